//! Media composition for url-only mode (spec §6, a pure function).

pub fn compose_inbound_text_for_codex(text: &str, media_url: Option<&str>) -> String {
    let media_url = media_url.filter(|url| !url.is_empty());
    match media_url {
        None => text.to_string(),
        Some(url) => {
            let media_block =
                format!("User attached media URL: {url}\nFetch and inspect this attachment URL as needed.");
            if text.is_empty() {
                media_block
            } else {
                format!("User message: {text}\n{media_block}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn empty_text_and_no_media_is_empty() {
        assert_eq!(compose_inbound_text_for_codex("", None), "");
        assert_eq!(compose_inbound_text_for_codex("", Some("")), "");
    }

    #[test]
    fn media_only_uses_fetch_instruction() {
        assert_eq!(
            compose_inbound_text_for_codex("", Some("https://example.com/a.png")),
            "User attached media URL: https://example.com/a.png\nFetch and inspect this attachment URL as needed."
        );
    }

    #[test]
    fn text_and_media_prefixes_user_message() {
        let composed = compose_inbound_text_for_codex("check this out", Some("https://example.com/a.png"));
        assert_eq!(
            composed,
            "User message: check this out\nUser attached media URL: https://example.com/a.png\nFetch and inspect this attachment URL as needed."
        );
    }

    #[test]
    fn text_only_is_unchanged() {
        assert_eq!(compose_inbound_text_for_codex("hello", None), "hello");
    }
}
