//! Outbound message chunking (spec §6): max 1200 chars/chunk by
//! default, splitting preferring a newline boundary then a space
//! boundary above 40% of the max.

pub const DEFAULT_MAX_CHUNK_CHARS: usize = 1200;

/// Splits `text` into chunks of at most `max_len` chars each. CRLF is
/// normalized to LF and the text is trimmed first. Concatenating the
/// returned chunks with no separator reproduces the normalized text
/// exactly.
pub fn split_message(text: &str, max_len: usize) -> Vec<String> {
    assert!(max_len > 0, "max_len must be positive");
    let normalized = text.replace("\r\n", "\n");
    let trimmed = normalized.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    let chars: Vec<char> = trimmed.chars().collect();
    let threshold = ((max_len as f64) * 0.4) as usize;
    let mut chunks = Vec::new();
    let mut start = 0;

    while start < chars.len() {
        let remaining = chars.len() - start;
        if remaining <= max_len {
            chunks.push(chars[start..].iter().collect());
            break;
        }

        let window_end = start + max_len;
        let search_floor = start + threshold;
        let newline_cut = (search_floor..window_end).rev().find(|&i| chars[i] == '\n');
        let space_cut = (search_floor..window_end).rev().find(|&i| chars[i] == ' ');
        let cut = newline_cut.or(space_cut).map(|i| i + 1).unwrap_or(window_end);

        chunks.push(chars[start..cut].iter().collect());
        start = cut;
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn short_message_is_a_single_chunk() {
        assert_eq!(split_message("hello", 1200), vec!["hello".to_string()]);
    }

    #[test]
    fn empty_message_has_no_chunks() {
        assert_eq!(split_message("   \r\n ", 1200), Vec::<String>::new());
    }

    #[test]
    fn long_message_splits_at_newline_boundary() {
        let first = "a".repeat(50);
        let second = "b".repeat(50);
        let text = format!("{first}\n{second}");
        let chunks = split_message(&text, 60);
        assert_eq!(chunks[0], format!("{first}\n"));
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn all_chunks_respect_max_len() {
        let text = "word ".repeat(500);
        let chunks = split_message(&text, 1200);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 1200);
        }
        assert_eq!(chunks.concat(), text.trim());
    }

    #[test]
    fn join_reproduces_trimmed_crlf_normalized_text() {
        let text = "line one\r\nline two\r\nline three ".repeat(80);
        let chunks = split_message(&text, 1200);
        let normalized = text.replace("\r\n", "\n");
        assert_eq!(chunks.concat(), normalized.trim());
    }
}
