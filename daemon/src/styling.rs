//! Outbound Markdown-to-Unicode styling (spec §6, a pure function).
//!
//! `**bold**` / `__bold__` / `*italic*` / `_italic_` / `` `mono` `` are
//! rewritten to the corresponding Unicode Mathematical Alphanumeric
//! Symbols; the ASCII delimiters are removed. Styling is idempotent:
//! the mapped code points fall outside the ASCII ranges this module
//! touches, so a second pass is a no-op.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StyleKind {
    Bold,
    Italic,
    Mono,
}

fn style_char(c: char, kind: StyleKind) -> char {
    match kind {
        StyleKind::Bold => {
            if c.is_ascii_uppercase() {
                char::from_u32(0x1D400 + (c as u32 - 'A' as u32)).unwrap_or(c)
            } else if c.is_ascii_lowercase() {
                char::from_u32(0x1D41A + (c as u32 - 'a' as u32)).unwrap_or(c)
            } else if c.is_ascii_digit() {
                char::from_u32(0x1D7CE + (c as u32 - '0' as u32)).unwrap_or(c)
            } else {
                c
            }
        }
        StyleKind::Italic => {
            if c == 'h' {
                '\u{210E}' // mathematical alphanumeric italic skips lowercase h
            } else if c.is_ascii_uppercase() {
                char::from_u32(0x1D434 + (c as u32 - 'A' as u32)).unwrap_or(c)
            } else if c.is_ascii_lowercase() {
                char::from_u32(0x1D44E + (c as u32 - 'a' as u32)).unwrap_or(c)
            } else {
                c
            }
        }
        StyleKind::Mono => {
            if c.is_ascii_uppercase() {
                char::from_u32(0x1D670 + (c as u32 - 'A' as u32)).unwrap_or(c)
            } else if c.is_ascii_lowercase() {
                char::from_u32(0x1D68A + (c as u32 - 'a' as u32)).unwrap_or(c)
            } else if c.is_ascii_digit() {
                char::from_u32(0x1D7F6 + (c as u32 - '0' as u32)).unwrap_or(c)
            } else {
                c
            }
        }
    }
}

fn apply_style(text: &str, kind: StyleKind) -> String {
    text.chars().map(|c| style_char(c, kind)).collect()
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn matches_at(chars: &[char], idx: usize, delim: &[char]) -> bool {
    idx + delim.len() <= chars.len() && chars[idx..idx + delim.len()] == *delim
}

fn find_close(chars: &[char], from: usize, delim: &[char]) -> Option<usize> {
    let mut i = from;
    while i + delim.len() <= chars.len() {
        if matches_at(chars, i, delim) {
            return Some(i);
        }
        i += 1;
    }
    None
}

/// Replaces every non-overlapping `delim ... delim` span with its
/// styled inner text, removing the delimiters. When `word_guard` is
/// set, a span is only honored if the characters immediately outside
/// the delimiters are not word characters — this is what keeps
/// `snake_case` untouched by single-underscore emphasis.
fn replace_delim(text: &str, delim: &str, kind: StyleKind, word_guard: bool) -> String {
    let chars: Vec<char> = text.chars().collect();
    let dchars: Vec<char> = delim.chars().collect();
    let mut out = String::new();
    let mut i = 0;
    while i < chars.len() {
        if matches_at(&chars, i, &dchars) {
            if let Some(close) = find_close(&chars, i + dchars.len(), &dchars) {
                let inner_start = i + dchars.len();
                let after = close + dchars.len();
                let before_ok = i == 0 || !word_guard || !is_word_char(chars[i - 1]);
                let after_ok = after >= chars.len() || !word_guard || !is_word_char(chars[after]);
                if close > inner_start && before_ok && after_ok {
                    let inner: String = chars[inner_start..close].iter().collect();
                    out.push_str(&apply_style(&inner, kind));
                    i = after;
                    continue;
                }
            }
        }
        out.push(chars[i]);
        i += 1;
    }
    out
}

/// Applies the outbound styling rules. Idempotent: `style(style(s)) ==
/// style(s)` for all `s`.
pub fn style_markdown(text: &str) -> String {
    let text = replace_delim(text, "`", StyleKind::Mono, false);
    let text = replace_delim(&text, "**", StyleKind::Bold, false);
    let text = replace_delim(&text, "__", StyleKind::Bold, false);
    let text = replace_delim(&text, "*", StyleKind::Italic, false);
    replace_delim(&text, "_", StyleKind::Italic, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn bold_double_star_maps_to_mathematical_bold() {
        assert_eq!(style_markdown("**hi**"), "\u{1D421}\u{1D422}");
    }

    #[test]
    fn mono_backtick_maps_to_mathematical_monospace() {
        assert_eq!(style_markdown("`ok`"), "\u{1D698}\u{1D694}");
    }

    #[test]
    fn snake_case_survives_underscore_emphasis() {
        assert_eq!(style_markdown("snake_case survives"), "snake_case survives");
    }

    #[test]
    fn standalone_underscore_emphasis_is_still_styled() {
        let styled = style_markdown("please _run_ it");
        assert!(styled.contains('\u{1D45F}') || styled.contains('\u{210E}'));
        assert!(!styled.contains('_'));
    }

    #[test]
    fn styling_is_idempotent() {
        let once = style_markdown("**bold** and _word_ and `code`");
        let twice = style_markdown(&once);
        assert_eq!(once, twice);
    }
}
