//! Phone-number normalization (spec §6): strip everything but digits,
//! prefix with `+`; empty after stripping is rejected.

pub fn normalize_phone_number(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        None
    } else {
        Some(format!("+{digits}"))
    }
}

/// The provider's `to_number`/`from_number` fields may arrive as a bare
/// string or as an array of strings (spec §9 open question); this picks
/// the first non-empty entry either way.
pub fn first_non_empty_phone(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Array(items) => items
            .iter()
            .filter_map(|item| item.as_str())
            .find(|s| !s.is_empty())
            .map(str::to_string),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn strips_formatting_and_prefixes_plus() {
        assert_eq!(normalize_phone_number("+1 (555) 000-1111"), Some("+15550001111".to_string()));
    }

    #[test]
    fn rejects_empty_after_strip() {
        assert_eq!(normalize_phone_number("()- "), None);
    }

    #[test]
    fn first_non_empty_phone_picks_from_array() {
        let value = serde_json::json!(["", "+15550001111", "+19998887777"]);
        assert_eq!(first_non_empty_phone(&value), Some("+15550001111".to_string()));
    }

    #[test]
    fn first_non_empty_phone_accepts_bare_string() {
        let value = serde_json::json!("+15550001111");
        assert_eq!(first_non_empty_phone(&value), Some("+15550001111".to_string()));
    }
}
