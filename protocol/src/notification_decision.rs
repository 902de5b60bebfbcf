use serde::Deserialize;
use serde::Serialize;

/// Strict JSON envelope a notification-mode turn must produce.
/// `#[serde(deny_unknown_fields)]` enforces "no extra properties".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct NotificationDecision {
    pub delivery: Delivery,
    pub message: Option<String>,
    pub reason_code: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Delivery {
    Send,
    Suppress,
}

impl NotificationDecision {
    /// Parses strict JSON produced by the agent's final assistant text.
    /// Any trailing/leading whitespace is trimmed first since agents
    /// sometimes wrap JSON in surrounding text noise that is not part
    /// of the schema-enforced envelope.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text.trim())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_valid_suppress_envelope() {
        let decision = NotificationDecision::parse(
            r#"{"delivery":"suppress","message":null,"reasonCode":"deploy_noise"}"#,
        )
        .unwrap();
        assert_eq!(decision.delivery, Delivery::Suppress);
        assert_eq!(decision.reason_code.as_deref(), Some("deploy_noise"));
    }

    #[test]
    fn rejects_invalid_json() {
        assert!(NotificationDecision::parse("not json").is_err());
    }

    #[test]
    fn rejects_unknown_fields() {
        let err = NotificationDecision::parse(
            r#"{"delivery":"send","message":"hi","reason_code":null,"extra":true}"#,
        );
        assert!(err.is_err());
    }
}
