use serde::Deserialize;
use serde::Serialize;

/// Decision returned in response to `item/commandExecution/requestApproval`
/// and `item/fileChange/requestApproval`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Accept,
    Decline,
}

impl ApprovalDecision {
    /// `accept` iff auto-approve is on and the session is not paused.
    pub fn from_policy(auto_approve: bool, paused: bool) -> Self {
        if auto_approve && !paused {
            Self::Accept
        } else {
            Self::Decline
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_requires_auto_approve_and_not_paused() {
        assert_eq!(ApprovalDecision::from_policy(true, false), ApprovalDecision::Accept);
        assert_eq!(ApprovalDecision::from_policy(true, true), ApprovalDecision::Decline);
        assert_eq!(ApprovalDecision::from_policy(false, false), ApprovalDecision::Decline);
    }
}
