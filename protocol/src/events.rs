//! Notifications received from the agent, and the internal bridge
//! events the session manager fans out to the orchestrator.

use serde::Deserialize;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Completed,
    Failed,
    Interrupted,
}

/// One notification the agent sent over the wire, after JSON-RPC
/// envelope classification has already stripped the `method`/`params`
/// wrapper. Unlike `ClientRequest`, these are parsed from
/// `(method, params)` pairs rather than round-tripped through serde's
/// internally-tagged representation, since the agent's notification
/// shapes are not under this bridge's control.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentNotification {
    ThreadStarted {
        thread_id: String,
    },
    TurnStarted {
        turn_id: String,
    },
    TurnCompleted {
        turn_id: String,
        status: TurnStatus,
        error: Option<String>,
    },
    AssistantDelta {
        item_id: String,
        turn_id: String,
        delta: String,
    },
    ItemStarted {
        item_id: String,
        turn_id: String,
        item_type: String,
    },
    ItemCompleted {
        item_id: String,
        turn_id: String,
        item_type: String,
        text: Option<String>,
    },
}

impl AgentNotification {
    pub fn from_method_and_params(
        method: &str,
        params: &serde_json::Value,
    ) -> Result<Option<Self>, serde_json::Error> {
        #[derive(Deserialize)]
        struct ThreadStartedParams {
            thread_id: String,
        }
        #[derive(Deserialize)]
        struct TurnStartedParams {
            turn_id: String,
        }
        #[derive(Deserialize)]
        struct TurnCompletedParams {
            turn_id: String,
            status: TurnStatus,
            #[serde(default)]
            error: Option<String>,
        }
        #[derive(Deserialize)]
        struct AssistantDeltaParams {
            item_id: String,
            turn_id: String,
            delta: String,
        }
        #[derive(Deserialize)]
        struct ItemParams {
            item_id: String,
            turn_id: String,
            #[serde(rename = "type")]
            item_type: String,
            #[serde(default)]
            text: Option<String>,
        }

        Ok(match method {
            "thread/started" => {
                let p: ThreadStartedParams = serde_json::from_value(params.clone())?;
                Some(Self::ThreadStarted { thread_id: p.thread_id })
            }
            "turn/started" => {
                let p: TurnStartedParams = serde_json::from_value(params.clone())?;
                Some(Self::TurnStarted { turn_id: p.turn_id })
            }
            "turn/completed" => {
                let p: TurnCompletedParams = serde_json::from_value(params.clone())?;
                Some(Self::TurnCompleted {
                    turn_id: p.turn_id,
                    status: p.status,
                    error: p.error,
                })
            }
            "item/agentMessage/delta" => {
                let p: AssistantDeltaParams = serde_json::from_value(params.clone())?;
                Some(Self::AssistantDelta {
                    item_id: p.item_id,
                    turn_id: p.turn_id,
                    delta: p.delta,
                })
            }
            "item/started" => {
                let p: ItemParams = serde_json::from_value(params.clone())?;
                Some(Self::ItemStarted {
                    item_id: p.item_id,
                    turn_id: p.turn_id,
                    item_type: p.item_type,
                })
            }
            "item/completed" => {
                let p: ItemParams = serde_json::from_value(params.clone())?;
                Some(Self::ItemCompleted {
                    item_id: p.item_id,
                    turn_id: p.turn_id,
                    item_type: p.item_type,
                    text: p.text,
                })
            }
            _ => None,
        })
    }
}

/// Turn mode, tagging in-memory turn contexts per spec §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnMode {
    User,
    Notification,
}

/// Events the session manager fans out to the bridge orchestrator. This
/// is the Rust rendering of the source's event-emitter pattern (§9):
/// an explicit, typed channel rather than named callback seams.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    TurnStarted {
        thread_id: String,
        turn_id: String,
        mode: TurnMode,
    },
    TurnCompleted {
        thread_id: String,
        turn_id: String,
        mode: TurnMode,
        status: TurnStatus,
        error: Option<String>,
    },
    AssistantDelta {
        item_id: String,
        turn_id: String,
        mode: TurnMode,
        delta: String,
    },
    AssistantFinal {
        item_id: String,
        turn_id: String,
        mode: TurnMode,
        text: String,
    },
    CompactionStarted {
        turn_id: String,
    },
    CompactionCompleted {
        turn_id: String,
    },
    ApprovalDeclinedDueToPolicy {
        item_id: String,
        turn_id: String,
    },
    ModelFallback {
        from_model: String,
        to_model: String,
        to_effort: crate::models::ReasoningEffort,
        operation: String,
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn parses_turn_completed_notification() {
        let notif = AgentNotification::from_method_and_params(
            "turn/completed",
            &json!({"turn_id": "t1", "status": "completed", "error": null}),
        )
        .unwrap()
        .unwrap();
        assert_eq!(
            notif,
            AgentNotification::TurnCompleted {
                turn_id: "t1".to_string(),
                status: TurnStatus::Completed,
                error: None,
            }
        );
    }

    #[test]
    fn unknown_method_yields_none() {
        let notif =
            AgentNotification::from_method_and_params("codex/event/unused", &json!({})).unwrap();
        assert_eq!(notif, None);
    }
}
