//! Methods invoked by the bridge and requests received from the agent.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::jsonrpc::JSONRPCRequest;
use crate::jsonrpc::RequestId;
use crate::models::ReasoningEffort;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitializeParams {
    pub client_info: ClientInfo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApprovalPolicy {
    Never,
    OnRequest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SandboxMode {
    ReadOnly,
    WorkspaceWrite,
    DangerFullAccess,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextElement {
    pub start: u32,
    pub end: u32,
    pub text: String,
}

/// One item of turn/thread input. Only the `text` kind is produced by
/// this bridge; the variant still round-trips any other kind the agent
/// might echo back in a rollout replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputItem {
    Text {
        text: String,
        #[serde(default)]
        text_elements: Vec<TextElement>,
    },
}

impl InputItem {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text {
            text: text.into(),
            text_elements: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadStartParams {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    pub approval_policy: ApprovalPolicy,
    pub sandbox: SandboxMode,
    #[serde(default)]
    pub experimental_raw_events: bool,
    #[serde(default)]
    pub tools: Vec<ToolDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadStartResponse {
    pub thread_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadResumeParams {
    pub thread_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadResumeResponse {
    pub thread_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadCompactStartParams {
    pub thread_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnStartParams {
    pub thread_id: String,
    pub input: Vec<InputItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_policy: Option<ApprovalPolicy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox_policy: Option<SandboxMode>,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effort: Option<ReasoningEffort>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnStartResponse {
    pub turn_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnSteerParams {
    pub thread_id: String,
    pub expected_turn_id: String,
    pub input: Vec<InputItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnSteerResponse {
    pub turn_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnInterruptParams {
    pub thread_id: String,
    pub turn_id: String,
}

/// Request from the bridge to the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "camelCase")]
pub enum ClientRequest {
    Initialize {
        #[serde(rename = "id")]
        request_id: RequestId,
        params: InitializeParams,
    },

    #[serde(rename = "thread/start")]
    ThreadStart {
        #[serde(rename = "id")]
        request_id: RequestId,
        params: ThreadStartParams,
    },

    #[serde(rename = "thread/resume")]
    ThreadResume {
        #[serde(rename = "id")]
        request_id: RequestId,
        params: ThreadResumeParams,
    },

    #[serde(rename = "thread/compact/start")]
    ThreadCompactStart {
        #[serde(rename = "id")]
        request_id: RequestId,
        params: ThreadCompactStartParams,
    },

    #[serde(rename = "turn/start")]
    TurnStart {
        #[serde(rename = "id")]
        request_id: RequestId,
        params: TurnStartParams,
    },

    #[serde(rename = "turn/steer")]
    TurnSteer {
        #[serde(rename = "id")]
        request_id: RequestId,
        params: TurnSteerParams,
    },

    #[serde(rename = "turn/interrupt")]
    TurnInterrupt {
        #[serde(rename = "id")]
        request_id: RequestId,
        params: TurnInterruptParams,
    },
}

impl ClientRequest {
    pub fn request_id(&self) -> &RequestId {
        match self {
            Self::Initialize { request_id, .. }
            | Self::ThreadStart { request_id, .. }
            | Self::ThreadResume { request_id, .. }
            | Self::ThreadCompactStart { request_id, .. }
            | Self::TurnStart { request_id, .. }
            | Self::TurnSteer { request_id, .. }
            | Self::TurnInterrupt { request_id, .. } => request_id,
        }
    }
}

/// Notification from the bridge to the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "camelCase")]
pub enum ClientNotification {
    Initialized,
}

/// Server-initiated request received from the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "camelCase")]
pub enum ServerRequest {
    #[serde(rename = "item/commandExecution/requestApproval")]
    CommandExecution {
        #[serde(rename = "id")]
        request_id: RequestId,
        #[serde(default)]
        params: Option<Value>,
    },

    #[serde(rename = "item/fileChange/requestApproval")]
    FileChange {
        #[serde(rename = "id")]
        request_id: RequestId,
        #[serde(default)]
        params: Option<Value>,
    },

    #[serde(rename = "item/tool/call")]
    ToolCall {
        #[serde(rename = "id")]
        request_id: RequestId,
        #[serde(default)]
        params: Option<Value>,
    },
}

impl ServerRequest {
    pub fn request_id(&self) -> &RequestId {
        match self {
            Self::CommandExecution { request_id, .. }
            | Self::FileChange { request_id, .. }
            | Self::ToolCall { request_id, .. } => request_id,
        }
    }
}

impl TryFrom<JSONRPCRequest> for ServerRequest {
    type Error = serde_json::Error;

    fn try_from(value: JSONRPCRequest) -> Result<Self, Self::Error> {
        serde_json::from_value(serde_json::to_value(value)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn serialize_initialized_notification_has_no_params_field() {
        let notification = ClientNotification::Initialized;
        let value = serde_json::to_value(&notification).unwrap();
        assert_eq!(value["method"], "initialized");
        assert!(value.get("params").is_none());
    }

    #[test]
    fn serialize_thread_start_includes_camel_case_fields() {
        let request = ClientRequest::ThreadStart {
            request_id: RequestId::Integer(1),
            params: ThreadStartParams {
                model: "gpt-5.3-codex".to_string(),
                cwd: None,
                approval_policy: ApprovalPolicy::Never,
                sandbox: SandboxMode::WorkspaceWrite,
                experimental_raw_events: false,
                tools: Vec::new(),
            },
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["method"], "thread/start");
        assert_eq!(value["id"], 1);
        assert_eq!(value["params"]["approvalPolicy"], "never");
        assert_eq!(value["params"]["experimentalRawEvents"], false);
    }

    #[test]
    fn serialize_turn_start_round_trips_text_input() {
        let request = ClientRequest::TurnStart {
            request_id: RequestId::Integer(2),
            params: TurnStartParams {
                thread_id: "thread-1".to_string(),
                input: vec![InputItem::text("hello")],
                cwd: None,
                approval_policy: None,
                sandbox_policy: None,
                model: "gpt-5.3-codex".to_string(),
                effort: Some(ReasoningEffort::Medium),
                output_schema: None,
            },
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["method"], "turn/start");
        assert_eq!(value["params"]["input"][0]["type"], "text");
        assert_eq!(value["params"]["input"][0]["text"], "hello");
    }

    #[test]
    fn server_request_round_trips_from_jsonrpc_request() {
        let raw = JSONRPCRequest {
            id: RequestId::Integer(9),
            method: "item/commandExecution/requestApproval".to_string(),
            params: Some(serde_json::json!({"command": "ls"})),
        };
        let parsed = ServerRequest::try_from(raw).unwrap();
        assert!(matches!(parsed, ServerRequest::CommandExecution { .. }));
    }
}
