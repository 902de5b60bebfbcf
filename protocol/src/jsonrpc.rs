//! Newline-delimited JSON-RPC 2.0 envelope types.
//!
//! The wire carries no `"jsonrpc"` field in either direction (the agent
//! does not emit one and the bridge does not require one), so these
//! types model only the fields that matter for classification and
//! demux: `id`, `method`, `result`, `error`.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

/// Request/response correlation id. The agent mints integer ids for its
/// own server-initiated requests; the bridge mints integer ids for
/// everything it sends.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Integer(i64),
    String(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JSONRPCErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JSONRPCRequest {
    pub id: RequestId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JSONRPCResponse {
    pub id: RequestId,
    pub result: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JSONRPCErrorResponse {
    pub id: RequestId,
    pub error: JSONRPCErrorObject,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JSONRPCNotification {
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// A parsed line from the child's stdout, classified per the four-way
/// split: success response, error response, server-initiated request,
/// or notification.
#[derive(Debug, Clone, PartialEq)]
pub enum JSONRPCMessage {
    Response(JSONRPCResponse),
    Error(JSONRPCErrorResponse),
    Request(JSONRPCRequest),
    Notification(JSONRPCNotification),
}

#[derive(Debug, thiserror::Error)]
pub enum JsonRpcParseError {
    #[error("line is not a JSON object")]
    NotAnObject,
    #[error("line has neither a result, error, nor method field")]
    Unclassifiable,
    #[error("failed to deserialize classified message: {0}")]
    Deserialize(#[from] serde_json::Error),
}

impl JSONRPCMessage {
    /// Classify a decoded JSON value per spec: (a) has `id`+`result` →
    /// success response; (b) has `id`+`error` → error response; (c) has
    /// `id`+`method` → server request; (d) has `method`, no `id` →
    /// notification.
    pub fn classify(value: Value) -> Result<Self, JsonRpcParseError> {
        let obj = value.as_object().ok_or(JsonRpcParseError::NotAnObject)?;
        let has_id = obj.contains_key("id");
        let has_method = obj.contains_key("method");
        let has_result = obj.contains_key("result");
        let has_error = obj.contains_key("error");

        if has_id && has_result {
            Ok(Self::Response(serde_json::from_value(value)?))
        } else if has_id && has_error {
            Ok(Self::Error(serde_json::from_value(value)?))
        } else if has_id && has_method {
            Ok(Self::Request(serde_json::from_value(value)?))
        } else if has_method {
            Ok(Self::Notification(serde_json::from_value(value)?))
        } else {
            Err(JsonRpcParseError::Unclassifiable)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn classifies_success_response() {
        let msg = JSONRPCMessage::classify(json!({"id": 1, "result": {"ok": true}})).unwrap();
        assert!(matches!(msg, JSONRPCMessage::Response(_)));
    }

    #[test]
    fn classifies_error_response() {
        let msg = JSONRPCMessage::classify(json!({
            "id": 1,
            "error": {"code": -32000, "message": "boom"}
        }))
        .unwrap();
        assert!(matches!(msg, JSONRPCMessage::Error(_)));
    }

    #[test]
    fn classifies_server_request() {
        let msg = JSONRPCMessage::classify(json!({
            "id": 2,
            "method": "item/commandExecution/requestApproval",
            "params": {}
        }))
        .unwrap();
        assert!(matches!(msg, JSONRPCMessage::Request(_)));
    }

    #[test]
    fn classifies_notification() {
        let msg =
            JSONRPCMessage::classify(json!({"method": "turn/started", "params": {}})).unwrap();
        assert!(matches!(msg, JSONRPCMessage::Notification(_)));
    }

    #[test]
    fn rejects_unclassifiable_object() {
        let err = JSONRPCMessage::classify(json!({"foo": "bar"})).unwrap_err();
        assert!(matches!(err, JsonRpcParseError::Unclassifiable));
    }

    #[test]
    fn request_id_serializes_untagged() {
        assert_eq!(serde_json::to_value(RequestId::Integer(7)).unwrap(), json!(7));
        assert_eq!(
            serde_json::to_value(RequestId::String("abc".to_string())).unwrap(),
            json!("abc")
        );
    }
}
