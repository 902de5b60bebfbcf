//! Wire and domain types shared between the JSON-RPC transport and the
//! agent session manager. No I/O lives here.

pub mod approvals;
pub mod events;
pub mod jsonrpc;
pub mod models;
pub mod notification_decision;
pub mod wire;

pub use approvals::ApprovalDecision;
pub use events::AgentNotification;
pub use events::BridgeEvent;
pub use events::TurnMode;
pub use events::TurnStatus;
pub use jsonrpc::JSONRPCErrorObject;
pub use jsonrpc::JSONRPCMessage;
pub use jsonrpc::JSONRPCNotification;
pub use jsonrpc::JSONRPCRequest;
pub use jsonrpc::JSONRPCResponse;
pub use jsonrpc::JsonRpcParseError;
pub use jsonrpc::RequestId;
pub use models::AgentModel;
pub use models::ReasoningEffort;
pub use notification_decision::NotificationDecision;
pub use wire::ClientNotification;
pub use wire::ClientRequest;
pub use wire::ServerRequest;
