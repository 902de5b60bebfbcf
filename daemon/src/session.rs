//! Agent Session Manager (C3, spec §4.3). Owns the transport and
//! enforces the session/turn state machine: thread lifecycle, turn
//! lifecycle, spark fallback, model/effort controls, and translation
//! of agent notifications into `BridgeEvent`s for the orchestrator.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bridge_protocol::events::TurnMode;
use bridge_protocol::models::AgentModel;
use bridge_protocol::wire::ApprovalPolicy;
use bridge_protocol::wire::InputItem;
use bridge_protocol::wire::SandboxMode;
use bridge_protocol::wire::ThreadResumeParams;
use bridge_protocol::wire::ThreadStartParams;
use bridge_protocol::wire::TurnInterruptParams;
use bridge_protocol::wire::TurnSteerParams;
use bridge_protocol::AgentNotification;
use bridge_protocol::ApprovalDecision;
use bridge_protocol::BridgeEvent;
use bridge_protocol::ClientNotification;
use bridge_protocol::ClientRequest;
use bridge_protocol::ReasoningEffort;
use bridge_protocol::RequestId;
use bridge_protocol::ServerRequest;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio::sync::RwLock;
use tracing::info;
use tracing::warn;

use crate::store::Store;
use crate::transport::Transport;
use crate::transport::TransportError;
use crate::transport::TransportEvent;
use crate::transport::DEFAULT_REQUEST_TIMEOUT;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnStartMode {
    Start,
    Steer,
}

#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub mode: TurnStartMode,
    pub turn_id: String,
    pub thread_id: String,
}

#[derive(Debug, Clone)]
struct TurnContext {
    mode: TurnMode,
    notification_id: Option<i64>,
    attempt: u8,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("thread not found")]
    ThreadNotFound,
    #[error("turn/steer is not supported by this agent")]
    SteerUnsupported,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Other(String),
}

pub struct SessionManagerConfig {
    pub agent_bin: String,
    pub agent_cwd: Option<PathBuf>,
    pub model_prefix: String,
    pub default_model: String,
    pub trusted_user: String,
}

/// Notification output schema enforced on decision turns (spec §4.3.3).
pub fn notification_output_schema() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "delivery": {"type": "string", "enum": ["send", "suppress"]},
            "message": {"type": ["string", "null"]},
            "reasonCode": {"type": ["string", "null"]},
        },
        "required": ["delivery", "message", "reasonCode"],
        "additionalProperties": false,
    })
}

pub struct SessionManager {
    store: Store,
    transport: RwLock<Transport>,
    attached: AtomicBool,
    supports_turn_steer: AtomicBool,
    turn_contexts: Mutex<HashMap<String, TurnContext>>,
    config: SessionManagerConfig,
    events_tx: mpsc::UnboundedSender<BridgeEvent>,
    /// Cloned into every `Transport::spawn` call, including restarts, so
    /// the single long-lived `run_event_loop` task keeps receiving
    /// transport events across a `restartCodex` without re-wiring a new
    /// channel each time.
    transport_events_tx: mpsc::UnboundedSender<TransportEvent>,
}

impl SessionManager {
    pub async fn start(
        store: Store,
        config: SessionManagerConfig,
        events_tx: mpsc::UnboundedSender<BridgeEvent>,
    ) -> anyhow::Result<Arc<Self>> {
        let (transport_events_tx, transport_events_rx) = mpsc::unbounded_channel();
        let transport =
            Transport::spawn(&config.agent_bin, config.agent_cwd.as_deref(), transport_events_tx.clone()).await?;

        let manager = Arc::new(Self {
            store,
            transport: RwLock::new(transport),
            attached: AtomicBool::new(false),
            supports_turn_steer: AtomicBool::new(true),
            turn_contexts: Mutex::new(HashMap::new()),
            config,
            events_tx,
            transport_events_tx,
        });

        manager.initialize_handshake().await?;

        let worker = Arc::clone(&manager);
        tokio::spawn(async move {
            worker.run_event_loop(transport_events_rx).await;
        });

        Ok(manager)
    }

    async fn initialize_handshake(&self) -> Result<(), SessionError> {
        let transport = self.transport.read().await;
        transport
            .request(
                |request_id| ClientRequest::Initialize {
                    request_id,
                    params: bridge_protocol::wire::InitializeParams {
                        client_info: bridge_protocol::wire::ClientInfo {
                            name: "imessage-bridge".to_string(),
                            title: Some("imessage-bridge".to_string()),
                            version: env!("CARGO_PKG_VERSION").to_string(),
                        },
                    },
                },
                DEFAULT_REQUEST_TIMEOUT,
            )
            .await?;
        transport.notify(&ClientNotification::Initialized).await?;
        Ok(())
    }

    async fn run_event_loop(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<TransportEvent>) {
        while let Some(event) = rx.recv().await {
            match event {
                TransportEvent::Notification { method, params } => {
                    if let Err(err) = self.handle_agent_notification(&method, &params).await {
                        warn!(%err, method, "failed to handle agent notification");
                    }
                }
                TransportEvent::ServerRequest(request) => {
                    if let Err(err) = self.handle_server_request(request).await {
                        warn!(%err, "failed to handle server request");
                    }
                }
                TransportEvent::Stopped { reason } => {
                    info!(reason, "agent transport stopped");
                    self.attached.store(false, Ordering::SeqCst);
                }
            }
        }
    }

    async fn handle_agent_notification(&self, method: &str, params: &Value) -> anyhow::Result<()> {
        let Some(notification) = AgentNotification::from_method_and_params(method, params)? else {
            return Ok(());
        };

        let phone = self.config.trusted_user.clone();
        match notification {
            AgentNotification::ThreadStarted { thread_id } => {
                self.store.session_set_thread(&phone, &thread_id)?;
                self.attached.store(true, Ordering::SeqCst);
            }
            AgentNotification::TurnStarted { turn_id } => {
                self.store.session_set_active_turn(&phone, &turn_id)?;
                let mode = self.turn_contexts.lock().await.get(&turn_id).map(|c| c.mode).unwrap_or(TurnMode::User);
                let session = self.store.session_get(&phone)?;
                let _ = self.events_tx.send(BridgeEvent::TurnStarted {
                    thread_id: session.thread_id.unwrap_or_default(),
                    turn_id,
                    mode,
                });
            }
            AgentNotification::TurnCompleted { turn_id, status, error } => {
                self.store.session_clear_active_turn(&phone)?;
                let mode = self
                    .turn_contexts
                    .lock()
                    .await
                    .remove(&turn_id)
                    .map(|c| c.mode)
                    .unwrap_or(TurnMode::User);
                let session = self.store.session_get(&phone)?;
                let _ = self.events_tx.send(BridgeEvent::TurnCompleted {
                    thread_id: session.thread_id.unwrap_or_default(),
                    turn_id,
                    mode,
                    status,
                    error,
                });
            }
            AgentNotification::AssistantDelta { item_id, turn_id, delta } => {
                let mode = self.turn_mode(&turn_id).await;
                let _ = self.events_tx.send(BridgeEvent::AssistantDelta { item_id, turn_id, mode, delta });
            }
            AgentNotification::ItemStarted { item_id: _, turn_id, item_type } => {
                if item_type == "contextCompaction" {
                    let _ = self.events_tx.send(BridgeEvent::CompactionStarted { turn_id });
                }
            }
            AgentNotification::ItemCompleted { item_id, turn_id, item_type, text } => {
                if item_type == "contextCompaction" {
                    let _ = self.events_tx.send(BridgeEvent::CompactionCompleted { turn_id });
                } else if item_type == "agentMessage" {
                    let mode = self.turn_mode(&turn_id).await;
                    let _ = self.events_tx.send(BridgeEvent::AssistantFinal {
                        item_id,
                        turn_id,
                        mode,
                        text: text.unwrap_or_default(),
                    });
                }
            }
        }
        Ok(())
    }

    async fn turn_mode(&self, turn_id: &str) -> TurnMode {
        self.turn_contexts.lock().await.get(turn_id).map(|c| c.mode).unwrap_or(TurnMode::User)
    }

    async fn handle_server_request(&self, request: ServerRequest) -> anyhow::Result<()> {
        let transport = self.transport.read().await;
        match request {
            ServerRequest::CommandExecution { request_id, .. } | ServerRequest::FileChange { request_id, .. } => {
                let phone = self.config.trusted_user.clone();
                let auto_approve = self.store.flag_get_bool("auto_approve", false)?;
                let paused = self.store.flag_get_bool("paused", false)?;
                let decision = ApprovalDecision::from_policy(auto_approve, paused);
                self.store.audit_append(crate::store::AuditEventInput {
                    phone_number: &phone,
                    thread_id: None,
                    turn_id: None,
                    kind: "approval_request",
                    summary: "approval requested",
                    payload: None,
                })?;
                transport
                    .respond(request_id.clone(), serde_json::json!({"decision": decision}))
                    .await?;
                self.store.audit_append(crate::store::AuditEventInput {
                    phone_number: &phone,
                    thread_id: None,
                    turn_id: None,
                    kind: "approval_response",
                    summary: &format!("{decision:?}"),
                    payload: None,
                })?;
                if decision == ApprovalDecision::Decline {
                    let _ = self.events_tx.send(BridgeEvent::ApprovalDeclinedDueToPolicy {
                        item_id: String::new(),
                        turn_id: String::new(),
                    });
                }
            }
            ServerRequest::ToolCall { request_id, params } => {
                self.handle_tool_call(&transport, request_id, params).await?;
            }
        }
        Ok(())
    }

    async fn handle_tool_call(
        &self,
        transport: &Transport,
        request_id: bridge_protocol::RequestId,
        params: Option<Value>,
    ) -> anyhow::Result<()> {
        let params = params.unwrap_or(Value::Null);
        let name = params.get("name").and_then(Value::as_str).unwrap_or_default();
        let arguments = params.get("arguments").cloned().unwrap_or(Value::Null);

        let result = match name {
            "notifications_list" => {
                let limit = arguments.get("limit").and_then(Value::as_u64).unwrap_or(20) as usize;
                let rows = self.store.notification_list(limit, None)?;
                Ok(serde_json::to_value(rows.iter().map(summarize_notification).collect::<Vec<_>>())?)
            }
            "notifications_get" => {
                let id = arguments.get("id").and_then(Value::as_i64);
                match id {
                    Some(id) => match self.store.notification_get(id)? {
                        Some(row) => Ok(summarize_notification(&row)),
                        None => Err(format!("no notification with id {id}")),
                    },
                    None => Err("missing required argument: id".to_string()),
                }
            }
            "notifications_search" => {
                let source = arguments.get("source").and_then(Value::as_str);
                let limit = arguments.get("limit").and_then(Value::as_u64).unwrap_or(20) as usize;
                let rows = self.store.notification_list(limit, source)?;
                Ok(serde_json::to_value(rows.iter().map(summarize_notification).collect::<Vec<_>>())?)
            }
            other => Err(format!("unknown tool: {other}")),
        };

        match result {
            Ok(value) => {
                let pretty = serde_json::to_string_pretty(&value)?;
                transport
                    .respond(
                        request_id,
                        serde_json::json!({
                            "success": true,
                            "contentItems": [{"type": "inputText", "text": pretty}],
                        }),
                    )
                    .await?;
            }
            Err(message) => {
                transport
                    .respond(request_id, serde_json::json!({"success": false, "error": message}))
                    .await?;
            }
        }
        Ok(())
    }

    /// Whether the session currently has an active turn (spec §3: at most one at a time).
    pub async fn has_active_turn(&self) -> Result<bool, SessionError> {
        let phone = self.config.trusted_user.clone();
        Ok(self.store.session_get(&phone)?.active_turn_id.is_some())
    }

    // ---- §4.3.1 Thread lifecycle ----------------------------------------

    pub async fn ensure_thread(&self) -> Result<String, SessionError> {
        let phone = self.config.trusted_user.clone();
        let session = self.store.session_get(&phone)?;

        if let Some(thread_id) = &session.thread_id {
            if self.attached.load(Ordering::SeqCst) {
                return Ok(thread_id.clone());
            }

            match self.resume_thread(thread_id).await {
                Ok(resumed) => {
                    self.store.session_set_thread(&phone, &resumed)?;
                    self.attached.store(true, Ordering::SeqCst);
                    self.store.audit_append(crate::store::AuditEventInput {
                        phone_number: &phone,
                        thread_id: Some(&resumed),
                        turn_id: None,
                        kind: "thread_resume",
                        summary: "resumed thread",
                        payload: None,
                    })?;
                    return Ok(resumed);
                }
                Err(SessionError::ThreadNotFound) => {
                    self.store.session_reset(&phone)?;
                }
                Err(other) => return Err(other),
            }
        }

        self.start_thread_with_retry().await
    }

    async fn resume_thread(&self, thread_id: &str) -> Result<String, SessionError> {
        let result = self
            .request_with_spark_fallback("thread/resume", |request_id| ClientRequest::ThreadResume {
                request_id,
                params: ThreadResumeParams { thread_id: thread_id.to_string() },
            })
            .await;

        match result {
            Ok(value) => Ok(value.get("threadId").and_then(Value::as_str).unwrap_or(thread_id).to_string()),
            Err(err) if is_thread_not_found(&err) => Err(SessionError::ThreadNotFound),
            Err(err) => Err(err.into()),
        }
    }

    /// Issues `build` against the transport; if the failure looks like
    /// "spark model unavailable" (spec §4.3.1.5), falls back the session
    /// to its default model and retries the same call once.
    async fn request_with_spark_fallback(
        &self,
        operation: &str,
        build: impl Fn(RequestId) -> ClientRequest,
    ) -> Result<Value, TransportError> {
        let first = {
            let transport = self.transport.read().await;
            transport.request(&build, DEFAULT_REQUEST_TIMEOUT).await
        };
        let err = match first {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        let model = match self.store.session_get(&self.config.trusted_user) {
            Ok(session) => session.model,
            Err(_) => return Err(err),
        };
        if !is_spark_inaccessible(&err, &model) {
            return Err(err);
        }
        if self.apply_spark_fallback(operation, &err.to_string()).await.is_err() {
            return Err(err);
        }

        let transport = self.transport.read().await;
        transport.request(&build, DEFAULT_REQUEST_TIMEOUT).await
    }

    async fn start_thread_with_retry(&self) -> Result<String, SessionError> {
        match self.start_thread_once().await {
            Ok(thread_id) => Ok(thread_id),
            Err(SessionError::Transport(TransportError::Timeout(_))) => {
                self.restart_transport().await?;
                self.start_thread_once().await
            }
            Err(err) => Err(err),
        }
    }

    async fn start_thread_once(&self) -> Result<String, SessionError> {
        let phone = self.config.trusted_user.clone();
        let session = self.store.session_get(&phone)?;
        let auto_approve = self.store.flag_get_bool("auto_approve", false)?;

        let build_params = |model: String| ThreadStartParams {
            model,
            cwd: self.config.agent_cwd.as_ref().map(|p| p.display().to_string()),
            approval_policy: if auto_approve { ApprovalPolicy::Never } else { ApprovalPolicy::OnRequest },
            sandbox: SandboxMode::WorkspaceWrite,
            experimental_raw_events: false,
            tools: notification_tool_descriptors(),
        };

        let params = build_params(session.model.clone());
        let response = {
            let transport = self.transport.read().await;
            transport
                .request(|request_id| ClientRequest::ThreadStart { request_id, params }, DEFAULT_REQUEST_TIMEOUT)
                .await
        };

        let response = match response {
            Ok(value) => value,
            Err(err) if is_spark_inaccessible(&err, &session.model) => {
                self.apply_spark_fallback("thread/start", &err.to_string()).await?;
                let session = self.store.session_get(&phone)?;
                let params = build_params(session.model);
                let transport = self.transport.read().await;
                transport
                    .request(|request_id| ClientRequest::ThreadStart { request_id, params }, DEFAULT_REQUEST_TIMEOUT)
                    .await
                    .map_err(SessionError::from)?
            }
            Err(err) => return Err(SessionError::from(err)),
        };
        let thread_id = response.get("threadId").and_then(Value::as_str).unwrap_or_default().to_string();

        self.store.session_set_thread(&phone, &thread_id)?;
        self.attached.store(true, Ordering::SeqCst);
        Ok(thread_id)
    }

    async fn restart_transport(&self) -> Result<(), SessionError> {
        let mut transport = self.transport.write().await;
        transport.stop().await.map_err(|e| SessionError::Other(e.to_string()))?;
        *transport = Transport::spawn(
            &self.config.agent_bin,
            self.config.agent_cwd.as_deref(),
            self.transport_events_tx.clone(),
        )
        .await
        .map_err(|e| SessionError::Other(e.to_string()))?;
        drop(transport);
        self.attached.store(false, Ordering::SeqCst);
        Ok(())
    }

    // ---- §4.3.2 Turn lifecycle — user text ------------------------------

    pub async fn start_or_steer_turn(&self, text: &str) -> Result<TurnOutcome, SessionError> {
        let thread_id = self.ensure_thread().await?;
        let phone = self.config.trusted_user.clone();
        let session = self.store.session_get(&phone)?;

        if let Some(active_turn_id) = session.active_turn_id.clone() {
            if self.supports_turn_steer.load(Ordering::SeqCst) {
                match self.steer_turn(&thread_id, &active_turn_id, text).await {
                    Ok(turn_id) => {
                        self.turn_contexts.lock().await.insert(
                            turn_id.clone(),
                            TurnContext { mode: TurnMode::User, notification_id: None, attempt: 1 },
                        );
                        return Ok(TurnOutcome { mode: TurnStartMode::Steer, turn_id, thread_id });
                    }
                    Err(SessionError::SteerUnsupported) => {
                        self.supports_turn_steer.store(false, Ordering::SeqCst);
                        return Err(SessionError::SteerUnsupported);
                    }
                    Err(SessionError::ThreadNotFound) => {
                        self.attached.store(false, Ordering::SeqCst);
                        let thread_id = self.ensure_thread().await?;
                        return self.start_turn(&thread_id, text, TurnMode::User, None).await;
                    }
                    Err(_) => {
                        self.store.session_clear_active_turn(&phone)?;
                    }
                }
            }
        }

        self.start_turn(&thread_id, text, TurnMode::User, None).await
    }

    pub async fn start_notification_turn(
        &self,
        text: &str,
        notification_id: i64,
        attempt: u8,
    ) -> Result<TurnOutcome, SessionError> {
        let thread_id = self.ensure_thread().await?;
        let outcome = self.start_turn_with_schema(
            &thread_id,
            text,
            TurnMode::Notification,
            Some(notification_id),
            Some(notification_output_schema()),
        )
        .await?;
        if let Some(ctx) = self.turn_contexts.lock().await.get_mut(&outcome.turn_id) {
            ctx.attempt = attempt;
        }
        Ok(outcome)
    }

    async fn steer_turn(&self, thread_id: &str, active_turn_id: &str, text: &str) -> Result<String, SessionError> {
        let result = self
            .request_with_spark_fallback("turn/steer", |request_id| ClientRequest::TurnSteer {
                request_id,
                params: TurnSteerParams {
                    thread_id: thread_id.to_string(),
                    expected_turn_id: active_turn_id.to_string(),
                    input: vec![InputItem::text(text)],
                },
            })
            .await;

        match result {
            Ok(value) => Ok(value.get("turnId").and_then(Value::as_str).unwrap_or(active_turn_id).to_string()),
            Err(err) if is_unknown_method(&err, "turn/steer") => Err(SessionError::SteerUnsupported),
            Err(err) if is_thread_not_found(&err) => Err(SessionError::ThreadNotFound),
            Err(err) => Err(err.into()),
        }
    }

    async fn start_turn(
        &self,
        thread_id: &str,
        text: &str,
        mode: TurnMode,
        notification_id: Option<i64>,
    ) -> Result<TurnOutcome, SessionError> {
        self.start_turn_with_schema(thread_id, text, mode, notification_id, None).await
    }

    async fn start_turn_with_schema(
        &self,
        thread_id: &str,
        text: &str,
        mode: TurnMode,
        notification_id: Option<i64>,
        output_schema: Option<Value>,
    ) -> Result<TurnOutcome, SessionError> {
        let phone = self.config.trusted_user.clone();
        let session = self.store.session_get(&phone)?;
        let effort = self.effort_for_model(&session.model)?;

        let build_params = |thread_id: String| bridge_protocol::wire::TurnStartParams {
            thread_id,
            input: vec![InputItem::text(text)],
            cwd: self.config.agent_cwd.as_ref().map(|p| p.display().to_string()),
            approval_policy: None,
            sandbox_policy: None,
            model: session.model.clone(),
            effort: Some(effort),
            output_schema: output_schema.clone(),
        };

        let response = {
            let transport = self.transport.read().await;
            transport
                .request(
                    |request_id| ClientRequest::TurnStart { request_id, params: build_params(thread_id.to_string()) },
                    DEFAULT_REQUEST_TIMEOUT,
                )
                .await
        };

        let response = match response {
            Ok(value) => value,
            Err(err) if is_thread_not_found(&err) => {
                self.attached.store(false, Ordering::SeqCst);
                let thread_id = self.ensure_thread().await?;
                let transport = self.transport.read().await;
                transport
                    .request(
                        |request_id| ClientRequest::TurnStart { request_id, params: build_params(thread_id) },
                        DEFAULT_REQUEST_TIMEOUT,
                    )
                    .await
                    .map_err(SessionError::from)?
            }
            Err(err) if is_spark_inaccessible(&err, &session.model) => {
                self.apply_spark_fallback("turn/start", &err.to_string()).await?;
                let session = self.store.session_get(&phone)?;
                let effort = self.effort_for_model(&session.model)?;
                let mut params = build_params(thread_id.to_string());
                params.model = session.model;
                params.effort = Some(effort);
                let transport = self.transport.read().await;
                transport
                    .request(move |request_id| ClientRequest::TurnStart { request_id, params }, DEFAULT_REQUEST_TIMEOUT)
                    .await
                    .map_err(SessionError::from)?
            }
            Err(err) => return Err(err.into()),
        };

        let turn_id = response.get("turnId").and_then(Value::as_str).unwrap_or_default().to_string();
        self.store.session_set_active_turn(&phone, &turn_id)?;
        self.turn_contexts
            .lock()
            .await
            .insert(turn_id.clone(), TurnContext { mode, notification_id, attempt: 1 });
        Ok(TurnOutcome { mode: TurnStartMode::Start, turn_id, thread_id: thread_id.to_string() })
    }

    async fn apply_spark_fallback(&self, operation: &str, reason: &str) -> Result<(), SessionError> {
        let phone = self.config.trusted_user.clone();
        let session = self.store.session_get(&phone)?;
        self.store.session_set_model(&phone, &self.config.default_model)?;
        let to_effort = ReasoningEffort::default_for(AgentModel::Standard);
        let _ = self.events_tx.send(BridgeEvent::ModelFallback {
            from_model: session.model,
            to_model: self.config.default_model.clone(),
            to_effort,
            operation: operation.to_string(),
            reason: reason.to_string(),
        });
        Ok(())
    }

    fn effort_for_model(&self, model: &str) -> Result<ReasoningEffort, SessionError> {
        let key = format!("reasoning_effort_by_model.{model}");
        let stored = self.store.flag_get_json(&key)?;
        Ok(stored
            .and_then(|v| v.as_str().and_then(ReasoningEffort::parse))
            .unwrap_or_else(|| ReasoningEffort::default_for(AgentModel::classify(model))))
    }

    /// Snapshot of `(session, current effort)` for `/status`, `/effort`, and similar read-only commands.
    pub fn status_snapshot(&self) -> Result<(crate::store::Session, ReasoningEffort), SessionError> {
        let phone = self.config.trusted_user.clone();
        let session = self.store.session_get(&phone)?;
        let effort = self.effort_for_model(&session.model)?;
        Ok((session, effort))
    }

    // ---- §4.3.5 Model and effort controls --------------------------------

    pub fn enforce_model_prefix(&self, model: &str) -> Result<(), SessionError> {
        if model.starts_with(&self.config.model_prefix) {
            Ok(())
        } else {
            Err(SessionError::Other(format!(
                "model id must begin with prefix {}",
                self.config.model_prefix
            )))
        }
    }

    pub fn set_model(&self, model: &str) -> Result<ReasoningEffort, SessionError> {
        self.enforce_model_prefix(model)?;
        let phone = self.config.trusted_user.clone();
        self.store.session_set_model(&phone, model)?;
        self.effort_for_model(model)
    }

    pub fn set_model_with_effort(&self, model: &str, effort: ReasoningEffort) -> Result<(), SessionError> {
        self.enforce_model_prefix(model)?;
        let phone = self.config.trusted_user.clone();
        self.store.session_set_model(&phone, model)?;
        let key = format!("reasoning_effort_by_model.{model}");
        self.store.flag_set_json(&key, &Value::String(effort.as_str().to_string()))?;
        Ok(())
    }

    pub fn set_effort_for_current_model(&self, effort: ReasoningEffort) -> Result<(), SessionError> {
        let phone = self.config.trusted_user.clone();
        let session = self.store.session_get(&phone)?;
        let key = format!("reasoning_effort_by_model.{}", session.model);
        self.store.flag_set_json(&key, &Value::String(effort.as_str().to_string()))?;
        Ok(())
    }

    pub fn toggle_spark_model(&self) -> Result<(String, ReasoningEffort), SessionError> {
        let phone = self.config.trusted_user.clone();
        let session = self.store.session_get(&phone)?;

        if AgentModel::classify(&session.model) != AgentModel::Spark {
            let current_effort = self.effort_for_model(&session.model)?;
            self.store.flag_set_json(
                "spark_return_target",
                &serde_json::json!({"model": session.model, "effort": current_effort.as_str()}),
            )?;
            let spark_model = format!("{}-spark", self.config.model_prefix);
            let spark_effort = self.effort_for_model(&spark_model)?;
            self.store.session_set_model(&phone, &spark_model)?;
            Ok((spark_model, spark_effort))
        } else {
            let saved = self.store.flag_consume("spark_return_target")?;
            let (model, effort) = match saved {
                Some(value) => {
                    let model = value.get("model").and_then(Value::as_str).unwrap_or(&self.config.default_model).to_string();
                    let effort = value
                        .get("effort")
                        .and_then(Value::as_str)
                        .and_then(ReasoningEffort::parse)
                        .unwrap_or(ReasoningEffort::Medium);
                    (model, effort)
                }
                None => (self.config.default_model.clone(), ReasoningEffort::Medium),
            };
            self.store.session_set_model(&phone, &model)?;
            Ok((model, effort))
        }
    }

    // ---- §4.3.8 restartCodex ---------------------------------------------

    pub async fn restart_codex(&self) -> Result<Option<String>, SessionError> {
        let phone = self.config.trusted_user.clone();
        self.store.audit_append(crate::store::AuditEventInput {
            phone_number: &phone,
            thread_id: None,
            turn_id: None,
            kind: "system",
            summary: "restartCodex requested",
            payload: None,
        })?;

        self.restart_transport().await?;
        self.initialize_handshake().await?;
        self.store.session_clear_active_turn(&phone)?;

        let thread_id = match self.ensure_thread().await {
            Ok(id) => Some(id),
            Err(err) => {
                warn!(%err, "failed to re-ensure thread after restartCodex");
                None
            }
        };

        self.store.audit_append(crate::store::AuditEventInput {
            phone_number: &phone,
            thread_id: thread_id.as_deref(),
            turn_id: None,
            kind: "system",
            summary: "restartCodex completed",
            payload: None,
        })?;

        Ok(thread_id)
    }

    pub async fn interrupt_current_turn(&self) -> Result<Option<String>, SessionError> {
        let phone = self.config.trusted_user.clone();
        let session = self.store.session_get(&phone)?;
        let (Some(thread_id), Some(turn_id)) = (session.thread_id, session.active_turn_id) else {
            return Ok(None);
        };
        let transport = self.transport.read().await;
        transport
            .request(
                |request_id| ClientRequest::TurnInterrupt {
                    request_id,
                    params: TurnInterruptParams { thread_id, turn_id: turn_id.clone() },
                },
                DEFAULT_REQUEST_TIMEOUT,
            )
            .await?;
        Ok(Some(turn_id))
    }

    pub async fn compact_thread(&self) -> Result<(), SessionError> {
        let thread_id = self.ensure_thread().await?;
        let transport = self.transport.read().await;
        transport
            .request(
                |request_id| ClientRequest::ThreadCompactStart {
                    request_id,
                    params: bridge_protocol::wire::ThreadCompactStartParams { thread_id },
                },
                DEFAULT_REQUEST_TIMEOUT,
            )
            .await?;
        Ok(())
    }

    pub async fn stop(&self) -> anyhow::Result<()> {
        self.transport.read().await.stop().await
    }
}

fn notification_tool_descriptors() -> Vec<bridge_protocol::wire::ToolDescriptor> {
    vec![
        bridge_protocol::wire::ToolDescriptor {
            name: "notifications_list".to_string(),
            description: "List recent notifications.".to_string(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {"limit": {"type": "integer"}},
            }),
        },
        bridge_protocol::wire::ToolDescriptor {
            name: "notifications_get".to_string(),
            description: "Get a single notification by id.".to_string(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {"id": {"type": "integer"}},
                "required": ["id"],
            }),
        },
        bridge_protocol::wire::ToolDescriptor {
            name: "notifications_search".to_string(),
            description: "Search notifications by source.".to_string(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "source": {"type": "string"},
                    "limit": {"type": "integer"},
                },
            }),
        },
    ]
}

fn summarize_notification(row: &crate::store::Notification) -> Value {
    serde_json::json!({
        "id": row.id,
        "source": row.source,
        "status": format!("{:?}", row.status).to_lowercase(),
        "summary": row.summary,
        "receivedAtMs": row.received_at_ms,
    })
}

fn is_thread_not_found(err: &TransportError) -> bool {
    matches!(err, TransportError::Rpc { message, .. } if message.to_lowercase().contains("thread not found"))
}

fn is_unknown_method(err: &TransportError, method: &str) -> bool {
    matches!(err, TransportError::Rpc { message, .. }
        if message.to_lowercase().contains("unknown variant") || message.to_lowercase().contains(&format!("unknown method {method}")))
}

/// Heuristic predicate for "spark model unavailable" (spec §4.3.4, §9
/// open question: the agent's exact error-string surface is not
/// documented).
fn is_spark_inaccessible(err: &TransportError, current_model: &str) -> bool {
    if AgentModel::classify(current_model) != AgentModel::Spark {
        return false;
    }
    let TransportError::Rpc { message, .. } = err else { return false };
    let lower = message.to_lowercase();
    let mentions_spark = lower.contains("spark");
    let mentions_unavailable = [
        "not available",
        "not permitted",
        "not enabled",
        "insufficient",
        "permission",
        "access denied",
        "unauthorized",
        "forbidden",
        "pro",
    ]
    .iter()
    .any(|needle| lower.contains(needle));
    mentions_spark && mentions_unavailable
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spark_inaccessible_predicate_matches_seed_scenario() {
        let err = TransportError::Rpc {
            code: -32000,
            message: "model gpt-5.3-codex-spark is not available for this account".to_string(),
            data: None,
        };
        assert!(is_spark_inaccessible(&err, "gpt-5.3-codex-spark"));
    }

    #[test]
    fn spark_inaccessible_predicate_requires_spark_current_model() {
        let err = TransportError::Rpc {
            code: -32000,
            message: "model gpt-5.3-codex-spark is not available for this account".to_string(),
            data: None,
        };
        assert!(!is_spark_inaccessible(&err, "gpt-5.3-codex"));
    }

    #[test]
    fn thread_not_found_predicate_is_case_insensitive() {
        let err = TransportError::Rpc { code: -32001, message: "Thread Not Found: th_1".to_string(), data: None };
        assert!(is_thread_not_found(&err));
    }
}
