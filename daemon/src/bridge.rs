//! Bridge Orchestrator (C6, spec §4.6): poll loop, command router,
//! outbound queue, event fan-in, restart/supervision hooks.

use std::collections::HashSet;
use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use bridge_protocol::BridgeEvent;
use bridge_protocol::TurnMode;
use bridge_protocol::TurnStatus;
use tokio::sync::mpsc;
use tokio::sync::Mutex;

use crate::chunking;
use crate::commands;
use crate::commands::CommandContext;
use crate::config::Config;
use crate::media;
use crate::notifications::DecisionOutcome;
use crate::notifications::NotificationConfig;
use crate::notifications::NotificationPipeline;
use crate::provider::InboundMessage;
use crate::provider::ProviderClient;
use crate::session::SessionManager;
use crate::store::AuditEventInput;
use crate::store::Store;
use crate::styling;

const ASSISTANT_RELAY_CAPACITY: usize = 4000;
const TYPING_HEARTBEAT_FLOOR: Duration = Duration::from_secs(10);
const TYPING_BACKOFF: Duration = Duration::from_secs(30);
const POLL_ERROR_WINDOW: Duration = Duration::from_secs(60);

/// Tracks the most recent item ids already relayed to the user, so a
/// duplicate `assistantFinal` (e.g. after a retried turn) isn't resent.
struct AssistantRelay {
    seen: HashSet<String>,
    order: VecDeque<String>,
}

impl AssistantRelay {
    fn new() -> Self {
        Self { seen: HashSet::new(), order: VecDeque::new() }
    }

    /// Returns `true` the first time `item_id` is observed.
    fn mark_new(&mut self, item_id: &str) -> bool {
        if self.seen.contains(item_id) {
            return false;
        }
        self.seen.insert(item_id.to_string());
        self.order.push_back(item_id.to_string());
        if self.order.len() > ASSISTANT_RELAY_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }
}

struct TypingState {
    enabled: bool,
    heartbeat: Duration,
    last_sent: Option<Instant>,
    backoff_until: Option<Instant>,
    in_flight: bool,
}

impl TypingState {
    fn new(enabled: bool, heartbeat: Duration) -> Self {
        Self { enabled, heartbeat, last_sent: None, backoff_until: None, in_flight: false }
    }

    fn should_send(&self, now: Instant) -> bool {
        if !self.enabled || self.in_flight {
            return false;
        }
        if self.backoff_until.is_some_and(|until| now < until) {
            return false;
        }
        self.last_sent.is_none_or(|last| now.duration_since(last) >= self.heartbeat)
    }

    fn clear(&mut self) {
        self.last_sent = None;
        self.backoff_until = None;
        self.in_flight = false;
    }
}

struct PollErrorSuppressor {
    signature: Option<String>,
    window_start: Instant,
    suppressed: u32,
}

impl PollErrorSuppressor {
    fn new() -> Self {
        Self { signature: None, window_start: Instant::now(), suppressed: 0 }
    }

    /// Returns `(should_log_now, suppressed_count_to_report)`.
    fn observe(&mut self, message: &str) -> (bool, u32) {
        let now = Instant::now();
        match &self.signature {
            Some(sig) if sig == message && now.duration_since(self.window_start) < POLL_ERROR_WINDOW => {
                self.suppressed += 1;
                (false, 0)
            }
            _ => {
                let reported = self.suppressed;
                self.signature = Some(message.to_string());
                self.window_start = now;
                self.suppressed = 0;
                (true, reported)
            }
        }
    }
}

pub struct BridgeConfig {
    pub trusted_user: String,
    pub poll_interval: Duration,
    pub enable_typing_indicator: bool,
    pub enable_read_receipts: bool,
    pub enable_outbound_styling: bool,
    pub enable_startup_backlog_discard: bool,
    pub typing_heartbeat: Duration,
}

impl BridgeConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            trusted_user: config.trusted_user.clone(),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            enable_typing_indicator: config.enable_typing_indicator,
            enable_read_receipts: config.enable_read_receipts,
            enable_outbound_styling: config.enable_outbound_styling,
            enable_startup_backlog_discard: config.enable_startup_backlog_discard,
            typing_heartbeat: Duration::from_secs(config.typing_heartbeat_secs).max(TYPING_HEARTBEAT_FLOOR),
        }
    }
}

pub struct Bridge {
    store: Store,
    session: Arc<SessionManager>,
    provider: ProviderClient,
    notifications: Arc<NotificationPipeline>,
    config: BridgeConfig,
    outbound_tx: mpsc::UnboundedSender<String>,
    restart_requested: Arc<AtomicBool>,
    relay: Mutex<AssistantRelay>,
    typing: Mutex<TypingState>,
    poll_errors: Mutex<PollErrorSuppressor>,
    pending_notification_text: Mutex<Option<String>>,
}

impl Bridge {
    pub async fn start(
        config: &Config,
        store: Store,
        session: Arc<SessionManager>,
        provider: ProviderClient,
        mut events_rx: mpsc::UnboundedReceiver<BridgeEvent>,
        restart_requested: Arc<AtomicBool>,
    ) -> anyhow::Result<Arc<Self>> {
        let bridge_config = BridgeConfig::from_config(config);
        let notifications = Arc::new(NotificationPipeline::new(
            store.clone(),
            NotificationConfig {
                enabled: config.notifications_enabled,
                raw_excerpt_bytes: config.notification_raw_excerpt_bytes,
                retention_days: config.notification_retention_days,
                max_rows: config.notification_max_rows,
            },
        ));

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let typing = TypingState::new(bridge_config.enable_typing_indicator, bridge_config.typing_heartbeat);

        let bridge = Arc::new(Self {
            store,
            session,
            provider,
            notifications,
            config: bridge_config,
            outbound_tx,
            restart_requested,
            relay: Mutex::new(AssistantRelay::new()),
            typing: Mutex::new(typing),
            poll_errors: Mutex::new(PollErrorSuppressor::new()),
            pending_notification_text: Mutex::new(None),
        });

        bridge.clone().spawn_outbound_worker(outbound_rx);

        let event_bridge = bridge.clone();
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                event_bridge.clone().handle_bridge_event(event).await;
            }
        });

        bridge.run_startup_sequence().await?;
        Ok(bridge)
    }

    /// Shared with the webhook server so ingress and the poll loop agree
    /// on what's pending, in-flight, and already decided.
    pub fn notifications(&self) -> Arc<NotificationPipeline> {
        self.notifications.clone()
    }

    fn command_context(&self) -> CommandContext {
        CommandContext {
            store: self.store.clone(),
            session: self.session.clone(),
            notifications: self.notifications.clone(),
            trusted_user: self.config.trusted_user.clone(),
            restart_requested: self.restart_requested.clone(),
        }
    }

    fn spawn_outbound_worker(self: Arc<Self>, mut outbound_rx: mpsc::UnboundedReceiver<String>) {
        tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                self.send_outbound_now(&text).await;
            }
        });
    }

    fn enqueue_outbound(&self, text: String) {
        let _ = self.outbound_tx.send(text);
    }

    /// Styles, chunks, and sends a single logical message, contiguously (spec §4.6.3).
    async fn send_outbound_now(&self, text: &str) {
        let styled = if self.config.enable_outbound_styling { styling::style_markdown(text) } else { text.to_string() };
        for chunk in chunking::split_message(&styled, chunking::DEFAULT_MAX_CHUNK_CHARS) {
            if let Err(error) = self.provider.send_message(&self.config.trusted_user, &chunk).await {
                tracing::warn!(%error, "outbound send failed");
            }
        }
    }

    // ---- §4.6.1 Startup ---------------------------------------------------

    async fn run_startup_sequence(&self) -> anyhow::Result<()> {
        if self.config.enable_startup_backlog_discard {
            self.discard_startup_backlog().await?;
        }
        self.dispatch_pending_restart_notice()?;
        Ok(())
    }

    async fn discard_startup_backlog(&self) -> anyhow::Result<()> {
        let messages = match self.provider.fetch_inbound_messages().await {
            Ok(messages) => messages,
            Err(error) => {
                tracing::warn!(%error, "startup backlog fetch failed; continuing without discard");
                return Ok(());
            }
        };
        for message in messages {
            if !self.is_from_trusted_user(&message) || message.message_handle.is_empty() {
                continue;
            }
            if self.store.dedupe_mark_processed(&message.message_handle)? {
                self.store.audit_append(AuditEventInput {
                    phone_number: &self.config.trusted_user,
                    thread_id: None,
                    turn_id: None,
                    kind: "startup_backlog_discarded",
                    summary: &message.message_handle,
                    payload: None,
                })?;
            }
        }
        Ok(())
    }

    fn dispatch_pending_restart_notice(&self) -> anyhow::Result<()> {
        let Some(notice) = self.store.flag_consume("pending_bridge_restart_notice")? else {
            return Ok(());
        };
        let target = notice.get("target").and_then(|v| v.as_str()).unwrap_or("bridge");
        let message = if target == "codex" { "Codex restarted. Back online.".to_string() } else { format!("{} restarted. Back online.", capitalize(target)) };
        self.enqueue_outbound(message);
        Ok(())
    }

    // ---- §4.6.2 Poll loop ---------------------------------------------------

    pub async fn run(self: Arc<Self>, running: Arc<AtomicBool>) -> anyhow::Result<()> {
        while running.load(Ordering::SeqCst) && !self.restart_requested.load(Ordering::SeqCst) {
            if let Err(error) = self.poll_once().await {
                self.log_poll_error(&error.to_string());
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
        self.session.stop().await?;
        Ok(())
    }

    async fn poll_once(&self) -> anyhow::Result<()> {
        let mut messages = self.provider.fetch_inbound_messages().await?;
        messages.sort_by_key(message_sort_key);

        for message in messages {
            self.process_inbound_message(message).await?;
        }

        if !self.session.has_active_turn().await? && self.notifications.is_enabled() {
            self.maybe_process_notification().await?;
        }

        let now_ms = chrono::Utc::now().timestamp_millis();
        let pruned = self.notifications.maybe_prune(now_ms)?;
        if pruned > 0 {
            tracing::debug!(pruned, "pruned aged notifications");
        }

        Ok(())
    }

    fn is_from_trusted_user(&self, message: &InboundMessage) -> bool {
        let Some(from) = message.from_number.as_ref().and_then(crate::phone::first_non_empty_phone) else {
            return false;
        };
        crate::phone::normalize_phone_number(&from).as_deref() == Some(self.config.trusted_user.as_str())
    }

    async fn process_inbound_message(&self, message: InboundMessage) -> anyhow::Result<()> {
        if !self.is_from_trusted_user(&message) || message.message_handle.is_empty() {
            return Ok(());
        }
        if !self.store.dedupe_mark_processed(&message.message_handle)? {
            return Ok(());
        }

        let content = message.content.clone().unwrap_or_default();
        self.store.audit_append(AuditEventInput {
            phone_number: &self.config.trusted_user,
            thread_id: None,
            turn_id: None,
            kind: "inbound_message",
            summary: &content,
            payload: None,
        })?;

        if let Some(parsed) = commands::parse(&content) {
            self.handle_command_message(parsed).await?;
            if self.config.enable_read_receipts {
                self.provider.mark_read(&message.message_handle).await;
            }
            return Ok(());
        }

        let text = media::compose_inbound_text_for_codex(&content, message.media_url.as_deref());
        if text.is_empty() {
            return Ok(());
        }

        if self.store.flag_get_bool("paused", false)? {
            self.enqueue_outbound("Bridge is paused. Send /resume to continue.".to_string());
            return Ok(());
        }

        if self.notifications.has_active_decision_turn() {
            self.enqueue_outbound("Still deciding on a notification. Please resend in a moment.".to_string());
            return Ok(());
        }

        match self.session.start_or_steer_turn(&text).await {
            Ok(_) => {
                if self.config.enable_read_receipts {
                    self.provider.mark_read(&message.message_handle).await;
                }
            }
            Err(error) => {
                self.enqueue_outbound(format!("Turn failed: {error}"));
            }
        }

        Ok(())
    }

    async fn handle_command_message(&self, parsed: Result<commands::Command, commands::CommandParseError>) -> anyhow::Result<()> {
        let ctx = self.command_context();
        let now_ms = chrono::Utc::now().timestamp_millis();
        match parsed {
            Err(commands::CommandParseError::Unrecognized(_)) => {
                self.enqueue_outbound("Unknown command.".to_string());
            }
            Err(commands::CommandParseError::InvalidArguments(message)) => {
                self.enqueue_outbound(message);
            }
            Ok(command) => match ctx.execute(command, now_ms).await {
                Ok(dispatch) => {
                    if let Some(reply) = dispatch.reply {
                        self.enqueue_outbound(reply);
                    }
                    if dispatch.stop_poll_loop {
                        self.restart_requested.store(true, Ordering::SeqCst);
                    }
                }
                Err(error) => {
                    self.enqueue_outbound(format!("Command failed: {error}"));
                }
            },
        }
        Ok(())
    }

    async fn maybe_process_notification(&self) -> anyhow::Result<()> {
        let Some(claimed) = self.notifications.try_claim_next()? else {
            return Ok(());
        };
        self.start_notification_turn(claimed.id, &claimed.prompt, 1).await
    }

    async fn start_notification_turn(&self, notification_id: i64, prompt: &str, attempt: u8) -> anyhow::Result<()> {
        match self.session.start_notification_turn(prompt, notification_id, attempt).await {
            Ok(_) => Ok(()),
            Err(error) => {
                tracing::warn!(%error, notification_id, "notification turn failed to start");
                Ok(())
            }
        }
    }

    // ---- §4.6.5 Event relay / §4.6.4 Typing indicator ---------------------

    async fn handle_bridge_event(self: Arc<Self>, event: BridgeEvent) {
        if let Err(error) = self.handle_bridge_event_fallible(event).await {
            tracing::error!(%error, "error handling bridge event");
        }
    }

    async fn handle_bridge_event_fallible(&self, event: BridgeEvent) -> anyhow::Result<()> {
        match event {
            BridgeEvent::TurnStarted { .. } => Ok(()),
            BridgeEvent::TurnCompleted { mode, turn_id, status, error, .. } => {
                self.clear_typing().await;
                if mode == TurnMode::Notification {
                    self.handle_notification_turn_completed(turn_id, status, error).await
                } else {
                    Ok(())
                }
            }
            BridgeEvent::AssistantDelta { mode, .. } => {
                if mode == TurnMode::User {
                    self.maybe_send_typing_indicator().await;
                }
                Ok(())
            }
            BridgeEvent::AssistantFinal { item_id, mode, text, .. } => {
                if mode == TurnMode::Notification {
                    self.last_notification_text(&text).await;
                    return Ok(());
                }
                let is_new = { self.relay.lock().await.mark_new(&item_id) };
                if is_new && !text.trim().is_empty() {
                    self.enqueue_outbound(text);
                }
                Ok(())
            }
            BridgeEvent::CompactionStarted { .. } | BridgeEvent::CompactionCompleted { .. } => Ok(()),
            BridgeEvent::ApprovalDeclinedDueToPolicy { .. } => Ok(()),
            BridgeEvent::ModelFallback { from_model, to_model, to_effort, operation, reason } => {
                tracing::info!(from_model, to_model, effort = to_effort.as_str(), operation, reason, "model fallback applied");
                Ok(())
            }
        }
    }

    async fn last_notification_text(&self, text: &str) {
        let mut pending = self.pending_notification_text.lock().await;
        *pending = Some(text.to_string());
    }

    async fn handle_notification_turn_completed(&self, _turn_id: String, status: TurnStatus, error: Option<String>) -> anyhow::Result<()> {
        let Some(notification_id) = self.notifications.active_notification_id() else {
            return Ok(());
        };
        let final_text = self.pending_notification_text.lock().await.take();
        let outcome = self.notifications.handle_turn_completed(notification_id, status, error, final_text)?;
        match outcome {
            DecisionOutcome::RetryDecisionTurn(claimed) => {
                self.start_notification_turn(claimed.id, &claimed.prompt, 2).await?;
            }
            DecisionOutcome::Decided { message: Some(message) } => self.enqueue_outbound(message),
            DecisionOutcome::Decided { message: None } => {}
            DecisionOutcome::Failed { fallback_message: Some(message) } => self.enqueue_outbound(message),
            DecisionOutcome::Failed { fallback_message: None } => {}
        }
        Ok(())
    }

    async fn maybe_send_typing_indicator(&self) {
        let now = Instant::now();
        let should_send = {
            let mut typing = self.typing.lock().await;
            if !typing.should_send(now) {
                false
            } else {
                typing.in_flight = true;
                true
            }
        };
        if !should_send {
            return;
        }
        let result = self.provider.send_typing_indicator(&self.config.trusted_user).await;
        let mut typing = self.typing.lock().await;
        typing.in_flight = false;
        match result {
            Ok(()) => typing.last_sent = Some(now),
            Err(error) => {
                tracing::debug!(%error, "typing indicator send failed");
                typing.backoff_until = Some(now + TYPING_BACKOFF);
            }
        }
    }

    async fn clear_typing(&self) {
        self.typing.lock().await.clear();
    }

    // ---- §4.6.7 Poll-error log suppression ---------------------------------

    fn log_poll_error(&self, message: &str) {
        let Ok(mut suppressor) = self.poll_errors.try_lock() else {
            tracing::error!(%message, "poll loop error");
            return;
        };
        let (should_log, suppressed) = suppressor.observe(message);
        if should_log {
            if suppressed > 0 {
                tracing::warn!(suppressed, "resuming normal logging after repeated poll errors");
            }
            tracing::error!(%message, "poll loop error");
        }
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

fn message_sort_key(message: &InboundMessage) -> i64 {
    [&message.created_at, &message.date_sent, &message.date_updated]
        .iter()
        .find_map(|candidate| candidate.as_deref().and_then(parse_timestamp_ms))
        .unwrap_or(i64::MAX)
}

fn parse_timestamp_ms(raw: &str) -> Option<i64> {
    chrono::DateTime::parse_from_rfc3339(raw).ok().map(|dt| dt.timestamp_millis())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assistant_relay_suppresses_repeat_item_ids() {
        let mut relay = AssistantRelay::new();
        assert!(relay.mark_new("item_1"));
        assert!(!relay.mark_new("item_1"));
        assert!(relay.mark_new("item_2"));
    }

    #[test]
    fn assistant_relay_evicts_oldest_past_capacity() {
        let mut relay = AssistantRelay::new();
        for i in 0..ASSISTANT_RELAY_CAPACITY {
            assert!(relay.mark_new(&format!("item_{i}")));
        }
        assert!(relay.mark_new(&format!("item_{ASSISTANT_RELAY_CAPACITY}")));
        assert!(relay.mark_new("item_0"));
    }

    #[test]
    fn poll_error_suppressor_counts_repeats_within_window() {
        let mut suppressor = PollErrorSuppressor::new();
        let (first_log, _) = suppressor.observe("boom");
        assert!(first_log);
        let (second_log, _) = suppressor.observe("boom");
        assert!(!second_log);
        let (third_log, suppressed) = suppressor.observe("different");
        assert!(third_log);
        assert_eq!(suppressed, 1);
    }

    #[test]
    fn missing_timestamps_sort_last() {
        let with_ts = InboundMessage {
            message_handle: "a".to_string(),
            content: None,
            from_number: None,
            to_number: None,
            is_outbound: false,
            media_url: None,
            created_at: Some("2024-01-01T00:00:00Z".to_string()),
            date_sent: None,
            date_updated: None,
        };
        let without_ts = InboundMessage { message_handle: "b".to_string(), created_at: None, ..with_ts.clone() };
        assert!(message_sort_key(&with_ts) < message_sort_key(&without_ts));
    }
}
