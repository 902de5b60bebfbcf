//! Notification Pipeline (C4, spec §4.4): normalize incoming payloads,
//! dedupe + queue them, drive a decision-mode turn against the agent,
//! and enforce the retry-once-then-fallback rule for malformed
//! decision envelopes.

use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;
use std::sync::Mutex;

use bridge_protocol::notification_decision::Delivery;
use bridge_protocol::NotificationDecision;
use bridge_protocol::TurnStatus;
use serde_json::Value;
use sha2::Digest;
use sha2::Sha256;

use crate::store::AuditEventInput;
use crate::store::Notification;
use crate::store::NotificationInput;
use crate::store::NotificationStatus;
use crate::store::Store;

const SUMMARY_MAX_CHARS: usize = 220;
const PRUNE_INTERVAL_MS: i64 = 10 * 60 * 1000;
const SUMMARY_FIELDS: [&str; 7] = ["summary", "message", "text", "title", "event", "type", "kind"];
const EVENT_ID_FIELDS: [&str; 4] = ["event_id", "eventId", "id", "message_handle"];
const ACCOUNT_FIELDS: [&str; 4] = ["source_account", "sourceAccount", "account", "account_id"];

pub struct NotificationConfig {
    pub enabled: bool,
    pub raw_excerpt_bytes: usize,
    pub retention_days: u32,
    pub max_rows: u32,
}

#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub notification_id: i64,
    pub inserted: bool,
}

#[derive(Debug, Clone)]
pub struct ClaimedNotification {
    pub id: i64,
    pub source: String,
    pub summary: String,
    pub prompt: String,
}

#[derive(Debug, Clone)]
pub enum DecisionOutcome {
    /// The envelope did not parse; the caller should immediately start
    /// a second decision turn for the same notification.
    RetryDecisionTurn(ClaimedNotification),
    /// A valid decision was reached; dispatch `message` to the user if
    /// `Some`, otherwise the decision was `suppress`.
    Decided { message: Option<String> },
    /// The turn failed, was interrupted, or exhausted its retry; the
    /// notification is terminally `failed`, optionally with a raw
    /// fallback message to still deliver to the user.
    Failed { fallback_message: Option<String> },
}

struct ActiveDecisionTurn {
    notification_id: i64,
    attempt: u8,
}

pub struct NotificationPipeline {
    store: Store,
    config: NotificationConfig,
    active: Mutex<Option<ActiveDecisionTurn>>,
    last_prune_at_ms: AtomicI64,
}

impl NotificationPipeline {
    pub fn new(store: Store, config: NotificationConfig) -> Self {
        Self { store, config, active: Mutex::new(None), last_prune_at_ms: AtomicI64::new(0) }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn has_active_decision_turn(&self) -> bool {
        self.active.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    /// The notification id of the in-flight decision turn, if any.
    pub fn active_notification_id(&self) -> Option<i64> {
        self.active.lock().unwrap_or_else(|e| e.into_inner()).as_ref().map(|a| a.notification_id)
    }

    /// Normalizes and appends a payload (spec §4.4.1-§4.4.2).
    pub fn ingest(
        &self,
        source: &str,
        payload: &Value,
        caller_source_account: Option<&str>,
        caller_source_event_id: Option<&str>,
        received_at_ms: i64,
    ) -> anyhow::Result<IngestOutcome> {
        let normalized = normalize(payload, source, caller_source_account, caller_source_event_id, self.config.raw_excerpt_bytes);

        let outcome = self.store.notification_append(NotificationInput {
            source: &normalized.source,
            source_account: normalized.source_account.as_deref(),
            source_event_id: normalized.source_event_id.as_deref(),
            dedupe_key: &normalized.dedupe_key,
            summary: &normalized.summary,
            payload_hash: &normalized.payload_hash,
            raw_excerpt: &normalized.raw_excerpt,
            raw_size_bytes: normalized.raw_size_bytes,
            raw_truncated: normalized.raw_truncated,
            received_at_ms,
        })?;

        self.store.audit_append(AuditEventInput {
            phone_number: "-",
            thread_id: None,
            turn_id: None,
            kind: if outcome.inserted { "notification_ingested" } else { "notification_duplicate" },
            summary: &normalized.summary,
            payload: Some(&serde_json::json!({"dedupeKey": normalized.dedupe_key, "notificationId": outcome.id})),
        })?;

        Ok(IngestOutcome { notification_id: outcome.id, inserted: outcome.inserted })
    }

    /// Claims the oldest queued notification and builds its decision-turn
    /// prompt, iff no decision turn is already in flight (spec §4.4.2).
    pub fn try_claim_next(&self) -> anyhow::Result<Option<ClaimedNotification>> {
        if self.has_active_decision_turn() {
            return Ok(None);
        }
        let Some(row) = self.store.notification_claim_next()? else {
            return Ok(None);
        };

        let claimed = ClaimedNotification { id: row.id, source: row.source.clone(), summary: row.summary.clone(), prompt: decision_prompt(&row) };
        *self.active.lock().unwrap_or_else(|e| e.into_inner()) = Some(ActiveDecisionTurn { notification_id: row.id, attempt: 1 });
        Ok(Some(claimed))
    }

    /// Rebuilds the prompt for a retry attempt without reclaiming the row.
    pub fn retry_prompt(&self, notification_id: i64) -> anyhow::Result<Option<String>> {
        Ok(self.store.notification_get(notification_id)?.map(|row| decision_prompt(&row)))
    }

    /// Processes a completed (or failed/interrupted) decision-mode turn
    /// for `notification_id` (spec §4.4.3-§4.4.4).
    pub fn handle_turn_completed(
        &self,
        notification_id: i64,
        status: TurnStatus,
        error: Option<String>,
        final_assistant_text: Option<String>,
    ) -> anyhow::Result<DecisionOutcome> {
        if status != TurnStatus::Completed {
            let message = error.unwrap_or_else(|| format!("{status:?}"));
            self.store.notification_record_failure(notification_id, &message)?;
            self.store.audit_append(AuditEventInput {
                phone_number: "-",
                thread_id: None,
                turn_id: None,
                kind: "notification_failed",
                summary: &message,
                payload: None,
            })?;
            self.clear_active();
            return Ok(DecisionOutcome::Failed { fallback_message: None });
        }

        let text = final_assistant_text.unwrap_or_default();
        match NotificationDecision::parse(&text) {
            Ok(decision) => {
                self.clear_active();
                self.record_decision(notification_id, &decision)?;
                match decision.delivery {
                    Delivery::Suppress => Ok(DecisionOutcome::Decided { message: None }),
                    Delivery::Send => {
                        let row = self.store.notification_get(notification_id)?;
                        let fallback = row.map(|r| fallback_message(&r.source, &r.summary)).unwrap_or_default();
                        Ok(DecisionOutcome::Decided { message: Some(decision.message.unwrap_or(fallback)) })
                    }
                }
            }
            Err(_) if self.attempt_for(notification_id) < 2 => {
                self.bump_attempt();
                let row = self.store.notification_get(notification_id)?;
                let Some(row) = row else {
                    self.clear_active();
                    return Ok(DecisionOutcome::Failed { fallback_message: None });
                };
                Ok(DecisionOutcome::RetryDecisionTurn(ClaimedNotification {
                    id: row.id,
                    source: row.source.clone(),
                    summary: row.summary.clone(),
                    prompt: decision_prompt(&row),
                }))
            }
            Err(_) => {
                let row = self.store.notification_get(notification_id)?;
                let fallback = row.as_ref().map(|r| fallback_message(&r.source, &r.summary));
                self.store.notification_record_failure(notification_id, "invalid decision envelope after retry")?;
                self.store.audit_append(AuditEventInput {
                    phone_number: "-",
                    thread_id: None,
                    turn_id: None,
                    kind: "notification_failed",
                    summary: "invalid decision envelope after retry",
                    payload: None,
                })?;
                self.clear_active();
                Ok(DecisionOutcome::Failed { fallback_message: fallback })
            }
        }
    }

    fn record_decision(&self, notification_id: i64, decision: &NotificationDecision) -> anyhow::Result<()> {
        let status = match decision.delivery {
            Delivery::Suppress => NotificationStatus::Suppressed,
            Delivery::Send => NotificationStatus::Sent,
        };
        let decision_json = serde_json::to_string(decision)?;
        self.store.notification_record_decision(
            notification_id,
            status,
            Some(delivery_str(decision.delivery)),
            decision.reason_code.as_deref(),
            decision.message.as_deref(),
            None,
            None,
            Some(&decision_json),
        )?;
        self.store.audit_append(AuditEventInput {
            phone_number: "-",
            thread_id: None,
            turn_id: None,
            kind: "notification_decided",
            summary: delivery_str(decision.delivery),
            payload: Some(&serde_json::json!(decision)),
        })?;
        Ok(())
    }

    fn attempt_for(&self, notification_id: i64) -> u8 {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .filter(|a| a.notification_id == notification_id)
            .map(|a| a.attempt)
            .unwrap_or(1)
    }

    fn bump_attempt(&self) {
        if let Some(active) = self.active.lock().unwrap_or_else(|e| e.into_inner()).as_mut() {
            active.attempt += 1;
        }
    }

    fn clear_active(&self) {
        *self.active.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Deletes notifications past the retention window / row cap, at
    /// most once per ten minutes.
    pub fn maybe_prune(&self, now_ms: i64) -> anyhow::Result<usize> {
        let last = self.last_prune_at_ms.load(Ordering::SeqCst);
        if now_ms - last < PRUNE_INTERVAL_MS {
            return Ok(0);
        }
        self.last_prune_at_ms.store(now_ms, Ordering::SeqCst);
        self.store.notification_prune(self.config.retention_days, self.config.max_rows)
    }
}

fn delivery_str(delivery: Delivery) -> &'static str {
    match delivery {
        Delivery::Send => "send",
        Delivery::Suppress => "suppress",
    }
}

fn decision_prompt(row: &Notification) -> String {
    format!(
        "A notification arrived from source \"{}\":\n{}\n\nDecide whether to relay this to the user. Respond with the required JSON decision envelope only.",
        row.source, row.summary
    )
}

fn fallback_message(source: &str, summary: &str) -> String {
    format!("Notification ({source}): {summary}")
}

struct NormalizedNotification {
    source: String,
    source_account: Option<String>,
    source_event_id: Option<String>,
    dedupe_key: String,
    summary: String,
    payload_hash: String,
    raw_excerpt: Vec<u8>,
    raw_size_bytes: i64,
    raw_truncated: bool,
}

fn normalize(
    payload: &Value,
    source: &str,
    caller_source_account: Option<&str>,
    caller_source_event_id: Option<&str>,
    raw_excerpt_bytes: usize,
) -> NormalizedNotification {
    let clamped_n = raw_excerpt_bytes.clamp(256, 32768);
    let canonical = canonicalize_payload(payload);
    let payload_hash = sha256_hex(canonical.as_bytes());

    let source_event_id = caller_source_event_id
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .or_else(|| first_field_str(payload, &EVENT_ID_FIELDS));
    let source_account = caller_source_account
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .or_else(|| first_field_str(payload, &ACCOUNT_FIELDS));

    let account_part = source_account.clone().unwrap_or_else(|| "-".to_string());
    let dedupe_key = match &source_event_id {
        Some(event_id) => format!("event:{source}:{account_part}:{event_id}"),
        None => format!("hash:{source}:{account_part}:{payload_hash}"),
    };

    let summary = derive_summary(payload);

    let raw_bytes = canonical.as_bytes();
    let raw_truncated = raw_bytes.len() > clamped_n;
    let raw_excerpt = raw_bytes[..raw_bytes.len().min(clamped_n)].to_vec();

    NormalizedNotification {
        source: source.to_string(),
        source_account,
        source_event_id,
        dedupe_key,
        summary,
        payload_hash,
        raw_excerpt,
        raw_size_bytes: raw_bytes.len() as i64,
        raw_truncated,
    }
}

fn canonicalize_payload(payload: &Value) -> String {
    match payload {
        Value::Object(_) | Value::Array(_) => payload.to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn first_field_str(payload: &Value, fields: &[&str]) -> Option<String> {
    let obj = payload.as_object()?;
    fields.iter().find_map(|f| obj.get(*f).and_then(Value::as_str).filter(|s| !s.is_empty()).map(str::to_string))
}

fn derive_summary(payload: &Value) -> String {
    let candidate = first_field_str(payload, &SUMMARY_FIELDS);
    let text = candidate.unwrap_or_else(|| fallback_description(payload));
    clamp_chars(&text, SUMMARY_MAX_CHARS)
}

fn fallback_description(payload: &Value) -> String {
    match payload {
        Value::Object(map) => {
            let mut keys: Vec<&str> = map.keys().map(String::as_str).collect();
            keys.sort_unstable();
            format!("payload with keys: {}", keys.join(", "))
        }
        Value::Array(items) => format!("array payload with {} entries", items.len()),
        other => other.to_string(),
    }
}

fn clamp_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn dedupe_key_prefers_event_id_seed_scenario() {
        let payload = serde_json::json!({"event_id": "evt_1", "summary": "build failed"});
        let normalized = normalize(&payload, "webhook", None, None, 4096);
        assert_eq!(normalized.dedupe_key, "event:webhook:-:evt_1");
        assert_eq!(normalized.summary, "build failed");
    }

    #[test]
    fn dedupe_key_falls_back_to_payload_hash() {
        let payload = serde_json::json!({"summary": "no id here"});
        let normalized = normalize(&payload, "cron", None, None, 4096);
        assert!(normalized.dedupe_key.starts_with("hash:cron:-:"));
    }

    #[test]
    fn raw_excerpt_bytes_clamped_to_bounds() {
        let payload = serde_json::json!({"summary": "x".repeat(100)});
        let normalized = normalize(&payload, "webhook", None, None, 10);
        assert_eq!(normalized.raw_excerpt.len(), 256.min(normalized.raw_size_bytes as usize));
    }

    #[test]
    fn ingest_and_retry_flow_matches_seed_scenario_six() {
        let store = Store::open_in_memory().unwrap();
        let config = NotificationConfig { enabled: true, raw_excerpt_bytes: 4096, retention_days: 30, max_rows: 5000 };
        let pipeline = NotificationPipeline::new(store, config);

        let payload = serde_json::json!({"event_id": "evt_1", "summary": "build failed"});
        let outcome = pipeline.ingest("webhook", &payload, None, None, 1).unwrap();
        assert!(outcome.inserted);

        let claimed = pipeline.try_claim_next().unwrap().unwrap();
        assert_eq!(claimed.id, outcome.notification_id);

        let first =
            pipeline.handle_turn_completed(claimed.id, TurnStatus::Completed, None, Some("not json".to_string())).unwrap();
        assert!(matches!(first, DecisionOutcome::RetryDecisionTurn(_)));

        let second =
            pipeline.handle_turn_completed(claimed.id, TurnStatus::Completed, None, Some("not json".to_string())).unwrap();
        match second {
            DecisionOutcome::Failed { fallback_message } => {
                assert_eq!(fallback_message.as_deref(), Some("Notification (webhook): build failed"));
            }
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[test]
    fn suppress_decision_emits_no_message() {
        let store = Store::open_in_memory().unwrap();
        let config = NotificationConfig { enabled: true, raw_excerpt_bytes: 4096, retention_days: 30, max_rows: 5000 };
        let pipeline = NotificationPipeline::new(store, config);

        let payload = serde_json::json!({"event_id": "evt_1", "summary": "build failed"});
        let outcome = pipeline.ingest("webhook", &payload, None, None, 1).unwrap();
        pipeline.try_claim_next().unwrap();

        let result = pipeline
            .handle_turn_completed(
                outcome.notification_id,
                TurnStatus::Completed,
                None,
                Some(r#"{"delivery":"suppress","message":null,"reasonCode":"deploy_noise"}"#.to_string()),
            )
            .unwrap();
        assert!(matches!(result, DecisionOutcome::Decided { message: None }));
    }
}
