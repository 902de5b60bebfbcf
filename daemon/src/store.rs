//! Persistent Store (C1, spec §4.1, schema in §6). A single SQLite
//! connection behind a mutex is the sole writer; every method here is
//! synchronous and callers must treat calls as linearizable in call
//! order, per §5's concurrency model.

use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;

use anyhow::Context;
use rusqlite::params;
use rusqlite::Connection;
use rusqlite::OptionalExtension;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

const SCHEMA_VERSION: i64 = 1;

#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub phone_number: String,
    pub thread_id: Option<String>,
    pub active_turn_id: Option<String>,
    pub model: String,
    pub updated_at_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: i64,
    pub ts_ms: i64,
    pub phone_number: String,
    pub thread_id: Option<String>,
    pub turn_id: Option<String>,
    pub kind: String,
    pub summary: String,
    pub payload_json: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AuditEventInput<'a> {
    pub phone_number: &'a str,
    pub thread_id: Option<&'a str>,
    pub turn_id: Option<&'a str>,
    pub kind: &'a str,
    pub summary: &'a str,
    pub payload: Option<&'a Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    Received,
    Queued,
    Processing,
    Sent,
    Suppressed,
    Failed,
    Duplicate,
}

impl NotificationStatus {
    fn as_str(self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Sent => "sent",
            Self::Suppressed => "suppressed",
            Self::Failed => "failed",
            Self::Duplicate => "duplicate",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "received" => Self::Received,
            "queued" => Self::Queued,
            "processing" => Self::Processing,
            "sent" => Self::Sent,
            "suppressed" => Self::Suppressed,
            "failed" => Self::Failed,
            _ => Self::Duplicate,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NotificationInput<'a> {
    pub source: &'a str,
    pub source_account: Option<&'a str>,
    pub source_event_id: Option<&'a str>,
    pub dedupe_key: &'a str,
    pub summary: &'a str,
    pub payload_hash: &'a str,
    pub raw_excerpt: &'a [u8],
    pub raw_size_bytes: i64,
    pub raw_truncated: bool,
    pub received_at_ms: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub id: i64,
    pub source: String,
    pub source_account: Option<String>,
    pub source_event_id: Option<String>,
    pub dedupe_key: String,
    pub status: NotificationStatus,
    pub received_at_ms: i64,
    pub processed_at_ms: Option<i64>,
    pub delivery: Option<String>,
    pub reason_code: Option<String>,
    pub message_excerpt: Option<String>,
    pub summary: String,
    pub payload_hash: String,
    pub raw_excerpt: Vec<u8>,
    pub raw_size_bytes: i64,
    pub raw_truncated: bool,
    pub duplicate_count: i64,
    pub first_seen_at_ms: i64,
    pub last_seen_at_ms: i64,
    pub thread_id: Option<String>,
    pub turn_id: Option<String>,
    pub decision_json: Option<String>,
    pub error_text: Option<String>,
}

/// Result of appending a notification: whether a new row was inserted
/// and the row's (possibly pre-existing) id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendOutcome {
    pub id: i64,
    pub inserted: bool,
}

pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Clone for Store {
    fn clone(&self) -> Self {
        Self { conn: Arc::clone(&self.conn) }
    }
}

impl Store {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path).with_context(|| format!("open sqlite db {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let store = Self { conn: Arc::new(Mutex::new(conn)) };
        store.migrate()?;
        Ok(store)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn: Arc::new(Mutex::new(conn)) };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let current: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if current >= SCHEMA_VERSION {
            return Ok(());
        }

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS sessions (
                phone_number TEXT PRIMARY KEY,
                thread_id TEXT,
                active_turn_id TEXT,
                model TEXT NOT NULL,
                updated_at_ms INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS inbound_messages (
                message_handle TEXT PRIMARY KEY,
                received_at_ms INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS flags (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at_ms INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS audit_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ts_ms INTEGER NOT NULL,
                phone_number TEXT NOT NULL,
                thread_id TEXT,
                turn_id TEXT,
                kind TEXT NOT NULL,
                summary TEXT NOT NULL,
                payload_json TEXT
            );
            CREATE TABLE IF NOT EXISTS notifications (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source TEXT NOT NULL,
                source_account TEXT,
                source_event_id TEXT,
                dedupe_key TEXT NOT NULL UNIQUE,
                status TEXT NOT NULL,
                received_at_ms INTEGER NOT NULL,
                processed_at_ms INTEGER,
                delivery TEXT,
                reason_code TEXT,
                message_excerpt TEXT,
                summary TEXT NOT NULL,
                payload_hash TEXT NOT NULL,
                raw_excerpt BLOB NOT NULL,
                raw_size_bytes INTEGER NOT NULL,
                raw_truncated INTEGER NOT NULL,
                duplicate_count INTEGER NOT NULL DEFAULT 0,
                first_seen_at_ms INTEGER NOT NULL,
                last_seen_at_ms INTEGER NOT NULL,
                thread_id TEXT,
                turn_id TEXT,
                decision_json TEXT,
                error_text TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_notifications_received
                ON notifications (received_at_ms DESC);
            CREATE INDEX IF NOT EXISTS idx_notifications_source
                ON notifications (source, received_at_ms DESC);
            CREATE INDEX IF NOT EXISTS idx_notifications_status
                ON notifications (status, received_at_ms DESC);
            ",
        )?;
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ---- Session ----------------------------------------------------

    pub fn session_get(&self, phone: &str) -> anyhow::Result<Session> {
        let conn = self.lock();
        let existing = conn
            .query_row(
                "SELECT phone_number, thread_id, active_turn_id, model, updated_at_ms
                 FROM sessions WHERE phone_number = ?1",
                params![phone],
                |row| {
                    Ok(Session {
                        phone_number: row.get(0)?,
                        thread_id: row.get(1)?,
                        active_turn_id: row.get(2)?,
                        model: row.get(3)?,
                        updated_at_ms: row.get(4)?,
                    })
                },
            )
            .optional()?;

        if let Some(session) = existing {
            return Ok(session);
        }

        let now = now_ms();
        conn.execute(
            "INSERT INTO sessions (phone_number, thread_id, active_turn_id, model, updated_at_ms)
             VALUES (?1, NULL, NULL, ?2, ?3)",
            params![phone, default_model_placeholder(), now],
        )?;
        Ok(Session {
            phone_number: phone.to_string(),
            thread_id: None,
            active_turn_id: None,
            model: default_model_placeholder().to_string(),
            updated_at_ms: now,
        })
    }

    pub fn session_set_thread(&self, phone: &str, thread_id: &str) -> anyhow::Result<()> {
        self.session_get(phone)?;
        self.lock().execute(
            "UPDATE sessions SET thread_id = ?2, updated_at_ms = ?3 WHERE phone_number = ?1",
            params![phone, thread_id, now_ms()],
        )?;
        Ok(())
    }

    pub fn session_set_active_turn(&self, phone: &str, turn_id: &str) -> anyhow::Result<()> {
        self.session_get(phone)?;
        self.lock().execute(
            "UPDATE sessions SET active_turn_id = ?2, updated_at_ms = ?3 WHERE phone_number = ?1",
            params![phone, turn_id, now_ms()],
        )?;
        Ok(())
    }

    pub fn session_clear_active_turn(&self, phone: &str) -> anyhow::Result<()> {
        self.session_get(phone)?;
        self.lock().execute(
            "UPDATE sessions SET active_turn_id = NULL, updated_at_ms = ?2 WHERE phone_number = ?1",
            params![phone, now_ms()],
        )?;
        Ok(())
    }

    pub fn session_set_model(&self, phone: &str, model: &str) -> anyhow::Result<()> {
        self.session_get(phone)?;
        self.lock().execute(
            "UPDATE sessions SET model = ?2, updated_at_ms = ?3 WHERE phone_number = ?1",
            params![phone, model, now_ms()],
        )?;
        Ok(())
    }

    /// Clears thread + active turn atomically.
    pub fn session_reset(&self, phone: &str) -> anyhow::Result<()> {
        self.session_get(phone)?;
        self.lock().execute(
            "UPDATE sessions SET thread_id = NULL, active_turn_id = NULL, updated_at_ms = ?2
             WHERE phone_number = ?1",
            params![phone, now_ms()],
        )?;
        Ok(())
    }

    // ---- Dedupe -------------------------------------------------------

    /// Returns `true` iff the insert happened (i.e. the handle was not
    /// already present).
    pub fn dedupe_mark_processed(&self, handle: &str) -> anyhow::Result<bool> {
        let conn = self.lock();
        let changed = conn.execute(
            "INSERT OR IGNORE INTO inbound_messages (message_handle, received_at_ms) VALUES (?1, ?2)",
            params![handle, now_ms()],
        )?;
        Ok(changed > 0)
    }

    pub fn dedupe_mark_many(&self, handles: &[String]) -> anyhow::Result<usize> {
        let mut count = 0;
        for handle in handles {
            if self.dedupe_mark_processed(handle)? {
                count += 1;
            }
        }
        Ok(count)
    }

    pub fn dedupe_has_any(&self) -> anyhow::Result<bool> {
        let conn = self.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM inbound_messages", [], |row| row.get(0))?;
        Ok(count > 0)
    }

    // ---- Flags ----------------------------------------------------------

    pub fn flag_get_json(&self, key: &str) -> anyhow::Result<Option<Value>> {
        let conn = self.lock();
        let raw: Option<String> = conn
            .query_row("SELECT value FROM flags WHERE key = ?1", params![key], |row| row.get(0))
            .optional()?;
        raw.map(|s| serde_json::from_str(&s).context("decode flag JSON")).transpose()
    }

    pub fn flag_set_json(&self, key: &str, value: &Value) -> anyhow::Result<()> {
        let encoded = serde_json::to_string(value)?;
        self.lock().execute(
            "INSERT INTO flags (key, value, updated_at_ms) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at_ms = excluded.updated_at_ms",
            params![key, encoded, now_ms()],
        )?;
        Ok(())
    }

    pub fn flag_get_bool(&self, key: &str, default: bool) -> anyhow::Result<bool> {
        Ok(self.flag_get_json(key)?.and_then(|v| v.as_bool()).unwrap_or(default))
    }

    pub fn flag_set_bool(&self, key: &str, value: bool) -> anyhow::Result<()> {
        self.flag_set_json(key, &Value::Bool(value))
    }

    /// Atomically reads and deletes a one-shot flag, returning its
    /// value if present.
    pub fn flag_consume(&self, key: &str) -> anyhow::Result<Option<Value>> {
        let conn = self.lock();
        let raw: Option<String> = conn
            .query_row("SELECT value FROM flags WHERE key = ?1", params![key], |row| row.get(0))
            .optional()?;
        if raw.is_some() {
            conn.execute("DELETE FROM flags WHERE key = ?1", params![key])?;
        }
        raw.map(|s| serde_json::from_str(&s).context("decode flag JSON")).transpose()
    }

    // ---- Audit ----------------------------------------------------------

    pub fn audit_append(&self, event: AuditEventInput<'_>) -> anyhow::Result<i64> {
        let payload_json = event.payload.map(serde_json::to_string).transpose()?;
        let conn = self.lock();
        conn.execute(
            "INSERT INTO audit_events (ts_ms, phone_number, thread_id, turn_id, kind, summary, payload_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                now_ms(),
                event.phone_number,
                event.thread_id,
                event.turn_id,
                event.kind,
                event.summary,
                payload_json
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Ordered events for the most recent turn id seen for `phone`,
    /// limited to `limit` rows.
    pub fn audit_last_turn_timeline(&self, phone: &str, limit: usize) -> anyhow::Result<Vec<AuditEvent>> {
        let conn = self.lock();
        let last_turn_id: Option<String> = conn
            .query_row(
                "SELECT turn_id FROM audit_events
                 WHERE phone_number = ?1 AND turn_id IS NOT NULL
                 ORDER BY id DESC LIMIT 1",
                params![phone],
                |row| row.get(0),
            )
            .optional()?;

        let Some(turn_id) = last_turn_id else {
            return Ok(Vec::new());
        };

        let mut stmt = conn.prepare(
            "SELECT id, ts_ms, phone_number, thread_id, turn_id, kind, summary, payload_json
             FROM audit_events WHERE phone_number = ?1 AND turn_id = ?2 ORDER BY id ASC LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(params![phone, turn_id, limit as i64], |row| {
                Ok(AuditEvent {
                    id: row.get(0)?,
                    ts_ms: row.get(1)?,
                    phone_number: row.get(2)?,
                    thread_id: row.get(3)?,
                    turn_id: row.get(4)?,
                    kind: row.get(5)?,
                    summary: row.get(6)?,
                    payload_json: row.get(7)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ---- Notifications --------------------------------------------------

    pub fn notification_append(&self, input: NotificationInput<'_>) -> anyhow::Result<AppendOutcome> {
        let conn = self.lock();
        let changed = conn.execute(
            "INSERT OR IGNORE INTO notifications (
                source, source_account, source_event_id, dedupe_key, status,
                received_at_ms, summary, payload_hash, raw_excerpt, raw_size_bytes,
                raw_truncated, duplicate_count, first_seen_at_ms, last_seen_at_ms
             ) VALUES (?1, ?2, ?3, ?4, 'received', ?5, ?6, ?7, ?8, ?9, ?10, 0, ?5, ?5)",
            params![
                input.source,
                input.source_account,
                input.source_event_id,
                input.dedupe_key,
                input.received_at_ms,
                input.summary,
                input.payload_hash,
                input.raw_excerpt,
                input.raw_size_bytes,
                input.raw_truncated as i64,
            ],
        )?;

        if changed > 0 {
            let id = conn.last_insert_rowid();
            return Ok(AppendOutcome { id, inserted: true });
        }

        conn.execute(
            "UPDATE notifications SET duplicate_count = duplicate_count + 1, last_seen_at_ms = ?2
             WHERE dedupe_key = ?1",
            params![input.dedupe_key, input.received_at_ms],
        )?;
        let id: i64 = conn.query_row(
            "SELECT id FROM notifications WHERE dedupe_key = ?1",
            params![input.dedupe_key],
            |row| row.get(0),
        )?;
        Ok(AppendOutcome { id, inserted: false })
    }

    /// Atomically claims the oldest `received`/`queued` row, moving it
    /// to `processing`.
    pub fn notification_claim_next(&self) -> anyhow::Result<Option<Notification>> {
        let conn = self.lock();
        let id: Option<i64> = conn
            .query_row(
                "SELECT id FROM notifications WHERE status IN ('received', 'queued')
                 ORDER BY received_at_ms ASC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;

        let Some(id) = id else {
            return Ok(None);
        };

        conn.execute(
            "UPDATE notifications SET status = 'processing', processed_at_ms = ?2 WHERE id = ?1",
            params![id, now_ms()],
        )?;

        Self::fetch_notification(&conn, id)
    }

    pub fn notification_record_decision(
        &self,
        id: i64,
        status: NotificationStatus,
        delivery: Option<&str>,
        reason_code: Option<&str>,
        message_excerpt: Option<&str>,
        thread_id: Option<&str>,
        turn_id: Option<&str>,
        decision_json: Option<&str>,
    ) -> anyhow::Result<()> {
        self.lock().execute(
            "UPDATE notifications SET status = ?2, delivery = ?3, reason_code = ?4,
                message_excerpt = ?5, thread_id = ?6, turn_id = ?7, decision_json = ?8
             WHERE id = ?1",
            params![
                id,
                status.as_str(),
                delivery,
                reason_code,
                message_excerpt,
                thread_id,
                turn_id,
                decision_json
            ],
        )?;
        Ok(())
    }

    pub fn notification_record_failure(&self, id: i64, error_text: &str) -> anyhow::Result<()> {
        self.lock().execute(
            "UPDATE notifications SET status = 'failed', error_text = ?2 WHERE id = ?1",
            params![id, error_text],
        )?;
        Ok(())
    }

    pub fn notification_get(&self, id: i64) -> anyhow::Result<Option<Notification>> {
        let conn = self.lock();
        Self::fetch_notification(&conn, id)
    }

    pub fn notification_list(&self, limit: usize, source: Option<&str>) -> anyhow::Result<Vec<Notification>> {
        let conn = self.lock();
        let mut stmt = if source.is_some() {
            conn.prepare(
                "SELECT id, source, source_account, source_event_id, dedupe_key, status,
                        received_at_ms, processed_at_ms, delivery, reason_code, message_excerpt,
                        summary, payload_hash, raw_excerpt, raw_size_bytes, raw_truncated,
                        duplicate_count, first_seen_at_ms, last_seen_at_ms, thread_id, turn_id,
                        decision_json, error_text
                 FROM notifications WHERE source = ?2 ORDER BY received_at_ms DESC LIMIT ?1",
            )?
        } else {
            conn.prepare(
                "SELECT id, source, source_account, source_event_id, dedupe_key, status,
                        received_at_ms, processed_at_ms, delivery, reason_code, message_excerpt,
                        summary, payload_hash, raw_excerpt, raw_size_bytes, raw_truncated,
                        duplicate_count, first_seen_at_ms, last_seen_at_ms, thread_id, turn_id,
                        decision_json, error_text
                 FROM notifications ORDER BY received_at_ms DESC LIMIT ?1",
            )?
        };

        let rows = if let Some(source) = source {
            stmt.query_map(params![limit as i64, source], Self::row_to_notification)?
                .collect::<Result<Vec<_>, _>>()?
        } else {
            stmt.query_map(params![limit as i64], Self::row_to_notification)?
                .collect::<Result<Vec<_>, _>>()?
        };
        Ok(rows)
    }

    /// Deletes rows older than `retention_days`, then deletes the
    /// oldest rows until the total is at most `cap`. Returns the
    /// number of rows deleted.
    pub fn notification_prune(&self, retention_days: u32, cap: u32) -> anyhow::Result<usize> {
        let conn = self.lock();
        let cutoff_ms = now_ms() - (retention_days as i64) * 24 * 60 * 60 * 1000;
        let mut deleted = conn.execute("DELETE FROM notifications WHERE received_at_ms < ?1", params![cutoff_ms])?;

        let total: i64 = conn.query_row("SELECT COUNT(*) FROM notifications", [], |row| row.get(0))?;
        if total > cap as i64 {
            let overflow = total - cap as i64;
            deleted += conn.execute(
                "DELETE FROM notifications WHERE id IN (
                    SELECT id FROM notifications ORDER BY received_at_ms ASC LIMIT ?1
                 )",
                params![overflow],
            )?;
        }
        Ok(deleted)
    }

    fn fetch_notification(conn: &Connection, id: i64) -> anyhow::Result<Option<Notification>> {
        conn.query_row(
            "SELECT id, source, source_account, source_event_id, dedupe_key, status,
                    received_at_ms, processed_at_ms, delivery, reason_code, message_excerpt,
                    summary, payload_hash, raw_excerpt, raw_size_bytes, raw_truncated,
                    duplicate_count, first_seen_at_ms, last_seen_at_ms, thread_id, turn_id,
                    decision_json, error_text
             FROM notifications WHERE id = ?1",
            params![id],
            Self::row_to_notification,
        )
        .optional()
        .map_err(Into::into)
    }

    fn row_to_notification(row: &rusqlite::Row<'_>) -> rusqlite::Result<Notification> {
        Ok(Notification {
            id: row.get(0)?,
            source: row.get(1)?,
            source_account: row.get(2)?,
            source_event_id: row.get(3)?,
            dedupe_key: row.get(4)?,
            status: NotificationStatus::parse(&row.get::<_, String>(5)?),
            received_at_ms: row.get(6)?,
            processed_at_ms: row.get(7)?,
            delivery: row.get(8)?,
            reason_code: row.get(9)?,
            message_excerpt: row.get(10)?,
            summary: row.get(11)?,
            payload_hash: row.get(12)?,
            raw_excerpt: row.get(13)?,
            raw_size_bytes: row.get(14)?,
            raw_truncated: row.get::<_, i64>(15)? != 0,
            duplicate_count: row.get(16)?,
            first_seen_at_ms: row.get(17)?,
            last_seen_at_ms: row.get(18)?,
            thread_id: row.get(19)?,
            turn_id: row.get(20)?,
            decision_json: row.get(21)?,
            error_text: row.get(22)?,
        })
    }
}

fn default_model_placeholder() -> &'static str {
    "gpt-5.3-codex"
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn session_get_creates_defaults() {
        let store = Store::open_in_memory().unwrap();
        let session = store.session_get("+15550001111").unwrap();
        assert_eq!(session.thread_id, None);
        assert_eq!(session.active_turn_id, None);
    }

    #[test]
    fn session_reset_clears_thread_and_turn_atomically() {
        let store = Store::open_in_memory().unwrap();
        store.session_set_thread("+1", "th1").unwrap();
        store.session_set_active_turn("+1", "turn1").unwrap();
        store.session_reset("+1").unwrap();
        let session = store.session_get("+1").unwrap();
        assert_eq!(session.thread_id, None);
        assert_eq!(session.active_turn_id, None);
    }

    #[test]
    fn dedupe_mark_processed_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.dedupe_mark_processed("m1").unwrap());
        assert!(!store.dedupe_mark_processed("m1").unwrap());
    }

    #[test]
    fn flag_consume_deletes_after_read() {
        let store = Store::open_in_memory().unwrap();
        store.flag_set_json("pending_bridge_restart_notice", &serde_json::json!({"target": "bridge"})).unwrap();
        let first = store.flag_consume("pending_bridge_restart_notice").unwrap();
        assert!(first.is_some());
        let second = store.flag_consume("pending_bridge_restart_notice").unwrap();
        assert!(second.is_none());
    }

    #[test]
    fn notification_append_dedupes_and_counts_duplicates() {
        let store = Store::open_in_memory().unwrap();
        let input = NotificationInput {
            source: "webhook",
            source_account: None,
            source_event_id: Some("evt_1"),
            dedupe_key: "event:webhook:-:evt_1",
            summary: "build failed",
            payload_hash: "abc123",
            raw_excerpt: b"{}",
            raw_size_bytes: 2,
            raw_truncated: false,
            received_at_ms: 1,
        };
        let first = store.notification_append(input.clone()).unwrap();
        assert!(first.inserted);
        let second = store.notification_append(NotificationInput { received_at_ms: 2, ..input }).unwrap();
        assert!(!second.inserted);
        assert_eq!(second.id, first.id);

        let row = store.notification_get(first.id).unwrap().unwrap();
        assert_eq!(row.duplicate_count, 1);
        assert_eq!(row.last_seen_at_ms, 2);
    }

    #[test]
    fn notification_claim_next_transitions_to_processing() {
        let store = Store::open_in_memory().unwrap();
        let input = NotificationInput {
            source: "webhook",
            source_account: None,
            source_event_id: Some("evt_1"),
            dedupe_key: "event:webhook:-:evt_1",
            summary: "build failed",
            payload_hash: "abc123",
            raw_excerpt: b"{}",
            raw_size_bytes: 2,
            raw_truncated: false,
            received_at_ms: 1,
        };
        store.notification_append(input).unwrap();
        let claimed = store.notification_claim_next().unwrap().unwrap();
        assert_eq!(claimed.status, NotificationStatus::Processing);
        assert!(store.notification_claim_next().unwrap().is_none());
    }

    #[test]
    fn audit_last_turn_timeline_returns_only_most_recent_turn() {
        let store = Store::open_in_memory().unwrap();
        store
            .audit_append(AuditEventInput {
                phone_number: "+1",
                thread_id: Some("th1"),
                turn_id: Some("turn1"),
                kind: "turn_started",
                summary: "started",
                payload: None,
            })
            .unwrap();
        store
            .audit_append(AuditEventInput {
                phone_number: "+1",
                thread_id: Some("th1"),
                turn_id: Some("turn2"),
                kind: "turn_started",
                summary: "started",
                payload: None,
            })
            .unwrap();
        let timeline = store.audit_last_turn_timeline("+1", 10).unwrap();
        assert_eq!(timeline.len(), 1);
        assert_eq!(timeline[0].turn_id.as_deref(), Some("turn2"));
    }

    #[test]
    fn notification_prune_enforces_retention_and_cap() {
        let store = Store::open_in_memory().unwrap();
        for i in 0..5 {
            store
                .notification_append(NotificationInput {
                    source: "cron",
                    source_account: None,
                    source_event_id: Some(&i.to_string()),
                    dedupe_key: &format!("event:cron:-:{i}"),
                    summary: "tick",
                    payload_hash: "h",
                    raw_excerpt: b"{}",
                    raw_size_bytes: 2,
                    raw_truncated: false,
                    received_at_ms: i as i64,
                })
                .unwrap();
        }
        let deleted = store.notification_prune(3650, 2).unwrap();
        assert_eq!(deleted, 3);
        let remaining = store.notification_list(10, None).unwrap();
        assert_eq!(remaining.len(), 2);
    }
}
