//! Slash-command parsing and dispatch (spec §6, table; §4.6.6,
//! §4.6.8). Parsing is pure; dispatch drives the session manager,
//! store, and notification pipeline and returns the text (if any) to
//! send back to the trusted user.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bridge_protocol::ReasoningEffort;
use serde_json::json;

use crate::notifications::NotificationPipeline;
use crate::session::SessionManager;
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartTarget {
    Codex,
    Bridge,
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationSourceFilter {
    All,
    Webhook,
    Cron,
    Heartbeat,
}

impl NotificationSourceFilter {
    fn as_store_filter(self) -> Option<&'static str> {
        match self {
            Self::All => None,
            Self::Webhook => Some("webhook"),
            Self::Cron => Some("cron"),
            Self::Heartbeat => Some("heartbeat"),
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "all" => Some(Self::All),
            "webhook" => Some(Self::Webhook),
            "cron" => Some(Self::Cron),
            "heartbeat" => Some(Self::Heartbeat),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Status,
    Stop,
    Reset,
    Debug,
    Thread { new: bool },
    Compact,
    Model { id: String, effort: Option<String> },
    Effort { level: Option<String> },
    Spark,
    Pause,
    Resume,
    Notifications { count: u32, source: NotificationSourceFilterToken },
    Restart { target: RestartTargetToken },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotificationSourceFilterToken(pub NotificationSourceFilter);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartTargetToken(pub RestartTarget);

const HELP_TEXT: &str = "\
/help - show this list
/status - phone, thread, active_turn, model, paused, auto_approve
/stop - interrupt the current turn
/reset - clear thread + active turn, start a fresh thread
/debug - last-turn audit timeline
/thread [new] - show or recreate the current thread
/compact - compact the current thread
/model <id>[-<effort>] - set the active model (and optionally effort)
/effort [level] - show or set the current model's reasoning effort
/spark - toggle the spark model
/pause | /resume - pause/resume new turns and auto-approval
/notifications [count] [source] - recent notifications (source: all|webhook|cron|heartbeat)
/restart <codex|bridge|both> - restart the agent process and/or the bridge";

/// Distinguishes a slash command that doesn't exist from a recognized
/// one that was given bad arguments (spec §4.6.2/§7 treat these as
/// separate categories with different reply text).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandParseError {
    Unrecognized(String),
    InvalidArguments(String),
}

/// Returns `None` if `text` is not a recognized slash command.
pub fn parse(text: &str) -> Option<Result<Command, CommandParseError>> {
    let trimmed = text.trim();
    if !trimmed.starts_with('/') {
        return None;
    }
    let mut parts = trimmed.split_whitespace();
    let head = parts.next()?;
    let rest: Vec<&str> = parts.collect();

    Some(match head {
        "/help" => Ok(Command::Help),
        "/status" => Ok(Command::Status),
        "/stop" => Ok(Command::Stop),
        "/reset" => Ok(Command::Reset),
        "/debug" => Ok(Command::Debug),
        "/thread" => Ok(Command::Thread { new: rest.first().is_some_and(|s| *s == "new") }),
        "/compact" => Ok(Command::Compact),
        "/model" => match rest.first() {
            Some(raw) => {
                let (id, effort) = split_model_suffix(raw);
                Ok(Command::Model { id, effort })
            }
            None => Err(CommandParseError::InvalidArguments("usage: /model <id>[-<effort>]".to_string())),
        },
        "/effort" => Ok(Command::Effort { level: rest.first().map(|s| s.to_string()) }),
        "/spark" => Ok(Command::Spark),
        "/pause" => Ok(Command::Pause),
        "/resume" => Ok(Command::Resume),
        "/notifications" => {
            let count = match rest.first() {
                Some(raw) => match raw.parse::<u32>() {
                    Ok(n) if (1..=200).contains(&n) => n,
                    _ => {
                        return Some(Err(CommandParseError::InvalidArguments(
                            "count must be an integer in 1..=200".to_string(),
                        )))
                    }
                },
                None => 20,
            };
            let source = match rest.get(1) {
                Some(raw) => match NotificationSourceFilter::parse(raw) {
                    Some(source) => source,
                    None => {
                        return Some(Err(CommandParseError::InvalidArguments(
                            "source must be one of all|webhook|cron|heartbeat".to_string(),
                        )))
                    }
                },
                None => NotificationSourceFilter::All,
            };
            Ok(Command::Notifications { count, source: NotificationSourceFilterToken(source) })
        }
        "/restart" => match rest.first().copied() {
            Some("codex") => Ok(Command::Restart { target: RestartTargetToken(RestartTarget::Codex) }),
            Some("bridge") => Ok(Command::Restart { target: RestartTargetToken(RestartTarget::Bridge) }),
            Some("both") => Ok(Command::Restart { target: RestartTargetToken(RestartTarget::Both) }),
            _ => Err(CommandParseError::InvalidArguments("usage: /restart <codex|bridge|both>".to_string())),
        },
        _ => Err(CommandParseError::Unrecognized(format!("unknown command: {head}"))),
    })
}

/// Splits `<id>-<effort>` on the *last* `-`, falling back to no effort
/// suffix if the tail isn't a recognized effort level.
fn split_model_suffix(raw: &str) -> (String, Option<String>) {
    if let Some((prefix, suffix)) = raw.rsplit_once('-') {
        if ReasoningEffort::parse(suffix).is_some() {
            return (prefix.to_string(), Some(suffix.to_string()));
        }
    }
    (raw.to_string(), None)
}

/// Outcome of dispatching a command: text to send back to the user,
/// and whether the bridge must now stop its poll loop (restart paths).
pub struct Dispatch {
    pub reply: Option<String>,
    pub stop_poll_loop: bool,
}

impl Dispatch {
    fn reply(text: impl Into<String>) -> Self {
        Self { reply: Some(text.into()), stop_poll_loop: false }
    }

    fn silent() -> Self {
        Self { reply: None, stop_poll_loop: false }
    }
}

pub struct CommandContext {
    pub store: Store,
    pub session: Arc<SessionManager>,
    pub notifications: Arc<NotificationPipeline>,
    pub trusted_user: String,
    pub restart_requested: Arc<AtomicBool>,
}

impl CommandContext {
    pub async fn execute(&self, command: Command, now_ms: i64) -> anyhow::Result<Dispatch> {
        match command {
            Command::Help => Ok(Dispatch::reply(HELP_TEXT)),
            Command::Status => self.status(),
            Command::Stop => self.stop().await,
            Command::Reset => self.reset().await,
            Command::Debug => self.debug(),
            Command::Thread { new } => self.thread(new).await,
            Command::Compact => self.compact().await,
            Command::Model { id, effort } => self.model(&id, effort.as_deref()),
            Command::Effort { level } => self.effort(level.as_deref()),
            Command::Spark => self.spark(),
            Command::Pause => self.pause(),
            Command::Resume => self.resume(),
            Command::Notifications { count, source } => self.notifications(count, source.0),
            Command::Restart { target } => self.restart(target.0, now_ms).await,
        }
    }

    fn status(&self) -> anyhow::Result<Dispatch> {
        let (session, effort) = self.session.status_snapshot()?;
        let paused = self.store.flag_get_bool("paused", false)?;
        let auto_approve = self.store.flag_get_bool("auto_approve", true)?;
        let text = format!(
            "phone: {}\nthread: {}\nactive_turn: {}\nmodel: {} ({})\npaused: {}\nauto_approve: {}",
            session.phone_number,
            session.thread_id.as_deref().unwrap_or("-"),
            session.active_turn_id.as_deref().unwrap_or("-"),
            session.model,
            effort.as_str(),
            paused,
            auto_approve,
        );
        Ok(Dispatch::reply(text))
    }

    async fn stop(&self) -> anyhow::Result<Dispatch> {
        match self.session.interrupt_current_turn().await? {
            Some(turn_id) => Ok(Dispatch::reply(format!("Interrupted turn {turn_id}."))),
            None => Ok(Dispatch::reply("Nothing to interrupt.")),
        }
    }

    async fn reset(&self) -> anyhow::Result<Dispatch> {
        self.store.session_reset(&self.trusted_user)?;
        let thread_id = self.session.ensure_thread().await?;
        Ok(Dispatch::reply(format!("Thread reset. New thread: {thread_id}")))
    }

    fn debug(&self) -> anyhow::Result<Dispatch> {
        let events = self.store.audit_last_turn_timeline(&self.trusted_user, 50)?;
        if events.is_empty() {
            return Ok(Dispatch::reply("No turn activity recorded yet."));
        }
        let lines: Vec<String> = events
            .iter()
            .map(|event| {
                let mut summary = event.summary.clone();
                summary.truncate(200);
                format!("{}: {}", event.kind, summary)
            })
            .collect();
        Ok(Dispatch::reply(lines.join("\n")))
    }

    async fn thread(&self, new: bool) -> anyhow::Result<Dispatch> {
        if new {
            self.store.session_reset(&self.trusted_user)?;
        }
        let thread_id = self.session.ensure_thread().await?;
        Ok(Dispatch::reply(format!("thread: {thread_id}")))
    }

    async fn compact(&self) -> anyhow::Result<Dispatch> {
        self.session.compact_thread().await?;
        Ok(Dispatch::silent())
    }

    fn model(&self, id: &str, effort: Option<&str>) -> anyhow::Result<Dispatch> {
        match effort.and_then(ReasoningEffort::parse) {
            Some(effort) => {
                self.session.set_model_with_effort(id, effort)?;
                Ok(Dispatch::reply(format!("model: {id} ({})", effort.as_str())))
            }
            None => {
                let effort = self.session.set_model(id)?;
                Ok(Dispatch::reply(format!("model: {id} ({})", effort.as_str())))
            }
        }
    }

    fn effort(&self, level: Option<&str>) -> anyhow::Result<Dispatch> {
        match level {
            None => {
                let (_, effort) = self.session.status_snapshot()?;
                Ok(Dispatch::reply(format!("effort: {}", effort.as_str())))
            }
            Some(raw) => match ReasoningEffort::parse(raw) {
                Some(effort) => {
                    self.session.set_effort_for_current_model(effort)?;
                    Ok(Dispatch::reply(format!("effort: {}", effort.as_str())))
                }
                None => Ok(Dispatch::reply(format!("unknown effort level: {raw}"))),
            },
        }
    }

    fn spark(&self) -> anyhow::Result<Dispatch> {
        let (model, effort) = self.session.toggle_spark_model()?;
        Ok(Dispatch::reply(format!("model: {model} ({})", effort.as_str())))
    }

    fn pause(&self) -> anyhow::Result<Dispatch> {
        self.store.flag_set_bool("paused", true)?;
        self.store.flag_set_bool("auto_approve", false)?;
        Ok(Dispatch::reply("Paused. New turns are blocked and approvals are no longer auto-accepted."))
    }

    fn resume(&self) -> anyhow::Result<Dispatch> {
        self.store.flag_set_bool("paused", false)?;
        self.store.flag_set_bool("auto_approve", true)?;
        Ok(Dispatch::reply("Resumed. New turns and auto-approval are active again."))
    }

    fn notifications(&self, count: u32, source: NotificationSourceFilter) -> anyhow::Result<Dispatch> {
        let rows = self.store.notification_list(count as usize, source.as_store_filter())?;
        if rows.is_empty() {
            return Ok(Dispatch::reply("No notifications recorded."));
        }
        let lines: Vec<String> = rows
            .iter()
            .map(|row| format!("[{}] {} — {}", row.status_label(), row.source, row.summary))
            .collect();
        Ok(Dispatch::reply(lines.join("\n")))
    }

    async fn restart(&self, target: RestartTarget, now_ms: i64) -> anyhow::Result<Dispatch> {
        match target {
            RestartTarget::Codex => {
                self.session.restart_codex().await?;
                Ok(Dispatch::reply("Codex restarted."))
            }
            RestartTarget::Bridge | RestartTarget::Both => {
                if target == RestartTarget::Both {
                    self.session.restart_codex().await?;
                }
                self.store.flag_set_json(
                    "pending_bridge_restart_notice",
                    &json!({"target": restart_target_label(target), "requestedAtMs": now_ms}),
                )?;
                self.restart_requested.store(true, Ordering::SeqCst);
                Ok(Dispatch { reply: Some("Restarting bridge now...".to_string()), stop_poll_loop: true })
            }
        }
    }
}

fn restart_target_label(target: RestartTarget) -> &'static str {
    match target {
        RestartTarget::Codex => "codex",
        RestartTarget::Bridge => "bridge",
        RestartTarget::Both => "both",
    }
}

/// `consumeRestartRequested()` (spec §4.6.8): one-shot check-and-clear.
pub fn consume_restart_requested(flag: &Arc<AtomicBool>) -> bool {
    flag.swap(false, Ordering::SeqCst)
}

trait StatusLabel {
    fn status_label(&self) -> &'static str;
}

impl StatusLabel for crate::store::Notification {
    fn status_label(&self) -> &'static str {
        match self.status {
            crate::store::NotificationStatus::Received => "received",
            crate::store::NotificationStatus::Queued => "queued",
            crate::store::NotificationStatus::Processing => "processing",
            crate::store::NotificationStatus::Sent => "sent",
            crate::store::NotificationStatus::Suppressed => "suppressed",
            crate::store::NotificationStatus::Failed => "failed",
            crate::store::NotificationStatus::Duplicate => "duplicate",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn non_slash_text_is_not_a_command() {
        assert!(parse("hello there").is_none());
    }

    #[test]
    fn model_suffix_splits_on_last_dash() {
        let (id, effort) = split_model_suffix("gpt-5.3-codex-high");
        assert_eq!(id, "gpt-5.3-codex");
        assert_eq!(effort.as_deref(), Some("high"));
    }

    #[test]
    fn model_without_recognized_suffix_keeps_whole_id() {
        let (id, effort) = split_model_suffix("gpt-5.3-codex-spark");
        assert_eq!(id, "gpt-5.3-codex-spark");
        assert_eq!(effort, None);
    }

    #[test]
    fn notifications_rejects_out_of_range_count() {
        let result = parse("/notifications 500").unwrap();
        assert!(result.is_err());
    }

    #[test]
    fn restart_requires_target() {
        let result = parse("/restart").unwrap();
        assert!(result.is_err());
    }

    #[test]
    fn restart_parses_each_target() {
        assert!(matches!(
            parse("/restart codex").unwrap().unwrap(),
            Command::Restart { target: RestartTargetToken(RestartTarget::Codex) }
        ));
        assert!(matches!(
            parse("/restart both").unwrap().unwrap(),
            Command::Restart { target: RestartTargetToken(RestartTarget::Both) }
        ));
    }

    #[test]
    fn thread_new_subcommand_is_recognized() {
        assert_eq!(parse("/thread new").unwrap().unwrap(), Command::Thread { new: true });
        assert_eq!(parse("/thread").unwrap().unwrap(), Command::Thread { new: false });
    }
}
