//! Startup configuration (spec §6). Every field is environment-variable
//! driven, following the teacher's `#[arg(long, env = "...")]` CLI
//! convention. Bounds named in spec.md are validated right after
//! parsing; a violation is a fatal startup error (exit code 1).

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "imessage-bridge", version)]
pub struct Config {
    /// Base URL of the messaging provider API.
    #[arg(long, env = "PROVIDER_API_BASE")]
    pub provider_api_base: String,

    /// Provider API key header value.
    #[arg(long, env = "PROVIDER_API_KEY")]
    pub provider_api_key: String,

    /// Provider API secret header value.
    #[arg(long, env = "PROVIDER_API_SECRET")]
    pub provider_api_secret: String,

    /// The single allow-listed remote identifier permitted to drive the bridge.
    #[arg(long, env = "TRUSTED_USER")]
    pub trusted_user: String,

    /// Phone number the bridge sends outbound messages from.
    #[arg(long, env = "FROM_NUMBER")]
    pub from_number: String,

    /// Poll interval in milliseconds. Bounds: 250..=30000.
    #[arg(long, env = "POLL_INTERVAL_MS", default_value_t = 2000)]
    pub poll_interval_ms: u64,

    /// Path to the agent binary.
    #[arg(long, env = "AGENT_BIN", default_value = "codex")]
    pub agent_bin: String,

    /// Working directory for the spawned agent.
    #[arg(long, env = "AGENT_CWD")]
    pub agent_cwd: Option<PathBuf>,

    /// Required prefix for model ids accepted by `/model` and `setModel`.
    #[arg(long, env = "MODEL_PREFIX", default_value = "gpt-5.3-codex")]
    pub model_prefix: String,

    /// Default model id used for a freshly-started thread.
    #[arg(long, env = "DEFAULT_MODEL", default_value = "gpt-5.3-codex")]
    pub default_model: String,

    /// Path to the SQLite database file.
    #[arg(long, env = "DB_PATH", default_value = "bridge.db")]
    pub db_path: PathBuf,

    #[arg(long, env = "ENABLE_TYPING_INDICATOR", default_value_t = true)]
    pub enable_typing_indicator: bool,

    #[arg(long, env = "ENABLE_READ_RECEIPTS", default_value_t = true)]
    pub enable_read_receipts: bool,

    #[arg(long, env = "ENABLE_OUTBOUND_STYLING", default_value_t = true)]
    pub enable_outbound_styling: bool,

    #[arg(long, env = "ENABLE_STARTUP_BACKLOG_DISCARD", default_value_t = false)]
    pub enable_startup_backlog_discard: bool,

    /// Typing-indicator heartbeat in seconds. Bounds: 3..=30.
    #[arg(long, env = "TYPING_HEARTBEAT_SECS", default_value_t = 10)]
    pub typing_heartbeat_secs: u64,

    #[arg(long, env = "NOTIFICATIONS_ENABLED", default_value_t = true)]
    pub notifications_enabled: bool,

    /// Bytes of payload excerpt retained per notification. Bounds: 256..=32768.
    #[arg(long, env = "NOTIFICATION_RAW_EXCERPT_BYTES", default_value_t = 4096)]
    pub notification_raw_excerpt_bytes: usize,

    /// Notification retention window in days. Bound: >= 1.
    #[arg(long, env = "NOTIFICATION_RETENTION_DAYS", default_value_t = 30)]
    pub notification_retention_days: u32,

    /// Notification row cap enforced by the prune job. Bound: >= 100.
    #[arg(long, env = "NOTIFICATION_MAX_ROWS", default_value_t = 5000)]
    pub notification_max_rows: u32,

    #[arg(long, env = "WEBHOOK_ENABLED", default_value_t = false)]
    pub webhook_enabled: bool,

    #[arg(long, env = "WEBHOOK_HOST", default_value = "127.0.0.1")]
    pub webhook_host: String,

    #[arg(long, env = "WEBHOOK_PORT", default_value_t = 8787)]
    pub webhook_port: u16,

    #[arg(long, env = "WEBHOOK_PATH", default_value = "/webhook")]
    pub webhook_path: String,

    #[arg(long, env = "WEBHOOK_SECRET")]
    pub webhook_secret: Option<String>,
}

impl Config {
    pub fn parse_and_validate() -> anyhow::Result<Self> {
        let config = Self::parse();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            (250..=30_000).contains(&self.poll_interval_ms),
            "poll_interval_ms must be within 250..=30000, got {}",
            self.poll_interval_ms
        );
        anyhow::ensure!(
            (3..=30).contains(&self.typing_heartbeat_secs),
            "typing_heartbeat_secs must be within 3..=30, got {}",
            self.typing_heartbeat_secs
        );
        anyhow::ensure!(
            (256..=32_768).contains(&self.notification_raw_excerpt_bytes),
            "notification_raw_excerpt_bytes must be within 256..=32768, got {}",
            self.notification_raw_excerpt_bytes
        );
        anyhow::ensure!(
            self.notification_retention_days >= 1,
            "notification_retention_days must be >= 1"
        );
        anyhow::ensure!(self.notification_max_rows >= 100, "notification_max_rows must be >= 100");
        if self.webhook_enabled {
            anyhow::ensure!(
                self.webhook_secret.as_ref().is_some_and(|s| !s.is_empty()),
                "webhook_secret is required when webhook_enabled is set"
            );
        }
        Ok(())
    }

    pub fn db_path_display(&self) -> String {
        self.db_path.display().to_string()
    }

    pub fn lock_path(&self) -> PathBuf {
        self.db_path.with_extension("lock")
    }
}

pub fn load() -> anyhow::Result<Config> {
    Config::parse_and_validate().context("invalid configuration")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn base_config() -> Config {
        Config {
            provider_api_base: "https://api.example.com".to_string(),
            provider_api_key: "key".to_string(),
            provider_api_secret: "secret".to_string(),
            trusted_user: "+15550001111".to_string(),
            from_number: "+15550009999".to_string(),
            poll_interval_ms: 2000,
            agent_bin: "codex".to_string(),
            agent_cwd: None,
            model_prefix: "gpt-5.3-codex".to_string(),
            default_model: "gpt-5.3-codex".to_string(),
            db_path: PathBuf::from("bridge.db"),
            enable_typing_indicator: true,
            enable_read_receipts: true,
            enable_outbound_styling: true,
            enable_startup_backlog_discard: false,
            typing_heartbeat_secs: 10,
            notifications_enabled: true,
            notification_raw_excerpt_bytes: 4096,
            notification_retention_days: 30,
            notification_max_rows: 5000,
            webhook_enabled: false,
            webhook_host: "127.0.0.1".to_string(),
            webhook_port: 8787,
            webhook_path: "/webhook".to_string(),
            webhook_secret: None,
        }
    }

    #[test]
    fn default_config_is_valid() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn rejects_out_of_range_poll_interval() {
        let mut config = base_config();
        config.poll_interval_ms = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn webhook_enabled_requires_secret() {
        let mut config = base_config();
        config.webhook_enabled = true;
        assert!(config.validate().is_err());
        config.webhook_secret = Some("s".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn lock_path_sits_next_to_db_path() {
        let config = base_config();
        assert_eq!(config.lock_path(), PathBuf::from("bridge.lock"));
    }
}
