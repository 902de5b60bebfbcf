//! Entry point: wires configuration, the single-instance lock, the
//! SQLite store, the agent session manager, the provider client, the
//! bridge orchestrator, and (optionally) the webhook HTTP server.
//!
//! Exit codes (spec §6): 0 normal shutdown, 1 fatal startup/runtime
//! error, 42 sentinel telling the launcher to relaunch us (emitted
//! after a `/restart` that targeted the bridge process itself).

mod bridge;
mod chunking;
mod commands;
mod config;
mod lock;
mod media;
mod notifications;
mod phone;
mod provider;
mod session;
mod signals;
mod store;
mod styling;
mod transport;
mod webhook;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::mpsc;
use tracing::error;
use tracing::info;

use crate::bridge::Bridge;
use crate::config::Config;
use crate::lock::InstanceLock;
use crate::notifications::NotificationPipeline;
use crate::provider::ProviderClient;
use crate::session::SessionManager;
use crate::session::SessionManagerConfig;
use crate::store::Store;

const RESTART_SENTINEL_EXIT_CODE: i32 = 42;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    match run().await {
        Ok(exit_code) => std::process::exit(exit_code),
        Err(err) => {
            error!("fatal: {err:#}");
            std::process::exit(1);
        }
    }
}

async fn run() -> anyhow::Result<i32> {
    let config = config::load()?;
    info!(db = config.db_path_display(), trusted_user = config.trusted_user, "starting imessage-bridge");

    let _lock = InstanceLock::acquire(&config.lock_path())
        .context("failed to acquire single-instance lock")?;

    let store = Store::open(&config.db_path)
        .with_context(|| format!("failed to open database at {}", config.db_path_display()))?;

    let provider = ProviderClient::new(
        config.provider_api_base.clone(),
        config.provider_api_key.clone(),
        config.provider_api_secret.clone(),
        config.from_number.clone(),
    )
    .context("failed to build provider client")?;

    let (events_tx, events_rx) = mpsc::unbounded_channel();

    let session_config = SessionManagerConfig {
        agent_bin: config.agent_bin.clone(),
        agent_cwd: config.agent_cwd.clone(),
        model_prefix: config.model_prefix.clone(),
        default_model: config.default_model.clone(),
        trusted_user: config.trusted_user.clone(),
    };
    let session = SessionManager::start(store.clone(), session_config, events_tx)
        .await
        .context("failed to start agent session")?;

    let restart_requested = Arc::new(AtomicBool::new(false));
    let bridge = Bridge::start(&config, store.clone(), session, provider, events_rx, restart_requested.clone())
        .await
        .context("failed to start bridge orchestrator")?;

    let running = Arc::new(AtomicBool::new(true));
    signals::install_shutdown_handler(running.clone());

    if config.webhook_enabled {
        spawn_webhook_server(&config, bridge.notifications()).await?;
    }

    bridge.run(running).await.context("bridge orchestrator exited with an error")?;

    if commands::consume_restart_requested(&restart_requested) {
        info!("restart requested, exiting with sentinel code");
        return Ok(RESTART_SENTINEL_EXIT_CODE);
    }

    info!("shutdown complete");
    Ok(0)
}

async fn spawn_webhook_server(config: &Config, notifications: Arc<NotificationPipeline>) -> anyhow::Result<()> {
    let secret = config
        .webhook_secret
        .clone()
        .context("webhook_enabled is set but webhook_secret is missing")?;

    let state = webhook::WebhookState { pipeline: notifications, secret, path: config.webhook_path.clone() };
    let app = webhook::router(state);

    let addr = format!("{}:{}", config.webhook_host, config.webhook_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind webhook listener at {addr}"))?;

    info!(%addr, path = config.webhook_path, "webhook server listening");

    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            tracing::error!(%err, "webhook server exited");
        }
    });

    Ok(())
}
