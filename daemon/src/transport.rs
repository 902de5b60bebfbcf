//! JSON-RPC Transport (C2, spec §4.2): a newline-delimited JSON-RPC 2.0
//! channel bound to a child process's stdin/stdout. Generalizes the
//! teacher's one-request-in-flight reader loop into a true concurrent
//! pending-request demux, since §4.2 requires "pending-request demux"
//! rather than a strictly sequential exchange.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bridge_protocol::ClientNotification;
use bridge_protocol::ClientRequest;
use bridge_protocol::JSONRPCErrorObject;
use bridge_protocol::JSONRPCMessage;
use bridge_protocol::RequestId;
use bridge_protocol::ServerRequest;
use serde_json::Value;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::process::Child;
use tokio::process::ChildStdin;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::timeout;
use tracing::debug;
use tracing::warn;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const STDERR_RING_BUFFER_BYTES: usize = 32 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String, data: Option<Value> },
    #[error("transport is stopped: {0}")]
    Stopped(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl From<JSONRPCErrorObject> for TransportError {
    fn from(err: JSONRPCErrorObject) -> Self {
        Self::Rpc { code: err.code, message: err.message, data: err.data }
    }
}

/// Events emitted to subscribers: server-initiated requests and
/// notifications from the agent, plus terminal transport failure.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Notification { method: String, params: Value },
    ServerRequest(ServerRequest),
    Stopped { reason: String },
}

type PendingMap = Arc<AsyncMutex<HashMap<RequestId, oneshot::Sender<Result<Value, JSONRPCErrorObject>>>>>;

pub struct Transport {
    stdin: Arc<AsyncMutex<ChildStdin>>,
    pending: PendingMap,
    next_id: AtomicI64,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    reader_task: tokio::task::JoinHandle<()>,
    stderr_task: tokio::task::JoinHandle<()>,
    child: Arc<AsyncMutex<Child>>,
}

impl Transport {
    /// Spawns the agent binary and begins reading its stdout. Does not
    /// perform the `initialize`/`initialized` handshake; callers do
    /// that with `request`/`notify` immediately after `spawn` returns.
    pub async fn spawn(
        bin: &str,
        cwd: Option<&std::path::Path>,
        events_tx: mpsc::UnboundedSender<TransportEvent>,
    ) -> anyhow::Result<Self> {
        Self::spawn_with_args(bin, &[], cwd, events_tx).await
    }

    async fn spawn_with_args(
        bin: &str,
        args: &[&str],
        cwd: Option<&std::path::Path>,
        events_tx: mpsc::UnboundedSender<TransportEvent>,
    ) -> anyhow::Result<Self> {
        let mut command = Command::new(bin);
        command
            .args(args)
            .kill_on_drop(true)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = cwd {
            command.current_dir(cwd);
        }

        let mut child = command.spawn().with_context(|| format!("spawn agent binary {bin}"))?;
        let stdin = child.stdin.take().context("child stdin was not piped")?;
        let stdout = child.stdout.take().context("child stdout was not piped")?;
        let stderr = child.stderr.take().context("child stderr was not piped")?;

        let pending: PendingMap = Arc::new(AsyncMutex::new(HashMap::new()));

        let reader_task = {
            let pending = Arc::clone(&pending);
            let events_tx = events_tx.clone();
            tokio::spawn(async move {
                run_reader_loop(stdout, pending, events_tx).await;
            })
        };

        let stderr_task = {
            tokio::spawn(async move {
                run_stderr_loop(stderr).await;
            })
        };

        Ok(Self {
            stdin: Arc::new(AsyncMutex::new(stdin)),
            pending,
            next_id: AtomicI64::new(1),
            events_tx,
            reader_task,
            stderr_task,
            child: Arc::new(AsyncMutex::new(child)),
        })
    }

    fn next_request_id(&self) -> RequestId {
        RequestId::Integer(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Sends a request built by `build` (which receives the freshly
    /// minted id) and awaits the matching response, bounded by
    /// `timeout_duration`.
    pub async fn request(
        &self,
        build: impl FnOnce(RequestId) -> ClientRequest,
        timeout_duration: Duration,
    ) -> Result<Value, TransportError> {
        let id = self.next_request_id();
        let request = build(id.clone());
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);

        if let Err(err) = self.send_line(&request).await {
            self.pending.lock().await.remove(&id);
            return Err(err);
        }

        match timeout(timeout_duration, rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(rpc_error))) => Err(rpc_error.into()),
            Ok(Err(_)) => Err(TransportError::Stopped("pending request channel dropped".to_string())),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(TransportError::Timeout(timeout_duration))
            }
        }
    }

    pub async fn notify(&self, notification: &ClientNotification) -> Result<(), TransportError> {
        self.send_line(notification).await
    }

    pub async fn respond(&self, id: RequestId, result: Value) -> Result<(), TransportError> {
        self.send_line(&serde_json::json!({"id": id, "result": result})).await
    }

    pub async fn respond_error(
        &self,
        id: RequestId,
        code: i64,
        message: impl Into<String>,
        data: Option<Value>,
    ) -> Result<(), TransportError> {
        self.send_line(&serde_json::json!({
            "id": id,
            "error": {"code": code, "message": message.into(), "data": data},
        }))
        .await
    }

    async fn send_line(&self, value: &impl serde::Serialize) -> Result<(), TransportError> {
        let mut bytes = serde_json::to_vec(value)?;
        bytes.push(b'\n');
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(&bytes).await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Sends SIGTERM to the child and rejects every pending request
    /// with a terminal error.
    pub async fn stop(&self) -> anyhow::Result<()> {
        self.reader_task.abort();
        self.stderr_task.abort();
        let mut child = self.child.lock().await;
        if let Some(id) = child.id() {
            #[cfg(unix)]
            {
                use nix::sys::signal::kill;
                use nix::sys::signal::Signal;
                use nix::unistd::Pid;
                let _ = kill(Pid::from_raw(id as i32), Signal::SIGTERM);
            }
        }
        let _ = child.start_kill();
        self.reject_all_pending("transport stopped").await;
        Ok(())
    }

    async fn reject_all_pending(&self, message: &str) {
        let mut pending = self.pending.lock().await;
        for (_, tx) in pending.drain() {
            let _ = tx.send(Err(JSONRPCErrorObject {
                code: -32000,
                message: message.to_string(),
                data: None,
            }));
        }
    }
}

async fn run_reader_loop(
    stdout: tokio::process::ChildStdout,
    pending: PendingMap,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                if let Err(err) = handle_line(&line, &pending, &events_tx) {
                    warn!(%err, "failed to parse line from agent stdout");
                }
            }
            Ok(None) => {
                let _ = events_tx.send(TransportEvent::Stopped { reason: "child stdout closed".to_string() });
                break;
            }
            Err(err) => {
                warn!(%err, "error reading agent stdout");
                let _ = events_tx.send(TransportEvent::Stopped { reason: err.to_string() });
                break;
            }
        }
    }

    let mut pending = pending.lock().await;
    for (_, tx) in pending.drain() {
        let _ = tx.send(Err(JSONRPCErrorObject {
            code: -32000,
            message: "agent process exited".to_string(),
            data: None,
        }));
    }
}

fn handle_line(
    line: &str,
    pending: &PendingMap,
    events_tx: &mpsc::UnboundedSender<TransportEvent>,
) -> anyhow::Result<()> {
    let value: Value = serde_json::from_str(line)?;
    let message = JSONRPCMessage::classify(value)?;
    match message {
        JSONRPCMessage::Response(response) => {
            if let Ok(mut pending) = pending.try_lock() {
                if let Some(tx) = pending.remove(&response.id) {
                    let _ = tx.send(Ok(response.result));
                }
            } else {
                // Fall back to a blocking-free spawn to avoid holding up the reader loop.
                let pending = Arc::clone(pending);
                tokio::spawn(async move {
                    if let Some(tx) = pending.lock().await.remove(&response.id) {
                        let _ = tx.send(Ok(response.result));
                    }
                });
            }
        }
        JSONRPCMessage::Error(error) => {
            let pending = Arc::clone(pending);
            tokio::spawn(async move {
                if let Some(tx) = pending.lock().await.remove(&error.id) {
                    let _ = tx.send(Err(error.error));
                }
            });
        }
        JSONRPCMessage::Request(request) => {
            let server_request = ServerRequest::try_from(request)?;
            let _ = events_tx.send(TransportEvent::ServerRequest(server_request));
        }
        JSONRPCMessage::Notification(notification) => {
            let _ = events_tx.send(TransportEvent::Notification {
                method: notification.method,
                params: notification.params.unwrap_or(Value::Null),
            });
        }
    }
    Ok(())
}

/// Stderr lines are surfaced as warnings only, truncated to a bounded
/// ring buffer so a chatty agent cannot grow memory unboundedly.
async fn run_stderr_loop(stderr: tokio::process::ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    let mut buffered_bytes = 0usize;
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                buffered_bytes += line.len();
                if buffered_bytes <= STDERR_RING_BUFFER_BYTES {
                    warn!(target: "agent_stderr", "{line}");
                } else {
                    debug!(target: "agent_stderr", "stderr ring buffer exceeded, suppressing further lines");
                }
            }
            Ok(None) => break,
            Err(err) => {
                warn!(%err, "error reading agent stderr");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_protocol::wire::ClientInfo;
    use bridge_protocol::InitializeParams;
    use std::time::Duration;

    /// Minimal fake agent: echoes an `initialize` response, then for
    /// every `thread/start` request responds with a fixed thread id.
    /// Mirrors the teacher's bash-script fake-binary integration tests.
    const FAKE_AGENT_SCRIPT: &str = r#"
        while IFS= read -r line; do
          id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
          case "$line" in
            *'"method":"initialize"'*)
              printf '{"id":%s,"result":{}}\n' "$id"
              ;;
            *'"method":"thread/start"'*)
              printf '{"id":%s,"result":{"threadId":"thread-1"}}\n' "$id"
              ;;
          esac
        done
    "#;

    async fn spawn_fake_agent(events_tx: mpsc::UnboundedSender<TransportEvent>) -> Transport {
        Transport::spawn_with_args("/bin/sh", &["-c", FAKE_AGENT_SCRIPT], None, events_tx)
            .await
            .expect("spawn fake agent")
    }

    #[tokio::test]
    async fn request_round_trips_through_fake_child() {
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let transport = spawn_fake_agent(events_tx).await;

        let result = transport
            .request(
                |request_id| ClientRequest::Initialize {
                    request_id,
                    params: InitializeParams {
                        client_info: ClientInfo {
                            name: "imessage-bridge".to_string(),
                            title: None,
                            version: "0.1.0".to_string(),
                        },
                    },
                },
                Duration::from_secs(5),
            )
            .await;

        assert!(result.is_ok());
        let _ = transport.stop().await;
    }

    #[tokio::test]
    async fn concurrent_requests_each_get_their_own_response() {
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(spawn_fake_agent(events_tx).await);

        let t1 = Arc::clone(&transport);
        let t2 = Arc::clone(&transport);
        let (r1, r2) = tokio::join!(
            t1.request(
                |request_id| ClientRequest::ThreadStart {
                    request_id,
                    params: bridge_protocol::wire::ThreadStartParams {
                        model: "gpt-5.3-codex".to_string(),
                        cwd: None,
                        approval_policy: bridge_protocol::wire::ApprovalPolicy::Never,
                        sandbox: bridge_protocol::wire::SandboxMode::WorkspaceWrite,
                        experimental_raw_events: false,
                        tools: Vec::new(),
                    }
                },
                Duration::from_secs(5)
            ),
            t2.request(
                |request_id| ClientRequest::ThreadStart {
                    request_id,
                    params: bridge_protocol::wire::ThreadStartParams {
                        model: "gpt-5.3-codex".to_string(),
                        cwd: None,
                        approval_policy: bridge_protocol::wire::ApprovalPolicy::Never,
                        sandbox: bridge_protocol::wire::SandboxMode::WorkspaceWrite,
                        experimental_raw_events: false,
                        tools: Vec::new(),
                    }
                },
                Duration::from_secs(5)
            ),
        );

        assert_eq!(r1.unwrap()["threadId"], "thread-1");
        assert_eq!(r2.unwrap()["threadId"], "thread-1");
        let _ = transport.stop().await;
    }

    #[tokio::test]
    async fn abnormal_exit_rejects_all_pending_requests() {
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        // This script exits immediately without responding to anything.
        let transport = Transport::spawn_with_args("/bin/sh", &["-c", "exit 0"], None, events_tx)
            .await
            .expect("spawn exiting agent");

        let result = transport
            .request(
                |request_id| ClientRequest::Initialize {
                    request_id,
                    params: InitializeParams {
                        client_info: ClientInfo {
                            name: "imessage-bridge".to_string(),
                            title: None,
                            version: "0.1.0".to_string(),
                        },
                    },
                },
                Duration::from_secs(5),
            )
            .await;

        assert!(result.is_err());
    }
}
