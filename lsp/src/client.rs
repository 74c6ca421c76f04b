//! Protocol client: the language server as a child process speaking JSON-RPC
//! over stdio.
//!
//! [`StdioClient`] runs four tasks per process:
//! - writer: drains a channel of outgoing frames into stdin
//! - reader: routes responses to waiting requests, declines server requests,
//!   logs `window/*Message` notifications
//! - stderr: forwards each line to the `gx::server` log target
//! - handshake: `initialize` / `initialized`, then `Starting` → `Running`
//!
//! The state starts at `Starting`. It becomes `Stopped` when the handshake
//! fails, when the output stream ends, or after [`LanguageClient::stop`].

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use gx_types::ClientState;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::codec::{FrameReader, FrameWriter};
use crate::protocol::{self, Incoming, MessageParams, Notification, Request};
use crate::types::{LaunchSpec, LspEvent, ServerStopReason};

const INIT_TIMEOUT: Duration = Duration::from_secs(30);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);
const WRITER_CHANNEL_CAPACITY: usize = 64;

pub type ClientFut<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A started language server.
pub trait LanguageClient: Send + Sync {
    fn state(&self) -> ClientState;

    fn subscribe_state(&self) -> watch::Receiver<ClientState>;

    /// Shut the server down and wait for it to go away.
    fn stop(self: Box<Self>) -> ClientFut<'static, ()>;
}

/// Starts language servers.
///
/// `start` fails only when the process cannot be launched. A server that
/// launches and then dies is reported through its state.
pub trait ClientFactory: Send + Sync {
    fn start<'a>(
        &'a self,
        spec: &'a LaunchSpec,
        events: mpsc::Sender<LspEvent>,
    ) -> ClientFut<'a, Result<Box<dyn LanguageClient>>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StdioClientFactory;

impl ClientFactory for StdioClientFactory {
    fn start<'a>(
        &'a self,
        spec: &'a LaunchSpec,
        events: mpsc::Sender<LspEvent>,
    ) -> ClientFut<'a, Result<Box<dyn LanguageClient>>> {
        Box::pin(async move {
            let client = StdioClient::spawn(spec, events)?;
            Ok(Box::new(client) as Box<dyn LanguageClient>)
        })
    }
}

// ============================================================================
// JSON-RPC plumbing
// ============================================================================

enum WriterCommand {
    Send(serde_json::Value),
    Shutdown,
}

type PendingMap = Mutex<HashMap<u64, oneshot::Sender<serde_json::Value>>>;

struct Rpc {
    writer_tx: mpsc::Sender<WriterCommand>,
    pending: PendingMap,
    next_id: AtomicU64,
    /// Set once the server's output has ended; no response can arrive.
    closed: AtomicBool,
}

impl Rpc {
    fn new(writer_tx: mpsc::Sender<WriterCommand>) -> Self {
        Self {
            writer_tx,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    async fn request(
        &self,
        method: &'static str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<serde_json::Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = serde_json::to_value(Request::new(id, method, params))
            .context("encoding request")?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);
        if self.closed.load(Ordering::Acquire) {
            self.pending.lock().await.remove(&id);
            bail!("server output closed before {method}");
        }
        if self.writer_tx.send(WriterCommand::Send(frame)).await.is_err() {
            self.pending.lock().await.remove(&id);
            bail!("writer channel closed");
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => bail!("server went away before answering {method}"),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                bail!("{method} timed out after {timeout:?}");
            }
        }
    }

    async fn notify(&self, method: &'static str, params: Option<serde_json::Value>) -> Result<()> {
        let frame = serde_json::to_value(Notification::new(method, params))
            .context("encoding notification")?;
        self.writer_tx
            .send(WriterCommand::Send(frame))
            .await
            .map_err(|_| anyhow!("writer channel closed"))
    }

    /// Fail every outstanding request.
    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.pending.lock().await.clear();
    }

    async fn dispatch(&self, frame: &serde_json::Value) {
        let Some(incoming) = Incoming::classify(frame) else {
            tracing::trace!(target: "gx::server", "Ignoring malformed frame");
            return;
        };

        match incoming {
            Incoming::Response { id, body } => {
                if let Some(tx) = self.pending.lock().await.remove(&id) {
                    let _ = tx.send(body);
                }
            }
            Incoming::ServerRequest { id, method } => {
                tracing::debug!(target: "gx::server", %method, "Declining server request");
                let reply = protocol::method_not_found(&id, &method);
                let _ = self.writer_tx.send(WriterCommand::Send(reply)).await;
            }
            Incoming::Notification { method, params } => log_notification(&method, params),
        }
    }
}

fn log_notification(method: &str, params: Option<serde_json::Value>) {
    match method {
        "window/logMessage" | "window/showMessage" => {
            let Some(params) =
                params.and_then(|p| serde_json::from_value::<MessageParams>(p).ok())
            else {
                return;
            };
            tracing::info!(target: "gx::server", level = params.level_label(), "{}", params.message);
        }
        _ => tracing::trace!(target: "gx::server", %method, "Ignoring notification"),
    }
}

// ============================================================================
// Tasks
// ============================================================================

/// Move to `Stopped`, notifying watchers only on an actual change.
fn mark_stopped(state: &watch::Sender<ClientState>) {
    state.send_if_modified(|current| {
        std::mem::replace(current, ClientState::Stopped) != ClientState::Stopped
    });
}

async fn write_loop<W: AsyncWrite + Unpin>(stdin: W, mut rx: mpsc::Receiver<WriterCommand>) {
    let mut writer = FrameWriter::new(stdin);
    while let Some(command) = rx.recv().await {
        match command {
            WriterCommand::Send(frame) => {
                if let Err(err) = writer.write_frame(&frame).await {
                    tracing::debug!(target: "gx::server", "Write to language server failed: {err:#}");
                    break;
                }
            }
            WriterCommand::Shutdown => break,
        }
    }
}

async fn read_loop<R: AsyncRead + Unpin>(
    stdout: R,
    rpc: Arc<Rpc>,
    state: Arc<watch::Sender<ClientState>>,
    stopping: Arc<AtomicBool>,
    events: mpsc::Sender<LspEvent>,
) {
    let mut reader = FrameReader::new(stdout);
    let reason = loop {
        match reader.read_frame().await {
            Ok(Some(frame)) => rpc.dispatch(&frame).await,
            Ok(None) => break ServerStopReason::Exited,
            Err(err) => break ServerStopReason::Failed(format!("{err:#}")),
        }
    };

    rpc.close().await;
    mark_stopped(&state);
    if stopping.load(Ordering::Acquire) {
        return;
    }

    match &reason {
        ServerStopReason::Exited => {
            tracing::info!(target: "gx::server", "Language server closed its output");
        }
        ServerStopReason::Failed(message) => {
            tracing::warn!(target: "gx::server", "Language server stream failed: {message}");
        }
    }
    if events.try_send(LspEvent::ServerStopped { reason }).is_err() {
        tracing::debug!("Event channel full; stop event dropped");
    }
}

async fn forward_stderr<R: AsyncRead + Unpin>(stderr: R) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::info!(target: "gx::server", "{line}");
    }
}

async fn handshake(
    rpc: Arc<Rpc>,
    state: Arc<watch::Sender<ClientState>>,
    root_uri: Option<String>,
) {
    let params = protocol::initialize_params(root_uri.as_deref());
    let outcome = match rpc.request("initialize", Some(params), INIT_TIMEOUT).await {
        Ok(body) => match protocol::response_error(&body) {
            Some(message) => Err(anyhow!("initialize rejected: {message}")),
            None => rpc.notify("initialized", Some(serde_json::json!({}))).await,
        },
        Err(err) => Err(err),
    };

    match outcome {
        Ok(()) => {
            let promoted = state.send_if_modified(|current| {
                if *current == ClientState::Starting {
                    *current = ClientState::Running;
                    true
                } else {
                    false
                }
            });
            if promoted {
                tracing::info!(target: "gx::server", "Language server initialized");
            }
        }
        Err(err) => {
            tracing::warn!(target: "gx::server", "Language server handshake failed: {err:#}");
            mark_stopped(&state);
        }
    }
}

// ============================================================================
// StdioClient
// ============================================================================

pub struct StdioClient {
    child: Child,
    rpc: Arc<Rpc>,
    state: Arc<watch::Sender<ClientState>>,
    /// Suppresses the stop event when the shutdown was ours.
    stopping: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

impl StdioClient {
    /// Launch the process and begin the handshake. Must be called inside a
    /// tokio runtime.
    pub fn spawn(spec: &LaunchSpec, events: mpsc::Sender<LspEvent>) -> Result<Self> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(spec.env.iter().map(|(key, value)| (key, value)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }

        tracing::info!(target: "gx::server", command = %spec.command_line(), "Starting language server");
        let mut child = command
            .spawn()
            .with_context(|| format!("spawning {}", spec.program.display()))?;
        let stdin = child.stdin.take().context("language server has no stdin")?;
        let stdout = child.stdout.take().context("language server has no stdout")?;
        let stderr = child.stderr.take().context("language server has no stderr")?;

        let root_uri = spec
            .cwd
            .as_deref()
            .and_then(|cwd| protocol::path_to_file_uri(cwd).ok())
            .map(|uri| uri.to_string());

        let (writer_tx, writer_rx) = mpsc::channel(WRITER_CHANNEL_CAPACITY);
        let rpc = Arc::new(Rpc::new(writer_tx));
        let state = Arc::new(watch::channel(ClientState::Starting).0);
        let stopping = Arc::new(AtomicBool::new(false));

        let tasks = vec![
            tokio::spawn(write_loop(stdin, writer_rx)),
            tokio::spawn(read_loop(
                stdout,
                Arc::clone(&rpc),
                Arc::clone(&state),
                Arc::clone(&stopping),
                events,
            )),
            tokio::spawn(forward_stderr(stderr)),
            tokio::spawn(handshake(Arc::clone(&rpc), Arc::clone(&state), root_uri)),
        ];

        Ok(Self {
            child,
            rpc,
            state,
            stopping,
            tasks,
        })
    }

    async fn shutdown(mut self) {
        self.stopping.store(true, Ordering::Release);
        let live = *self.state.borrow() != ClientState::Stopped;
        if live {
            match self.rpc.request("shutdown", None, SHUTDOWN_TIMEOUT).await {
                Ok(response) if protocol::response_error(&response).is_none() => {
                    let _ = self.rpc.notify("exit", None).await;
                }
                Ok(_) => tracing::debug!(target: "gx::server", "shutdown rejected"),
                Err(err) => tracing::debug!(target: "gx::server", "shutdown failed: {err:#}"),
            }
        }
        let _ = self.rpc.writer_tx.send(WriterCommand::Shutdown).await;

        if tokio::time::timeout(SHUTDOWN_TIMEOUT, self.child.wait())
            .await
            .is_err()
        {
            tracing::debug!(target: "gx::server", "Language server did not exit in time; killing it");
            let _ = self.child.kill().await;
        }
        mark_stopped(&self.state);
        tracing::info!(target: "gx::server", "Language server stopped");
    }
}

impl LanguageClient for StdioClient {
    fn state(&self) -> ClientState {
        *self.state.borrow()
    }

    fn subscribe_state(&self) -> watch::Receiver<ClientState> {
        self.state.subscribe()
    }

    fn stop(self: Box<Self>) -> ClientFut<'static, ()> {
        Box::pin((*self).shutdown())
    }
}

impl Drop for StdioClient {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rpc_with_outbox() -> (Arc<Rpc>, mpsc::Receiver<WriterCommand>) {
        let (tx, rx) = mpsc::channel(8);
        (Arc::new(Rpc::new(tx)), rx)
    }

    fn sent_frame(command: WriterCommand) -> serde_json::Value {
        match command {
            WriterCommand::Send(frame) => frame,
            WriterCommand::Shutdown => panic!("expected a frame, got Shutdown"),
        }
    }

    #[tokio::test]
    async fn response_resolves_the_matching_request() {
        let (rpc, mut outbox) = rpc_with_outbox();
        let requester = {
            let rpc = Arc::clone(&rpc);
            tokio::spawn(async move {
                rpc.request("initialize", None, Duration::from_secs(5)).await
            })
        };

        let request = sent_frame(outbox.recv().await.unwrap());
        assert_eq!(request["method"], "initialize");
        let id = request["id"].clone();

        rpc.dispatch(&serde_json::json!({"jsonrpc": "2.0", "id": id, "result": {"ok": true}}))
            .await;
        let response = requester.await.unwrap().unwrap();
        assert_eq!(response["result"]["ok"], true);
        assert!(rpc.pending.lock().await.is_empty());
    }

    #[tokio::test]
    async fn server_requests_are_declined() {
        let (rpc, mut outbox) = rpc_with_outbox();
        rpc.dispatch(&serde_json::json!({
            "jsonrpc": "2.0",
            "id": 4,
            "method": "workspace/configuration",
            "params": {"items": []}
        }))
        .await;

        let reply = sent_frame(outbox.try_recv().unwrap());
        assert_eq!(reply["id"], 4);
        assert_eq!(reply["error"]["code"], protocol::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn notifications_produce_no_traffic() {
        let (rpc, mut outbox) = rpc_with_outbox();
        rpc.dispatch(&serde_json::json!({
            "jsonrpc": "2.0",
            "method": "window/logMessage",
            "params": {"type": 3, "message": "pygerber language server ready"}
        }))
        .await;
        assert!(outbox.try_recv().is_err());
    }

    #[tokio::test]
    async fn closing_fails_outstanding_and_later_requests() {
        let (rpc, _outbox) = rpc_with_outbox();
        let waiting = {
            let rpc = Arc::clone(&rpc);
            tokio::spawn(async move { rpc.request("shutdown", None, Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        while rpc.pending.lock().await.is_empty() {
            tokio::task::yield_now().await;
        }

        rpc.close().await;
        assert!(waiting.await.unwrap().is_err());
        assert!(
            rpc.request("initialize", None, Duration::from_secs(5))
                .await
                .is_err()
        );
    }

    #[cfg(unix)]
    fn shell(script: &str, cwd: &std::path::Path) -> LaunchSpec {
        LaunchSpec {
            program: "/bin/sh".into(),
            args: vec!["-c".into(), script.into()],
            env: Vec::new(),
            cwd: Some(cwd.to_path_buf()),
        }
    }

    /// Waits for the first request line, then answers it as request id 1.
    #[cfg(unix)]
    fn answering_server() -> String {
        let body = r#"{"jsonrpc":"2.0","id":1,"result":{"capabilities":{}}}"#;
        format!(
            "IFS= read -r header\nprintf 'Content-Length: {}\\r\\n\\r\\n%s' '{body}'\nexec cat > /dev/null\n",
            body.len()
        )
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn handshake_reaches_running_and_stop_is_quiet() {
        let dir = tempfile::tempdir().unwrap();
        let (events_tx, mut events) = mpsc::channel(8);
        let client = StdioClientFactory
            .start(&shell(&answering_server(), dir.path()), events_tx)
            .await
            .unwrap();

        let mut state = client.subscribe_state();
        tokio::time::timeout(
            Duration::from_secs(10),
            state.wait_for(|s| *s == ClientState::Running),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(client.state(), ClientState::Running);

        client.stop().await;
        assert_eq!(*state.borrow(), ClientState::Stopped);
        assert!(events.try_recv().is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn immediate_exit_reports_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let (events_tx, mut events) = mpsc::channel(8);
        let client = StdioClientFactory
            .start(&shell("exit 0", dir.path()), events_tx)
            .await
            .unwrap();

        let mut state = client.subscribe_state();
        tokio::time::timeout(
            Duration::from_secs(10),
            state.wait_for(|s| *s == ClientState::Stopped),
        )
        .await
        .unwrap()
        .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .unwrap();
        assert_eq!(
            event,
            Some(LspEvent::ServerStopped {
                reason: ServerStopReason::Exited
            })
        );
        client.stop().await;
    }

    #[tokio::test]
    async fn unlaunchable_program_is_an_error() {
        let (events_tx, _events) = mpsc::channel(8);
        let spec = LaunchSpec {
            program: "/nonexistent/gx-test/python".into(),
            ..LaunchSpec::default()
        };
        assert!(StdioClientFactory.start(&spec, events_tx).await.is_err());
    }
}
