//! Exec session - one actor per streaming command attachment
//!
//! A session opens a streaming exec against the worker API, republishes
//! every chunk on `exec:<session_id>`, parses stdout lines for protocol
//! events (republished on `exec:<session_id>:events`), forwards everything
//! to the sprite's unified log topic, and keeps a bounded ring buffer for
//! late subscribers. An idle timeout closes abandoned sessions; `close()`
//! is idempotent.

use super::protocol::{self, ParsedLine};
use super::registry::{ExecRegistry, ExecSessionInfo};
use crate::capabilities::secrets::SecretStore;
use crate::capabilities::worker_api::{ExecStreamItem, WorkerApi, WorkerApiError};
use crate::capabilities::WORKER_API_TOKEN;
use crate::events::{telemetry, topics, BusMessage, EventBus, LogLine, LogStream};
use crate::ids;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

// ============================================================================
// Types
// ============================================================================

/// Which stream an output chunk belongs to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecStream {
    Stdout,
    Stderr,
    Exit,
}

/// Output envelope published on `exec:<session_id>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecOutput {
    pub session_id: String,
    pub sprite_id: String,
    pub stream: ExecStream,
    pub chunk: String,
    pub at: DateTime<Utc>,
}

/// Exec session errors
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("missing worker API token")]
    MissingApiToken,
    #[error(transparent)]
    WorkerApi(#[from] WorkerApiError),
}

enum SessionCommand {
    Close,
    GetOutput { reply: oneshot::Sender<Vec<Arc<ExecOutput>>> },
}

// ============================================================================
// Handle
// ============================================================================

/// Handle to a running exec session.
#[derive(Clone)]
pub struct ExecSessionHandle {
    session_id: String,
    tx: mpsc::Sender<SessionCommand>,
}

impl ExecSessionHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn is_alive(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Close the session. Idempotent: closing an already-terminated session
    /// succeeds silently.
    pub async fn close(&self) {
        let _ = self.tx.send(SessionCommand::Close).await;
    }

    /// Fetch the buffered output (last N entries, oldest first). Empty when
    /// the session is gone.
    pub async fn get_output(&self) -> Vec<Arc<ExecOutput>> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(SessionCommand::GetOutput { reply }).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// A handle whose session has already terminated. For tests.
    pub fn detached(session_id: &str) -> Self {
        let (tx, _) = mpsc::channel(1);
        Self { session_id: session_id.to_string(), tx }
    }
}

// ============================================================================
// Session
// ============================================================================

/// Collaborators for exec sessions.
#[derive(Clone)]
pub struct ExecDeps {
    pub worker_api: Arc<dyn WorkerApi>,
    pub bus: EventBus,
    pub registry: ExecRegistry,
    pub secrets: Arc<dyn SecretStore>,
    /// Override idle timeout (config default when `None`)
    pub idle_timeout: Option<Duration>,
    /// Override buffer depth (config default when `None`)
    pub max_buffer_lines: Option<usize>,
}

/// Start an exec session: verify credentials, open the stream, register,
/// and spawn the session actor. Returns the handle once attached.
pub async fn start(
    sprite_id: &str,
    command: &str,
    deps: ExecDeps,
) -> Result<(ExecSessionHandle, JoinHandle<()>), ExecError> {
    // Fail fast before any connection attempt.
    if deps.secrets.get_secret(WORKER_API_TOKEN).is_none() {
        return Err(ExecError::MissingApiToken);
    }

    let chunks = deps.worker_api.exec_stream(sprite_id, command).await?;
    let session_id = ids::random_id("exec");
    let (tx, rx) = mpsc::channel(16);
    let handle = ExecSessionHandle { session_id: session_id.clone(), tx };

    deps.registry.register(ExecSessionInfo {
        session_id: session_id.clone(),
        sprite_id: sprite_id.to_string(),
        command: command.to_string(),
        started_at: Utc::now(),
        handle: handle.clone(),
    });

    let config = &crate::config::get().exec;
    let session = Session {
        session_id: session_id.clone(),
        sprite_id: sprite_id.to_string(),
        bus: deps.bus.clone(),
        registry: deps.registry.clone(),
        buffer: VecDeque::new(),
        max_buffer_lines: deps.max_buffer_lines.unwrap_or(config.max_buffer_lines),
        idle_timeout: deps
            .idle_timeout
            .unwrap_or(Duration::from_millis(config.idle_timeout_ms)),
        saw_exit: false,
    };

    info!(session_id = %session_id, sprite_id = %sprite_id, command = %command, "Exec session started");
    let join = tokio::spawn(session.run(chunks, rx));
    Ok((handle, join))
}

struct Session {
    session_id: String,
    sprite_id: String,
    bus: EventBus,
    registry: ExecRegistry,
    buffer: VecDeque<Arc<ExecOutput>>,
    max_buffer_lines: usize,
    idle_timeout: Duration,
    saw_exit: bool,
}

impl Session {
    async fn run(
        mut self,
        mut chunks: mpsc::Receiver<ExecStreamItem>,
        mut rx: mpsc::Receiver<SessionCommand>,
    ) {
        let mut idle_deadline = Instant::now() + self.idle_timeout;

        loop {
            tokio::select! {
                item = chunks.recv() => match item {
                    Some(item) => {
                        idle_deadline = Instant::now() + self.idle_timeout;
                        let finished = self.handle_item(item);
                        if finished {
                            break;
                        }
                    }
                    None => {
                        debug!(session_id = %self.session_id, "Exec stream ended");
                        if !self.saw_exit {
                            // Remote went away without an exit record.
                            self.emit_completed(-1);
                        }
                        break;
                    }
                },
                cmd = rx.recv() => match cmd {
                    Some(SessionCommand::Close) | None => {
                        debug!(session_id = %self.session_id, "Exec session closed");
                        break;
                    }
                    Some(SessionCommand::GetOutput { reply }) => {
                        let _ = reply.send(self.buffer.iter().cloned().collect());
                    }
                },
                _ = tokio::time::sleep_until(idle_deadline) => {
                    info!(
                        session_id = %self.session_id,
                        idle_ms = self.idle_timeout.as_millis() as u64,
                        "Exec session idle timeout"
                    );
                    break;
                }
            }
        }

        // Cleanup path: releasing the chunk receiver tears down the remote
        // stream task; the registry entry goes with it.
        self.registry.remove(&self.session_id);
    }

    /// Process one stream item. Returns true when the session is finished.
    fn handle_item(&mut self, item: ExecStreamItem) -> bool {
        match item {
            ExecStreamItem::Stdout(data) => {
                self.publish_chunk(ExecStream::Stdout, &data);
                for line in data.lines() {
                    if let ParsedLine::Event(event) = protocol::parse_line(line) {
                        self.bus.publish(
                            &topics::exec_events(&self.session_id),
                            BusMessage::ProtocolEvent(Arc::new(event)),
                        );
                    }
                }
                false
            }
            ExecStreamItem::Stderr(data) => {
                self.publish_chunk(ExecStream::Stderr, &data);
                false
            }
            ExecStreamItem::Exit(code) => {
                self.saw_exit = true;
                self.publish_chunk(ExecStream::Exit, &code.to_string());
                self.emit_completed(code);
                true
            }
        }
    }

    fn publish_chunk(&mut self, stream: ExecStream, data: &str) {
        let output = Arc::new(ExecOutput {
            session_id: self.session_id.clone(),
            sprite_id: self.sprite_id.clone(),
            stream,
            chunk: data.to_string(),
            at: Utc::now(),
        });

        self.bus.publish(
            &topics::exec(&self.session_id),
            BusMessage::ExecOutput(Arc::clone(&output)),
        );

        // Ring buffer: drop the oldest entry exactly at capacity.
        if self.buffer.len() == self.max_buffer_lines {
            self.buffer.pop_front();
        }
        self.buffer.push_back(Arc::clone(&output));

        // Unified per-sprite log stream.
        let log_stream = match stream {
            ExecStream::Stdout => LogStream::Stdout,
            ExecStream::Stderr => LogStream::Stderr,
            ExecStream::Exit => LogStream::System,
        };
        self.bus.publish(
            &topics::sprite_logs(&self.sprite_id),
            BusMessage::LogLine(Arc::new(LogLine {
                sprite_id: self.sprite_id.clone(),
                source: format!("exec:{}", self.session_id),
                stream: log_stream,
                line: data.to_string(),
                at: output.at,
            })),
        );

        telemetry::emit(
            &["lattice", "exec", "output"],
            json!({"bytes": data.len()}),
            json!({"session_id": self.session_id, "stream": stream}),
        );
    }

    fn emit_completed(&self, exit_code: i32) {
        telemetry::emit(
            &["lattice", "exec", "completed"],
            json!({"exit_code": exit_code}),
            json!({"session_id": self.session_id, "sprite_id": self.sprite_id}),
        );
        if exit_code != 0 {
            warn!(session_id = %self.session_id, exit_code = exit_code, "Exec finished non-zero");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::secrets::StaticSecretStore;
    use crate::capabilities::worker_api::{make_api_sprite, StubWorkerApi};
    use crate::exec::protocol::ProtocolEvent;

    fn deps(stub: &StubWorkerApi) -> (ExecDeps, EventBus, ExecRegistry) {
        let bus = EventBus::new();
        let registry = ExecRegistry::new();
        let deps = ExecDeps {
            worker_api: Arc::new(stub.clone()),
            bus: bus.clone(),
            registry: registry.clone(),
            secrets: Arc::new(StaticSecretStore::new().with(WORKER_API_TOKEN, "stub-token")),
            idle_timeout: Some(Duration::from_millis(200)),
            max_buffer_lines: Some(5),
        };
        (deps, bus, registry)
    }

    #[tokio::test]
    async fn test_missing_token_fails_fast() {
        let stub = StubWorkerApi::new();
        let (mut deps, _bus, _registry) = deps(&stub);
        deps.secrets = Arc::new(StaticSecretStore::new());

        let err = start("s1", "echo hi", deps).await.err().unwrap();
        assert!(matches!(err, ExecError::MissingApiToken));
    }

    #[tokio::test]
    async fn test_output_and_protocol_events_published() {
        let stub = StubWorkerApi::new();
        stub.insert_sprite(make_api_sprite("s1", "running"));
        stub.script_exec(vec![
            ExecStreamItem::Stdout("plain line".to_string()),
            ExecStreamItem::Stdout(
                r#"LATTICE_EVENT {"type":"progress","data":{"message":"half way","percent":50.0}}"#
                    .to_string(),
            ),
            ExecStreamItem::Stderr("a complaint".to_string()),
            ExecStreamItem::Exit(0),
        ]);
        let (deps, bus, registry) = deps(&stub);

        // Subscribe to the log topic up front; exec topics need the session
        // id, so buffered output covers those.
        let mut logs_rx = bus.subscribe(&topics::sprite_logs("s1"));

        let (handle, join) = start("s1", "make test", deps).await.unwrap();
        assert!(registry.get(handle.session_id()).is_some());

        let mut events_rx = bus.subscribe(&topics::exec_events(handle.session_id()));

        // Unified logs carry all three chunks
        let mut seen = Vec::new();
        for _ in 0..3 {
            match logs_rx.recv().await.unwrap() {
                BusMessage::LogLine(line) => seen.push((line.stream, line.line.clone())),
                other => panic!("unexpected message: {other:?}"),
            }
        }
        assert_eq!(seen[0], (LogStream::Stdout, "plain line".to_string()));
        assert_eq!(seen[2], (LogStream::Stderr, "a complaint".to_string()));

        // The protocol event was parsed and republished (subscription may
        // race the first chunks; the event is the second stdout line).
        if let Ok(BusMessage::ProtocolEvent(event)) = events_rx.try_recv() {
            assert_eq!(event.message(), "half way");
        }

        join.await.unwrap();
        assert!(registry.get(handle.session_id()).is_none());
    }

    #[tokio::test]
    async fn test_ring_buffer_drops_oldest() {
        let stub = StubWorkerApi::new();
        stub.insert_sprite(make_api_sprite("s1", "running"));
        stub.set_exec_hold_open(true);
        let items: Vec<ExecStreamItem> =
            (0..8).map(|i| ExecStreamItem::Stdout(format!("line {i}"))).collect();
        stub.script_exec(items);
        let (deps, _bus, _registry) = deps(&stub);

        let (handle, _join) = start("s1", "yes", deps).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let output = handle.get_output().await;
        assert_eq!(output.len(), 5);
        // Oldest three were dropped
        assert_eq!(output[0].chunk, "line 3");
        assert_eq!(output[4].chunk, "line 7");

        handle.close().await;
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let stub = StubWorkerApi::new();
        stub.insert_sprite(make_api_sprite("s1", "running"));
        stub.set_exec_hold_open(true);
        let (deps, _bus, registry) = deps(&stub);

        let (handle, join) = start("s1", "sleep 1000", deps).await.unwrap();
        handle.close().await;
        join.await.unwrap();
        assert!(registry.is_empty());

        // Second and third closes are silent no-ops
        handle.close().await;
        handle.close().await;
        assert!(handle.get_output().await.is_empty());
    }

    #[tokio::test]
    async fn test_idle_timeout_closes_session() {
        let stub = StubWorkerApi::new();
        stub.insert_sprite(make_api_sprite("s1", "running"));
        stub.set_exec_hold_open(true);
        let (mut deps, _bus, registry) = deps(&stub);
        deps.idle_timeout = Some(Duration::from_millis(40));

        let (_handle, join) = start("s1", "sleep 1000", deps).await.unwrap();
        assert_eq!(registry.len(), 1);

        join.await.unwrap();
        assert!(registry.is_empty());
    }
}
