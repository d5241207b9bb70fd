//! Engine backed by an external bridge process.
//!
//! The bridge is any executable that speaks newline-delimited JSON over its
//! standard streams. The daemon writes one command per line to stdin:
//!
//! ```text
//! {"id":1,"command":"initialize","sessionId":"acct1","sessionDir":"/var/lib/pairline/sessions"}
//! {"id":2,"command":"send","to":"5551234@c.us","body":"hello"}
//! {"id":3,"command":"logout"}
//! {"id":4,"command":"destroy"}
//! ```
//!
//! and reads events and replies from stdout:
//!
//! ```text
//! {"event":"qr","code":"2@..."}
//! {"event":"authenticated"}
//! {"event":"ready","phone":"5551234"}
//! {"event":"auth_failure","reason":"..."}
//! {"event":"disconnected","reason":"..."}
//! {"reply":"ok","id":2,"messageId":"true_5551234@c.us_3EB0"}
//! {"reply":"error","id":2,"message":"..."}
//! ```
//!
//! Replies are matched to commands by id. When the process exits on its own
//! the engine reports `Disconnected`.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use super::{
    Engine, EngineError, EngineEvent, EngineEvents, EngineFactory, EngineFuture, EngineResult,
    MessageReceipt,
};
use crate::config::EngineConfig;

/// Timeout for the initialize command; booting a client can take a while.
const START_TIMEOUT: Duration = Duration::from_secs(120);

/// Timeout for every other command.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize)]
#[serde(tag = "command", rename_all = "snake_case", rename_all_fields = "camelCase")]
enum BridgeCommand<'a> {
    Initialize {
        session_id: &'a str,
        session_dir: &'a str,
    },
    Send {
        to: &'a str,
        body: &'a str,
    },
    Logout,
    Destroy,
}

#[derive(Debug, Serialize)]
struct BridgeRequest<'a> {
    id: u64,
    #[serde(flatten)]
    command: BridgeCommand<'a>,
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
enum BridgeEvent {
    Qr {
        code: String,
    },
    Authenticated,
    Ready {
        #[serde(default)]
        phone: Option<String>,
    },
    AuthFailure {
        #[serde(default)]
        reason: String,
    },
    Disconnected {
        #[serde(default)]
        reason: String,
    },
}

impl From<BridgeEvent> for EngineEvent {
    fn from(event: BridgeEvent) -> Self {
        match event {
            BridgeEvent::Qr { code } => EngineEvent::PairingCode(code),
            BridgeEvent::Authenticated => EngineEvent::Authenticated,
            BridgeEvent::Ready { phone } => EngineEvent::Ready { phone },
            BridgeEvent::AuthFailure { reason } => EngineEvent::AuthFailure(reason),
            BridgeEvent::Disconnected { reason } => EngineEvent::Disconnected(reason),
        }
    }
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "reply", rename_all = "snake_case")]
enum BridgeReply {
    Ok {
        id: u64,
        #[serde(default, rename = "messageId")]
        message_id: Option<String>,
    },
    Error {
        id: u64,
        #[serde(default)]
        message: String,
    },
}

impl BridgeReply {
    fn id(&self) -> u64 {
        match self {
            BridgeReply::Ok { id, .. } | BridgeReply::Error { id, .. } => *id,
        }
    }
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(untagged)]
enum BridgeLine {
    Event(BridgeEvent),
    Reply(BridgeReply),
}

type PendingReplies = Arc<DashMap<u64, oneshot::Sender<BridgeReply>>>;

/// Engine that drives an external bridge process.
pub struct BridgeEngine {
    session_id: String,
    program: String,
    args: Vec<String>,
    session_dir: PathBuf,
    events: EngineEvents,
    stdin: Mutex<Option<ChildStdin>>,
    pending: PendingReplies,
    next_id: AtomicU64,
    cancel: CancellationToken,
}

impl BridgeEngine {
    /// Creates an engine that will run `program args..` on initialize.
    pub fn new(
        session_id: impl Into<String>,
        program: impl Into<String>,
        args: Vec<String>,
        session_dir: PathBuf,
        events: EngineEvents,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            program: program.into(),
            args,
            session_dir,
            events,
            stdin: Mutex::new(None),
            pending: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
            cancel: CancellationToken::new(),
        }
    }

    async fn spawn_process(&self) -> EngineResult<()> {
        let mut stdin_slot = self.stdin.lock().await;
        if stdin_slot.is_some() {
            return Err(EngineError::Start("bridge already running".to_string()));
        }
        if self.cancel.is_cancelled() {
            return Err(EngineError::Closed);
        }

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg("--session-id")
            .arg(&self.session_id)
            .arg("--session-dir")
            .arg(&self.session_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EngineError::Start(format!("failed to spawn {}: {}", self.program, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::Start("bridge stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Start("bridge stdout unavailable".to_string()))?;

        tracing::info!(
            session_id = %self.session_id,
            program = %self.program,
            pid = ?child.id(),
            "Bridge process started"
        );

        tokio::spawn(Self::read_loop(
            self.session_id.clone(),
            stdout,
            self.events.clone(),
            self.pending.clone(),
            self.cancel.clone(),
        ));
        tokio::spawn(Self::supervise(
            self.session_id.clone(),
            child,
            self.cancel.clone(),
        ));

        *stdin_slot = Some(stdin);
        Ok(())
    }

    /// Reads events and replies until the bridge closes stdout.
    async fn read_loop(
        session_id: String,
        stdout: ChildStdout,
        events: EngineEvents,
        pending: PendingReplies,
        cancel: CancellationToken,
    ) {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            let line = tokio::select! {
                _ = cancel.cancelled() => break,
                line = lines.next_line() => line,
            };

            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(session_id = %session_id, error = %e, "Bridge read failed");
                    break;
                }
            };
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            match serde_json::from_str::<BridgeLine>(trimmed) {
                Ok(BridgeLine::Event(event)) => {
                    if !events.emit(event.into()).await {
                        break;
                    }
                }
                Ok(BridgeLine::Reply(reply)) => match pending.remove(&reply.id()) {
                    Some((_, tx)) => {
                        let _ = tx.send(reply);
                    }
                    None => {
                        tracing::debug!(session_id = %session_id, id = reply.id(), "Unmatched bridge reply");
                    }
                },
                Err(e) => {
                    tracing::warn!(
                        session_id = %session_id,
                        error = %e,
                        line = %trimmed,
                        "Ignoring malformed bridge output"
                    );
                }
            }
        }

        // Dropping the senders fails every in-flight command with `Closed`.
        pending.clear();

        if !cancel.is_cancelled() {
            events
                .emit(EngineEvent::Disconnected("bridge process exited".to_string()))
                .await;
        }
    }

    /// Waits for the process, killing it when the engine is destroyed.
    async fn supervise(session_id: String, mut child: Child, cancel: CancellationToken) {
        tokio::select! {
            status = child.wait() => match status {
                Ok(status) => tracing::info!(session_id = %session_id, %status, "Bridge process exited"),
                Err(e) => tracing::warn!(session_id = %session_id, error = %e, "Failed to wait for bridge process"),
            },
            _ = cancel.cancelled() => {
                if let Err(e) = child.kill().await {
                    tracing::warn!(session_id = %session_id, error = %e, "Failed to kill bridge process");
                } else {
                    tracing::debug!(session_id = %session_id, "Bridge process killed");
                }
            }
        }
    }

    async fn request(
        &self,
        command: BridgeCommand<'_>,
        timeout: Duration,
    ) -> EngineResult<BridgeReply> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut line = serde_json::to_string(&BridgeRequest { id, command })
            .map_err(|e| EngineError::Protocol(e.to_string()))?;
        line.push('\n');

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        {
            let mut guard = self.stdin.lock().await;
            let Some(stdin) = guard.as_mut() else {
                self.pending.remove(&id);
                return Err(EngineError::Closed);
            };
            let written = async {
                stdin.write_all(line.as_bytes()).await?;
                stdin.flush().await
            }
            .await;
            if let Err(e) = written {
                self.pending.remove(&id);
                return Err(EngineError::Io(e));
            }
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(BridgeReply::Error { message, .. })) => Err(EngineError::Command(message)),
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(EngineError::Closed),
            Err(_) => {
                self.pending.remove(&id);
                Err(EngineError::Command(format!(
                    "bridge did not reply within {}s",
                    timeout.as_secs()
                )))
            }
        }
    }
}

impl Engine for BridgeEngine {
    fn initialize(&self) -> EngineFuture<'_, ()> {
        Box::pin(async move {
            self.spawn_process().await?;
            let session_dir = self.session_dir.to_string_lossy();
            self.request(
                BridgeCommand::Initialize {
                    session_id: &self.session_id,
                    session_dir: &session_dir,
                },
                START_TIMEOUT,
            )
            .await
            .map_err(|e| EngineError::Start(e.to_string()))?;
            Ok(())
        })
    }

    fn send_message<'a>(
        &'a self,
        recipient: &'a str,
        body: &'a str,
    ) -> EngineFuture<'a, MessageReceipt> {
        Box::pin(async move {
            let reply = self
                .request(
                    BridgeCommand::Send {
                        to: recipient,
                        body,
                    },
                    COMMAND_TIMEOUT,
                )
                .await
                .map_err(|e| match e {
                    EngineError::Command(reason) => EngineError::Send(reason),
                    other => other,
                })?;

            match reply {
                BridgeReply::Ok {
                    message_id: Some(message_id),
                    ..
                } => Ok(MessageReceipt { message_id }),
                _ => Err(EngineError::Protocol(
                    "send reply carried no messageId".to_string(),
                )),
            }
        })
    }

    fn logout(&self) -> EngineFuture<'_, ()> {
        Box::pin(async move {
            self.request(BridgeCommand::Logout, COMMAND_TIMEOUT).await?;
            Ok(())
        })
    }

    fn destroy(&self) -> EngineFuture<'_, ()> {
        Box::pin(async move {
            let running = self.stdin.lock().await.is_some();
            if running && !self.cancel.is_cancelled() {
                if let Err(e) = self.request(BridgeCommand::Destroy, COMMAND_TIMEOUT).await {
                    tracing::debug!(session_id = %self.session_id, error = %e, "Bridge destroy command failed");
                }
            }
            self.cancel.cancel();
            self.stdin.lock().await.take();
            Ok(())
        })
    }
}

impl Drop for BridgeEngine {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Factory for [`BridgeEngine`]s.
pub struct BridgeFactory {
    program: String,
    args: Vec<String>,
    session_dir: PathBuf,
}

impl BridgeFactory {
    /// Creates a factory from the `[engine]` configuration section.
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            program: config.command.clone(),
            args: config.args.clone(),
            session_dir: config.session_dir.clone(),
        }
    }
}

impl EngineFactory for BridgeFactory {
    fn create(&self, session_id: &str, events: EngineEvents) -> EngineResult<Arc<dyn Engine>> {
        if self.program.trim().is_empty() {
            return Err(EngineError::Start("no bridge command configured".to_string()));
        }
        Ok(Arc::new(BridgeEngine::new(
            session_id,
            self.program.clone(),
            self.args.clone(),
            self.session_dir.clone(),
            events,
        )))
    }
}
