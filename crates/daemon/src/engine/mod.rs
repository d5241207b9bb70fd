//! Messaging engine seam.
//!
//! An engine is the opaque protocol client behind a session. The daemon only
//! drives it through four commands and listens to the typed events it emits
//! on an [`EngineEvents`] channel:
//! - `initialize`: boot the client; pairing codes and readiness arrive as events
//! - `send_message`: deliver one text message
//! - `logout`: end the paired session on the provider side
//! - `destroy`: release every local resource held by the client
//!
//! Two implementations ship with the daemon: [`BridgeEngine`], which drives an
//! external bridge process over JSON lines, and [`SimulatedEngine`], which
//! fabricates pairing codes for development.

pub mod bridge;
pub mod simulated;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::{EngineConfig, EngineKind};

pub use bridge::{BridgeEngine, BridgeFactory};
pub use simulated::{SimulatedEngine, SimulatedFactory};

/// Capacity of a session's engine event channel.
pub const ENGINE_EVENT_CAPACITY: usize = 64;

/// Errors reported by an engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine could not be booted.
    #[error("engine failed to start: {0}")]
    Start(String),

    /// A message could not be delivered.
    #[error("send failed: {0}")]
    Send(String),

    /// The engine rejected a command.
    #[error("command failed: {0}")]
    Command(String),

    /// The engine is gone (process exited or was destroyed).
    #[error("engine is closed")]
    Closed,

    /// I/O error talking to the engine.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The engine sent something that could not be understood.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Boxed future returned by [`Engine`] methods.
pub type EngineFuture<'a, T> = Pin<Box<dyn Future<Output = EngineResult<T>> + Send + 'a>>;

/// Lifecycle event raised by an engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// A raw pairing token to be rendered and shown to the user.
    PairingCode(String),
    /// Credentials were accepted; `Ready` follows once the client is usable.
    Authenticated,
    /// The session is paired and can send.
    Ready {
        /// Identity of the paired phone, if known.
        phone: Option<String>,
    },
    /// The provider rejected pairing.
    AuthFailure(String),
    /// The connection was lost.
    Disconnected(String),
}

/// Sending half of a session's engine event channel.
///
/// Engines clone this freely; the lifecycle controller owns the only receiver.
#[derive(Debug, Clone)]
pub struct EngineEvents {
    session_id: String,
    tx: mpsc::Sender<EngineEvent>,
}

impl EngineEvents {
    /// Creates a bounded event channel for a session.
    pub fn channel(session_id: impl Into<String>) -> (Self, mpsc::Receiver<EngineEvent>) {
        let (tx, rx) = mpsc::channel(ENGINE_EVENT_CAPACITY);
        (
            Self {
                session_id: session_id.into(),
                tx,
            },
            rx,
        )
    }

    /// Returns the session these events belong to.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Delivers an event to the controller.
    ///
    /// Returns false once the controller has stopped listening.
    pub async fn emit(&self, event: EngineEvent) -> bool {
        match self.tx.send(event).await {
            Ok(()) => true,
            Err(_) => {
                tracing::debug!(session_id = %self.session_id, "Engine event dropped, controller gone");
                false
            }
        }
    }

    /// Returns whether the controller has stopped listening.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Provider acknowledgement of a delivered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageReceipt {
    /// Provider-assigned message identifier.
    pub message_id: String,
}

/// A messaging protocol client bound to one session.
///
/// Methods take `&self` so a command can run while the engine keeps emitting
/// events from its own tasks.
pub trait Engine: Send + Sync {
    /// Boots the client. Returns once the start sequence has completed.
    fn initialize(&self) -> EngineFuture<'_, ()>;

    /// Sends a text message to a normalised recipient address.
    fn send_message<'a>(
        &'a self,
        recipient: &'a str,
        body: &'a str,
    ) -> EngineFuture<'a, MessageReceipt>;

    /// Ends the paired session on the provider side.
    fn logout(&self) -> EngineFuture<'_, ()>;

    /// Releases every resource held by the client.
    fn destroy(&self) -> EngineFuture<'_, ()>;
}

/// Creates engines for sessions.
pub trait EngineFactory: Send + Sync {
    /// Creates a fresh, not yet initialized engine for a session.
    fn create(&self, session_id: &str, events: EngineEvents) -> EngineResult<Arc<dyn Engine>>;
}

/// Builds the engine factory selected by configuration.
pub fn factory_from_config(config: &EngineConfig) -> Arc<dyn EngineFactory> {
    match config.kind {
        EngineKind::Bridge => Arc::new(BridgeFactory::from_config(config)),
        EngineKind::Simulated => Arc::new(SimulatedFactory::from_config(config)),
    }
}
