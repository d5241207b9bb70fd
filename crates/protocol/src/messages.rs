//! Wire types for Pairline.
//!
//! This module defines the lifecycle events published on the daemon's event
//! bus, the frames written to streaming pairing connections, and the status
//! and send result shapes returned by session commands. Everything here is
//! JSON-serializable with camelCase field names.

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Caller-assigned identifier of a tenant session.
pub type SessionId = String;

/// Suffix appended to bare phone numbers to form a recipient address.
pub const RECIPIENT_SUFFIX: &str = "@c.us";

/// Lifecycle state of a session.
///
/// Only an explicit destroy removes a session; every state here can be
/// re-entered into `Initializing` by a fresh initialize command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Record registered, engine not started yet.
    Created,
    /// Engine start sequence in progress.
    Initializing,
    /// A pairing code has been issued and is waiting to be scanned.
    PairedPending,
    /// Pairing succeeded; the session can send.
    Ready,
    /// The engine lost its connection.
    Disconnected,
    /// The session was logged out on request.
    LoggedOut,
    /// The engine failed to boot.
    InitFailed,
    /// The provider rejected pairing.
    AuthFailed,
}

impl LifecycleState {
    /// Returns the wire name of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Created => "created",
            LifecycleState::Initializing => "initializing",
            LifecycleState::PairedPending => "paired_pending",
            LifecycleState::Ready => "ready",
            LifecycleState::Disconnected => "disconnected",
            LifecycleState::LoggedOut => "logged_out",
            LifecycleState::InitFailed => "init_failed",
            LifecycleState::AuthFailed => "auth_failed",
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind tag of a [`SessionEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A new pairing code was issued.
    Code,
    /// Pairing completed.
    Ready,
    /// Pairing was rejected.
    AuthFailure,
    /// The engine disconnected.
    Disconnected,
}

impl EventKind {
    /// Returns the wire name of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Code => "code",
            EventKind::Ready => "ready",
            EventKind::AuthFailure => "auth_failure",
            EventKind::Disconnected => "disconnected",
        }
    }
}

/// Lifecycle event published on the event bus.
///
/// Every event carries the session it belongs to; subscribers receive all
/// sessions' events and filter on [`SessionEvent::session_id`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum SessionEvent {
    /// A new pairing code, already rendered to a displayable payload.
    Code {
        /// Session the code belongs to.
        session_id: SessionId,
        /// Rendered image payload (data URL).
        code: String,
    },
    /// The session finished pairing.
    Ready {
        /// Session that became ready.
        session_id: SessionId,
        /// Identity of the paired phone, if the engine reported one.
        phone_identity: Option<String>,
        /// Unix timestamp in milliseconds.
        ready_at: u64,
    },
    /// The provider rejected pairing.
    AuthFailure {
        /// Affected session.
        session_id: SessionId,
        /// Provider-supplied reason.
        reason: String,
    },
    /// The engine disconnected.
    Disconnected {
        /// Affected session.
        session_id: SessionId,
        /// Engine-supplied reason.
        reason: String,
    },
}

impl SessionEvent {
    /// Returns the session this event belongs to.
    pub fn session_id(&self) -> &str {
        match self {
            SessionEvent::Code { session_id, .. }
            | SessionEvent::Ready { session_id, .. }
            | SessionEvent::AuthFailure { session_id, .. }
            | SessionEvent::Disconnected { session_id, .. } => session_id,
        }
    }

    /// Returns the kind tag of this event.
    pub fn kind(&self) -> EventKind {
        match self {
            SessionEvent::Code { .. } => EventKind::Code,
            SessionEvent::Ready { .. } => EventKind::Ready,
            SessionEvent::AuthFailure { .. } => EventKind::AuthFailure,
            SessionEvent::Disconnected { .. } => EventKind::Disconnected,
        }
    }

    /// Returns the lifecycle error this event reports, if any.
    pub fn failure(&self) -> Option<ProtocolError> {
        match self {
            SessionEvent::AuthFailure { session_id, reason } => Some(ProtocolError::AuthFailure {
                session_id: session_id.clone(),
                reason: reason.clone(),
            }),
            _ => None,
        }
    }
}

/// A data frame written to a streaming pairing connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum StreamFrame {
    /// First frame of every stream.
    Connected {
        /// Human-readable notice.
        message: String,
    },
    /// A pairing code to display.
    Code {
        /// Rendered image payload (data URL).
        qr_code: String,
        /// Human-readable notice.
        message: String,
    },
    /// Pairing completed; the stream ends after this frame.
    Ready {
        /// Human-readable notice.
        message: String,
        /// Identity of the paired phone.
        phone_identity: Option<String>,
    },
}

impl StreamFrame {
    /// Builds the opening frame for a session's stream.
    pub fn connected(session_id: &str) -> Self {
        StreamFrame::Connected {
            message: format!("Connected to pairing stream for {}", session_id),
        }
    }

    /// Returns true if the stream must end after this frame.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamFrame::Ready { .. })
    }
}

/// One item of a streaming pairing connection: a data frame or a keep-alive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamMessage {
    /// A typed data frame.
    Frame(StreamFrame),
    /// A comment-only keep-alive with no type.
    Heartbeat,
}

impl StreamMessage {
    /// Returns the data frame, if this item is one.
    pub fn frame(&self) -> Option<&StreamFrame> {
        match self {
            StreamMessage::Frame(frame) => Some(frame),
            StreamMessage::Heartbeat => None,
        }
    }
}

/// Point-in-time status snapshot of a session.
///
/// A session that does not exist reports `exists: false` and nothing else.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    /// Whether a record is registered under the id.
    pub exists: bool,
    /// Current lifecycle state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<LifecycleState>,
    /// Whether the engine start sequence has completed.
    pub is_initialized: bool,
    /// Whether pairing succeeded.
    pub is_ready: bool,
    /// Whether a pairing code is cached.
    pub has_code: bool,
    /// Identity of the paired phone.
    pub phone_identity: Option<String>,
    /// Unix milliseconds of the latest pairing code.
    pub last_code_at: Option<u64>,
    /// Unix milliseconds when the session became ready.
    pub ready_at: Option<u64>,
}

impl SessionStatus {
    /// Status reported for an unknown session id.
    pub fn missing() -> Self {
        Self::default()
    }
}

/// Receipt for a delivered message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendReceipt {
    /// Provider-assigned message identifier.
    pub message_id: String,
    /// Normalised recipient address.
    pub to: String,
    /// Session the message was sent from.
    pub session_id: SessionId,
}

/// One entry of a bulk send request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkItem {
    /// Recipient phone number or address.
    #[serde(alias = "number")]
    pub recipient: String,
    /// Message text.
    #[serde(alias = "message")]
    pub body: String,
}

impl BulkItem {
    /// Creates a new bulk item.
    pub fn new(recipient: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            recipient: recipient.into(),
            body: body.into(),
        }
    }
}

/// A failed entry of a bulk send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkError {
    /// Position of the item in the request.
    pub index: usize,
    /// Recipient as supplied by the caller.
    pub recipient: String,
    /// Failure description.
    pub error: String,
}

/// Outcome of a bulk send, in request order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkReport {
    /// Receipts for delivered items.
    pub sent: Vec<SendReceipt>,
    /// Failures, one per failed item.
    pub errors: Vec<BulkError>,
}

/// Normalises a recipient into a provider address.
///
/// Addresses that already carry [`RECIPIENT_SUFFIX`] are kept as-is; anything
/// else is reduced to its digits and suffixed. Returns `None` when no digits
/// remain.
pub fn normalize_recipient(recipient: &str) -> Option<String> {
    let trimmed = recipient.trim();
    if trimmed.contains(RECIPIENT_SUFFIX) {
        return Some(trimmed.to_string());
    }

    let digits: String = trimmed.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    Some(format!("{}{}", digits, RECIPIENT_SUFFIX))
}
