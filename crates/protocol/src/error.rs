//! Error types for the protocol crate.

use thiserror::Error;

/// Error type covering every failure a session command can report.
///
/// Lifecycle failures (`EngineStartFailure`, `AuthFailure`) are usually
/// observed through session state and bus events rather than returned, since
/// engine start runs detached from the command that requested it. See
/// [`SessionEvent::failure`](crate::SessionEvent::failure).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    // Command errors
    /// No session is registered under the given identifier.
    #[error("session not found: {0}")]
    NotFound(String),

    /// The session exists but pairing has not completed.
    #[error("session not ready: {0}")]
    NotReady(String),

    /// The request was malformed or violated a configured limit.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    // Lifecycle errors
    /// The engine failed to boot for a session.
    #[error("engine failed to start for {session_id}: {reason}")]
    EngineStartFailure {
        /// The affected session.
        session_id: String,
        /// Engine-supplied reason.
        reason: String,
    },

    /// Pairing was rejected by the provider.
    #[error("authentication failed for {session_id}: {reason}")]
    AuthFailure {
        /// The affected session.
        session_id: String,
        /// Provider-supplied reason.
        reason: String,
    },

    /// A single outbound message could not be delivered.
    #[error("failed to send message to {recipient}: {reason}")]
    SendFailure {
        /// Normalised recipient address.
        recipient: String,
        /// Engine-supplied reason.
        reason: String,
    },

    /// The engine rejected a logout or destroy command.
    #[error("engine error: {0}")]
    Engine(String),

    /// A best-effort external write failed.
    #[error("persistence failed: {0}")]
    PersistenceFailure(String),

    // Serialization errors
    /// Failed to serialize data.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize data.
    #[error("deserialization failed: {0}")]
    Deserialization(String),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::Deserialization(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_display() {
        let err = ProtocolError::NotFound("acct1".to_string());
        assert_eq!(err.to_string(), "session not found: acct1");
    }

    #[test]
    fn test_not_ready_display() {
        let err = ProtocolError::NotReady("acct1".to_string());
        assert_eq!(err.to_string(), "session not ready: acct1");
    }

    #[test]
    fn test_send_failure_display() {
        let err = ProtocolError::SendFailure {
            recipient: "5551234@c.us".to_string(),
            reason: "rate limited".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "failed to send message to 5551234@c.us: rate limited"
        );
    }

    #[test]
    fn test_engine_start_failure_display() {
        let err = ProtocolError::EngineStartFailure {
            session_id: "acct1".to_string(),
            reason: "browser crashed".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "engine failed to start for acct1: browser crashed"
        );
    }

    #[test]
    fn test_from_serde_json_syntax_error() {
        let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let converted: ProtocolError = err.into();
        assert!(matches!(converted, ProtocolError::Deserialization(_)));
    }
}
