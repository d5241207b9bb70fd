//! Per-session record and its state transitions.
//!
//! A [`SessionRecord`] is only ever mutated by the lifecycle controller while
//! holding the record's lock. The transition methods here keep the record's
//! invariants: a pairing code and readiness never coexist, and a phone
//! identity is only present while ready.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use protocol::{LifecycleState, SessionId, SessionStatus};
use tokio_util::sync::CancellationToken;

use crate::engine::Engine;

/// Returns the current Unix timestamp in milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// The engine currently attached to a record.
#[derive(Clone)]
pub struct EngineSlot {
    /// The engine handle.
    pub engine: Arc<dyn Engine>,
    /// Stops the event loop that consumes this engine's events.
    pub cancel: CancellationToken,
}

impl EngineSlot {
    /// Detaches the engine: stops its event loop and destroys it in the background.
    pub fn release(self, session_id: &str) {
        self.cancel.cancel();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = self.engine.destroy().await {
                tracing::warn!(session_id = %session_id, error = %e, "Failed to release engine");
            }
        });
    }
}

/// Mutable state of one tenant session.
pub struct SessionRecord {
    id: SessionId,
    engine: Option<EngineSlot>,
    pairing_code: Option<String>,
    is_initialized: bool,
    is_ready: bool,
    phone_identity: Option<String>,
    last_code_at: Option<u64>,
    ready_at: Option<u64>,
    state: LifecycleState,
    generation: u64,
    starting: bool,
    destroyed: bool,
}

impl SessionRecord {
    /// Creates a record in the `Created` state.
    pub fn new(id: impl Into<SessionId>) -> Self {
        Self {
            id: id.into(),
            engine: None,
            pairing_code: None,
            is_initialized: false,
            is_ready: false,
            phone_identity: None,
            last_code_at: None,
            ready_at: None,
            state: LifecycleState::Created,
            generation: 0,
            starting: false,
            destroyed: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn is_initialized(&self) -> bool {
        self.is_initialized
    }

    pub fn is_ready(&self) -> bool {
        self.is_ready
    }

    pub fn pairing_code(&self) -> Option<&str> {
        self.pairing_code.as_deref()
    }

    pub fn phone_identity(&self) -> Option<&str> {
        self.phone_identity.as_deref()
    }

    /// Returns true while an engine start sequence is in flight.
    pub fn is_starting(&self) -> bool {
        self.starting
    }

    /// Engine generation; bumped every time an engine is attached or detached
    /// by a command.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns true once the record has been removed from the registry.
    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Returns a handle to the attached engine.
    pub fn engine(&self) -> Option<Arc<dyn Engine>> {
        self.engine.as_ref().map(|slot| slot.engine.clone())
    }

    /// Detaches the engine, if any.
    pub fn take_engine(&mut self) -> Option<EngineSlot> {
        self.engine.take()
    }

    /// Returns true if an initialize command should boot a fresh engine.
    ///
    /// Sessions that lost their connection, were logged out or failed to
    /// pair resume in place with a new engine.
    pub fn needs_start(&self) -> bool {
        if self.starting {
            return false;
        }
        !self.is_initialized
            || matches!(
                self.state,
                LifecycleState::Disconnected | LifecycleState::LoggedOut | LifecycleState::AuthFailed
            )
    }

    /// Attaches a fresh engine and enters `Initializing`.
    ///
    /// Returns the previously attached engine, which the caller must release.
    pub fn begin_start(&mut self, slot: EngineSlot) -> Option<EngineSlot> {
        let previous = self.engine.replace(slot);
        self.generation += 1;
        self.starting = true;
        self.is_initialized = false;
        self.is_ready = false;
        self.pairing_code = None;
        self.phone_identity = None;
        self.state = LifecycleState::Initializing;
        previous
    }

    /// Records the outcome of the start sequence for `generation`.
    ///
    /// Returns false if a newer engine has been attached since, in which case
    /// nothing changes. On failure the engine is detached and returned through
    /// `released` for the caller to clean up.
    pub fn finish_start(
        &mut self,
        generation: u64,
        succeeded: bool,
        released: &mut Option<EngineSlot>,
    ) -> bool {
        if generation != self.generation {
            return false;
        }
        self.starting = false;
        if succeeded {
            self.is_initialized = true;
        } else {
            self.is_initialized = false;
            self.is_ready = false;
            self.pairing_code = None;
            self.phone_identity = None;
            self.state = LifecycleState::InitFailed;
            *released = self.engine.take();
        }
        true
    }

    /// Marks the start as failed before any engine could be attached.
    pub fn fail_start(&mut self) {
        self.generation += 1;
        self.starting = false;
        self.is_initialized = false;
        self.is_ready = false;
        self.state = LifecycleState::InitFailed;
    }

    /// A new pairing code superseding any previous one.
    pub fn apply_code(&mut self, code: String, at: u64) {
        self.pairing_code = Some(code);
        self.last_code_at = Some(at);
        self.is_ready = false;
        self.phone_identity = None;
        self.state = LifecycleState::PairedPending;
    }

    /// Pairing completed.
    pub fn apply_ready(&mut self, phone_identity: Option<String>, at: u64) {
        self.is_ready = true;
        self.pairing_code = None;
        self.phone_identity = phone_identity;
        self.ready_at = Some(at);
        self.state = LifecycleState::Ready;
    }

    /// Pairing was rejected.
    pub fn apply_auth_failure(&mut self) {
        self.is_ready = false;
        self.phone_identity = None;
        self.state = LifecycleState::AuthFailed;
    }

    /// The engine lost its connection.
    pub fn apply_disconnected(&mut self) {
        self.is_ready = false;
        self.pairing_code = None;
        self.phone_identity = None;
        self.state = LifecycleState::Disconnected;
    }

    /// The session was logged out.
    ///
    /// Any start still in flight belongs to the detached engine and its
    /// outcome is discarded.
    pub fn apply_logged_out(&mut self) {
        self.generation += 1;
        self.starting = false;
        self.is_ready = false;
        self.pairing_code = None;
        self.phone_identity = None;
        self.state = LifecycleState::LoggedOut;
    }

    /// Tombstones the record and detaches its engine.
    ///
    /// A destroyed record is never started again; callers holding a stale
    /// handle must look the id up afresh.
    pub fn mark_destroyed(&mut self) -> Option<EngineSlot> {
        self.destroyed = true;
        self.generation += 1;
        self.starting = false;
        self.is_initialized = false;
        self.is_ready = false;
        self.pairing_code = None;
        self.phone_identity = None;
        self.engine.take()
    }

    /// Returns a status snapshot.
    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            exists: true,
            state: Some(self.state),
            is_initialized: self.is_initialized,
            is_ready: self.is_ready,
            has_code: self.pairing_code.is_some(),
            phone_identity: self.phone_identity.clone(),
            last_code_at: self.last_code_at,
            ready_at: self.ready_at,
        }
    }
}

impl std::fmt::Debug for SessionRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRecord")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("is_initialized", &self.is_initialized)
            .field("is_ready", &self.is_ready)
            .field("has_code", &self.pairing_code.is_some())
            .field("has_engine", &self.engine.is_some())
            .field("generation", &self.generation)
            .field("destroyed", &self.destroyed)
            .finish()
    }
}
