//! Session registry and lifecycle.
//!
//! This module holds one record per tenant session, keyed by a
//! caller-assigned id, and the controller that drives each session's engine
//! through initialize, pairing, readiness, logout and destroy.

pub mod controller;
pub mod record;
pub mod store;

pub use controller::{InitializeOutcome, LifecycleController};
pub use record::{now_millis, EngineSlot, SessionRecord};
pub use store::{SessionStore, SharedRecord};
