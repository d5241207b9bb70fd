//! # Pairline Protocol Library
//!
//! This crate provides the wire types shared by the Pairline daemon and its
//! consumers.
//!
//! ## Overview
//!
//! - **Session Events**: typed lifecycle events carried on the daemon's event bus
//! - **Stream Frames**: the text event stream format used for live pairing updates
//! - **Status Snapshots**: what a status query reports about a session
//! - **Send Results**: receipts and bulk send reports
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::StreamFrame;
//!
//! let frame = StreamFrame::connected("acct1");
//! let json = serde_json::to_string(&frame).unwrap();
//! assert!(json.contains(r#""type":"connected""#));
//! ```
//!
//! ## Modules
//!
//! - [`messages`]: Event, frame and status definitions
//! - [`error`]: Error types

pub mod error;
pub mod messages;

pub use error::{ProtocolError, Result};
pub use messages::{
    normalize_recipient, BulkError, BulkItem, BulkReport, EventKind, LifecycleState,
    SendReceipt, SessionEvent, SessionId, SessionStatus, StreamFrame, StreamMessage,
    RECIPIENT_SUFFIX,
};
