//! # Pairline Daemon Library
//!
//! This crate provides the daemon side of Pairline, a multi-tenant registry of
//! messaging sessions that are paired by scanning a QR code.
//!
//! ## Overview
//!
//! The daemon hosts many independent sessions, each identified by a
//! caller-assigned id and backed by its own messaging engine. It provides:
//!
//! - **Session Lifecycle**: Initialize, pair, send, log out and destroy sessions
//! - **Event Bus**: Non-blocking fan-out of lifecycle events to subscribers
//! - **Pairing Streams**: Live pairing-code delivery with heartbeats
//! - **Engines**: A pluggable engine seam with bridge and simulated backends
//! - **HTTP Adapter**: JSON routes and a server-sent event stream
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Daemon Orchestrator                         │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                 HTTP Adapter (axum)                        │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                   Session Service                          │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────────┐  │
//! │  │  Lifecycle   │  │   Event      │  │   Pairing Streams    │  │
//! │  │  Controller  │──│   Bus        │──│   + Account Ledger   │  │
//! │  └──────────────┘  └──────────────┘  └──────────────────────┘  │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │        Engines (bridge process / simulated)                │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use daemon::{Config, DaemonOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!
//!     let orchestrator = DaemonOrchestrator::new(config)?;
//!     orchestrator.start().await?;
//!
//!     // Serving until a shutdown signal arrives...
//!
//!     orchestrator.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`engine`]: Engine trait and backends
//! - [`session`]: Session records, registry and lifecycle controller
//! - [`events`]: Lifecycle event bus
//! - [`stream`]: Pairing streams
//! - [`accounts`]: Best-effort account bookkeeping
//! - [`pairing`]: QR rendering of pairing codes
//! - [`service`]: Command façade
//! - [`http`]: HTTP routes
//! - [`orchestrator`]: Main daemon coordinator

pub mod accounts;
pub mod config;
pub mod engine;
pub mod events;
pub mod http;
pub mod orchestrator;
pub mod pairing;
pub mod service;
pub mod session;
pub mod stream;

// Re-export protocol for convenience
pub use protocol;

pub use accounts::{AccountEntry, AccountLedger, AccountNotifier};
pub use config::Config;
pub use engine::{Engine, EngineError, EngineEvent, EngineEvents, EngineFactory};
pub use events::{EventBus, SubscribeOptions, Subscription};
pub use http::{build_router, AppState};
pub use orchestrator::{DaemonOrchestrator, OrchestratorEvent, OrchestratorState};
pub use service::SessionService;
pub use session::{InitializeOutcome, LifecycleController, SessionStore};
pub use stream::PairingStream;
