//! Daemon orchestrator for wiring together all components.
//!
//! This module provides the `DaemonOrchestrator` that builds the session
//! service from configuration, serves the HTTP adapter and drives a graceful
//! shutdown that releases every engine.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use protocol::SessionEvent;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::accounts::{AccountLedger, AccountNotifier};
use crate::config::Config;
use crate::engine::{factory_from_config, EngineFactory};
use crate::http::{build_router, serve, AppState};
use crate::service::SessionService;

/// How long `stop` waits for in-flight HTTP requests to drain.
const SERVER_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Daemon orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Initial state, not started.
    Stopped,
    /// Starting up, binding the listener.
    Starting,
    /// Running and accepting requests.
    Running,
    /// Shutting down gracefully.
    ShuttingDown,
}

/// Events emitted by the orchestrator.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    /// Orchestrator state changed.
    StateChanged(OrchestratorState),
    /// A session lifecycle event was published.
    Session(SessionEvent),
    /// Error occurred.
    Error { message: String },
}

/// Daemon orchestrator that manages all subsystems.
pub struct DaemonOrchestrator {
    /// Configuration.
    config: Config,
    /// Current state.
    state: Arc<RwLock<OrchestratorState>>,
    /// Session registry façade.
    service: Arc<SessionService>,
    /// Account bookkeeping backing the pairing streams.
    ledger: Arc<AccountLedger>,
    /// Cancellation token for graceful shutdown.
    shutdown_token: CancellationToken,
    /// HTTP server task.
    server_task: Mutex<Option<JoinHandle<Result<()>>>>,
    /// Address the HTTP listener is bound to, once running.
    local_addr: RwLock<Option<SocketAddr>>,
    /// Event sender.
    event_tx: broadcast::Sender<OrchestratorEvent>,
}

impl DaemonOrchestrator {
    /// Creates a new daemon orchestrator using the configured engine.
    pub fn new(config: Config) -> Result<Self> {
        let factory = factory_from_config(&config.engine);
        Self::with_factory(config, factory)
    }

    /// Creates a new daemon orchestrator with an explicit engine factory.
    pub fn with_factory(config: Config, factory: Arc<dyn EngineFactory>) -> Result<Self> {
        let ledger = Arc::new(
            AccountLedger::open(config.ledger_path()).context("Failed to load account ledger")?,
        );

        let notifier: Arc<dyn AccountNotifier> = ledger.clone();
        let service = Arc::new(SessionService::new(
            &config.session,
            factory,
            Some(notifier),
        ));

        info!(
            "Session registry ready (engine: {:?}, max sessions: {})",
            config.engine.kind, config.session.max_sessions
        );

        let (event_tx, _) = broadcast::channel(256);

        Ok(Self {
            config,
            state: Arc::new(RwLock::new(OrchestratorState::Stopped)),
            service,
            ledger,
            shutdown_token: CancellationToken::new(),
            server_task: Mutex::new(None),
            local_addr: RwLock::new(None),
            event_tx,
        })
    }

    /// Returns the current state.
    pub async fn state(&self) -> OrchestratorState {
        *self.state.read().await
    }

    /// Returns a receiver for orchestrator events.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.event_tx.subscribe()
    }

    /// Starts the daemon orchestrator.
    pub async fn start(&self) -> Result<()> {
        // Check current state
        {
            let mut state = self.state.write().await;
            if *state != OrchestratorState::Stopped {
                anyhow::bail!("Orchestrator is already running");
            }
            if self.shutdown_token.is_cancelled() {
                anyhow::bail!("Orchestrator cannot be restarted after shutdown");
            }
            *state = OrchestratorState::Starting;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Starting));

        info!("Starting daemon orchestrator...");

        let addr = format!("{}:{}", self.config.http.bind, self.config.http.port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(e) => {
                *self.state.write().await = OrchestratorState::Stopped;
                self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Stopped));
                return Err(e)
                    .with_context(|| format!("Failed to bind HTTP listener on {}", addr));
            }
        };
        let local_addr = listener
            .local_addr()
            .context("Failed to read listener address")?;
        *self.local_addr.write().await = Some(local_addr);

        self.spawn_event_forwarder();

        let router = build_router(AppState::new(
            Arc::clone(&self.service),
            self.shutdown_token.clone(),
        ));
        let shutdown_token = self.shutdown_token.clone();
        let event_tx = self.event_tx.clone();
        let handle = tokio::spawn(async move {
            let result = serve(listener, router, shutdown_token).await;
            if let Err(ref e) = result {
                let _ = event_tx.send(OrchestratorEvent::Error {
                    message: format!("{:#}", e),
                });
            }
            result
        });
        *self.server_task.lock().await = Some(handle);

        // Update state to running
        {
            let mut state = self.state.write().await;
            *state = OrchestratorState::Running;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Running));

        info!("Daemon orchestrator started on {}", local_addr);
        Ok(())
    }

    /// Re-emits session lifecycle events as orchestrator events.
    fn spawn_event_forwarder(&self) {
        let mut subscription = self.service.bus().subscribe();
        let shutdown_token = self.shutdown_token.clone();
        let event_tx = self.event_tx.clone();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown_token.cancelled() => break,
                    event = subscription.recv() => event,
                };
                match event {
                    Some(event) => {
                        let _ = event_tx.send(OrchestratorEvent::Session(event));
                    }
                    None => break,
                }
            }
            debug!("Session event forwarder stopped");
        });
    }

    /// Stops the daemon orchestrator gracefully.
    ///
    /// Returns the number of ready sessions that were logged out.
    pub async fn stop(&self) -> Result<usize> {
        // Check current state
        {
            let mut state = self.state.write().await;
            if *state == OrchestratorState::Stopped {
                return Ok(0);
            }
            if *state == OrchestratorState::ShuttingDown {
                anyhow::bail!("Orchestrator is already shutting down");
            }
            *state = OrchestratorState::ShuttingDown;
        }
        self.emit_event(OrchestratorEvent::StateChanged(
            OrchestratorState::ShuttingDown,
        ));

        info!("Stopping daemon orchestrator...");

        // Signal shutdown to all tasks
        self.shutdown_token.cancel();

        if let Some(handle) = self.server_task.lock().await.take() {
            match tokio::time::timeout(SERVER_DRAIN_TIMEOUT, handle).await {
                Ok(Ok(Ok(()))) => debug!("HTTP server drained"),
                Ok(Ok(Err(e))) => warn!("HTTP server exited with error: {:#}", e),
                Ok(Err(e)) => warn!("HTTP server task panicked: {}", e),
                Err(_) => warn!("HTTP server did not drain within {:?}", SERVER_DRAIN_TIMEOUT),
            }
        }

        let logged_out = self.service.shutdown().await;
        info!("Logged out {} sessions", logged_out);

        // Update state
        {
            let mut state = self.state.write().await;
            *state = OrchestratorState::Stopped;
        }
        *self.local_addr.write().await = None;
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Stopped));

        info!("Daemon orchestrator stopped");
        Ok(logged_out)
    }

    /// Emits an orchestrator event.
    fn emit_event(&self, event: OrchestratorEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Returns the session service.
    pub fn service(&self) -> &Arc<SessionService> {
        &self.service
    }

    /// Returns the account ledger.
    pub fn ledger(&self) -> &Arc<AccountLedger> {
        &self.ledger
    }

    /// Returns the address the HTTP listener is bound to.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read().await
    }

    /// Returns the shutdown token for external tasks to observe shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }
}
