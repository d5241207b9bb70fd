//! In-process development engine.
//!
//! Emits a fresh random pairing token every interval until the session is
//! paired, either by [`SimulatedEngine::pair_now`] or after the configured
//! auto-pair delay. Sends succeed only while paired and are acknowledged with
//! a random message id.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{
    Engine, EngineError, EngineEvent, EngineEvents, EngineFactory, EngineFuture, EngineResult,
    MessageReceipt,
};
use crate::config::EngineConfig;

struct Shared {
    session_id: String,
    events: EngineEvents,
    code_interval: Duration,
    auto_pair: Option<Duration>,
    started: AtomicBool,
    paired: AtomicBool,
    pair: Notify,
    cancel: CancellationToken,
}

/// Development engine that fabricates pairing codes.
#[derive(Clone)]
pub struct SimulatedEngine {
    shared: Arc<Shared>,
}

impl SimulatedEngine {
    /// Creates an engine that rotates codes every `code_interval`.
    pub fn new(
        session_id: impl Into<String>,
        events: EngineEvents,
        code_interval: Duration,
        auto_pair: Option<Duration>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                session_id: session_id.into(),
                events,
                code_interval,
                auto_pair,
                started: AtomicBool::new(false),
                paired: AtomicBool::new(false),
                pair: Notify::new(),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Completes pairing as if the current code had been scanned.
    pub fn pair_now(&self) {
        self.shared.pair.notify_one();
    }

    /// Returns whether the engine is paired.
    pub fn is_paired(&self) -> bool {
        self.shared.paired.load(Ordering::SeqCst)
    }

    /// Phone identity reported on pairing, derived from the session id.
    fn phone_identity(session_id: &str) -> String {
        let hash = session_id
            .bytes()
            .fold(0u64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u64));
        format!("1555{:07}", hash % 10_000_000)
    }

    async fn run(shared: Arc<Shared>) {
        let deadline = shared.auto_pair.map(|d| Instant::now() + d);
        let auto_pair = async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(auto_pair);

        loop {
            let token = format!("2@{}", Uuid::new_v4().simple());
            if !shared.events.emit(EngineEvent::PairingCode(token)).await {
                return;
            }

            tokio::select! {
                _ = shared.cancel.cancelled() => return,
                _ = shared.pair.notified() => break,
                _ = &mut auto_pair => break,
                _ = tokio::time::sleep(shared.code_interval) => {}
            }
        }

        shared.paired.store(true, Ordering::SeqCst);
        tracing::info!(session_id = %shared.session_id, "Simulated engine paired");

        if !shared.events.emit(EngineEvent::Authenticated).await {
            return;
        }
        let phone = Self::phone_identity(&shared.session_id);
        shared
            .events
            .emit(EngineEvent::Ready { phone: Some(phone) })
            .await;
    }
}

impl Engine for SimulatedEngine {
    fn initialize(&self) -> EngineFuture<'_, ()> {
        Box::pin(async move {
            if self.shared.started.swap(true, Ordering::SeqCst) {
                return Err(EngineError::Start("engine already started".to_string()));
            }
            if self.shared.cancel.is_cancelled() {
                return Err(EngineError::Closed);
            }
            tokio::spawn(Self::run(self.shared.clone()));
            Ok(())
        })
    }

    fn send_message<'a>(
        &'a self,
        recipient: &'a str,
        _body: &'a str,
    ) -> EngineFuture<'a, MessageReceipt> {
        Box::pin(async move {
            if self.shared.cancel.is_cancelled() {
                return Err(EngineError::Closed);
            }
            if !self.is_paired() {
                return Err(EngineError::Send("session is not paired".to_string()));
            }
            Ok(MessageReceipt {
                message_id: format!("true_{}_{}", recipient, Uuid::new_v4().simple()),
            })
        })
    }

    fn logout(&self) -> EngineFuture<'_, ()> {
        Box::pin(async move {
            self.shared.paired.store(false, Ordering::SeqCst);
            self.shared.cancel.cancel();
            Ok(())
        })
    }

    fn destroy(&self) -> EngineFuture<'_, ()> {
        Box::pin(async move {
            self.shared.cancel.cancel();
            Ok(())
        })
    }
}

/// Factory for [`SimulatedEngine`]s.
///
/// Keeps a weak index of the engines it created so that a session can be
/// paired by id.
pub struct SimulatedFactory {
    code_interval: Duration,
    auto_pair: Option<Duration>,
    engines: DashMap<String, Weak<Shared>>,
}

impl SimulatedFactory {
    /// Creates a factory with explicit timings.
    pub fn new(code_interval: Duration, auto_pair: Option<Duration>) -> Self {
        Self {
            code_interval,
            auto_pair,
            engines: DashMap::new(),
        }
    }

    /// Creates a factory from the `[engine]` configuration section.
    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            Duration::from_secs(config.code_interval_secs),
            config.auto_pair_secs.map(Duration::from_secs),
        )
    }

    /// Pairs the most recent engine created for a session.
    ///
    /// Returns false if no live engine exists for the id.
    pub fn pair(&self, session_id: &str) -> bool {
        let shared = self
            .engines
            .get(session_id)
            .and_then(|entry| entry.value().upgrade());
        match shared {
            Some(shared) => {
                shared.pair.notify_one();
                true
            }
            None => false,
        }
    }
}

impl EngineFactory for SimulatedFactory {
    fn create(&self, session_id: &str, events: EngineEvents) -> EngineResult<Arc<dyn Engine>> {
        let engine = SimulatedEngine::new(session_id, events, self.code_interval, self.auto_pair);
        self.engines
            .insert(session_id.to_string(), Arc::downgrade(&engine.shared));
        Ok(Arc::new(engine))
    }
}
