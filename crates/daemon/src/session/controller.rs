//! Session lifecycle controller.
//!
//! The controller is the only writer of session records. It boots engines in
//! detached tasks, consumes each engine's event channel in a dedicated loop,
//! applies the resulting transitions under the record lock and publishes the
//! matching [`SessionEvent`] on the bus.
//!
//! Each engine attached to a record gets a generation number. Outcomes and
//! events from an engine that has since been replaced are discarded.

use std::sync::Arc;
use std::time::Duration;

use protocol::{
    normalize_recipient, BulkError, BulkItem, BulkReport, ProtocolError, SendReceipt,
    SessionEvent, SessionStatus,
};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::record::{now_millis, EngineSlot, SessionRecord};
use super::store::{SessionStore, SharedRecord};
use crate::engine::{Engine, EngineEvent, EngineEvents, EngineFactory};
use crate::events::EventBus;
use crate::pairing;

/// Result of an initialize command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitializeOutcome {
    /// A fresh engine is booting in the background.
    Started,
    /// A previous start is still in flight; nothing was done.
    Initializing,
    /// The session is already running; nothing was done.
    AlreadyInitialized(SessionStatus),
}

/// Drives session engines and owns every record mutation.
pub struct LifecycleController {
    store: Arc<SessionStore>,
    bus: EventBus,
    factory: Arc<dyn EngineFactory>,
    send_delay: Duration,
}

impl LifecycleController {
    /// Creates a controller.
    ///
    /// `send_delay` is the minimum spacing between engine sends of one bulk batch.
    pub fn new(
        store: Arc<SessionStore>,
        bus: EventBus,
        factory: Arc<dyn EngineFactory>,
        send_delay: Duration,
    ) -> Self {
        Self {
            store,
            bus,
            factory,
            send_delay,
        }
    }

    /// Registers the session if needed and boots its engine.
    ///
    /// Returns immediately; the engine start runs detached and its outcome is
    /// only visible through the record's state and bus events.
    pub async fn initialize(&self, id: &str) -> Result<InitializeOutcome, ProtocolError> {
        if id.trim().is_empty() {
            return Err(ProtocolError::InvalidInput(
                "session id must not be empty".to_string(),
            ));
        }

        let (record, mut rec) = loop {
            let (record, _) = self.store.create(id)?;
            let rec = Arc::clone(&record).lock_owned().await;
            if !rec.is_destroyed() {
                break (record, rec);
            }
            // Destroy removes the record under this lock, so the next lookup
            // registers a fresh one.
            tracing::debug!(session_id = %id, "Record destroyed while waiting, registering again");
        };

        if rec.is_starting() {
            tracing::debug!(session_id = %id, "Initialize ignored, start already in flight");
            return Ok(InitializeOutcome::Initializing);
        }
        if !rec.needs_start() {
            tracing::debug!(session_id = %id, state = %rec.state(), "Session already initialized");
            return Ok(InitializeOutcome::AlreadyInitialized(rec.status()));
        }

        let (events, rx) = EngineEvents::channel(id);
        let engine = match self.factory.create(id, events) {
            Ok(engine) => engine,
            Err(e) => {
                tracing::error!(session_id = %id, error = %e, "Failed to create engine");
                rec.fail_start();
                if let Some(previous) = rec.take_engine() {
                    previous.release(id);
                }
                return Err(ProtocolError::EngineStartFailure {
                    session_id: id.to_string(),
                    reason: e.to_string(),
                });
            }
        };

        let cancel = CancellationToken::new();
        let resumed = rec.state() != protocol::LifecycleState::Created;
        let previous = rec.begin_start(EngineSlot {
            engine: Arc::clone(&engine),
            cancel: cancel.clone(),
        });
        let generation = rec.generation();
        drop(rec);

        if let Some(previous) = previous {
            previous.release(id);
        }

        tracing::info!(session_id = %id, generation, resumed, "Starting engine");

        tokio::spawn(Self::event_loop(
            id.to_string(),
            Arc::clone(&record),
            self.bus.clone(),
            rx,
            generation,
            cancel,
        ));
        tokio::spawn(Self::start_engine(
            id.to_string(),
            record,
            engine,
            generation,
        ));

        Ok(InitializeOutcome::Started)
    }

    /// Runs the engine start sequence and records its outcome.
    async fn start_engine(
        id: String,
        record: SharedRecord,
        engine: Arc<dyn Engine>,
        generation: u64,
    ) {
        let result = engine.initialize().await;

        let mut released = None;
        let applied = {
            let mut rec = record.lock().await;
            rec.finish_start(generation, result.is_ok(), &mut released)
        };

        match (&result, applied) {
            (Ok(()), true) => tracing::info!(session_id = %id, "Engine initialized"),
            (Err(e), true) => {
                tracing::error!(session_id = %id, error = %e, "Engine failed to start")
            }
            (_, false) => {
                tracing::debug!(session_id = %id, generation, "Discarding outcome of replaced engine")
            }
        }

        if let Some(slot) = released {
            slot.release(&id);
        }
    }

    /// Consumes one engine's events until it is replaced or closes.
    async fn event_loop(
        id: String,
        record: SharedRecord,
        bus: EventBus,
        mut rx: mpsc::Receiver<EngineEvent>,
        generation: u64,
        cancel: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            let rendered = match &event {
                EngineEvent::PairingCode(token) => match pairing::render_data_url(token) {
                    Ok(code) => Some(code),
                    Err(e) => {
                        tracing::error!(session_id = %id, error = %e, "Failed to render pairing code");
                        continue;
                    }
                },
                _ => None,
            };

            let mut rec = record.lock().await;
            // Detaching an engine cancels its loop under this lock.
            if rec.generation() != generation || cancel.is_cancelled() {
                break;
            }
            if let Some(published) = Self::apply_event(&mut rec, event, rendered) {
                // Published under the lock so a stream that subscribed before
                // reading the record cannot miss a transition.
                bus.publish(published);
            }
        }
        tracing::debug!(session_id = %id, generation, "Engine event loop finished");
    }

    /// Applies one engine event to a record, returning the bus event to publish.
    fn apply_event(
        rec: &mut SessionRecord,
        event: EngineEvent,
        rendered: Option<String>,
    ) -> Option<SessionEvent> {
        let session_id = rec.id().to_string();
        match event {
            EngineEvent::PairingCode(_) => {
                let code = rendered?;
                rec.apply_code(code.clone(), now_millis());
                tracing::info!(session_id = %session_id, "Pairing code issued");
                Some(SessionEvent::Code { session_id, code })
            }
            EngineEvent::Authenticated => {
                tracing::info!(session_id = %session_id, "Engine authenticated");
                None
            }
            EngineEvent::Ready { phone } => {
                let ready_at = now_millis();
                rec.apply_ready(phone.clone(), ready_at);
                tracing::info!(session_id = %session_id, phone = ?phone, "Session ready");
                Some(SessionEvent::Ready {
                    session_id,
                    phone_identity: phone,
                    ready_at,
                })
            }
            EngineEvent::AuthFailure(reason) => {
                rec.apply_auth_failure();
                tracing::warn!(session_id = %session_id, reason = %reason, "Authentication failed");
                Some(SessionEvent::AuthFailure { session_id, reason })
            }
            EngineEvent::Disconnected(reason) => {
                rec.apply_disconnected();
                tracing::warn!(session_id = %session_id, reason = %reason, "Engine disconnected");
                Some(SessionEvent::Disconnected { session_id, reason })
            }
        }
    }

    /// Sends one message through a ready session.
    ///
    /// # Errors
    /// - `InvalidInput` for an empty or unusable recipient, or an empty body
    /// - `NotFound` / `NotReady` before any engine call is made
    /// - `SendFailure` when the engine rejects the message
    pub async fn send_message(
        &self,
        id: &str,
        recipient: &str,
        body: &str,
    ) -> Result<SendReceipt, ProtocolError> {
        if recipient.trim().is_empty() || body.is_empty() {
            return Err(ProtocolError::InvalidInput(
                "recipient and message are required".to_string(),
            ));
        }

        let engine = self.ready_engine(id).await?;
        let to = normalize_recipient(recipient).ok_or_else(|| {
            ProtocolError::InvalidInput(format!("invalid recipient: {}", recipient))
        })?;

        let receipt = engine.send_message(&to, body).await.map_err(|e| {
            tracing::warn!(session_id = %id, to = %to, error = %e, "Send failed");
            ProtocolError::SendFailure {
                recipient: to.clone(),
                reason: e.to_string(),
            }
        })?;

        tracing::info!(session_id = %id, to = %to, message_id = %receipt.message_id, "Message sent");
        Ok(SendReceipt {
            message_id: receipt.message_id,
            to,
            session_id: id.to_string(),
        })
    }

    /// Sends a batch one item at a time, spacing engine sends by the send delay.
    ///
    /// Per-item failures are collected in request order and never abort the
    /// batch. The session must exist and be ready when the batch starts.
    pub async fn send_bulk(
        &self,
        id: &str,
        items: &[BulkItem],
    ) -> Result<BulkReport, ProtocolError> {
        self.ready_engine(id).await?;

        let mut report = BulkReport::default();
        let mut last_send: Option<Instant> = None;

        for (index, item) in items.iter().enumerate() {
            if item.recipient.trim().is_empty() || item.body.is_empty() {
                report.errors.push(BulkError {
                    index,
                    recipient: item.recipient.clone(),
                    error: "recipient or message missing".to_string(),
                });
                continue;
            }

            if let Some(last) = last_send {
                tokio::time::sleep_until(last + self.send_delay).await;
            }
            last_send = Some(Instant::now());

            match self.send_message(id, &item.recipient, &item.body).await {
                Ok(receipt) => report.sent.push(receipt),
                Err(e) => report.errors.push(BulkError {
                    index,
                    recipient: item.recipient.clone(),
                    error: e.to_string(),
                }),
            }
        }

        tracing::info!(
            session_id = %id,
            sent = report.sent.len(),
            failed = report.errors.len(),
            "Bulk send finished"
        );
        Ok(report)
    }

    async fn ready_engine(&self, id: &str) -> Result<Arc<dyn Engine>, ProtocolError> {
        let record = self.store.require(id)?;
        let rec = record.lock().await;
        if !rec.is_ready() {
            return Err(ProtocolError::NotReady(id.to_string()));
        }
        rec.engine()
            .ok_or_else(|| ProtocolError::NotReady(id.to_string()))
    }

    /// Logs the session out and detaches its engine.
    ///
    /// The record stays registered in `LoggedOut` and can be initialized again.
    pub async fn logout(&self, id: &str) -> Result<(), ProtocolError> {
        let record = self.store.require(id)?;
        let (engine, generation) = {
            let rec = record.lock().await;
            if rec.is_destroyed() {
                return Err(ProtocolError::NotFound(id.to_string()));
            }
            (rec.engine(), rec.generation())
        };

        if let Some(engine) = engine {
            engine.logout().await.map_err(|e| {
                tracing::warn!(session_id = %id, error = %e, "Logout failed");
                ProtocolError::Engine(e.to_string())
            })?;
        }

        let mut rec = record.lock().await;
        if rec.generation() == generation {
            if let Some(slot) = rec.take_engine() {
                slot.release(id);
            }
            rec.apply_logged_out();
        }
        tracing::info!(session_id = %id, "Session logged out");
        Ok(())
    }

    /// Destroys the engine and removes the record.
    ///
    /// Subscriptions tied to the session are closed. An engine that fails to
    /// shut down cleanly is logged; the record is removed regardless.
    pub async fn destroy(&self, id: &str) -> Result<(), ProtocolError> {
        let record = self.store.require(id)?;
        let slot = {
            let mut rec = record.lock().await;
            if rec.is_destroyed() {
                return Err(ProtocolError::NotFound(id.to_string()));
            }
            let slot = rec.mark_destroyed();
            if let Some(slot) = &slot {
                slot.cancel.cancel();
            }
            // Unregistered under the lock: an initialize waiting on it finds
            // the tombstone and registers a fresh record.
            if let Err(e) = self.store.remove(id) {
                tracing::debug!(session_id = %id, error = %e, "Record already unregistered");
            }
            self.bus.unsubscribe_session(id);
            slot
        };

        if let Some(slot) = slot {
            if let Err(e) = slot.engine.destroy().await {
                tracing::warn!(session_id = %id, error = %e, "Engine destroy failed");
            }
        }

        tracing::info!(session_id = %id, "Session destroyed");
        Ok(())
    }

    /// Logs out ready sessions and releases every engine.
    ///
    /// Records stay registered. Failures are logged per session. Returns the
    /// number of sessions that were logged out.
    pub async fn shutdown(&self) -> usize {
        let mut logged_out = 0;
        for (id, record) in self.store.records() {
            let (engine, ready) = {
                let rec = record.lock().await;
                (rec.engine(), rec.is_ready())
            };
            let Some(engine) = engine else { continue };

            if ready {
                match engine.logout().await {
                    Ok(()) => logged_out += 1,
                    Err(e) => {
                        tracing::warn!(session_id = %id, error = %e, "Logout on shutdown failed")
                    }
                }
            }

            let slot = record.lock().await.take_engine();
            if let Some(slot) = slot {
                slot.cancel.cancel();
                if let Err(e) = slot.engine.destroy().await {
                    tracing::warn!(session_id = %id, error = %e, "Engine destroy on shutdown failed");
                }
            }
        }
        tracing::info!(logged_out, "Sessions shut down");
        logged_out
    }
}
