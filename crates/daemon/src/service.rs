//! Command façade over the session registry.
//!
//! [`SessionService`] is the single entry point used by the HTTP layer and
//! the orchestrator. It owns the record store, the event bus and the
//! lifecycle controller, and hands out pairing streams.

use std::collections::BTreeMap;
use std::sync::Arc;

use protocol::{BulkItem, BulkReport, ProtocolError, SendReceipt, SessionId, SessionStatus};

use crate::accounts::AccountNotifier;
use crate::config::SessionConfig;
use crate::engine::EngineFactory;
use crate::events::EventBus;
use crate::session::{InitializeOutcome, LifecycleController, SessionStore};
use crate::stream::{PairingStream, StreamContext};

/// Multi-tenant session registry.
pub struct SessionService {
    store: Arc<SessionStore>,
    bus: EventBus,
    controller: LifecycleController,
    streams: StreamContext,
}

impl SessionService {
    /// Creates a service with an empty registry.
    pub fn new(
        settings: &SessionConfig,
        factory: Arc<dyn EngineFactory>,
        notifier: Option<Arc<dyn AccountNotifier>>,
    ) -> Self {
        let store = Arc::new(SessionStore::new(settings.max_sessions));
        let bus = EventBus::new();
        let controller = LifecycleController::new(
            Arc::clone(&store),
            bus.clone(),
            factory,
            settings.send_delay(),
        );
        let streams = StreamContext {
            store: Arc::clone(&store),
            bus: bus.clone(),
            notifier,
            heartbeat: settings.heartbeat_interval(),
        };

        Self {
            store,
            bus,
            controller,
            streams,
        }
    }

    /// The bus lifecycle events are published on.
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Registers the session and boots its engine in the background.
    pub async fn initialize(&self, id: &str) -> Result<InitializeOutcome, ProtocolError> {
        self.controller.initialize(id).await
    }

    /// Status snapshot; unknown ids report `exists: false`.
    pub async fn status(&self, id: &str) -> SessionStatus {
        match self.store.get(id) {
            Some(record) => record.lock().await.status(),
            None => SessionStatus::missing(),
        }
    }

    /// Status of every registered session.
    pub async fn all_statuses(&self) -> BTreeMap<SessionId, SessionStatus> {
        let mut statuses = BTreeMap::new();
        for (id, record) in self.store.records() {
            let status = record.lock().await.status();
            statuses.insert(id, status);
        }
        statuses
    }

    /// The cached pairing code, if one is waiting to be scanned.
    pub async fn pairing_code(&self, id: &str) -> Result<Option<String>, ProtocolError> {
        let record = self.store.require(id)?;
        let rec = record.lock().await;
        Ok(rec.pairing_code().map(str::to_string))
    }

    /// Sends one message.
    pub async fn send_message(
        &self,
        id: &str,
        recipient: &str,
        body: &str,
    ) -> Result<SendReceipt, ProtocolError> {
        self.controller.send_message(id, recipient, body).await
    }

    /// Sends a batch sequentially with the configured inter-send delay.
    pub async fn send_bulk(
        &self,
        id: &str,
        items: &[BulkItem],
    ) -> Result<BulkReport, ProtocolError> {
        self.controller.send_bulk(id, items).await
    }

    /// Logs the session out, keeping its record.
    pub async fn logout(&self, id: &str) -> Result<(), ProtocolError> {
        self.controller.logout(id).await
    }

    /// Destroys the engine and removes the session.
    pub async fn destroy(&self, id: &str) -> Result<(), ProtocolError> {
        self.controller.destroy(id).await
    }

    /// Registered session ids, sorted.
    pub fn list_sessions(&self) -> Vec<SessionId> {
        self.store.list()
    }

    pub fn has_session(&self, id: &str) -> bool {
        self.store.contains(id)
    }

    /// Opens a live pairing stream for the session.
    pub async fn open_stream(&self, id: &str) -> Result<PairingStream, ProtocolError> {
        PairingStream::open(&self.streams, id).await
    }

    /// Logs out every ready session and releases all engines.
    pub async fn shutdown(&self) -> usize {
        self.controller.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::SimulatedFactory;
    use std::time::Duration;

    fn service() -> (SessionService, Arc<SimulatedFactory>) {
        let factory = Arc::new(SimulatedFactory::new(Duration::from_secs(20), None));
        let service = SessionService::new(
            &SessionConfig::default(),
            Arc::clone(&factory) as Arc<dyn EngineFactory>,
            None,
        );
        (service, factory)
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let (service, _) = service();
        assert_eq!(service.status("acct1").await, SessionStatus::missing());
        assert!(!service.has_session("acct1"));
        assert!(matches!(
            service.pairing_code("acct1").await,
            Err(ProtocolError::NotFound(_))
        ));
        assert!(matches!(
            service.logout("acct1").await,
            Err(ProtocolError::NotFound(_))
        ));
        assert!(service.open_stream("acct1").await.is_err());
    }

    #[tokio::test]
    async fn test_simulated_pairing_flow() {
        let (service, factory) = service();
        let mut sub = service.bus().subscribe();

        service.initialize("acct1").await.unwrap();
        assert_eq!(service.list_sessions(), vec!["acct1"]);

        assert!(matches!(
            sub.recv().await,
            Some(protocol::SessionEvent::Code { .. })
        ));
        let code = service.pairing_code("acct1").await.unwrap();
        assert!(code.unwrap().starts_with("data:image/png;base64,"));

        assert!(factory.pair("acct1"));
        assert!(matches!(
            sub.recv().await,
            Some(protocol::SessionEvent::Ready { .. })
        ));

        let status = service.status("acct1").await;
        assert!(status.is_ready);
        assert!(!status.has_code);
        assert!(status.phone_identity.is_some());

        let receipt = service.send_message("acct1", "5551234", "hi").await.unwrap();
        assert_eq!(receipt.to, "5551234@c.us");

        let statuses = service.all_statuses().await;
        assert_eq!(statuses.len(), 1);
        assert!(statuses["acct1"].is_ready);

        assert_eq!(service.shutdown().await, 1);
    }

    #[tokio::test]
    async fn test_session_limit() {
        let factory: Arc<dyn EngineFactory> =
            Arc::new(SimulatedFactory::new(Duration::from_secs(20), None));
        let settings = SessionConfig {
            max_sessions: 1,
            ..Default::default()
        };
        let service = SessionService::new(&settings, factory, None);

        service.initialize("acct1").await.unwrap();
        assert!(matches!(
            service.initialize("acct2").await,
            Err(ProtocolError::InvalidInput(_))
        ));
        assert!(service.initialize("acct1").await.is_ok());
    }
}
