//! End-to-end tests for Pairline session flows.
//!
//! These tests drive the service with a scripted engine whose events are
//! injected by the test:
//! - Initialize idempotence and resume after failures
//! - Pairing code caching and readiness
//! - Pairing streams
//! - Single and bulk sends
//! - HTTP routes over the same service

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use daemon::accounts::{AccountLedger, AccountNotifier};
use daemon::config::SessionConfig;
use daemon::engine::{
    Engine, EngineError, EngineEvent, EngineEvents, EngineFactory, EngineFuture, EngineResult,
    MessageReceipt,
};
use daemon::http::{build_router, AppState};
use daemon::pairing::render_data_url;
use daemon::service::SessionService;
use daemon::session::InitializeOutcome;
use futures_util::StreamExt;
use protocol::{
    BulkItem, LifecycleState, ProtocolError, SessionEvent, SessionStatus, StreamFrame,
    StreamMessage,
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

// =============================================================================
// Scripted engine
// =============================================================================

#[derive(Default)]
struct Script {
    created: AtomicUsize,
    started: AtomicUsize,
    logged_out: AtomicUsize,
    destroyed: AtomicUsize,
    fail_start: Mutex<bool>,
    sends: Mutex<Vec<String>>,
    rejected: Mutex<HashSet<String>>,
    events: Mutex<HashMap<String, EngineEvents>>,
}

struct ScriptedEngine {
    script: Arc<Script>,
}

impl Engine for ScriptedEngine {
    fn initialize(&self) -> EngineFuture<'_, ()> {
        Box::pin(async move {
            self.script.started.fetch_add(1, Ordering::SeqCst);
            if *self.script.fail_start.lock().unwrap() {
                return Err(EngineError::Start("browser failed to launch".to_string()));
            }
            Ok(())
        })
    }

    fn send_message<'a>(
        &'a self,
        recipient: &'a str,
        _body: &'a str,
    ) -> EngineFuture<'a, MessageReceipt> {
        Box::pin(async move {
            let mut sends = self.script.sends.lock().unwrap();
            sends.push(recipient.to_string());
            if self.script.rejected.lock().unwrap().contains(recipient) {
                return Err(EngineError::Send("recipient rejected".to_string()));
            }
            Ok(MessageReceipt {
                message_id: format!("msg-{}", sends.len()),
            })
        })
    }

    fn logout(&self) -> EngineFuture<'_, ()> {
        Box::pin(async move {
            self.script.logged_out.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn destroy(&self) -> EngineFuture<'_, ()> {
        Box::pin(async move {
            self.script.destroyed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

struct ScriptedFactory {
    script: Arc<Script>,
}

impl EngineFactory for ScriptedFactory {
    fn create(&self, session_id: &str, events: EngineEvents) -> EngineResult<Arc<dyn Engine>> {
        self.script.created.fetch_add(1, Ordering::SeqCst);
        self.script
            .events
            .lock()
            .unwrap()
            .insert(session_id.to_string(), events);
        Ok(Arc::new(ScriptedEngine {
            script: Arc::clone(&self.script),
        }))
    }
}

struct Harness {
    service: Arc<SessionService>,
    script: Arc<Script>,
}

impl Harness {
    fn new() -> Self {
        Self::with_notifier(None)
    }

    fn with_notifier(notifier: Option<Arc<dyn AccountNotifier>>) -> Self {
        let script = Arc::new(Script::default());
        let factory = Arc::new(ScriptedFactory {
            script: Arc::clone(&script),
        });
        let settings = SessionConfig {
            send_delay_ms: 0,
            ..Default::default()
        };
        let service = Arc::new(SessionService::new(&settings, factory, notifier));
        Self { service, script }
    }

    /// Injects an engine event and waits for the matching bus publication.
    async fn emit(&self, id: &str, event: EngineEvent) -> SessionEvent {
        let mut sub = self.service.bus().subscribe();
        let events = self.script.events.lock().unwrap().get(id).cloned().unwrap();
        assert!(events.emit(event).await);

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let published = sub.recv().await.unwrap();
                if published.session_id() == id {
                    return published;
                }
            }
        })
        .await
        .unwrap()
    }

    /// Injects an event the controller does not publish.
    async fn emit_silent(&self, id: &str, event: EngineEvent) {
        let events = self.script.events.lock().unwrap().get(id).cloned().unwrap();
        assert!(events.emit(event).await);
    }

    async fn wait_until<F>(&self, id: &str, mut check: F)
    where
        F: FnMut(&SessionStatus) -> bool,
    {
        for _ in 0..500 {
            if check(&self.service.status(id).await) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("status of {} never matched", id);
    }

    async fn wait_initialized(&self, id: &str) {
        self.wait_until(id, |status| status.is_initialized).await;
    }

    /// Initializes a session and drives it to ready.
    async fn ready(&self, id: &str, phone: &str) {
        self.service.initialize(id).await.unwrap();
        self.wait_initialized(id).await;
        self.emit(id, EngineEvent::PairingCode(format!("{}-code", id)))
            .await;
        self.emit(
            id,
            EngineEvent::Ready {
                phone: Some(phone.to_string()),
            },
        )
        .await;
    }

    fn sends(&self) -> Vec<String> {
        self.script.sends.lock().unwrap().clone()
    }
}

async fn collect(stream: daemon::stream::PairingStream) -> Vec<StreamMessage> {
    tokio::time::timeout(Duration::from_secs(5), stream.collect::<Vec<_>>())
        .await
        .unwrap()
}

// =============================================================================
// Initialize Tests
// =============================================================================

#[tokio::test]
async fn test_initialize_twice_starts_engine_once() {
    let h = Harness::new();

    assert_eq!(
        h.service.initialize("acct1").await.unwrap(),
        InitializeOutcome::Started
    );
    let second = h.service.initialize("acct1").await.unwrap();
    assert!(matches!(
        second,
        InitializeOutcome::Initializing | InitializeOutcome::AlreadyInitialized(_)
    ));

    h.wait_initialized("acct1").await;
    assert!(matches!(
        h.service.initialize("acct1").await.unwrap(),
        InitializeOutcome::AlreadyInitialized(_)
    ));

    assert_eq!(h.script.created.load(Ordering::SeqCst), 1);
    assert_eq!(h.script.started.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_concurrent_initialize_starts_engine_once() {
    let h = Harness::new();

    let mut handles = Vec::new();
    for _ in 0..16 {
        let service = Arc::clone(&h.service);
        handles.push(tokio::spawn(async move {
            service.initialize("acct1").await.unwrap()
        }));
    }

    let mut started = 0;
    for handle in handles {
        if handle.await.unwrap() == InitializeOutcome::Started {
            started += 1;
        }
    }
    assert_eq!(started, 1);
    assert_eq!(h.script.created.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_engine_start_failure_leaves_init_failed_and_is_retryable() {
    let h = Harness::new();
    *h.script.fail_start.lock().unwrap() = true;

    h.service.initialize("acct1").await.unwrap();
    h.wait_until("acct1", |s| s.state == Some(LifecycleState::InitFailed))
        .await;

    let status = h.service.status("acct1").await;
    assert!(status.exists);
    assert!(!status.is_initialized);

    // The failed engine is released in the background.
    for _ in 0..500 {
        if h.script.destroyed.load(Ordering::SeqCst) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    assert_eq!(h.script.destroyed.load(Ordering::SeqCst), 1);

    *h.script.fail_start.lock().unwrap() = false;
    assert_eq!(
        h.service.initialize("acct1").await.unwrap(),
        InitializeOutcome::Started
    );
    h.wait_initialized("acct1").await;
    assert_eq!(h.script.created.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_reinitialize_after_disconnect_resumes_in_place() {
    let h = Harness::new();
    h.ready("acct1", "5551234").await;

    let event = h
        .emit("acct1", EngineEvent::Disconnected("NAVIGATION".to_string()))
        .await;
    assert!(matches!(event, SessionEvent::Disconnected { .. }));

    let status = h.service.status("acct1").await;
    assert_eq!(status.state, Some(LifecycleState::Disconnected));
    assert!(!status.is_ready);
    assert!(!status.has_code);

    assert_eq!(
        h.service.initialize("acct1").await.unwrap(),
        InitializeOutcome::Started
    );
    h.wait_initialized("acct1").await;
    assert_eq!(h.service.list_sessions(), vec!["acct1"]);
    assert_eq!(h.script.created.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_auth_failure_clears_readiness() {
    let h = Harness::new();
    h.service.initialize("acct1").await.unwrap();
    h.wait_initialized("acct1").await;
    h.emit("acct1", EngineEvent::PairingCode("XYZ".to_string()))
        .await;

    let event = h
        .emit("acct1", EngineEvent::AuthFailure("bad scan".to_string()))
        .await;
    assert_eq!(
        event,
        SessionEvent::AuthFailure {
            session_id: "acct1".to_string(),
            reason: "bad scan".to_string(),
        }
    );

    let status = h.service.status("acct1").await;
    assert_eq!(status.state, Some(LifecycleState::AuthFailed));
    assert!(!status.is_ready);
    assert!(status.phone_identity.is_none());
}

// =============================================================================
// Pairing Code Tests
// =============================================================================

#[tokio::test]
async fn test_acct1_scenario() {
    let h = Harness::new();

    assert_eq!(
        h.service.status("acct1").await,
        SessionStatus {
            exists: false,
            ..Default::default()
        }
    );

    h.service.initialize("acct1").await.unwrap();
    h.emit("acct1", EngineEvent::PairingCode("XYZ".to_string()))
        .await;
    assert_eq!(
        h.service.pairing_code("acct1").await.unwrap(),
        Some(render_data_url("XYZ").unwrap())
    );

    h.emit(
        "acct1",
        EngineEvent::Ready {
            phone: Some("5551234".to_string()),
        },
    )
    .await;
    assert_eq!(h.service.pairing_code("acct1").await.unwrap(), None);

    let status = h.service.status("acct1").await;
    assert!(status.is_ready);
    assert!(!status.has_code);
    assert_eq!(status.phone_identity.as_deref(), Some("5551234"));
    assert!(status.ready_at.is_some());
}

#[tokio::test]
async fn test_latest_code_supersedes_previous() {
    let h = Harness::new();
    h.service.initialize("acct1").await.unwrap();

    for token in ["first", "second", "third"] {
        h.emit("acct1", EngineEvent::PairingCode(token.to_string()))
            .await;
        assert_eq!(
            h.service.pairing_code("acct1").await.unwrap(),
            Some(render_data_url(token).unwrap())
        );
    }

    let status = h.service.status("acct1").await;
    assert_eq!(status.state, Some(LifecycleState::PairedPending));
    assert!(status.last_code_at.is_some());
}

#[tokio::test]
async fn test_authenticated_alone_does_not_make_ready() {
    let h = Harness::new();
    h.service.initialize("acct1").await.unwrap();
    h.wait_initialized("acct1").await;
    h.emit("acct1", EngineEvent::PairingCode("XYZ".to_string()))
        .await;

    h.emit_silent("acct1", EngineEvent::Authenticated).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let status = h.service.status("acct1").await;
    assert!(!status.is_ready);
    assert!(status.has_code);
}

#[tokio::test]
async fn test_sessions_are_independent() {
    let h = Harness::new();
    h.ready("acct1", "5551111").await;
    h.service.initialize("acct2").await.unwrap();
    h.emit("acct2", EngineEvent::PairingCode("other".to_string()))
        .await;

    assert!(h.service.status("acct1").await.is_ready);
    assert!(!h.service.status("acct2").await.is_ready);
    assert_eq!(h.service.pairing_code("acct1").await.unwrap(), None);
    assert!(h.service.pairing_code("acct2").await.unwrap().is_some());

    let statuses = h.service.all_statuses().await;
    assert_eq!(statuses.keys().collect::<Vec<_>>(), vec!["acct1", "acct2"]);
}

// =============================================================================
// Pairing Stream Tests
// =============================================================================

#[tokio::test]
async fn test_stream_unknown_session_rejected() {
    let h = Harness::new();
    assert!(matches!(
        h.service.open_stream("ghost").await,
        Err(ProtocolError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_stream_sends_cached_code_first() {
    let h = Harness::new();
    h.service.initialize("acct1").await.unwrap();
    h.emit("acct1", EngineEvent::PairingCode("XYZ".to_string()))
        .await;

    let mut stream = h.service.open_stream("acct1").await.unwrap();
    assert!(matches!(
        stream.next().await,
        Some(StreamMessage::Frame(StreamFrame::Connected { .. }))
    ));
    match stream.next().await {
        Some(StreamMessage::Frame(StreamFrame::Code { qr_code, .. })) => {
            assert_eq!(qr_code, render_data_url("XYZ").unwrap());
        }
        other => panic!("expected cached code, got {:?}", other),
    }
}

#[tokio::test]
async fn test_stream_of_ready_session_ends_after_ready_frame() {
    let h = Harness::new();
    h.ready("acct1", "5551234").await;

    let frames = collect(h.service.open_stream("acct1").await.unwrap()).await;
    assert_eq!(frames.len(), 2);
    assert!(matches!(
        frames[0],
        StreamMessage::Frame(StreamFrame::Connected { .. })
    ));
    match &frames[1] {
        StreamMessage::Frame(StreamFrame::Ready { phone_identity, .. }) => {
            assert_eq!(phone_identity.as_deref(), Some("5551234"));
        }
        other => panic!("expected ready frame, got {:?}", other),
    }
}

#[tokio::test]
async fn test_stream_forwards_new_codes_then_ends_on_ready() {
    let h = Harness::new();
    h.service.initialize("acct1").await.unwrap();
    let stream = h.service.open_stream("acct1").await.unwrap();

    h.emit("acct1", EngineEvent::PairingCode("one".to_string()))
        .await;
    h.emit("acct1", EngineEvent::PairingCode("two".to_string()))
        .await;
    h.emit(
        "acct1",
        EngineEvent::Ready {
            phone: Some("5551234".to_string()),
        },
    )
    .await;

    let frames = collect(stream).await;
    let kinds: Vec<&str> = frames
        .iter()
        .filter_map(|message| message.frame())
        .map(|frame| match frame {
            StreamFrame::Connected { .. } => "connected",
            StreamFrame::Code { .. } => "code",
            StreamFrame::Ready { .. } => "ready",
        })
        .collect();
    assert_eq!(kinds, vec!["connected", "code", "code", "ready"]);
    assert!(frames.last().and_then(|m| m.frame()).unwrap().is_terminal());
}

#[tokio::test]
async fn test_stream_ignores_other_sessions() {
    let h = Harness::new();
    h.service.initialize("acct1").await.unwrap();
    h.service.initialize("acct2").await.unwrap();
    let stream = h.service.open_stream("acct1").await.unwrap();

    h.emit("acct2", EngineEvent::PairingCode("theirs".to_string()))
        .await;
    h.emit(
        "acct2",
        EngineEvent::Ready {
            phone: Some("5550000".to_string()),
        },
    )
    .await;
    h.emit(
        "acct1",
        EngineEvent::Ready {
            phone: Some("5551234".to_string()),
        },
    )
    .await;

    let frames = collect(stream).await;
    assert_eq!(frames.len(), 2);
    match &frames[1] {
        StreamMessage::Frame(StreamFrame::Ready { phone_identity, .. }) => {
            assert_eq!(phone_identity.as_deref(), Some("5551234"));
        }
        other => panic!("expected ready frame, got {:?}", other),
    }
}

#[tokio::test]
async fn test_dropping_stream_unsubscribes() {
    let h = Harness::new();
    h.service.initialize("acct1").await.unwrap();
    let baseline = h.service.bus().subscriber_count();

    let mut stream = h.service.open_stream("acct1").await.unwrap();
    stream.next().await;
    assert_eq!(h.service.bus().subscriber_count(), baseline + 1);

    drop(stream);
    assert_eq!(h.service.bus().subscriber_count(), baseline);

    // Publishing afterwards reaches no stale subscriber.
    h.emit("acct1", EngineEvent::PairingCode("late".to_string()))
        .await;
    assert_eq!(h.service.bus().subscriber_count(), baseline);
}

#[tokio::test]
async fn test_stream_receives_ready_while_other_sessions_rotate_codes() {
    let h = Harness::new();
    h.service.initialize("acct1").await.unwrap();
    h.wait_initialized("acct1").await;
    let stream = h.service.open_stream("acct1").await.unwrap();

    // Nobody polls the stream while the other tenants are busy.
    for i in 0..500 {
        h.service.bus().publish(SessionEvent::Code {
            session_id: format!("tenant{}", i),
            code: format!("code{}", i),
        });
    }
    h.emit(
        "acct1",
        EngineEvent::Ready {
            phone: Some("5551234".to_string()),
        },
    )
    .await;

    let frames = collect(stream).await;
    assert_eq!(frames.len(), 2);
    assert!(frames[1].frame().unwrap().is_terminal());
}

#[tokio::test]
async fn test_destroy_ends_open_stream() {
    let h = Harness::new();
    h.service.initialize("acct1").await.unwrap();
    let stream = h.service.open_stream("acct1").await.unwrap();

    h.service.destroy("acct1").await.unwrap();

    let frames = collect(stream).await;
    assert_eq!(frames.len(), 1);
    assert!(!h.service.has_session("acct1"));
}

#[tokio::test]
async fn test_stream_persists_progress_to_ledger() {
    let temp_dir = TempDir::new().unwrap();
    let ledger = Arc::new(AccountLedger::new(temp_dir.path().join("accounts.json")));
    let h = Harness::with_notifier(Some(ledger.clone() as Arc<dyn AccountNotifier>));

    h.service.initialize("acct1").await.unwrap();
    let stream = h.service.open_stream("acct1").await.unwrap();
    h.emit("acct1", EngineEvent::PairingCode("XYZ".to_string()))
        .await;
    h.emit(
        "acct1",
        EngineEvent::Ready {
            phone: Some("5551234".to_string()),
        },
    )
    .await;
    collect(stream).await;

    for _ in 0..500 {
        if let Some(entry) = ledger.get("acct1") {
            if entry.is_ready && entry.last_code_at.is_some() {
                assert_eq!(entry.phone_identity.as_deref(), Some("5551234"));
                assert!(entry.authenticated_at.is_some());
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("ledger was never updated");
}

// =============================================================================
// Send Tests
// =============================================================================

#[tokio::test]
async fn test_send_before_ready_makes_no_engine_call() {
    let h = Harness::new();
    h.service.initialize("acct1").await.unwrap();
    h.emit("acct1", EngineEvent::PairingCode("XYZ".to_string()))
        .await;

    assert_eq!(
        h.service.send_message("acct1", "5551234", "hi").await,
        Err(ProtocolError::NotReady("acct1".to_string()))
    );
    assert!(matches!(
        h.service
            .send_bulk("acct1", &[BulkItem::new("5551234", "hi")])
            .await,
        Err(ProtocolError::NotReady(_))
    ));
    assert!(h.sends().is_empty());
}

#[tokio::test]
async fn test_send_to_unknown_session() {
    let h = Harness::new();
    assert!(matches!(
        h.service.send_message("ghost", "5551234", "hi").await,
        Err(ProtocolError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_send_normalizes_recipient() {
    let h = Harness::new();
    h.ready("acct1", "5551234").await;

    let receipt = h
        .service
        .send_message("acct1", "+1 (555) 987-6543", "hello")
        .await
        .unwrap();
    assert_eq!(receipt.to, "15559876543@c.us");
    assert_eq!(receipt.session_id, "acct1");
    assert_eq!(h.sends(), vec!["15559876543@c.us"]);

    let receipt = h
        .service
        .send_message("acct1", "5550001@c.us", "hello")
        .await
        .unwrap();
    assert_eq!(receipt.to, "5550001@c.us");
}

#[tokio::test]
async fn test_send_failure_is_reported() {
    let h = Harness::new();
    h.ready("acct1", "5551234").await;
    h.script
        .rejected
        .lock()
        .unwrap()
        .insert("5550002@c.us".to_string());

    assert!(matches!(
        h.service.send_message("acct1", "5550002", "hello").await,
        Err(ProtocolError::SendFailure { .. })
    ));
}

#[tokio::test]
async fn test_bulk_continues_past_failing_item() {
    let h = Harness::new();
    h.ready("acct1", "5551234").await;
    h.script
        .rejected
        .lock()
        .unwrap()
        .insert("5550002@c.us".to_string());

    let items = vec![
        BulkItem::new("5550001", "a"),
        BulkItem::new("5550002", "b"),
        BulkItem::new("5550003", "c"),
        BulkItem::new("5550004", "d"),
    ];
    let report = h.service.send_bulk("acct1", &items).await.unwrap();

    assert_eq!(report.sent.len(), 3);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].index, 1);
    assert_eq!(report.errors[0].recipient, "5550002");

    let sent_to: Vec<&str> = report.sent.iter().map(|r| r.to.as_str()).collect();
    assert_eq!(
        sent_to,
        vec!["5550001@c.us", "5550003@c.us", "5550004@c.us"]
    );
    assert_eq!(
        h.sends(),
        vec![
            "5550001@c.us",
            "5550002@c.us",
            "5550003@c.us",
            "5550004@c.us"
        ]
    );
}

#[tokio::test]
async fn test_bulk_errors_preserve_input_order() {
    let h = Harness::new();
    h.ready("acct1", "5551234").await;
    h.script
        .rejected
        .lock()
        .unwrap()
        .insert("5550003@c.us".to_string());

    let items = vec![
        BulkItem::new("", "missing recipient"),
        BulkItem::new("5550002", "b"),
        BulkItem::new("5550003", "c"),
        BulkItem::new("5550004", ""),
    ];
    let report = h.service.send_bulk("acct1", &items).await.unwrap();

    let indices: Vec<usize> = report.errors.iter().map(|e| e.index).collect();
    assert_eq!(indices, vec![0, 2, 3]);
    assert_eq!(report.sent.len(), 1);
    // Items missing a field never reach the engine.
    assert_eq!(h.sends(), vec!["5550002@c.us", "5550003@c.us"]);
}

#[tokio::test(start_paused = true)]
async fn test_bulk_spaces_engine_sends() {
    let script = Arc::new(Script::default());
    let factory = Arc::new(ScriptedFactory {
        script: Arc::clone(&script),
    });
    let settings = SessionConfig {
        send_delay_ms: 1000,
        ..Default::default()
    };
    let h = Harness {
        service: Arc::new(SessionService::new(&settings, factory, None)),
        script,
    };
    h.ready("acct1", "5551234").await;

    let started = tokio::time::Instant::now();
    let items = vec![
        BulkItem::new("5550001", "a"),
        BulkItem::new("5550002", "b"),
        BulkItem::new("5550003", "c"),
    ];
    let report = h.service.send_bulk("acct1", &items).await.unwrap();

    assert_eq!(report.sent.len(), 3);
    assert!(started.elapsed() >= Duration::from_secs(2));
}

// =============================================================================
// Logout and Destroy Tests
// =============================================================================

#[tokio::test]
async fn test_logout_keeps_record_and_ignores_late_events() {
    let h = Harness::new();
    h.ready("acct1", "5551234").await;
    let old_events = h.script.events.lock().unwrap().get("acct1").cloned().unwrap();

    h.service.logout("acct1").await.unwrap();
    assert_eq!(h.script.logged_out.load(Ordering::SeqCst), 1);

    let status = h.service.status("acct1").await;
    assert!(status.exists);
    assert_eq!(status.state, Some(LifecycleState::LoggedOut));
    assert!(!status.is_ready);
    assert!(!status.has_code);
    assert!(status.phone_identity.is_none());

    old_events
        .emit(EngineEvent::Ready {
            phone: Some("5551234".to_string()),
        })
        .await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(
        h.service.status("acct1").await.state,
        Some(LifecycleState::LoggedOut)
    );
}

#[tokio::test]
async fn test_destroy_removes_session() {
    let h = Harness::new();
    h.ready("acct1", "5551234").await;

    h.service.destroy("acct1").await.unwrap();
    assert!(!h.service.has_session("acct1"));
    assert_eq!(h.service.status("acct1").await, SessionStatus::missing());
    assert!(h.script.destroyed.load(Ordering::SeqCst) >= 1);

    assert!(matches!(
        h.service.destroy("acct1").await,
        Err(ProtocolError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_shutdown_logs_out_ready_sessions() {
    let h = Harness::new();
    h.ready("acct1", "5551111").await;
    h.service.initialize("acct2").await.unwrap();
    h.wait_initialized("acct2").await;

    assert_eq!(h.service.shutdown().await, 1);
    assert_eq!(h.script.logged_out.load(Ordering::SeqCst), 1);
    assert_eq!(h.service.list_sessions(), vec!["acct1", "acct2"]);
}

// =============================================================================
// HTTP Tests
// =============================================================================

async fn http(
    h: &Harness,
    method: &str,
    uri: &str,
    body: Option<serde_json::Value>,
) -> (StatusCode, serde_json::Value) {
    let app = build_router(AppState::new(
        Arc::clone(&h.service),
        CancellationToken::new(),
    ));
    let builder = Request::builder().method(method).uri(uri);
    let req = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let resp = app.oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), 1_000_000)
        .await
        .unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn test_http_pairing_flow() {
    let h = Harness::new();

    let (status, body) = http(&h, "GET", "/api/sessions/acct1/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body["data"],
        serde_json::json!({
            "exists": false,
            "isInitialized": false,
            "isReady": false,
            "hasCode": false,
            "phoneIdentity": null,
            "lastCodeAt": null,
            "readyAt": null,
        })
    );

    let (status, _) = http(&h, "POST", "/api/sessions/acct1/initialize", None).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    h.emit("acct1", EngineEvent::PairingCode("XYZ".to_string()))
        .await;
    let (status, body) = http(&h, "GET", "/api/sessions/acct1/qr", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["qrCode"], render_data_url("XYZ").unwrap());

    h.emit(
        "acct1",
        EngineEvent::Ready {
            phone: Some("5551234".to_string()),
        },
    )
    .await;
    let (_, body) = http(&h, "GET", "/api/sessions/acct1/status", None).await;
    assert_eq!(body["data"]["isReady"], true);
    assert_eq!(body["data"]["phoneIdentity"], "5551234");

    let (_, body) = http(&h, "GET", "/api/sessions/acct1/qr", None).await;
    assert!(body["qrCode"].is_null());

    let (status, body) = http(
        &h,
        "POST",
        "/api/sessions/acct1/send",
        Some(serde_json::json!({ "number": "5550001", "message": "hi" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["messageId"], "msg-1");
}

#[tokio::test]
async fn test_http_send_not_ready_is_503() {
    let h = Harness::new();
    h.service.initialize("acct1").await.unwrap();

    let (status, body) = http(
        &h,
        "POST",
        "/api/sessions/acct1/send",
        Some(serde_json::json!({ "recipient": "5550001", "body": "hi" })),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["success"], false);
    assert!(h.sends().is_empty());
}
