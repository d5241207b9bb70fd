//! In-process event bus for session lifecycle events.
//!
//! Every subscriber gets its own bounded channel. Publishing never waits:
//! events for a subscriber whose buffer is full are dropped and the
//! subscription is flagged as lagged, and subscribers whose receiving side
//! has gone away are pruned. Subscribers may narrow what is queued for them
//! with a kind list or an arbitrary filter evaluated at publish time.
//!
//! A [`Subscription`] unregisters itself when dropped, so a subscriber that
//! goes out of scope on any path stops receiving events.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use protocol::{EventKind, SessionEvent};
use tokio::sync::mpsc;

/// Unique identifier for a subscriber.
pub type SubscriberId = u64;

/// Predicate deciding whether an event is queued for a subscriber.
pub type EventFilter = Arc<dyn Fn(&SessionEvent) -> bool + Send + Sync>;

/// Default channel capacity for a subscriber.
const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Overflow bookkeeping shared by a subscriber and its [`Subscription`].
#[derive(Default)]
struct Overflow {
    dropped: AtomicU64,
    lagged: AtomicBool,
}

struct Subscriber {
    tx: mpsc::Sender<SessionEvent>,
    kinds: Option<Vec<EventKind>>,
    filter: Option<EventFilter>,
    session_id: Option<String>,
    overflow: Arc<Overflow>,
    backpressured: AtomicBool,
}

impl Subscriber {
    fn wants(&self, event: &SessionEvent) -> bool {
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind()) {
                return false;
            }
        }
        match &self.filter {
            Some(filter) => filter(event),
            None => true,
        }
    }

    /// Returns true if the event was queued.
    fn try_send(&self, id: SubscriberId, event: SessionEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => {
                if self.backpressured.swap(false, Ordering::Relaxed) {
                    tracing::debug!(subscriber = id, "Subscriber recovered from backpressure");
                }
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.overflow.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                self.overflow.lagged.store(true, Ordering::Release);
                if !self.backpressured.swap(true, Ordering::Relaxed) {
                    tracing::warn!(
                        subscriber = id,
                        dropped,
                        "Subscriber is backpressured, dropping events"
                    );
                }
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

struct BusInner {
    subscribers: DashMap<SubscriberId, Subscriber>,
    next_id: AtomicU64,
}

/// Publish/subscribe channel for [`SessionEvent`]s.
///
/// Cloning is cheap; all clones share the same subscriber registry.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

/// Options for a new subscription.
#[derive(Clone, Default)]
pub struct SubscribeOptions {
    /// Only deliver these kinds. All kinds when unset.
    pub kinds: Option<Vec<EventKind>>,
    /// Only deliver events the filter accepts. Evaluated at publish time, so
    /// rejected events never take up channel capacity.
    pub filter: Option<EventFilter>,
    /// Session the subscriber belongs to, so that destroying the session
    /// closes the subscription.
    pub session_id: Option<String>,
    /// Channel capacity. Defaults to 64.
    pub capacity: Option<usize>,
}

impl EventBus {
    /// Creates an empty bus.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: DashMap::new(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Subscribes to every event.
    pub fn subscribe(&self) -> Subscription {
        self.subscribe_with(SubscribeOptions::default())
    }

    /// Subscribes with explicit options.
    pub fn subscribe_with(&self, options: SubscribeOptions) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let capacity = options.capacity.unwrap_or(DEFAULT_CHANNEL_CAPACITY).max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let overflow = Arc::new(Overflow::default());

        self.inner.subscribers.insert(
            id,
            Subscriber {
                tx,
                kinds: options.kinds,
                filter: options.filter,
                session_id: options.session_id.clone(),
                overflow: Arc::clone(&overflow),
                backpressured: AtomicBool::new(false),
            },
        );
        tracing::debug!(
            subscriber = id,
            session_id = ?options.session_id,
            "Added bus subscriber"
        );

        Subscription {
            id,
            rx,
            overflow,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Publishes an event to every interested subscriber.
    ///
    /// Never blocks. Returns the number of subscribers the event was queued for.
    pub fn publish(&self, event: SessionEvent) -> usize {
        let mut closed = Vec::new();
        let mut delivered = 0;

        for entry in self.inner.subscribers.iter() {
            let subscriber = entry.value();
            if subscriber.tx.is_closed() {
                closed.push(*entry.key());
                continue;
            }
            if subscriber.wants(&event) && subscriber.try_send(*entry.key(), event.clone()) {
                delivered += 1;
            }
        }

        for id in closed {
            self.inner.subscribers.remove(&id);
            tracing::debug!(subscriber = id, "Removed closed subscriber");
        }

        tracing::trace!(
            session_id = %event.session_id(),
            kind = event.kind().as_str(),
            delivered,
            "Published event"
        );
        delivered
    }

    /// Removes every subscriber tied to a session.
    ///
    /// Their subscriptions observe end-of-stream. Returns how many were removed.
    pub fn unsubscribe_session(&self, session_id: &str) -> usize {
        let before = self.inner.subscribers.len();
        self.inner
            .subscribers
            .retain(|_, subscriber| subscriber.session_id.as_deref() != Some(session_id));
        let removed = before.saturating_sub(self.inner.subscribers.len());
        if removed > 0 {
            tracing::debug!(session_id = %session_id, removed, "Closed session subscriptions");
        }
        removed
    }

    /// Returns the number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A live registration on the [`EventBus`].
///
/// Dropping the subscription unregisters it.
pub struct Subscription {
    id: SubscriberId,
    rx: mpsc::Receiver<SessionEvent>,
    overflow: Arc<Overflow>,
    bus: Weak<BusInner>,
}

impl Subscription {
    /// Returns the subscriber id.
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Waits for the next event.
    ///
    /// Returns `None` once the subscription has been closed by the bus.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        self.rx.recv().await
    }

    /// Returns the next queued event without waiting.
    pub fn try_recv(&mut self) -> Option<SessionEvent> {
        self.rx.try_recv().ok()
    }

    /// Returns true if events were dropped since the last call, clearing the flag.
    pub fn take_lagged(&self) -> bool {
        self.overflow.lagged.swap(false, Ordering::AcqRel)
    }

    /// Total number of events dropped because the channel was full.
    pub fn dropped(&self) -> u64 {
        self.overflow.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            if bus.subscribers.remove(&self.id).is_some() {
                tracing::debug!(subscriber = self.id, "Removed bus subscriber");
            }
        }
    }
}
