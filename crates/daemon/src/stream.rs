//! Streaming delivery of pairing progress.
//!
//! A [`PairingStream`] follows one session for one long-lived connection:
//! 1. a `connected` frame
//! 2. a `ready` frame and end of stream, if the session is already paired
//! 3. the cached pairing code, if there is one
//! 4. live `code` frames and a final `ready` frame from the event bus
//!
//! Heartbeats are interleaved at a fixed interval while waiting. The bus
//! subscription is owned by the stream, so dropping the stream for any
//! reason unsubscribes it. Only the followed session's events are queued for
//! the stream; if its buffer still overflows, the stream catches up from the
//! record instead of waiting for an event that was dropped.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::Stream;
use protocol::{EventKind, ProtocolError, SessionEvent, StreamFrame, StreamMessage};
use tokio::time::{Instant, MissedTickBehavior};

use crate::accounts::{self, AccountNotifier};
use crate::events::{EventBus, SubscribeOptions, Subscription};
use crate::session::{now_millis, SessionStore, SharedRecord};

/// Message attached to forwarded pairing codes.
pub const CODE_MESSAGE: &str = "New pairing code generated";

/// Message attached to the final ready frame.
pub const READY_MESSAGE: &str = "Session paired successfully";

/// Dependencies of every pairing stream.
#[derive(Clone)]
pub struct StreamContext {
    pub store: Arc<SessionStore>,
    pub bus: EventBus,
    pub notifier: Option<Arc<dyn AccountNotifier>>,
    pub heartbeat: Duration,
}

/// Live pairing feed for one session.
pub struct PairingStream {
    session_id: String,
    inner: Pin<Box<dyn Stream<Item = StreamMessage> + Send>>,
}

/// Owns the subscription for the lifetime of the stream.
struct StreamGuard {
    session_id: String,
    subscription: Subscription,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        tracing::debug!(
            session_id = %self.session_id,
            subscriber = self.subscription.id(),
            dropped = self.subscription.dropped(),
            "Pairing stream closed"
        );
    }
}

enum Step {
    Event(Option<SessionEvent>),
    Heartbeat,
}

impl PairingStream {
    /// Opens a stream for `session_id`.
    ///
    /// # Errors
    /// `NotFound` if no session is registered under the id.
    pub async fn open(ctx: &StreamContext, session_id: &str) -> Result<Self, ProtocolError> {
        let record = ctx.store.require(session_id)?;

        // Subscribe before reading the record so no transition falls in between.
        let followed = session_id.to_string();
        let subscription = ctx.bus.subscribe_with(SubscribeOptions {
            kinds: Some(vec![EventKind::Code, EventKind::Ready]),
            filter: Some(Arc::new(move |event: &SessionEvent| {
                event.session_id() == followed
            })),
            session_id: Some(session_id.to_string()),
            capacity: None,
        });

        let (ready, phone_identity, cached_code) = {
            let rec = record.lock().await;
            if rec.is_destroyed() {
                return Err(ProtocolError::NotFound(session_id.to_string()));
            }
            (
                rec.is_ready(),
                rec.phone_identity().map(str::to_string),
                rec.pairing_code().map(str::to_string),
            )
        };

        tracing::info!(
            session_id = %session_id,
            subscriber = subscription.id(),
            ready,
            has_code = cached_code.is_some(),
            "Pairing stream opened"
        );

        let guard = StreamGuard {
            session_id: session_id.to_string(),
            subscription,
        };
        let inner = Self::frames(
            guard,
            record,
            ctx.notifier.clone(),
            ctx.heartbeat,
            ready,
            phone_identity,
            cached_code,
        );

        Ok(Self {
            session_id: session_id.to_string(),
            inner,
        })
    }

    fn frames(
        mut guard: StreamGuard,
        record: SharedRecord,
        notifier: Option<Arc<dyn AccountNotifier>>,
        heartbeat: Duration,
        ready: bool,
        phone_identity: Option<String>,
        cached_code: Option<String>,
    ) -> Pin<Box<dyn Stream<Item = StreamMessage> + Send>> {
        Box::pin(async_stream::stream! {
            let session_id = guard.session_id.clone();
            yield StreamMessage::Frame(StreamFrame::connected(&session_id));

            if ready {
                yield StreamMessage::Frame(StreamFrame::Ready {
                    message: READY_MESSAGE.to_string(),
                    phone_identity,
                });
                return;
            }

            let mut last_code = cached_code.clone();
            if let Some(code) = cached_code {
                yield StreamMessage::Frame(StreamFrame::Code {
                    qr_code: code,
                    message: CODE_MESSAGE.to_string(),
                });
            }

            let mut ticker = tokio::time::interval_at(Instant::now() + heartbeat, heartbeat);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                let step = tokio::select! {
                    event = guard.subscription.recv() => Step::Event(event),
                    _ = ticker.tick() => Step::Heartbeat,
                };

                let event = match step {
                    Step::Heartbeat => None,
                    // The bus closed the subscription: the session was destroyed.
                    Step::Event(None) => break,
                    Step::Event(Some(event)) if event.session_id() == session_id => Some(event),
                    Step::Event(Some(_)) => continue,
                };

                // Events were dropped: the record is the source of truth.
                let event = if guard.subscription.take_lagged() {
                    tracing::warn!(session_id = %session_id, "Pairing stream lagged, resyncing");
                    let rec = record.lock().await;
                    if rec.is_destroyed() {
                        break;
                    }
                    let status = rec.status();
                    if status.is_ready {
                        Some(SessionEvent::Ready {
                            session_id: session_id.clone(),
                            phone_identity: status.phone_identity,
                            ready_at: status.ready_at.unwrap_or_else(now_millis),
                        })
                    } else {
                        rec.pairing_code().map(|code| SessionEvent::Code {
                            session_id: session_id.clone(),
                            code: code.to_string(),
                        })
                    }
                } else {
                    event
                };

                let frame = match event {
                    None => {
                        yield StreamMessage::Heartbeat;
                        continue;
                    }
                    Some(SessionEvent::Code { code, .. }) => {
                        if last_code.as_deref() == Some(code.as_str()) {
                            continue;
                        }
                        last_code = Some(code.clone());
                        if let Some(notifier) = &notifier {
                            accounts::spawn_pairing_code(
                                Arc::clone(notifier),
                                session_id.clone(),
                                now_millis(),
                            );
                        }
                        StreamFrame::Code {
                            qr_code: code,
                            message: CODE_MESSAGE.to_string(),
                        }
                    }
                    Some(SessionEvent::Ready { phone_identity, ready_at, .. }) => {
                        if let Some(notifier) = &notifier {
                            accounts::spawn_auth_status(
                                Arc::clone(notifier),
                                session_id.clone(),
                                true,
                                phone_identity.clone(),
                                ready_at,
                            );
                        }
                        StreamFrame::Ready {
                            message: READY_MESSAGE.to_string(),
                            phone_identity,
                        }
                    }
                    Some(_) => continue,
                };

                let terminal = frame.is_terminal();
                yield StreamMessage::Frame(frame);
                if terminal {
                    break;
                }
            }
        })
    }

    /// Returns the session this stream follows.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

impl Stream for PairingStream {
    type Item = StreamMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}
