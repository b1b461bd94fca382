//! Topic-based fan-out for room events.
//!
//! Each subscriber owns a bounded queue. Publishing never waits on a
//! subscriber: if its queue is full it is evicted, its close signal fires
//! with [`GatewayError::Backpressure`], and its subscription ends with
//! [`RecvError::Backpressure`]. Publishes to one topic are serialised so
//! every subscriber sees the same relative order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;

use super::events::ServerEvent;
use super::session::CloseSignal;
use crate::error::GatewayError;

/// A published event, shared between every subscriber's queue.
pub type Envelope = Arc<ServerEvent>;

/// Identifies one subscription on one topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    pub topic: String,
    pub id: u64,
}

/// Why a subscription stopped yielding envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RecvError {
    #[error("subscription closed")]
    Unsubscribed,
    #[error("subscriber dropped for backpressure")]
    Backpressure,
}

/// Publish/subscribe fabric keyed by topic (one topic per room).
pub trait BroadcastBus: Send + Sync {
    /// Start receiving envelopes published to `topic` from now on.
    fn subscribe(&self, topic: &str) -> Subscription;

    /// Fan `envelope` out to every current subscriber of `topic`. Returns the
    /// number of subscribers it was queued for.
    fn publish(&self, topic: &str, envelope: Envelope) -> usize;

    /// Detach a subscription. Unknown or already-removed handles are ignored.
    fn unsubscribe(&self, handle: &SubscriptionHandle);

    fn subscriber_count(&self, topic: &str) -> usize;
}

type Detach = Box<dyn FnOnce(&SubscriptionHandle) + Send>;

/// Receiving end of a subscription. Dropping it unsubscribes.
pub struct Subscription {
    handle: SubscriptionHandle,
    rx: mpsc::Receiver<Envelope>,
    signal: CloseSignal,
    detach: Option<Detach>,
}

impl Subscription {
    pub fn handle(&self) -> &SubscriptionHandle {
        &self.handle
    }

    /// Fires when the bus evicts this subscriber.
    pub fn close_signal(&self) -> CloseSignal {
        self.signal.clone()
    }

    fn evicted(&self) -> bool {
        matches!(self.signal.reason(), Some(GatewayError::Backpressure))
    }

    /// Next envelope. An evicted subscriber gets `Backpressure` straight
    /// away, without draining what was already queued.
    pub async fn recv(&mut self) -> Result<Envelope, RecvError> {
        if self.evicted() {
            return Err(RecvError::Backpressure);
        }
        match self.rx.recv().await {
            Some(envelope) => Ok(envelope),
            None if self.evicted() => Err(RecvError::Backpressure),
            None => Err(RecvError::Unsubscribed),
        }
    }

    /// Detach from the bus. Safe to call more than once.
    pub fn unsubscribe(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach(&self.handle);
        }
        self.rx.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

// ---------------------------------------------------------------------------
// In-process bus
// ---------------------------------------------------------------------------

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<Envelope>,
    signal: CloseSignal,
}

struct Topics {
    topics: DashMap<String, Vec<Subscriber>>,
    next_id: AtomicU64,
    capacity: usize,
}

impl Topics {
    fn remove(&self, handle: &SubscriptionHandle) {
        if let Some(mut subscribers) = self.topics.get_mut(&handle.topic) {
            subscribers.retain(|s| s.id != handle.id);
        }
        self.topics.remove_if(&handle.topic, |_, subscribers| subscribers.is_empty());
    }
}

/// Single-process [`BroadcastBus`]. Cloneable; clones share topics.
#[derive(Clone)]
pub struct LocalBus {
    inner: Arc<Topics>,
}

impl LocalBus {
    /// `capacity` is the per-subscriber queue depth.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Topics {
                topics: DashMap::new(),
                next_id: AtomicU64::new(1),
                capacity: capacity.max(1),
            }),
        }
    }
}

impl BroadcastBus for LocalBus {
    fn subscribe(&self, topic: &str) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.inner.capacity);
        let signal = CloseSignal::new();

        self.inner
            .topics
            .entry(topic.to_string())
            .or_default()
            .push(Subscriber {
                id,
                tx,
                signal: signal.clone(),
            });

        let topics = Arc::downgrade(&self.inner);
        Subscription {
            handle: SubscriptionHandle {
                topic: topic.to_string(),
                id,
            },
            rx,
            signal,
            detach: Some(Box::new(move |handle: &SubscriptionHandle| {
                if let Some(topics) = topics.upgrade() {
                    topics.remove(handle);
                }
            })),
        }
    }

    fn publish(&self, topic: &str, envelope: Envelope) -> usize {
        let Some(mut subscribers) = self.inner.topics.get_mut(topic) else {
            return 0;
        };

        // Holding the shard lock for the whole loop serialises publishers on
        // this topic.
        let mut delivered = 0;
        subscribers.retain(|subscriber| match subscriber.tx.try_send(envelope.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                subscriber.signal.close(GatewayError::Backpressure);
                tracing::warn!(
                    topic,
                    subscriber = subscriber.id,
                    "subscriber queue full, dropping subscriber"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        let now_empty = subscribers.is_empty();
        drop(subscribers);

        if now_empty {
            self.inner.topics.remove_if(topic, |_, s| s.is_empty());
        }
        delivered
    }

    fn unsubscribe(&self, handle: &SubscriptionHandle) {
        self.inner.remove(handle);
    }

    fn subscriber_count(&self, topic: &str) -> usize {
        self.inner.topics.get(topic).map_or(0, |s| s.len())
    }
}
