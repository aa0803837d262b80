//! Broadcast hub: fan-out to many subscribers with slow-consumer isolation.
//!
//! The hub is an actor. One task owns the subscriber set and consumes three
//! inputs: registrations, unregistrations and broadcasts. Everything else
//! talks to it through a cloneable [`HubHandle`].
//!
//! ```text
//!  register ──┐
//!  unregister ┼──> [ hub task ] ──try_send──> subscriber buffer 1
//!  broadcast ─┘         │       ──try_send──> subscriber buffer 2
//!                       └─ full buffer => evict
//! ```
//!
//! `broadcast` never blocks: when the hub's own queue is full the payload is
//! dropped and counted. A subscriber whose buffer is full when a payload is
//! offered is evicted, which closes its buffer; the transport notices and
//! disconnects.

use crate::config::HubConfig;
use crate::error::RelayError;
use crate::event::{HubEvent, Payload};
use crate::metrics;
use crate::shutdown::ShutdownSignal;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Unique key of a registered subscriber. Never reused.
pub type SubscriberId = u64;

struct Registration {
    id: SubscriberId,
    sender: mpsc::Sender<Payload>,
    ack: oneshot::Sender<()>,
}

/// Receiving end handed to a subscriber transport.
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriberId,
    pub receiver: mpsc::Receiver<Payload>,
}

#[derive(Debug, Default)]
struct HubCounters {
    next_id: AtomicU64,
    subscribers: AtomicUsize,
    delivered: AtomicU64,
    dropped: AtomicU64,
    evicted: AtomicU64,
}

/// Hub figures for `/stats`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct HubStats {
    pub subscribers: usize,
    pub delivered: u64,
    pub dropped: u64,
    pub evicted: u64,
}

/// Cloneable client of the hub task.
#[derive(Clone)]
pub struct HubHandle {
    register_tx: mpsc::UnboundedSender<Registration>,
    unregister_tx: mpsc::UnboundedSender<SubscriberId>,
    broadcast_tx: mpsc::Sender<Payload>,
    counters: Arc<HubCounters>,
    subscriber_buffer: usize,
}

/// The hub task's state. Consumed by [`BroadcastHub::run`].
pub struct BroadcastHub {
    register_rx: mpsc::UnboundedReceiver<Registration>,
    unregister_rx: mpsc::UnboundedReceiver<SubscriberId>,
    broadcast_rx: mpsc::Receiver<Payload>,
    counters: Arc<HubCounters>,
    subscribers: HashMap<SubscriberId, mpsc::Sender<Payload>>,
}

impl BroadcastHub {
    /// Create a hub and its handle. Nothing runs until [`run`](Self::run).
    pub fn channel(config: &HubConfig) -> (HubHandle, BroadcastHub) {
        let (register_tx, register_rx) = mpsc::unbounded_channel();
        let (unregister_tx, unregister_rx) = mpsc::unbounded_channel();
        let (broadcast_tx, broadcast_rx) = mpsc::channel(config.broadcast_capacity.max(1));
        let counters = Arc::new(HubCounters::default());

        let handle = HubHandle {
            register_tx,
            unregister_tx,
            broadcast_tx,
            counters: Arc::clone(&counters),
            subscriber_buffer: config.subscriber_buffer.max(1),
        };
        let hub = BroadcastHub {
            register_rx,
            unregister_rx,
            broadcast_rx,
            counters,
            subscribers: HashMap::new(),
        };
        (handle, hub)
    }

    /// Create a hub and run it on a new task.
    pub fn spawn(config: &HubConfig, shutdown: ShutdownSignal) -> (HubHandle, JoinHandle<()>) {
        let (handle, hub) = Self::channel(config);
        let task = tokio::spawn(hub.run(shutdown));
        (handle, task)
    }

    /// Serve until shutdown or until every handle is gone.
    ///
    /// On shutdown, broadcasts already queued are still delivered, then all
    /// subscriber buffers are closed.
    pub async fn run(mut self, mut shutdown: ShutdownSignal) {
        info!("Broadcast hub started");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.triggered() => break,
                Some(registration) = self.register_rx.recv() => self.add(registration),
                Some(id) = self.unregister_rx.recv() => self.remove(id),
                Some(payload) = self.broadcast_rx.recv() => self.fan_out(&payload),
                else => break,
            }
        }

        while let Ok(payload) = self.broadcast_rx.try_recv() {
            self.fan_out(&payload);
        }
        let remaining = self.subscribers.len();
        self.subscribers.clear();
        self.publish_count();
        info!(closed = remaining, "Broadcast hub stopped");
    }

    fn add(&mut self, registration: Registration) {
        let Registration { id, sender, ack } = registration;
        self.subscribers.insert(id, sender);
        self.publish_count();
        debug!(subscriber_id = id, total = self.subscribers.len(), "Subscriber registered");
        let _ = ack.send(());
    }

    fn remove(&mut self, id: SubscriberId) {
        // Dropping the sender closes the subscriber's buffer.
        if self.subscribers.remove(&id).is_some() {
            self.publish_count();
            debug!(subscriber_id = id, total = self.subscribers.len(), "Subscriber unregistered");
        }
    }

    fn fan_out(&mut self, payload: &Payload) {
        let counters = &self.counters;
        let before = self.subscribers.len();

        self.subscribers.retain(|id, sender| match sender.try_send(Arc::clone(payload)) {
            Ok(()) => {
                counters.delivered.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(_)) => {
                counters.evicted.fetch_add(1, Ordering::Relaxed);
                metrics::subscriber_evicted();
                warn!(subscriber_id = *id, "Subscriber buffer full, evicting slow subscriber");
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(subscriber_id = *id, "Subscriber gone, removing");
                false
            }
        });

        if self.subscribers.len() != before {
            self.publish_count();
        }
    }

    fn publish_count(&self) {
        let count = self.subscribers.len();
        self.counters.subscribers.store(count, Ordering::Relaxed);
        metrics::subscriber_gauge(count);
    }
}

impl HubHandle {
    /// Register a subscriber with the default buffer size.
    ///
    /// Returns once the hub has added it, so any broadcast sent after this
    /// resolves reaches the new subscriber.
    pub async fn register(&self) -> Result<Subscription, RelayError> {
        self.register_with_capacity(self.subscriber_buffer).await
    }

    pub async fn register_with_capacity(&self, capacity: usize) -> Result<Subscription, RelayError> {
        let id = self.counters.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let (ack, acked) = oneshot::channel();

        self.register_tx
            .send(Registration { id, sender, ack })
            .map_err(|_| RelayError::HubStopped)?;
        acked.await.map_err(|_| RelayError::HubStopped)?;

        Ok(Subscription { id, receiver })
    }

    /// Remove a subscriber. Unknown or already evicted ids are ignored.
    pub fn unregister(&self, id: SubscriberId) {
        let _ = self.unregister_tx.send(id);
    }

    /// Queue a payload for every subscriber. Returns `false` if it was dropped.
    pub fn broadcast(&self, payload: Payload) -> bool {
        match self.broadcast_tx.try_send(payload) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::broadcast_dropped();
                warn!("Broadcast queue full, dropping message");
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                debug!("Broadcast hub stopped, dropping message");
                false
            }
        }
    }

    /// Serialize and queue an event.
    pub fn broadcast_event(&self, event: &HubEvent) -> Result<bool, RelayError> {
        Ok(self.broadcast(event.to_payload()?))
    }

    pub fn subscriber_count(&self) -> usize {
        self.counters.subscribers.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            subscribers: self.subscriber_count(),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            evicted: self.counters.evicted.load(Ordering::Relaxed),
        }
    }
}
