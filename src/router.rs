//! Fan-out of chat messages to every registered session but the sender.
//!
//! Each session gets one [`Fanout`] worker that broadcasts its messages
//! serially, so the number of in-flight broadcasts is bounded by the number
//! of connected sessions rather than by the message rate.
//!
//! ```text
//!   session A ──submit──► Fanout(A) ──broadcast──┬──► Outbox(B) ──► session B
//!                                                └──► Outbox(C) ──► session C
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;

use crate::outbox::{DeliveryPolicy, Enqueue};
use crate::protocol::Envelope;
use crate::registry::Registry;

/// Per-broadcast delivery counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    pub dropped: usize,
    pub closed: usize,
}

/// Cumulative router counters.
#[derive(Debug, Default)]
pub struct RouterStats {
    broadcasts: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    closed: AtomicU64,
}

impl RouterStats {
    pub fn broadcasts(&self) -> u64 {
        self.broadcasts.load(Ordering::Relaxed)
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn closed(&self) -> u64 {
        self.closed.load(Ordering::Relaxed)
    }

    fn record(&self, delivery: &Delivery) {
        self.broadcasts.fetch_add(1, Ordering::Relaxed);
        self.delivered.fetch_add(delivery.delivered as u64, Ordering::Relaxed);
        self.dropped.fetch_add(delivery.dropped as u64, Ordering::Relaxed);
        self.closed.fetch_add(delivery.closed as u64, Ordering::Relaxed);
    }
}

#[derive(Clone)]
pub struct Router {
    registry: Registry,
    policy: DeliveryPolicy,
    stats: Arc<RouterStats>,
    workers: TaskTracker,
}

impl Router {
    pub fn new(registry: Registry, policy: DeliveryPolicy) -> Self {
        Self {
            registry,
            policy,
            stats: Arc::new(RouterStats::default()),
            workers: TaskTracker::new(),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn policy(&self) -> DeliveryPolicy {
        self.policy
    }

    pub fn stats(&self) -> &RouterStats {
        &self.stats
    }

    /// Deliver `envelope` to every registered session except `sender`.
    ///
    /// Membership is snapshotted under the registry lock; pushes happen after
    /// it is released. Under `OverflowPolicy::Block` a full receiver delays
    /// the receivers after it in this call for up to the block timeout.
    pub async fn broadcast(&self, sender: &str, envelope: &Envelope) -> Delivery {
        let targets = self.registry.snapshot_except(sender);
        let mut delivery = Delivery::default();

        for (name, outbox) in targets {
            match outbox.push(envelope.clone(), &self.policy).await {
                Enqueue::Delivered => delivery.delivered += 1,
                Enqueue::Dropped => {
                    delivery.dropped += 1;
                    tracing::warn!(
                        receiver = %name,
                        sender,
                        total_dropped = outbox.dropped(),
                        "outbound queue full, dropping message"
                    );
                }
                Enqueue::Closed => {
                    delivery.closed += 1;
                    tracing::debug!(receiver = %name, "receiver gone, skipping");
                }
            }
        }

        self.stats.record(&delivery);
        delivery
    }

    /// Start the serial fan-out worker for `sender`.
    pub fn spawn_fanout(&self, sender: impl Into<String>, capacity: usize) -> Fanout {
        let sender = sender.into();
        let (tx, mut rx) = mpsc::channel::<Envelope>(capacity);
        let router = self.clone();
        let task = self.workers.spawn(async move {
            while let Some(envelope) = rx.recv().await {
                router.broadcast(&sender, &envelope).await;
            }
            tracing::trace!(sender = %sender, "fan-out worker finished");
        });
        Fanout { tx, task }
    }

    /// Wait for every fan-out worker to finish its queued envelopes.
    ///
    /// Workers exit once their session drops its [`Fanout`], so call this
    /// after the sessions are gone.
    pub async fn wait_workers(&self) {
        self.workers.close();
        self.workers.wait().await;
    }
}

/// Handle to one session's fan-out worker.
///
/// Dropping the handle lets the worker finish the envelopes already queued
/// and then exit.
pub struct Fanout {
    tx: mpsc::Sender<Envelope>,
    task: JoinHandle<()>,
}

impl Fanout {
    /// Queue an envelope for broadcast. Waits while the worker's queue is
    /// full; returns false if the worker has stopped.
    pub async fn submit(&self, envelope: Envelope) -> bool {
        self.tx.send(envelope).await.is_ok()
    }

    /// Wait for a free slot in the worker's queue without committing an
    /// envelope yet. `None` if the worker has stopped.
    pub async fn reserve(&self) -> Option<mpsc::Permit<'_, Envelope>> {
        self.tx.reserve().await.ok()
    }

    /// Stop accepting envelopes and wait until the queued ones are broadcast.
    pub async fn finish(self) {
        let Fanout { tx, task } = self;
        drop(tx);
        if let Err(e) = task.await {
            tracing::warn!(?e, "fan-out worker panicked");
        }
    }
}
