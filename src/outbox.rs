//! Per-session outbound queues.
//!
//! Each registered session owns the single receiving end of its queue; the
//! router holds cloned [`Outbox`] handles and pushes into them from any number
//! of fan-out workers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::config::{OverflowPolicy, ServerConfig};
use crate::protocol::Envelope;

/// How a push behaves when the target queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryPolicy {
    pub overflow: OverflowPolicy,
    pub block_timeout: Duration,
}

impl DeliveryPolicy {
    pub fn drop_newest() -> Self {
        Self {
            overflow: OverflowPolicy::DropNewest,
            block_timeout: Duration::ZERO,
        }
    }

    pub fn block(timeout: Duration) -> Self {
        Self {
            overflow: OverflowPolicy::Block,
            block_timeout: timeout,
        }
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            overflow: config.overflow,
            block_timeout: config.block_timeout(),
        }
    }
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self::drop_newest()
    }
}

/// Result of a single push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueue {
    Delivered,
    /// Queue was full (or stayed full past the block timeout).
    Dropped,
    /// The owning session is gone.
    Closed,
}

/// Producer handle for one session's outbound queue.
#[derive(Clone, Debug)]
pub struct Outbox {
    tx: mpsc::Sender<Envelope>,
    dropped: Arc<AtomicU64>,
}

/// Create a bounded outbound queue.
pub fn channel(capacity: usize) -> (Outbox, mpsc::Receiver<Envelope>) {
    let (tx, rx) = mpsc::channel(capacity);
    let outbox = Outbox {
        tx,
        dropped: Arc::new(AtomicU64::new(0)),
    };
    (outbox, rx)
}

impl Outbox {
    /// Push an envelope according to `policy`.
    pub async fn push(&self, envelope: Envelope, policy: &DeliveryPolicy) -> Enqueue {
        match policy.overflow {
            OverflowPolicy::DropNewest => match self.tx.try_send(envelope) {
                Ok(()) => Enqueue::Delivered,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    Enqueue::Dropped
                }
                Err(mpsc::error::TrySendError::Closed(_)) => Enqueue::Closed,
            },
            OverflowPolicy::Block => {
                match tokio::time::timeout(policy.block_timeout, self.tx.send(envelope)).await {
                    Ok(Ok(())) => Enqueue::Delivered,
                    Ok(Err(_)) => Enqueue::Closed,
                    Err(_) => {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        Enqueue::Dropped
                    }
                }
            }
        }
    }

    /// Envelopes this queue has refused because it was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub(crate) fn same_queue(&self, other: &Outbox) -> bool {
        self.tx.same_channel(&other.tx)
    }
}
