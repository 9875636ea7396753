//! Registry of connected sessions, keyed by display name.
//!
//! Every structural change and every fan-out snapshot takes the same
//! exclusive lock. The lock is never held across an await: pushes into the
//! queues happen on the snapshot, after the lock is released.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::config::{NameRelease, DEFAULT_QUEUE_CAPACITY};
use crate::outbox::{self, Outbox};
use crate::protocol::Envelope;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("name already in use: {0}")]
    NameTaken(String),
    #[error("invalid name: {0}")]
    InvalidName(String),
}

/// Shared handle to the name → outbound queue map.
///
/// Cloning is cheap; all clones see the same map. Construct one per server
/// (or per test).
#[derive(Clone)]
pub struct Registry {
    outboxes: Arc<Mutex<HashMap<String, Outbox>>>,
    capacity: usize,
    release: NameRelease,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY, NameRelease::default())
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("sessions", &self.len())
            .field("capacity", &self.capacity)
            .field("release", &self.release)
            .finish()
    }
}

impl Registry {
    /// Create an empty registry whose queues hold `capacity` envelopes.
    pub fn new(capacity: usize, release: NameRelease) -> Self {
        Self {
            outboxes: Arc::new(Mutex::new(HashMap::new())),
            capacity,
            release,
        }
    }

    /// Claim `name` and create its outbound queue.
    ///
    /// The existence check and the insert happen under one lock acquisition,
    /// so two concurrent handshakes for the same name cannot both succeed.
    pub fn register(&self, name: &str) -> Result<Registration, RegistryError> {
        let mut outboxes = self.outboxes.lock();
        if outboxes.contains_key(name) {
            return Err(RegistryError::NameTaken(name.to_string()));
        }
        let (outbox, inbox) = outbox::channel(self.capacity);
        outboxes.insert(name.to_string(), outbox.clone());
        drop(outboxes);

        tracing::debug!(name, "registered");
        Ok(Registration {
            name: name.to_string(),
            outbox,
            inbox,
            registry: self.clone(),
        })
    }

    /// Consistent membership snapshot of every session except `exclude`.
    pub fn snapshot_except(&self, exclude: &str) -> Vec<(String, Outbox)> {
        let outboxes = self.outboxes.lock();
        outboxes
            .iter()
            .filter(|(name, _)| name.as_str() != exclude)
            .map(|(name, outbox)| (name.clone(), outbox.clone()))
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.outboxes.lock().contains_key(name)
    }

    /// Producer handle for a registered name, if present.
    pub fn outbox(&self, name: &str) -> Option<Outbox> {
        self.outboxes.lock().get(name).cloned()
    }

    /// Return all registered names.
    pub fn names(&self) -> Vec<String> {
        self.outboxes.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.outboxes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn release_policy(&self) -> NameRelease {
        self.release
    }

    /// Remove `name` only if it still maps to `outbox`.
    fn release(&self, name: &str, outbox: &Outbox) {
        let mut outboxes = self.outboxes.lock();
        if outboxes.get(name).is_some_and(|current| current.same_queue(outbox)) {
            outboxes.remove(name);
            tracing::debug!(name, "released");
        }
    }
}

/// A claimed name plus the consuming end of its outbound queue.
///
/// Dropping it ends the registration: under [`NameRelease::Release`] the
/// name is removed from the registry; under [`NameRelease::Reserve`] the
/// entry stays but its queue closes, so fan-out skips it.
pub struct Registration {
    name: String,
    outbox: Outbox,
    inbox: mpsc::Receiver<Envelope>,
    registry: Registry,
}

impl Registration {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Next envelope addressed to this session.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.inbox.recv().await
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.inbox.try_recv().ok()
    }

    /// Envelopes dropped because this session's queue was full.
    pub fn dropped(&self) -> u64 {
        self.outbox.dropped()
    }
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.inbox.close();
        if self.registry.release == NameRelease::Release {
            self.registry.release(&self.name, &self.outbox);
        }
    }
}
