//! The broadcast/replay engine.
//!
//! [`StreamHub`] is the owned service object constructed once at process
//! start and injected into the ingestion handler and the session acceptor.
//! It holds the two shared collections (replay buffers and subscriber
//! registry), each behind its own lock, and drives fan-out dispatch:
//!
//! ```text
//! publish(event) → buffer append → resolve targets → send to each → prune failures
//! ```
//!
//! Delivery is fire-and-forget: best-effort, at-most-once per live
//! subscriber, no retries. A failed send only costs that subscriber its
//! registration; it never surfaces to the publisher or delays other
//! subscribers. The bounded replay buffer is the only durability promised.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use uuid::Uuid;

use crate::model::{FilterKey, PipelineEvent, SourceKey};
use crate::registry::{Connection, SubscriberRegistry};
use crate::replay::ReplayBuffers;

/// Shared broadcast state: bounded per-source history plus the live
/// subscriber registry.
///
/// Both locks guard short map operations only. Network writes always happen
/// outside them, so a slow subscriber cannot stall ingestion or another
/// session's registration.
#[derive(Debug, Default)]
pub struct StreamHub {
    buffers: Mutex<ReplayBuffers>,
    registry: Mutex<SubscriberRegistry>,
}

// Poison only marks a panic elsewhere while the guard was held; both maps
// stay coherent for single-step operations, and publish must never raise.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl StreamHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer `event` and relay it to every matching live subscriber.
    ///
    /// The event is buffered before fan-out, so buffer state is authoritative
    /// even with zero subscribers connected. Sends run concurrently and each
    /// failure is contained to its own target: the target is deregistered
    /// under the exact filter key it was found under, and everyone else still
    /// gets the event.
    ///
    /// A subscriber registered before the target snapshot is taken receives
    /// the event; one removed before the snapshot does not. Nothing stronger
    /// is promised.
    pub async fn publish(&self, event: PipelineEvent) {
        let source = SourceKey::normalize(Some(event.received_artifact.as_str()));

        let buffered = event.clone();
        lock(&self.buffers).append(&source, buffered);

        let targets = lock(&self.registry).targets_for(&source);
        if targets.is_empty() {
            return;
        }

        // Serialize once; every target gets the same wire payload.
        let payload = match event.to_wire() {
            Ok(payload) => payload,
            Err(err) => {
                tracing::error!(source = %source, error = %err, "Failed to serialize pipeline event");
                return;
            }
        };

        tracing::debug!(
            source = %source,
            targets = targets.len(),
            "Relaying pipeline event"
        );

        let results = futures::future::join_all(
            targets
                .iter()
                .map(|target| target.connection.send(&payload)),
        )
        .await;

        let mut registry = lock(&self.registry);
        for (target, result) in targets.iter().zip(&results) {
            let Err(err) = result else { continue };
            if err.is_transport() {
                tracing::debug!(
                    connection = %target.connection.id(),
                    channel = %target.registered_under,
                    error = %err,
                    "Dropping subscriber after failed send"
                );
            } else {
                tracing::warn!(
                    connection = %target.connection.id(),
                    channel = %target.registered_under,
                    error = %err,
                    "Unexpected error relaying event; dropping subscriber"
                );
            }
            registry.remove(&target.registered_under, target.connection.id());
        }
    }

    /// Register `connection` under `filter` and return a guard that
    /// deregisters it when dropped.
    ///
    /// Sessions hold the guard for their whole lifetime; orderly disconnect,
    /// transport error, and task cancellation all release the registration
    /// through the same path.
    pub fn register(self: Arc<Self>, filter: FilterKey, connection: Connection) -> Registration {
        let id = connection.id();
        lock(&self.registry).register(&filter, connection);
        Registration {
            hub: self,
            filter,
            id,
        }
    }

    /// Deregister a connection. Safe to call for a connection already gone.
    pub fn remove(&self, filter: &FilterKey, id: Uuid) {
        lock(&self.registry).remove(filter, id);
    }

    /// Copy of the recent history visible to `filter`, for catch-up backlog.
    /// See [`ReplayBuffers::snapshot`] for ordering.
    pub fn snapshot(&self, filter: &FilterKey) -> Vec<PipelineEvent> {
        lock(&self.buffers).snapshot(filter)
    }

    /// Live connections across all channels.
    pub fn subscriber_count(&self) -> usize {
        lock(&self.registry).connection_count()
    }

    /// Sources with buffered history.
    pub fn source_count(&self) -> usize {
        lock(&self.buffers).source_count()
    }
}

/// RAII registry membership for one subscriber session.
pub struct Registration {
    hub: Arc<StreamHub>,
    filter: FilterKey,
    id: Uuid,
}

impl Registration {
    pub fn filter(&self) -> &FilterKey {
        &self.filter
    }

    pub fn connection_id(&self) -> Uuid {
        self.id
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.hub.remove(&self.filter, self.id);
    }
}
