//! Live subscriber registry.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::model::{FilterKey, SourceKey};

/// The transport seam: anything that can be handed a JSON message and can
/// fail. The engine never sees framing, handshakes, or socket types.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn send_json(&self, payload: &serde_json::Value) -> Result<()>;
}

/// One live subscriber session. Identity is the UUIDv7 id; the sink is shared
/// with whichever task drives the underlying transport.
///
/// A connection is bound to exactly one filter key for its lifetime. A
/// subscriber wanting a different filter reconnects.
#[derive(Clone)]
pub struct Connection {
    id: Uuid,
    sink: Arc<dyn EventSink>,
}

impl Connection {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            id: Uuid::now_v7(),
            sink,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub async fn send(&self, payload: &serde_json::Value) -> Result<()> {
        self.sink.send_json(payload).await
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection").field("id", &self.id).finish()
    }
}

/// A fan-out target together with the filter key it is registered under, so a
/// failed send can be deregistered from its exact membership.
#[derive(Debug, Clone)]
pub struct DispatchTarget {
    pub registered_under: FilterKey,
    pub connection: Connection,
}

/// Maps filter keys to the live connections observing them.
///
/// Channels with no remaining connections are dropped. Not synchronized;
/// [`crate::StreamHub`] owns the lock.
#[derive(Debug, Default)]
pub struct SubscriberRegistry {
    channels: HashMap<FilterKey, Vec<Connection>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `connection` to the channel for `filter`. Idempotent if the
    /// connection is already present.
    pub fn register(&mut self, filter: &FilterKey, connection: Connection) {
        let channel = self.channels.entry(filter.clone()).or_default();
        if channel.iter().any(|existing| existing.id == connection.id) {
            return;
        }
        channel.push(connection);
    }

    /// Remove the connection with `id` from the channel for `filter`, dropping
    /// the channel if it empties. Removing an absent connection is a no-op;
    /// disconnection cleanup is safe to run more than once.
    pub fn remove(&mut self, filter: &FilterKey, id: Uuid) {
        let Some(channel) = self.channels.get_mut(filter) else {
            return;
        };
        channel.retain(|connection| connection.id != id);
        if channel.is_empty() {
            self.channels.remove(filter);
        }
    }

    /// All connections that should receive an event from `source`: direct
    /// subscribers plus wildcard subscribers, deduplicated by connection
    /// identity (direct membership wins).
    pub fn targets_for(&self, source: &SourceKey) -> Vec<DispatchTarget> {
        let mut targets: Vec<DispatchTarget> = Vec::new();
        let mut seen: Vec<Uuid> = Vec::new();

        let channels = [
            (source.as_filter(), self.channels.get(source.as_str())),
            (FilterKey::wildcard(), self.channels.get(FilterKey::ALL)),
        ];
        for (registered_under, channel) in channels {
            for connection in channel.into_iter().flatten() {
                if seen.contains(&connection.id) {
                    continue;
                }
                seen.push(connection.id);
                targets.push(DispatchTarget {
                    registered_under: registered_under.clone(),
                    connection: connection.clone(),
                });
            }
        }
        targets
    }

    /// Total live connections across all channels.
    pub fn connection_count(&self) -> usize {
        self.channels.values().map(Vec::len).sum()
    }
}
