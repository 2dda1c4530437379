//! Bounded per-artifact replay buffers.
//!
//! One FIFO history per [`SourceKey`], capped at [`REPLAY_BUFFER_CAPACITY`]
//! entries. Newly-connecting observers pull a snapshot to catch up without
//! missing recent context; live delivery itself is best-effort and never
//! replayed to an already-connected subscriber.
//!
//! Buffers are created lazily on the first event for a source and never
//! destroyed. Source keys come from a small, effectively-fixed set of pipeline
//! stages, so key growth is bounded in practice.

use std::collections::{HashMap, VecDeque};

use crate::model::{FilterKey, PipelineEvent, SourceKey};

/// Maximum events retained per source.
pub const REPLAY_BUFFER_CAPACITY: usize = 50;

/// Per-source bounded FIFO histories.
#[derive(Debug, Default)]
pub struct ReplayBuffers {
    buffers: HashMap<SourceKey, VecDeque<PipelineEvent>>,
}

impl ReplayBuffers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `event` to the tail of the buffer for `source`, creating the
    /// buffer if absent. Beyond capacity the oldest entry is evicted.
    pub fn append(&mut self, source: &SourceKey, event: PipelineEvent) {
        let buffer = self
            .buffers
            .entry(source.clone())
            .or_insert_with(|| VecDeque::with_capacity(REPLAY_BUFFER_CAPACITY));
        buffer.push_back(event);
        while buffer.len() > REPLAY_BUFFER_CAPACITY {
            buffer.pop_front();
        }
    }

    /// Copy of the recent events visible to `filter`.
    ///
    /// For the wildcard this merges every source's buffer sorted ascending by
    /// timestamp. The sort is stable, so within one source arrival order is
    /// preserved under equal timestamps; across sources the relative order of
    /// equal timestamps follows map iteration order and is not a contract.
    ///
    /// For a specific source this is that buffer in arrival order, or empty if
    /// the source has never produced an event.
    pub fn snapshot(&self, filter: &FilterKey) -> Vec<PipelineEvent> {
        if filter.is_wildcard() {
            let mut merged: Vec<PipelineEvent> = self
                .buffers
                .values()
                .flat_map(|buffer| buffer.iter().cloned())
                .collect();
            merged.sort_by_key(|event| event.timestamp);
            return merged;
        }
        self.buffers
            .get(filter.as_str())
            .map(|buffer| buffer.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of sources that have produced at least one event.
    pub fn source_count(&self) -> usize {
        self.buffers.len()
    }
}
