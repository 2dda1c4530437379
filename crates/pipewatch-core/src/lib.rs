//! # pipewatch-core
//!
//! Core types and the broadcast/replay engine for pipewatch.
//!
//! This crate holds everything transport-free: the pipeline event model, the
//! bounded per-artifact replay buffers, the subscriber registry, and the
//! [`StreamHub`] service that ties them together for fan-out dispatch.

pub mod error;
pub mod hub;
pub mod model;
pub mod registry;
pub mod replay;

// Re-export commonly used types at crate root
pub use error::{Error, Result};
pub use hub::{Registration, StreamHub};
pub use model::{FilterKey, PipelineEvent, SourceKey};
pub use registry::{Connection, DispatchTarget, EventSink, SubscriberRegistry};
pub use replay::{ReplayBuffers, REPLAY_BUFFER_CAPACITY};
