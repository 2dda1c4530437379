//! Pipeline event model and key normalization.
//!
//! A [`PipelineEvent`] is a fact about a pipeline run, immutable once created.
//! The wire representation uses camelCase field names and serializes absent
//! optional fields as explicit nulls, so every relayed message carries the
//! full shape:
//!
//! ```text
//! {id, receivedArtifact, timestamp, eventType, eventMessage, userEmail,
//!  userLanguage, userLevel, queueRoutingKey, additionalInfo, audioRequestID}
//! ```
//!
//! Artifact names arrive in whatever casing the emitting subsystem uses.
//! [`SourceKey`] and [`FilterKey`] are the normalized (upper-cased) forms used
//! for buffer and registry keys, with sentinels for blank input: an event with
//! no usable artifact lands under `"UNKNOWN"`, and a subscriber with no filter
//! observes the wildcard channel `"ALL"`.

use std::borrow::Borrow;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// One pipeline-processing event relayed to dashboard observers.
///
/// Timestamps are caller-supplied Unix seconds and are not validated for
/// monotonicity. All optional context fields are independently nullable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineEvent {
    /// Opaque identifier; absent for locally synthesized events.
    #[serde(default)]
    pub id: Option<String>,
    /// Raw name of the emitting subsystem, as supplied by the caller. May be
    /// empty; see [`SourceKey::normalize`].
    pub received_artifact: String,
    /// Unix timestamp (seconds) of the event.
    pub timestamp: i64,
    /// Short category string.
    pub event_type: String,
    /// Free-text description.
    pub event_message: String,
    #[serde(default)]
    pub user_email: Option<String>,
    #[serde(default)]
    pub user_language: Option<String>,
    /// Non-negative user level, when available.
    #[serde(default)]
    pub user_level: Option<u32>,
    /// Routing key of the queue the event was received from.
    #[serde(default)]
    pub queue_routing_key: Option<String>,
    /// Open-ended supplementary data.
    #[serde(default)]
    pub additional_info: Option<serde_json::Map<String, serde_json::Value>>,
    /// ID of the audio request this event concerns. Mandatory.
    #[serde(rename = "audioRequestID")]
    pub audio_request_id: String,
}

impl PipelineEvent {
    /// Serialize to the wire representation shared by all subscribers.
    pub fn to_wire(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Normalized storage key for the subsystem an event came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceKey(String);

impl SourceKey {
    /// Sentinel for events whose artifact name is absent or blank.
    pub const UNKNOWN: &'static str = "UNKNOWN";

    /// Normalize a raw artifact name for internal buffer storage.
    ///
    /// Differently-cased spellings of the same artifact collapse to one key.
    pub fn normalize(raw: Option<&str>) -> Self {
        match raw {
            Some(value) if !value.trim().is_empty() => Self(value.to_uppercase()),
            _ => Self(Self::UNKNOWN.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The filter key a direct subscriber to this source would be registered
    /// under. Never the wildcard: blank input already normalized to `UNKNOWN`.
    pub fn as_filter(&self) -> FilterKey {
        FilterKey(self.0.clone())
    }
}

impl Borrow<str> for SourceKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Normalized key assigning a subscriber to a channel: a specific artifact,
/// or the wildcard meaning "every source's events".
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FilterKey(String);

impl FilterKey {
    /// Wildcard sentinel for subscribers that observe all sources.
    pub const ALL: &'static str = "ALL";

    /// Normalize a subscriber's requested artifact filter.
    pub fn normalize(raw: Option<&str>) -> Self {
        match raw {
            Some(value) if !value.trim().is_empty() => Self(value.to_uppercase()),
            _ => Self(Self::ALL.to_string()),
        }
    }

    pub fn wildcard() -> Self {
        Self(Self::ALL.to_string())
    }

    pub fn is_wildcard(&self) -> bool {
        self.0 == Self::ALL
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for FilterKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FilterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
