//! Last-writer-wins merge policy for per-datastream state.
//!
//! # Merge Rules
//!
//! | Stored | Incoming phenomenon time | Decision |
//! |--------|--------------------------|----------|
//! | none | any | accept |
//! | `t0` | `t > t0` | accept |
//! | `t0` | `t == t0` | discard (no new information, whichever source) |
//! | `t0` | `t < t0` | discard (stale) |
//!
//! Arrival order and source never matter; only phenomenon time does.

use crate::model::Observation;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which producer delivered an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateSource {
    /// Timer-driven or forced REST fetch
    Poll,
    /// MQTT push notification
    Mqtt,
}

impl fmt::Display for UpdateSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateSource::Poll => write!(f, "poll"),
            UpdateSource::Mqtt => write!(f, "mqtt"),
        }
    }
}

/// Last known value of a datastream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    /// Current observation
    pub observation: Observation,
    /// Producer of the current observation
    pub source: UpdateSource,
    /// Wall-clock time the observation was accepted
    pub updated_at: DateTime<Utc>,
}

impl SyncState {
    /// Create a state accepted now.
    #[must_use]
    pub fn new(observation: Observation, source: UpdateSource) -> Self {
        Self {
            observation,
            source,
            updated_at: Utc::now(),
        }
    }
}

/// Outcome of comparing an incoming observation with the stored state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeDecision {
    /// Incoming observation replaces the stored one
    Accept,
    /// Incoming phenomenon time equals the stored one
    DiscardEqual,
    /// Incoming phenomenon time is older than the stored one
    DiscardOlder,
}

impl MergeDecision {
    /// Whether the incoming observation should be stored.
    #[must_use]
    pub fn is_accept(self) -> bool {
        matches!(self, MergeDecision::Accept)
    }
}

/// Decide whether `incoming` replaces `current`.
#[must_use]
pub fn decide(current: Option<&SyncState>, incoming: &Observation) -> MergeDecision {
    let Some(current) = current else {
        return MergeDecision::Accept;
    };

    let stored = current.observation.phenomenon_time.latest();
    let candidate = incoming.phenomenon_time.latest();

    match candidate.cmp(&stored) {
        std::cmp::Ordering::Greater => MergeDecision::Accept,
        std::cmp::Ordering::Equal => MergeDecision::DiscardEqual,
        std::cmp::Ordering::Less => MergeDecision::DiscardOlder,
    }
}
