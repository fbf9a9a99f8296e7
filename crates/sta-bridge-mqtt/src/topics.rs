//! MQTT topic scheme of the SensorThings MQTT extension.
//!
//! Topic structure: `{version}/Datastreams({key})/Observations`, where
//! `key` is the OData key literal of the datastream (`5`, `'abc'`).
//!
//! # References
//!
//! - OGC 18-088: SensorThings API Part 1: Sensing Version 1.1, §14.2 (receive updates)

use serde::{Deserialize, Serialize};
use sta_bridge_core::{DatastreamId, EntityId};

/// What an observation topic refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicTarget {
    /// Observations of a single datastream
    Datastream(DatastreamId),
    /// All observations of the service
    AllObservations,
}

/// Topic scheme for one API version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicScheme {
    /// API version segment (e.g. `v1.1`)
    pub version: String,
}

impl Default for TopicScheme {
    fn default() -> Self {
        Self::new("v1.1")
    }
}

impl TopicScheme {
    /// Create a topic scheme for the given API version.
    #[must_use]
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
        }
    }

    /// Topic carrying new observations of a datastream.
    ///
    /// # Errors
    ///
    /// Returns error if the key contains a topic separator or wildcard,
    /// which would make the subscription filter invalid or too broad.
    pub fn observations(&self, datastream_id: &DatastreamId) -> Result<String, TopicError> {
        let key = datastream_id.to_key();
        if key.contains(['/', '+', '#', '\0']) {
            return Err(TopicError::InvalidKey(key));
        }
        Ok(format!("{}/Datastreams({key})/Observations", self.version))
    }

    /// Topic carrying every new observation of the service.
    #[must_use]
    pub fn all_observations(&self) -> String {
        format!("{}/Observations", self.version)
    }

    /// Parse an observation topic.
    ///
    /// A trailing query (`?$select=...`) is ignored.
    #[must_use]
    pub fn parse(&self, topic: &str) -> Option<TopicTarget> {
        let path = topic.split_once('?').map_or(topic, |(path, _)| path);
        let remainder = path.strip_prefix(&self.version)?.strip_prefix('/')?;

        if remainder == "Observations" {
            return Some(TopicTarget::AllObservations);
        }

        let key = remainder
            .strip_prefix("Datastreams(")?
            .strip_suffix(")/Observations")?;
        if key.is_empty() {
            return None;
        }

        Some(TopicTarget::Datastream(EntityId::from_key(key)))
    }
}

/// Errors building topics.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopicError {
    /// Datastream key cannot appear in a topic filter
    #[error("datastream key {0} contains an MQTT separator or wildcard")]
    InvalidKey(String),
}
