//! SensorThings entity model.
//!
//! Wire shapes follow the OGC SensorThings JSON encoding: identifiers are
//! carried in `@iot.id` and may be integers or strings depending on the
//! server.

use crate::time::{parse_instant, PhenomenonTime, TimeError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// A SensorThings `@iot.id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntityId {
    /// Integer identifier (FROST default)
    Number(i64),
    /// String identifier
    Text(String),
}

/// Identifier of a Thing.
pub type ThingId = EntityId;

/// Identifier of a Datastream.
pub type DatastreamId = EntityId;

impl EntityId {
    /// Render the identifier as an OData key literal.
    ///
    /// Integers are bare, strings are single-quoted with embedded quotes
    /// doubled: `5`, `'sensor''s'`.
    #[must_use]
    pub fn to_key(&self) -> String {
        match self {
            Self::Number(n) => n.to_string(),
            Self::Text(s) => format!("'{}'", s.replace('\'', "''")),
        }
    }

    /// Parse an OData key literal back into an identifier.
    #[must_use]
    pub fn from_key(key: &str) -> Self {
        let key = key.trim();
        if key.len() >= 2 && key.starts_with('\'') && key.ends_with('\'') {
            return Self::Text(key[1..key.len() - 1].replace("''", "'"));
        }
        key.parse::<i64>()
            .map_or_else(|_| Self::Text(key.to_string()), Self::Number)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for EntityId {
    fn from(value: i64) -> Self {
        Self::Number(value)
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

/// A sensing device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thing {
    /// Endpoint-scoped identifier
    #[serde(rename = "@iot.id")]
    pub id: ThingId,
    /// Display name
    #[serde(default)]
    pub name: String,
    /// Free-form description
    #[serde(default)]
    pub description: String,
    /// Opaque key/value properties
    #[serde(default)]
    pub properties: Map<String, Value>,
}

impl Thing {
    /// Display name, falling back to `Thing {id}`.
    #[must_use]
    pub fn display_name(&self) -> String {
        if self.name.is_empty() {
            format!("Thing {}", self.id)
        } else {
            self.name.clone()
        }
    }

    /// A string property, if present.
    #[must_use]
    pub fn property_str(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(Value::as_str)
    }
}

/// Unit of measurement of a Datastream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitOfMeasurement {
    /// Unit name (e.g. "degree Celsius")
    #[serde(default)]
    pub name: Option<String>,
    /// Unit symbol (e.g. "°C")
    #[serde(default)]
    pub symbol: Option<String>,
    /// Definition URI
    #[serde(default)]
    pub definition: Option<String>,
}

/// A named time series belonging to a Thing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Datastream {
    /// Endpoint-scoped identifier
    pub id: DatastreamId,
    /// Display name
    pub name: String,
    /// Description
    pub description: String,
    /// Unit of measurement
    pub unit: UnitOfMeasurement,
    /// Owning Thing
    pub thing_id: ThingId,
}

impl Datastream {
    /// Unit symbol, or an empty string.
    #[must_use]
    pub fn unit_symbol(&self) -> &str {
        self.unit.symbol.as_deref().unwrap_or_default()
    }
}

/// Datastream as it appears on the wire, without its owning Thing.
#[derive(Debug, Clone, Deserialize)]
pub struct DatastreamEntity {
    /// `@iot.id`
    #[serde(rename = "@iot.id")]
    pub id: DatastreamId,
    /// Name
    #[serde(default)]
    pub name: Option<String>,
    /// Description
    #[serde(default)]
    pub description: Option<String>,
    /// Unit of measurement (nullable on some servers)
    #[serde(rename = "unitOfMeasurement", default)]
    pub unit_of_measurement: Option<UnitOfMeasurement>,
}

impl DatastreamEntity {
    /// Attach the owning Thing.
    #[must_use]
    pub fn into_datastream(self, thing_id: ThingId) -> Datastream {
        let name = self
            .name
            .unwrap_or_else(|| format!("Datastream {}", self.id));
        Datastream {
            id: self.id,
            name,
            description: self.description.unwrap_or_default(),
            unit: self.unit_of_measurement.unwrap_or_default(),
            thing_id,
        }
    }
}

/// The result of an Observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ObservationResult {
    /// Numeric reading
    Number(f64),
    /// Boolean reading
    Boolean(bool),
    /// Textual or categorical reading
    Text(String),
    /// Any other JSON result (objects, arrays)
    Json(Value),
}

impl ObservationResult {
    /// Numeric value, if the result is a number.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }
}

impl fmt::Display for ObservationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Boolean(b) => write!(f, "{b}"),
            Self::Text(s) => f.write_str(s),
            Self::Json(v) => write!(f, "{v}"),
        }
    }
}

/// A single immutable reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// Observation `@iot.id`, when the server supplied one
    pub id: Option<EntityId>,
    /// Datastream this reading belongs to
    pub datastream_id: DatastreamId,
    /// The reading
    pub result: ObservationResult,
    /// When the phenomenon occurred
    pub phenomenon_time: PhenomenonTime,
    /// When the result was produced
    pub result_time: Option<DateTime<Utc>>,
}

/// Reference to an expanded related entity (`{"@iot.id": ..}`).
#[derive(Debug, Clone, Deserialize)]
pub struct EntityRef {
    /// `@iot.id`
    #[serde(rename = "@iot.id")]
    pub id: EntityId,
}

/// Observation as it appears on the wire.
#[derive(Debug, Clone, Deserialize)]
pub struct ObservationEntity {
    /// `@iot.id`
    #[serde(rename = "@iot.id", default)]
    pub id: Option<EntityId>,
    /// Raw phenomenon time
    #[serde(rename = "phenomenonTime", default)]
    pub phenomenon_time: Option<String>,
    /// Raw result time
    #[serde(rename = "resultTime", default)]
    pub result_time: Option<String>,
    /// Result (null is treated as missing)
    #[serde(default)]
    pub result: Option<ObservationResult>,
    /// Expanded Datastream, when requested
    #[serde(rename = "Datastream", default)]
    pub datastream: Option<EntityRef>,
}

impl ObservationEntity {
    /// Convert into an [`Observation`].
    ///
    /// `datastream_id` takes precedence over an expanded `Datastream` in the
    /// payload.
    ///
    /// # Errors
    ///
    /// Returns error if the datastream, result, or phenomenon time is
    /// missing or malformed.
    pub fn into_observation(
        self,
        datastream_id: Option<DatastreamId>,
    ) -> Result<Observation, ModelError> {
        let datastream_id = datastream_id
            .or_else(|| self.datastream.map(|d| d.id))
            .ok_or(ModelError::MissingField("Datastream"))?;
        let result = self.result.ok_or(ModelError::MissingField("result"))?;
        let raw_time = self
            .phenomenon_time
            .ok_or(ModelError::MissingField("phenomenonTime"))?;
        let phenomenon_time = PhenomenonTime::parse(&raw_time)?;
        let result_time = self
            .result_time
            .as_deref()
            .map(parse_instant)
            .transpose()?;

        Ok(Observation {
            id: self.id,
            datastream_id,
            result,
            phenomenon_time,
            result_time,
        })
    }
}

/// Errors converting wire entities into the model.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ModelError {
    /// Required field absent or null
    #[error("missing required field '{0}'")]
    MissingField(&'static str),
    /// Malformed timestamp
    #[error(transparent)]
    Time(#[from] TimeError),
}
