//! Observation payload parsing.

use crate::topics::{TopicScheme, TopicTarget};
use sta_bridge_core::model::{ModelError, ObservationEntity};
use sta_bridge_core::Observation;

/// Parse an Observation from an MQTT topic and payload.
///
/// The datastream is taken from the topic when it names one, otherwise
/// from an expanded `Datastream` in the payload.
///
/// # Errors
///
/// Returns error if the topic is not an observation topic, the payload is
/// not JSON, or a required field is missing or malformed.
pub fn parse_observation(
    scheme: &TopicScheme,
    topic: &str,
    payload: &[u8],
) -> Result<Observation, PayloadError> {
    let datastream_id = match scheme.parse(topic) {
        Some(TopicTarget::Datastream(id)) => Some(id),
        Some(TopicTarget::AllObservations) => None,
        None => return Err(PayloadError::UnknownTopic(topic.to_string())),
    };

    let entity: ObservationEntity =
        serde_json::from_slice(payload).map_err(|e| PayloadError::Json(e.to_string()))?;

    Ok(entity.into_observation(datastream_id)?)
}

/// Errors parsing an MQTT observation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PayloadError {
    /// Topic does not carry observations
    #[error("not an observation topic: {0}")]
    UnknownTopic(String),
    /// Payload is not valid JSON
    #[error("invalid JSON payload: {0}")]
    Json(String),
    /// Payload lacks a required field
    #[error("invalid observation: {0}")]
    Invalid(#[from] ModelError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use sta_bridge_core::{EntityId, ObservationResult};

    #[test]
    fn datastream_from_topic() {
        let payload = br#"{"@iot.id": 9001, "result": 21.5, "phenomenonTime": "2024-01-01T12:00:00Z"}"#;

        let obs = parse_observation(
            &TopicScheme::default(),
            "v1.1/Datastreams(7)/Observations",
            payload,
        )
        .unwrap();

        assert_eq!(obs.datastream_id, EntityId::Number(7));
        assert_eq!(obs.id, Some(EntityId::Number(9001)));
        assert_eq!(obs.result, ObservationResult::Number(21.5));
    }

    #[test]
    fn datastream_from_expanded_payload() {
        let payload = br#"{"@iot.id": 1, "result": "open",
            "phenomenonTime": "2024-01-01T12:00:00Z",
            "Datastream": {"@iot.id": "door-1"}}"#;

        let obs =
            parse_observation(&TopicScheme::default(), "v1.1/Observations", payload).unwrap();

        assert_eq!(obs.datastream_id, EntityId::from("door-1"));
        assert_eq!(obs.result, ObservationResult::Text("open".into()));
    }

    #[test]
    fn malformed_payloads() {
        let scheme = TopicScheme::default();
        let topic = "v1.1/Datastreams(7)/Observations";

        assert!(matches!(
            parse_observation(&scheme, topic, b"not json"),
            Err(PayloadError::Json(_))
        ));
        assert!(matches!(
            parse_observation(&scheme, topic, br#"{"result": 1}"#),
            Err(PayloadError::Invalid(ModelError::MissingField("phenomenonTime")))
        ));
        assert!(matches!(
            parse_observation(
                &scheme,
                "v1.1/Observations",
                br#"{"result": 1, "phenomenonTime": "2024-01-01T12:00:00Z"}"#
            ),
            Err(PayloadError::Invalid(ModelError::MissingField("Datastream")))
        ));
        assert!(matches!(
            parse_observation(&scheme, "v1.1/Things(1)", b"{}"),
            Err(PayloadError::UnknownTopic(_))
        ));
    }
}
