//! SensorThings endpoint addressing.
//!
//! Builds resource URLs from a versioned base endpoint. Entity keys are
//! rendered with [`EntityId::to_key`] and then percent-encoded so that
//! string identifiers containing spaces or reserved characters survive the
//! trip.
//!
//! # References
//!
//! - OGC 18-088: SensorThings API Part 1: Sensing Version 1.1, §9 (resource path)

use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use sta_bridge_core::EntityId;
use std::fmt;
use url::Url;

/// Characters that must be percent-encoded inside an entity key.
/// Parentheses and single quotes are part of the key syntax and kept.
const KEY_ESCAPE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'`')
    .add(b'?')
    .add(b'{')
    .add(b'}')
    .add(b'/')
    .add(b'\\');

/// Query selecting the most recent observation of a datastream.
pub const LATEST_OBSERVATION_QUERY: &str = "$orderby=phenomenonTime%20desc&$top=1";

/// A validated SensorThings base endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    base: String,
    host: String,
    version: String,
}

impl Endpoint {
    /// Parse and validate an endpoint URL.
    ///
    /// The URL must be `http` or `https`, have a host, and end with a
    /// version segment such as `v1.1`. Trailing slashes are ignored.
    ///
    /// # Errors
    ///
    /// Returns error if any of the above does not hold.
    pub fn parse(input: &str) -> Result<Self, EndpointError> {
        let trimmed = input.trim().trim_end_matches('/');
        let url = Url::parse(trimmed)
            .map_err(|e| EndpointError::InvalidUrl(format!("{trimmed}: {e}")))?;

        match url.scheme() {
            "http" | "https" => {}
            scheme => return Err(EndpointError::UnsupportedScheme(scheme.to_string())),
        }

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| EndpointError::InvalidUrl(format!("{trimmed}: missing host")))?
            .to_string();

        if url.query().is_some() || url.fragment().is_some() {
            return Err(EndpointError::InvalidUrl(format!(
                "{trimmed}: query and fragment are not allowed"
            )));
        }

        let version = url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|segment| is_version_segment(segment))
            .ok_or_else(|| EndpointError::MissingVersion(trimmed.to_string()))?
            .to_string();

        Ok(Self {
            base: trimmed.to_string(),
            host,
            version,
        })
    }

    /// The base URL without trailing slash.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.base
    }

    /// Host name of the endpoint.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// API version segment (e.g. `v1.1`).
    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// URL of the Things collection.
    #[must_use]
    pub fn things_url(&self) -> String {
        format!("{}/Things", self.base)
    }

    /// URL of the Datastreams of a Thing.
    #[must_use]
    pub fn datastreams_url(&self, thing_id: &EntityId) -> String {
        format!("{}/Things({})/Datastreams", self.base, encode_key(thing_id))
    }

    /// URL returning the latest Observation of a Datastream.
    #[must_use]
    pub fn latest_observation_url(&self, datastream_id: &EntityId) -> String {
        format!(
            "{}/Datastreams({})/Observations?{LATEST_OBSERVATION_QUERY}",
            self.base,
            encode_key(datastream_id)
        )
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.base)
    }
}

/// Render and percent-encode an entity key for use in a resource path.
#[must_use]
pub fn encode_key(id: &EntityId) -> String {
    utf8_percent_encode(&id.to_key(), KEY_ESCAPE).to_string()
}

/// `v<digits>(.<digits>)*`
fn is_version_segment(segment: &str) -> bool {
    let Some(rest) = segment.strip_prefix('v') else {
        return false;
    };
    !rest.is_empty()
        && rest
            .split('.')
            .all(|part| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit()))
}

/// Errors validating an endpoint URL.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EndpointError {
    /// Not a parseable absolute URL
    #[error("invalid endpoint URL: {0}")]
    InvalidUrl(String),
    /// Scheme other than http/https
    #[error("unsupported scheme '{0}', expected http or https")]
    UnsupportedScheme(String),
    /// Path does not end in a version segment
    #[error("endpoint URL must end with a version segment such as /v1.1: {0}")]
    MissingVersion(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_frost_url() {
        let ep = Endpoint::parse("http://192.168.1.100:8080/FROST-Server/v1.1/").unwrap();
        assert_eq!(ep.as_str(), "http://192.168.1.100:8080/FROST-Server/v1.1");
        assert_eq!(ep.host(), "192.168.1.100");
        assert_eq!(ep.version(), "v1.1");
    }

    #[test]
    fn version_segment_required() {
        let err = Endpoint::parse("http://example.com/FROST-Server").unwrap_err();
        assert!(matches!(err, EndpointError::MissingVersion(_)));

        let err = Endpoint::parse("http://example.com/").unwrap_err();
        assert!(matches!(err, EndpointError::MissingVersion(_)));
    }

    #[test]
    fn unsupported_scheme() {
        let err = Endpoint::parse("ftp://example.com/v1.1").unwrap_err();
        assert_eq!(err, EndpointError::UnsupportedScheme("ftp".to_string()));
    }

    #[test]
    fn not_a_url() {
        assert!(matches!(
            Endpoint::parse("example.com/v1.1"),
            Err(EndpointError::InvalidUrl(_))
        ));
    }

    #[test]
    fn version_segment_shapes() {
        assert!(is_version_segment("v1.0"));
        assert!(is_version_segment("v2"));
        assert!(!is_version_segment("v"));
        assert!(!is_version_segment("v1."));
        assert!(!is_version_segment("version1"));
    }

    #[test]
    fn resource_urls() {
        let ep = Endpoint::parse("https://sta.example.org/v1.1").unwrap();

        assert_eq!(ep.things_url(), "https://sta.example.org/v1.1/Things");
        assert_eq!(
            ep.datastreams_url(&EntityId::Number(3)),
            "https://sta.example.org/v1.1/Things(3)/Datastreams"
        );
        assert_eq!(
            ep.latest_observation_url(&EntityId::from("room 1")),
            "https://sta.example.org/v1.1/Datastreams('room%201')/Observations?$orderby=phenomenonTime%20desc&$top=1"
        );
    }
}
