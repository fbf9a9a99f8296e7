//! HTTP client for the SensorThings REST API.
//!
//! Provides typed access to the handful of resources the bridge needs.
//! Every call carries the configured timeout; retries are left to the
//! caller.

use crate::endpoint::Endpoint;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};
use sta_bridge_core::model::{DatastreamEntity, ObservationEntity};
use sta_bridge_core::{
    Datastream, DatastreamId, FetchError, Observation, ObservationFetcher, Thing, ThingId,
};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

/// Upper bound on `@iot.nextLink` pages followed for a single collection.
pub const MAX_PAGES: usize = 1000;

/// Conformance key under which servers advertise MQTT observation delivery.
const MQTT_CONFORMANCE_MARKER: &str = "create-observations-via-mqtt";

/// SensorThings client configuration.
#[derive(Debug, Clone)]
pub struct StaClientConfig {
    /// Versioned base endpoint
    pub endpoint: Endpoint,
    /// Per-request timeout
    pub timeout: Duration,
    /// Optional bearer token for authentication
    pub bearer_token: Option<String>,
    /// Custom CA certificate path for self-signed server certs (PEM format)
    pub ca_cert_path: Option<PathBuf>,
}

impl StaClientConfig {
    /// Configuration with the default 10 second timeout.
    #[must_use]
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            timeout: Duration::from_secs(10),
            bearer_token: None,
            ca_cert_path: None,
        }
    }
}

/// HTTP client for SensorThings operations.
#[derive(Debug, Clone)]
pub struct StaClient {
    client: Client,
    config: StaClientConfig,
}

impl StaClient {
    /// Create a new SensorThings client.
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be created, or if the CA
    /// certificate cannot be read or parsed.
    pub fn new(config: StaClientConfig) -> Result<Self, ClientError> {
        let mut builder = Client::builder().timeout(config.timeout);

        if config.endpoint.as_str().starts_with("https://") {
            builder = builder.use_rustls_tls();

            if let Some(ca_path) = &config.ca_cert_path {
                let ca_cert = fs::read(ca_path).map_err(|e| {
                    ClientError::Init(format!(
                        "failed to read CA certificate {}: {e}",
                        ca_path.display()
                    ))
                })?;
                let cert = reqwest::Certificate::from_pem(&ca_cert).map_err(|e| {
                    ClientError::Init(format!("failed to parse CA certificate: {e}"))
                })?;
                builder = builder.add_root_certificate(cert);
                tracing::debug!(ca_path = %ca_path.display(), "Loaded custom CA certificate");
            }
        }

        let client = builder
            .build()
            .map_err(|e| ClientError::Init(e.to_string()))?;

        Ok(Self { client, config })
    }

    /// The endpoint this client talks to.
    #[must_use]
    pub fn endpoint(&self) -> &Endpoint {
        &self.config.endpoint
    }

    /// GET a URL and decode the JSON body.
    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, ClientError> {
        let mut request = self.client.get(url).header("Accept", "application/json");
        if let Some(token) = &self.config.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ClientError::Network(format!("timed out after {:?}", self.config.timeout))
            } else {
                ClientError::Network(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::Status {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| ClientError::Network(e.to_string()))?;

        serde_json::from_slice(&body).map_err(|e| ClientError::Parse(e.to_string()))
    }

    /// Follow `@iot.nextLink` from `first_url` until the collection ends.
    async fn get_collection<T: DeserializeOwned>(
        &self,
        first_url: &str,
    ) -> Result<Vec<T>, ClientError> {
        let mut items = Vec::new();
        let mut next = Some(first_url.to_string());
        let mut pages = 0;

        while let Some(url) = next.take() {
            if pages == MAX_PAGES {
                return Err(ClientError::Parse(format!(
                    "collection {first_url} exceeded {MAX_PAGES} pages"
                )));
            }
            pages += 1;

            tracing::debug!(url, page = pages, "GET collection page");

            let page: Collection<T> = self.get_json(&url).await?;
            items.extend(page.value);

            next = page
                .next_link
                .map(|link| resolve_link(&url, &link))
                .transpose()?;
        }

        Ok(items)
    }

    /// Fetch the root service document.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Parse`] if the body is not a service document
    /// listing at least the `Things` and `Datastreams` collections.
    pub async fn fetch_service_document(&self) -> Result<ServiceDocument, ClientError> {
        let url = self.config.endpoint.as_str();
        tracing::debug!(url, "GET service document");

        let document: ServiceDocument = self.get_json(url).await?;
        for required in ["Things", "Datastreams"] {
            if document.resource(required).is_none() {
                return Err(ClientError::Parse(format!(
                    "service document does not list {required}"
                )));
            }
        }
        Ok(document)
    }

    /// Fetch all Things.
    ///
    /// # Errors
    ///
    /// Returns error on network, status, or parse failures.
    pub async fn fetch_things(&self) -> Result<Vec<Thing>, ClientError> {
        self.get_collection(&self.config.endpoint.things_url())
            .await
    }

    /// Fetch all Datastreams of a Thing.
    ///
    /// # Errors
    ///
    /// Returns error on network, status, or parse failures.
    pub async fn fetch_datastreams(
        &self,
        thing_id: &ThingId,
    ) -> Result<Vec<Datastream>, ClientError> {
        let entities: Vec<DatastreamEntity> = self
            .get_collection(&self.config.endpoint.datastreams_url(thing_id))
            .await?;
        Ok(entities
            .into_iter()
            .map(|e| e.into_datastream(thing_id.clone()))
            .collect())
    }

    /// Fetch the most recent Observation of a Datastream.
    ///
    /// Returns `Ok(None)` when the datastream has no observations.
    ///
    /// # Errors
    ///
    /// Returns error on network, status, or parse failures.
    pub async fn fetch_latest_observation(
        &self,
        datastream_id: &DatastreamId,
    ) -> Result<Option<Observation>, ClientError> {
        let url = self.config.endpoint.latest_observation_url(datastream_id);
        tracing::debug!(%datastream_id, url, "GET latest observation");

        let page: Collection<ObservationEntity> = self.get_json(&url).await?;
        page.value
            .into_iter()
            .next()
            .map(|entity| {
                entity
                    .into_observation(Some(datastream_id.clone()))
                    .map_err(|e| ClientError::Parse(e.to_string()))
            })
            .transpose()
    }

    /// Fetch every Thing together with its Datastreams.
    ///
    /// # Errors
    ///
    /// Returns the first error encountered.
    pub async fn fetch_catalog(&self) -> Result<Catalog, ClientError> {
        let things = self.fetch_things().await?;
        let mut catalog = Catalog::default();

        for thing in things {
            let datastreams = self.fetch_datastreams(&thing.id).await?;
            tracing::debug!(
                thing_id = %thing.id,
                datastreams = datastreams.len(),
                "Discovered thing"
            );
            catalog.things.push(CatalogThing { thing, datastreams });
        }

        Ok(catalog)
    }
}

impl ObservationFetcher for StaClient {
    async fn fetch_latest(
        &self,
        datastream_id: &DatastreamId,
    ) -> Result<Option<Observation>, FetchError> {
        self.fetch_latest_observation(datastream_id)
            .await
            .map_err(FetchError::from)
    }
}

/// Resolve a possibly relative `@iot.nextLink` against the current page.
fn resolve_link(current: &str, link: &str) -> Result<String, ClientError> {
    let base = Url::parse(current).map_err(|e| ClientError::Parse(e.to_string()))?;
    base.join(link)
        .map(String::from)
        .map_err(|e| ClientError::Parse(format!("invalid @iot.nextLink '{link}': {e}")))
}

/// An entity collection page.
#[derive(Debug, Deserialize)]
struct Collection<T> {
    value: Vec<T>,
    #[serde(rename = "@iot.nextLink", default)]
    next_link: Option<String>,
}

/// A resource listed in the service document.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServiceResource {
    /// Collection name (e.g. `Things`)
    pub name: String,
    /// Absolute collection URL
    pub url: String,
}

/// The root service document of an endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceDocument {
    /// Listed collections
    pub value: Vec<ServiceResource>,
    /// Server settings (v1.1)
    #[serde(rename = "serverSettings", default)]
    pub server_settings: Option<Map<String, Value>>,
}

impl ServiceDocument {
    /// Look up a collection by name.
    #[must_use]
    pub fn resource(&self, name: &str) -> Option<&ServiceResource> {
        self.value.iter().find(|r| r.name == name)
    }

    /// MQTT endpoints advertised for observation delivery, if any.
    #[must_use]
    pub fn mqtt_endpoints(&self) -> Vec<String> {
        let Some(settings) = &self.server_settings else {
            return Vec::new();
        };
        settings
            .iter()
            .filter(|(key, _)| key.contains(MQTT_CONFORMANCE_MARKER))
            .filter_map(|(_, value)| value.get("endpoints").and_then(Value::as_array))
            .flatten()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect()
    }
}

/// A Thing with its Datastreams.
#[derive(Debug, Clone)]
pub struct CatalogThing {
    /// The Thing
    pub thing: Thing,
    /// Its Datastreams
    pub datastreams: Vec<Datastream>,
}

/// Everything discovered on an endpoint.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    /// Things in server order
    pub things: Vec<CatalogThing>,
}

impl Catalog {
    /// Iterate over all Datastreams.
    pub fn datastreams(&self) -> impl Iterator<Item = &Datastream> {
        self.things.iter().flat_map(|t| t.datastreams.iter())
    }
}

/// Failure class of a [`ClientError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Transport failure, timeout, or non-success status
    Network,
    /// Malformed JSON or missing expected fields
    Parse,
}

/// Errors that can occur with the SensorThings client.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    /// Client initialization failed
    #[error("client init error: {0}")]
    Init(String),
    /// Transport failure or timeout
    #[error("network error: {0}")]
    Network(String),
    /// Server returned a non-success status
    #[error("server error (status {status}): {message}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body
        message: String,
    },
    /// Response parsing failed
    #[error("parse error: {0}")]
    Parse(String),
}

impl ClientError {
    /// Classify the error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::Parse(_) => ErrorKind::Parse,
            ClientError::Init(_) | ClientError::Network(_) | ClientError::Status { .. } => {
                ErrorKind::Network
            }
        }
    }
}

impl From<ClientError> for FetchError {
    fn from(err: ClientError) -> Self {
        match err.kind() {
            ErrorKind::Network => FetchError::Network(err.to_string()),
            ErrorKind::Parse => FetchError::Parse(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use sta_bridge_core::{EntityId, ObservationResult};

    fn client_for(server: &mockito::Server) -> StaClient {
        let endpoint = Endpoint::parse(&format!("{}/v1.1", server.url())).unwrap();
        StaClient::new(StaClientConfig::new(endpoint)).unwrap()
    }

    #[test]
    fn config_default_timeout() {
        let config = StaClientConfig::new(Endpoint::parse("http://localhost:8080/v1.1").unwrap());
        assert_eq!(config.timeout, Duration::from_secs(10));
        assert!(config.bearer_token.is_none());
    }

    #[test]
    fn client_creation_with_invalid_ca_fails() {
        let mut config =
            StaClientConfig::new(Endpoint::parse("https://localhost:8443/v1.1").unwrap());
        config.ca_cert_path = Some(PathBuf::from("/nonexistent/ca.pem"));

        let err = StaClient::new(config).unwrap_err();
        assert!(err.to_string().contains("client init error"));
    }

    #[tokio::test]
    async fn things_follow_next_link() {
        let mut server = mockito::Server::new_async().await;
        let next = format!("{}/v1.1/Things?$skip=1", server.url());

        let first = server
            .mock("GET", Matcher::Regex(r"^/v1\.1/Things".to_string()))
            .match_query(Matcher::Missing)
            .with_header("content-type", "application/json")
            .with_body(
                serde_json::json!({
                    "value": [{"@iot.id": 1, "name": "Weather station"}],
                    "@iot.nextLink": next
                })
                .to_string(),
            )
            .create_async()
            .await;
        let second = server
            .mock("GET", Matcher::Regex(r"^/v1\.1/Things".to_string()))
            .match_query(Matcher::UrlEncoded("$skip".into(), "1".into()))
            .with_header("content-type", "application/json")
            .with_body(r#"{"value": [{"@iot.id": "b", "name": "Garden"}]}"#)
            .create_async()
            .await;

        let things = client_for(&server).fetch_things().await.unwrap();

        assert_eq!(things.len(), 2);
        assert_eq!(things[0].id, EntityId::Number(1));
        assert_eq!(things[1].id, EntityId::from("b"));
        first.assert_async().await;
        second.assert_async().await;
    }

    #[tokio::test]
    async fn datastreams_carry_owning_thing() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", Matcher::Regex(r"^/v1\.1/Things\(7\)/Datastreams".to_string()))
            .with_body(
                r#"{"value": [{"@iot.id": 11, "name": "Temperature",
                    "unitOfMeasurement": {"name": "degree Celsius", "symbol": "°C"}}]}"#,
            )
            .create_async()
            .await;

        let datastreams = client_for(&server)
            .fetch_datastreams(&EntityId::Number(7))
            .await
            .unwrap();

        assert_eq!(datastreams.len(), 1);
        assert_eq!(datastreams[0].thing_id, EntityId::Number(7));
        assert_eq!(datastreams[0].unit_symbol(), "°C");
    }

    #[tokio::test]
    async fn latest_observation_query() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock(
                "GET",
                Matcher::Regex(r"^/v1\.1/Datastreams\(11\)/Observations".to_string()),
            )
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("$orderby".into(), "phenomenonTime desc".into()),
                Matcher::UrlEncoded("$top".into(), "1".into()),
            ]))
            .with_body(
                r#"{"value": [{"@iot.id": 500, "result": 21.5,
                    "phenomenonTime": "2024-01-01T12:00:00Z"}]}"#,
            )
            .create_async()
            .await;

        let obs = client_for(&server)
            .fetch_latest_observation(&EntityId::Number(11))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(obs.datastream_id, EntityId::Number(11));
        assert_eq!(obs.result, ObservationResult::Number(21.5));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn empty_observation_collection() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", Matcher::Regex(r"^/v1\.1/Datastreams\(11\)".to_string()))
            .with_body(r#"{"value": []}"#)
            .create_async()
            .await;

        let obs = client_for(&server)
            .fetch_latest_observation(&EntityId::Number(11))
            .await
            .unwrap();
        assert!(obs.is_none());
    }

    #[tokio::test]
    async fn error_classification() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", Matcher::Regex(r"^/v1\.1/Things$".to_string()))
            .with_status(503)
            .create_async()
            .await;
        server
            .mock("GET", Matcher::Regex(r"^/v1\.1/Things\(1\)/Datastreams".to_string()))
            .with_body("<html>not json</html>")
            .create_async()
            .await;
        server
            .mock("GET", Matcher::Regex(r"^/v1\.1/Datastreams\(2\)".to_string()))
            .with_body(r#"{"value": [{"result": 1}]}"#)
            .create_async()
            .await;

        let client = client_for(&server);

        let status = client.fetch_things().await.unwrap_err();
        assert!(matches!(status, ClientError::Status { status: 503, .. }));
        assert_eq!(status.kind(), ErrorKind::Network);

        let parse = client
            .fetch_datastreams(&EntityId::Number(1))
            .await
            .unwrap_err();
        assert_eq!(parse.kind(), ErrorKind::Parse);

        let missing_time = client
            .fetch_latest_observation(&EntityId::Number(2))
            .await
            .unwrap_err();
        assert!(matches!(
            FetchError::from(missing_time),
            FetchError::Parse(_)
        ));
    }

    #[tokio::test]
    async fn unreachable_server_is_network_error() {
        let endpoint = Endpoint::parse("http://127.0.0.1:1/v1.1").unwrap();
        let client = StaClient::new(StaClientConfig::new(endpoint)).unwrap();

        let err = client.fetch_service_document().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Network);
    }

    #[tokio::test]
    async fn service_document_with_mqtt_settings() {
        let mut server = mockito::Server::new_async().await;
        let base = format!("{}/v1.1", server.url());
        server
            .mock("GET", "/v1.1")
            .with_body(
                serde_json::json!({
                    "value": [
                        {"name": "Things", "url": format!("{base}/Things")},
                        {"name": "Datastreams", "url": format!("{base}/Datastreams")},
                        {"name": "Observations", "url": format!("{base}/Observations")}
                    ],
                    "serverSettings": {
                        "conformance": [],
                        "http://www.opengis.net/spec/iot_sensing/1.1/req/create-observations-via-mqtt/observations-creation": {
                            "endpoints": ["mqtt://sta.example.org:1883"]
                        }
                    }
                })
                .to_string(),
            )
            .create_async()
            .await;

        let doc = client_for(&server).fetch_service_document().await.unwrap();
        assert!(doc.resource("Observations").is_some());
        assert_eq!(doc.mqtt_endpoints(), vec!["mqtt://sta.example.org:1883"]);
    }

    #[tokio::test]
    async fn service_document_missing_collections_is_parse_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v1.1")
            .with_body(r#"{"value": [{"name": "Sensors", "url": "http://x/v1.1/Sensors"}]}"#)
            .create_async()
            .await;

        let err = client_for(&server)
            .fetch_service_document()
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Parse);
    }

    #[tokio::test]
    async fn catalog_combines_things_and_datastreams() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", Matcher::Regex(r"^/v1\.1/Things$".to_string()))
            .with_body(r#"{"value": [{"@iot.id": 1, "name": "A"}, {"@iot.id": 2, "name": "B"}]}"#)
            .create_async()
            .await;
        for id in [1, 2] {
            server
                .mock(
                    "GET",
                    Matcher::Regex(format!(r"^/v1\.1/Things\({id}\)/Datastreams")),
                )
                .with_body(format!(
                    r#"{{"value": [{{"@iot.id": {}, "name": "Temperature"}}]}}"#,
                    id * 10
                ))
                .create_async()
                .await;
        }

        let catalog = client_for(&server).fetch_catalog().await.unwrap();
        let ids: Vec<_> = catalog.datastreams().map(|d| d.id.clone()).collect();
        assert_eq!(ids, vec![EntityId::Number(10), EntityId::Number(20)]);
    }
}
