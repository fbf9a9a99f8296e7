//! Agent configuration.

use crate::flow::EntryOptions;
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Endpoint to configure on startup, if not configured yet
    pub url: Option<String>,

    /// Options for an entry created from `url`
    pub initial_options: EntryOptions,

    /// HTTP client configuration
    pub http: HttpConfig,

    /// Persistence configuration
    pub persistence: PersistenceConfig,
}

/// HTTP client configuration shared by all entries.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Per-request timeout
    pub timeout: Duration,

    /// Bearer token for authentication
    pub bearer_token: Option<String>,

    /// Custom CA certificate path
    pub ca_cert_path: Option<PathBuf>,

    /// How long to wait for the initial MQTT `CONNACK`
    pub mqtt_connect_timeout: Duration,
}

/// Persistence configuration.
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// Store type: "sqlite" or "memory"
    pub store_type: String,

    /// Database path (for SQLite)
    pub db_path: PathBuf,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            bearer_token: None,
            ca_cert_path: None,
            mqtt_connect_timeout: Duration::from_secs(10),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            url: None,
            initial_options: EntryOptions::default(),
            http: HttpConfig::default(),
            persistence: PersistenceConfig {
                store_type: "sqlite".to_string(),
                db_path: PathBuf::from("./sta-bridge.db"),
            },
        }
    }
}

impl AgentConfig {
    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `STA_BRIDGE_URL`: SensorThings endpoint (e.g. `http://host:8080/FROST-Server/v1.1`)
    /// - `STA_BRIDGE_SCAN_INTERVAL`: Poll interval in seconds for a new entry
    /// - `STA_BRIDGE_MQTT_ENABLED`: "true" or "false"
    /// - `STA_BRIDGE_MQTT_HOST`: Broker host override
    /// - `STA_BRIDGE_MQTT_PORT`: Broker port
    /// - `STA_BRIDGE_HTTP_TIMEOUT`: HTTP timeout in seconds
    /// - `STA_BRIDGE_BEARER_TOKEN`: Bearer token
    /// - `STA_BRIDGE_CA_CERT`: PEM CA certificate path
    /// - `STA_BRIDGE_STORE`: "sqlite" or "memory"
    /// - `STA_BRIDGE_DB_PATH`: SQLite database path
    ///
    /// Entry options are range-checked when the entry is created.
    ///
    /// # Errors
    ///
    /// Returns error if a variable cannot be parsed.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("STA_BRIDGE_URL") {
            config.url = Some(url);
        }

        if let Ok(interval) = std::env::var("STA_BRIDGE_SCAN_INTERVAL") {
            config.initial_options.scan_interval = interval
                .parse()
                .context("Invalid STA_BRIDGE_SCAN_INTERVAL")?;
        }

        if let Ok(enabled) = std::env::var("STA_BRIDGE_MQTT_ENABLED") {
            config.initial_options.mqtt_enabled =
                enabled.parse().context("Invalid STA_BRIDGE_MQTT_ENABLED")?;
        }

        if let Ok(host) = std::env::var("STA_BRIDGE_MQTT_HOST") {
            config.initial_options.mqtt_host = Some(host);
        }

        if let Ok(port) = std::env::var("STA_BRIDGE_MQTT_PORT") {
            config.initial_options.mqtt_port =
                port.parse().context("Invalid STA_BRIDGE_MQTT_PORT")?;
        }

        if let Ok(timeout) = std::env::var("STA_BRIDGE_HTTP_TIMEOUT") {
            let secs: u64 = timeout.parse().context("Invalid STA_BRIDGE_HTTP_TIMEOUT")?;
            config.http.timeout = Duration::from_secs(secs);
        }

        if let Ok(token) = std::env::var("STA_BRIDGE_BEARER_TOKEN") {
            config.http.bearer_token = Some(token);
        }

        if let Ok(path) = std::env::var("STA_BRIDGE_CA_CERT") {
            config.http.ca_cert_path = Some(PathBuf::from(path));
        }

        if let Ok(store_type) = std::env::var("STA_BRIDGE_STORE") {
            config.persistence.store_type = store_type;
        }

        if let Ok(db_path) = std::env::var("STA_BRIDGE_DB_PATH") {
            config.persistence.db_path = PathBuf::from(db_path);
        }

        Ok(config)
    }
}
