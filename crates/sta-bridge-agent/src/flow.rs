//! Config flow and options flow.
//!
//! A config entry is only written after the endpoint has answered the root
//! discovery request with a well-formed service document. Options are
//! range-checked before they reach the store.

use crate::config::HttpConfig;
use crate::store::{ConfigEntry, EntryStore, StoreError};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sta_bridge_client::{Endpoint, ErrorKind, StaClient, StaClientConfig};
use std::sync::Arc;
use std::time::Duration;

/// Poll interval bounds, in seconds.
pub const SCAN_INTERVAL_RANGE: (u64, u64) = (10, 3600);

/// Default poll interval, in seconds.
pub const DEFAULT_SCAN_INTERVAL: u64 = 60;

/// Default MQTT broker port.
pub const DEFAULT_MQTT_PORT: u16 = 1883;

/// Per-entry options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntryOptions {
    /// Poll interval in seconds
    pub scan_interval: u64,
    /// Whether to receive observations over MQTT
    pub mqtt_enabled: bool,
    /// Broker port
    pub mqtt_port: u16,
    /// Broker host; the endpoint host when unset
    pub mqtt_host: Option<String>,
}

impl Default for EntryOptions {
    fn default() -> Self {
        Self {
            scan_interval: DEFAULT_SCAN_INTERVAL,
            mqtt_enabled: true,
            mqtt_port: DEFAULT_MQTT_PORT,
            mqtt_host: None,
        }
    }
}

impl EntryOptions {
    /// Check option ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::OutOfRange`] for the first offending option.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let (min, max) = SCAN_INTERVAL_RANGE;
        check_range("scan_interval", i64::try_from(self.scan_interval).unwrap_or(i64::MAX), min, max)?;
        check_range("mqtt_port", i64::from(self.mqtt_port), 1, u64::from(u16::MAX))?;
        Ok(())
    }

    /// Poll interval as a duration.
    #[must_use]
    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval)
    }

    /// Broker host for `endpoint`.
    #[must_use]
    pub fn broker_host<'a>(&'a self, endpoint: &'a Endpoint) -> &'a str {
        self.mqtt_host
            .as_deref()
            .filter(|h| !h.trim().is_empty())
            .unwrap_or_else(|| endpoint.host())
    }
}

fn check_range(field: &'static str, value: i64, min: u64, max: u64) -> Result<(), ConfigError> {
    let in_range = u64::try_from(value).is_ok_and(|v| (min..=max).contains(&v));
    if in_range {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            field,
            value,
            min,
            max,
        })
    }
}

/// Options form submission. Absent fields keep their current value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OptionsInput {
    /// Poll interval in seconds
    pub scan_interval: Option<i64>,
    /// Whether to receive observations over MQTT
    pub mqtt_enabled: Option<bool>,
    /// Broker port
    pub mqtt_port: Option<i64>,
    /// Broker host; an empty string clears the override
    pub mqtt_host: Option<String>,
}

impl OptionsInput {
    /// Merge onto `current` and validate.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::OutOfRange`] if a value is outside its range.
    pub fn apply(&self, current: &EntryOptions) -> Result<EntryOptions, ConfigError> {
        let mut options = current.clone();

        if let Some(interval) = self.scan_interval {
            let (min, max) = SCAN_INTERVAL_RANGE;
            check_range("scan_interval", interval, min, max)?;
            options.scan_interval = interval.unsigned_abs();
        }

        if let Some(enabled) = self.mqtt_enabled {
            options.mqtt_enabled = enabled;
        }

        if let Some(port) = self.mqtt_port {
            check_range("mqtt_port", port, 1, u64::from(u16::MAX))?;
            options.mqtt_port = u16::try_from(port).map_err(|_| ConfigError::OutOfRange {
                field: "mqtt_port",
                value: port,
                min: 1,
                max: u64::from(u16::MAX),
            })?;
        }

        if let Some(host) = &self.mqtt_host {
            let host = host.trim();
            options.mqtt_host = (!host.is_empty()).then(|| host.to_string());
        }

        Ok(options)
    }
}

/// Creates config entries after validating the endpoint.
pub struct ConfigFlow {
    store: Arc<EntryStore>,
    http: HttpConfig,
}

impl ConfigFlow {
    /// Create a flow writing to `store`.
    #[must_use]
    pub fn new(store: Arc<EntryStore>, http: HttpConfig) -> Self {
        Self { store, http }
    }

    /// Validate `url` against the live endpoint and persist a new entry.
    ///
    /// Nothing is written unless every check passes.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidUrl`], [`ConfigError::OutOfRange`],
    /// [`ConfigError::AlreadyConfigured`], [`ConfigError::CannotConnect`] or
    /// [`ConfigError::InvalidResponse`].
    pub async fn validate_and_create_entry(
        &self,
        url: &str,
        options: EntryOptions,
    ) -> Result<ConfigEntry, ConfigError> {
        let endpoint = Endpoint::parse(url).map_err(|e| ConfigError::InvalidUrl(e.to_string()))?;
        options.validate()?;

        if self.store.find_by_url(endpoint.as_str())?.is_some() {
            return Err(ConfigError::AlreadyConfigured(endpoint.to_string()));
        }

        let client = StaClient::new(StaClientConfig {
            endpoint: endpoint.clone(),
            timeout: self.http.timeout,
            bearer_token: self.http.bearer_token.clone(),
            ca_cert_path: self.http.ca_cert_path.clone(),
        })
        .map_err(|e| ConfigError::CannotConnect(e.to_string()))?;

        let document = client.fetch_service_document().await.map_err(|e| {
            tracing::warn!(url = %endpoint, error = %e, "Endpoint validation failed");
            match e.kind() {
                ErrorKind::Network => ConfigError::CannotConnect(e.to_string()),
                ErrorKind::Parse => ConfigError::InvalidResponse(e.to_string()),
            }
        })?;

        let mqtt_endpoints = document.mqtt_endpoints();
        if !mqtt_endpoints.is_empty() {
            tracing::debug!(url = %endpoint, ?mqtt_endpoints, "Endpoint advertises MQTT");
        }

        let entry = ConfigEntry {
            entry_id: uuid::Uuid::new_v4().to_string(),
            title: format!("SensorThings ({})", endpoint.host()),
            url: endpoint.to_string(),
            options,
            created_at: Utc::now(),
        };

        // A concurrent flow may have stored the same endpoint meanwhile.
        self.store.insert(&entry).map_err(|e| match e {
            StoreError::DuplicateUrl(url) => ConfigError::AlreadyConfigured(url),
            other => other.into(),
        })?;
        tracing::info!(entry_id = %entry.entry_id, title = %entry.title, "Created config entry");

        Ok(entry)
    }
}

/// Edits the options of existing entries.
pub struct OptionsFlow {
    store: Arc<EntryStore>,
}

impl OptionsFlow {
    /// Create an options flow over `store`.
    #[must_use]
    pub fn new(store: Arc<EntryStore>) -> Self {
        Self { store }
    }

    /// Current options of an entry, used as form defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownEntry`] if the entry does not exist.
    pub fn current(&self, entry_id: &str) -> Result<EntryOptions, ConfigError> {
        self.store
            .get(entry_id)?
            .map(|entry| entry.options)
            .ok_or_else(|| ConfigError::UnknownEntry(entry_id.to_string()))
    }

    /// Validate and persist an options submission.
    ///
    /// # Errors
    ///
    /// Returns error if the entry does not exist or a value is out of range;
    /// the stored options are unchanged in that case.
    pub fn submit(&self, entry_id: &str, input: &OptionsInput) -> Result<EntryOptions, ConfigError> {
        let current = self.current(entry_id)?;
        let options = input.apply(&current)?;

        if !self.store.update_options(entry_id, &options)? {
            return Err(ConfigError::UnknownEntry(entry_id.to_string()));
        }

        tracing::info!(entry_id, ?options, "Updated entry options");
        Ok(options)
    }
}

/// Errors from the config and options flows.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// URL is malformed or lacks a version segment
    #[error("invalid endpoint URL: {0}")]
    InvalidUrl(String),
    /// Endpoint unreachable, timed out or answered with an error status
    #[error("cannot connect: {0}")]
    CannotConnect(String),
    /// Endpoint answered with something other than a service document
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    /// An entry for this endpoint exists already
    #[error("endpoint already configured: {0}")]
    AlreadyConfigured(String),
    /// Option outside its allowed range
    #[error("{field} must be between {min} and {max}, got {value}")]
    OutOfRange {
        /// Option name
        field: &'static str,
        /// Submitted value
        value: i64,
        /// Lower bound
        min: u64,
        /// Upper bound
        max: u64,
    },
    /// No entry with this id
    #[error("unknown config entry: {0}")]
    UnknownEntry(String),
    /// Entry store failure
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ConfigError {
    /// Stable key for form error display.
    #[must_use]
    pub fn error_key(&self) -> &'static str {
        match self {
            ConfigError::InvalidUrl(_) => "invalid_url",
            ConfigError::CannotConnect(_) => "cannot_connect",
            ConfigError::InvalidResponse(_) => "invalid_response",
            ConfigError::AlreadyConfigured(_) => "already_configured",
            ConfigError::OutOfRange { .. } => "out_of_range",
            ConfigError::UnknownEntry(_) => "unknown_entry",
            ConfigError::Store(_) => "unknown",
        }
    }
}
