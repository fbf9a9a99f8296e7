//! # SensorThings Bridge Agent
//!
//! Bridges OGC SensorThings API endpoints into host entities.
//!
//! ## Architecture
//!
//! Every configured endpoint (config entry) runs independently:
//! 1. **Discovery**: Things and Datastreams are enumerated once at start
//! 2. **Polling**: the latest observation of every datastream is fetched on
//!    an injected schedule
//! 3. **Push**: MQTT observations arrive over a channel
//! 4. **Rendering**: accepted updates are forwarded to an [`EntitySink`]
//!
//! Both producers feed one [`sta_bridge_core::Synchronizer`] per entry.
//! Manual commands reach all entries through an explicit [`EntryRegistry`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod commands;
pub mod config;
pub mod entities;
pub mod flow;
pub mod registry;
pub mod runtime;
pub mod store;

pub use commands::{Command, CommandError, CommandHandler, CommandOutcome};
pub use config::{AgentConfig, HttpConfig, PersistenceConfig};
pub use entities::{ChannelSink, EntitySink, EntityUpdate, LogSink};
pub use flow::{ConfigError, ConfigFlow, EntryOptions, OptionsFlow, OptionsInput};
pub use registry::EntryRegistry;
pub use runtime::{EntryRuntime, RefreshSummary, RuntimeError};
pub use store::{ConfigEntry, EntryStore, StoreError};

use anyhow::{bail, Context, Result};
use sta_bridge_poller::TokioScheduler;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

/// The agent: entry store, running entries and command handling.
pub struct Agent {
    config: AgentConfig,
    store: Arc<EntryStore>,
    registry: EntryRegistry,
    sink: Arc<dyn EntitySink>,
}

impl Agent {
    /// Create a new agent logging entity updates.
    ///
    /// # Errors
    ///
    /// Returns error if the entry store cannot be opened.
    pub fn new(config: AgentConfig) -> Result<Self> {
        Self::with_sink(config, Arc::new(LogSink))
    }

    /// Create a new agent publishing entity updates to `sink`.
    ///
    /// # Errors
    ///
    /// Returns error if the entry store cannot be opened.
    pub fn with_sink(config: AgentConfig, sink: Arc<dyn EntitySink>) -> Result<Self> {
        let store = match config.persistence.store_type.as_str() {
            "sqlite" => EntryStore::open(&config.persistence.db_path)
                .context("Failed to open SQLite database")?,
            "memory" => EntryStore::in_memory().context("Failed to create in-memory store")?,
            other => bail!("Unknown store type '{other}', expected sqlite or memory"),
        };

        Ok(Self {
            config,
            store: Arc::new(store),
            registry: EntryRegistry::new(),
            sink,
        })
    }

    /// The entry store.
    #[must_use]
    pub fn store(&self) -> &Arc<EntryStore> {
        &self.store
    }

    /// Running entries.
    #[must_use]
    pub fn registry(&self) -> &EntryRegistry {
        &self.registry
    }

    /// Handler for manual commands.
    #[must_use]
    pub fn commands(&self) -> CommandHandler {
        CommandHandler::new(self.registry.clone())
    }

    /// Config flow writing to this agent's store.
    #[must_use]
    pub fn config_flow(&self) -> ConfigFlow {
        ConfigFlow::new(Arc::clone(&self.store), self.config.http.clone())
    }

    /// Options flow over this agent's store.
    #[must_use]
    pub fn options_flow(&self) -> OptionsFlow {
        OptionsFlow::new(Arc::clone(&self.store))
    }

    /// Start an entry and register it, unloading any previous runtime of
    /// the same entry.
    ///
    /// # Errors
    ///
    /// Returns error if the entry cannot be started.
    pub async fn start_entry(&self, entry: ConfigEntry) -> Result<(), RuntimeError> {
        let runtime =
            EntryRuntime::start(entry, &self.config.http, &TokioScheduler, Arc::clone(&self.sink))
                .await?;

        let (_, previous) = self.registry.insert(runtime);
        if let Some(previous) = previous {
            previous.lock().await.unload().await;
        }
        Ok(())
    }

    /// Unload an entry and start it again from its stored configuration.
    ///
    /// # Errors
    ///
    /// Returns error if the entry is unknown or cannot be started.
    pub async fn reload_entry(&self, entry_id: &str) -> Result<()> {
        let entry = self
            .store
            .get(entry_id)?
            .with_context(|| format!("Unknown config entry {entry_id}"))?;

        if let Some(runtime) = self.registry.remove(entry_id) {
            runtime.lock().await.unload().await;
        }

        self.start_entry(entry)
            .await
            .with_context(|| format!("Failed to start entry {entry_id}"))
    }

    /// Start every stored entry. Entries that fail to start are logged and
    /// skipped.
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be read.
    pub async fn start_all(&self) -> Result<usize> {
        let mut started = 0;
        for entry in self.store.list()? {
            let entry_id = entry.entry_id.clone();
            match self.start_entry(entry).await {
                Ok(()) => started += 1,
                Err(e) => {
                    tracing::error!(%entry_id, error = %e, "Failed to start entry");
                }
            }
        }
        Ok(started)
    }

    /// Run the agent's main loop.
    ///
    /// Creates an entry for the configured URL when none exists, starts all
    /// entries, then executes commands read from stdin until Ctrl+C.
    ///
    /// # Errors
    ///
    /// Returns error if the configured URL fails validation or the store
    /// cannot be read.
    pub async fn run(self) -> Result<()> {
        tracing::info!("Starting agent runtime");

        if let Some(url) = &self.config.url {
            match self
                .config_flow()
                .validate_and_create_entry(url, self.config.initial_options.clone())
                .await
            {
                Ok(entry) => tracing::info!(entry_id = %entry.entry_id, "Configured endpoint"),
                Err(ConfigError::AlreadyConfigured(url)) => {
                    tracing::debug!(%url, "Endpoint already configured");
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to configure {url}"));
                }
            }
        }

        let started = self.start_all().await?;
        if started == 0 {
            tracing::warn!("No config entries running, set STA_BRIDGE_URL to add one");
        }

        tracing::info!(
            entries = started,
            "Agent running, commands: refresh_all, reconnect_mqtt, options <entry_id> key=value..; press Ctrl+C to stop"
        );

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut stdin_open = true;

        loop {
            tokio::select! {
                line = lines.next_line(), if stdin_open => {
                    match line {
                        Ok(Some(line)) => self.handle_line(&line).await,
                        Ok(None) => stdin_open = false,
                        Err(e) => {
                            tracing::warn!(error = %e, "Failed to read stdin");
                            stdin_open = false;
                        }
                    }
                }

                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Shutdown signal received");
                    break;
                }
            }
        }

        self.registry.unload_all().await;
        tracing::info!("Agent stopped");
        Ok(())
    }

    async fn handle_line(&self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }

        if let Some(rest) = line.strip_prefix("options ") {
            if let Err(e) = self.update_options(rest).await {
                tracing::error!(error = %format!("{e:#}"), "Options update failed");
            }
            return;
        }

        match line.parse::<Command>() {
            Ok(command) => {
                let outcome = self.commands().execute(command).await;
                tracing::info!(%command, ?outcome, "Command complete");
            }
            Err(e) => tracing::warn!(error = %e, "Ignoring input"),
        }
    }

    async fn update_options(&self, args: &str) -> Result<()> {
        let mut parts = args.split_whitespace();
        let entry_id = parts.next().context("Missing entry id")?;
        let input = parse_options_input(parts)?;

        let options = self.options_flow().submit(entry_id, &input)?;
        tracing::info!(entry_id, ?options, "Options saved, reloading entry");
        self.reload_entry(entry_id).await
    }
}

/// Parse `key=value` pairs into an options submission.
///
/// # Errors
///
/// Returns error on unknown keys or unparseable values.
pub fn parse_options_input<'a>(pairs: impl IntoIterator<Item = &'a str>) -> Result<OptionsInput> {
    let mut input = OptionsInput::default();

    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .with_context(|| format!("Expected key=value, got '{pair}'"))?;

        match key {
            "scan_interval" => {
                input.scan_interval = Some(value.parse().context("Invalid scan_interval")?);
            }
            "mqtt_enabled" => {
                input.mqtt_enabled = Some(value.parse().context("Invalid mqtt_enabled")?);
            }
            "mqtt_port" => {
                input.mqtt_port = Some(value.parse().context("Invalid mqtt_port")?);
            }
            "mqtt_host" => input.mqtt_host = Some(value.to_string()),
            other => bail!("Unknown option '{other}'"),
        }
    }

    Ok(input)
}
