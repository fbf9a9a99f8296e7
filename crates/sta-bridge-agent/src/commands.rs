//! Manual commands spanning every configured entry.

use crate::registry::EntryRegistry;
use crate::runtime::RefreshSummary;
use std::fmt;
use std::str::FromStr;

/// A manual command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Force-refresh every known datastream of every entry
    RefreshAll,
    /// Tear down and re-establish every entry's MQTT session
    ReconnectMqtt,
}

impl FromStr for Command {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "refresh_all" | "refresh" => Ok(Command::RefreshAll),
            "reconnect_mqtt" | "reconnect" => Ok(Command::ReconnectMqtt),
            other => Err(CommandError::Unknown(other.to_string())),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::RefreshAll => f.write_str("refresh_all"),
            Command::ReconnectMqtt => f.write_str("reconnect_mqtt"),
        }
    }
}

/// Result of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    /// Totals across all entries
    Refreshed(RefreshSummary),
    /// Entries whose MQTT session was restarted
    Reconnected {
        /// Entries visited
        entries: usize,
        /// Entries with MQTT enabled that were restarted
        reconnected: usize,
    },
}

/// Executes commands against the entries of a registry.
#[derive(Clone)]
pub struct CommandHandler {
    registry: EntryRegistry,
}

impl CommandHandler {
    /// Create a handler over `registry`.
    #[must_use]
    pub fn new(registry: EntryRegistry) -> Self {
        Self { registry }
    }

    /// Force-refresh every known datastream across every entry.
    pub async fn refresh_all(&self) -> RefreshSummary {
        let mut total = RefreshSummary::default();
        for (_, runtime) in self.registry.runtimes() {
            let summary = runtime.lock().await.force_refresh_all().await;
            total.merge(summary);
        }
        total
    }

    /// Restart the MQTT session of every entry. Returns the number of
    /// entries restarted.
    pub async fn reconnect_mqtt(&self) -> usize {
        let mut reconnected = 0;
        for (entry_id, runtime) in self.registry.runtimes() {
            if runtime.lock().await.reconnect_mqtt().await {
                reconnected += 1;
            } else {
                tracing::debug!(%entry_id, "MQTT not enabled, skipping reconnect");
            }
        }
        reconnected
    }

    /// Execute a command.
    pub async fn execute(&self, command: Command) -> CommandOutcome {
        tracing::info!(%command, entries = self.registry.len(), "Executing command");
        match command {
            Command::RefreshAll => CommandOutcome::Refreshed(self.refresh_all().await),
            Command::ReconnectMqtt => CommandOutcome::Reconnected {
                entries: self.registry.len(),
                reconnected: self.reconnect_mqtt().await,
            },
        }
    }
}

/// Errors parsing a command.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    /// Not a known command
    #[error("unknown command '{0}', expected refresh_all or reconnect_mqtt")]
    Unknown(String),
}
