//! `SQLite` config-entry store.

use crate::flow::EntryOptions;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// A persisted, validated endpoint configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigEntry {
    /// Unique entry identifier
    pub entry_id: String,
    /// Display title (`SensorThings ({host})`)
    pub title: String,
    /// Normalized endpoint URL
    pub url: String,
    /// Current options
    pub options: EntryOptions,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// `SQLite`-backed config-entry store.
pub struct EntryStore {
    conn: Mutex<Connection>,
}

impl EntryStore {
    /// Open or create a `SQLite` database.
    ///
    /// # Errors
    ///
    /// Returns error if database cannot be opened or initialized.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    /// Create an in-memory database.
    ///
    /// # Errors
    ///
    /// Returns error if database cannot be created.
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            r"
            CREATE TABLE IF NOT EXISTS config_entries (
                entry_id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                url TEXT NOT NULL UNIQUE,
                options TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Persist a new entry.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DuplicateUrl`] when the URL is already stored,
    /// or a database error if the insert fails otherwise.
    pub fn insert(&self, entry: &ConfigEntry) -> Result<(), StoreError> {
        let options = serde_json::to_string(&entry.options)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        self.conn().execute(
            r"
            INSERT INTO config_entries (entry_id, title, url, options, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ",
            (
                &entry.entry_id,
                &entry.title,
                &entry.url,
                options,
                entry.created_at.timestamp(),
            ),
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(err, _)
                if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE =>
            {
                StoreError::DuplicateUrl(entry.url.clone())
            }
            other => other.into(),
        })?;

        tracing::debug!(entry_id = %entry.entry_id, url = %entry.url, "Stored config entry");
        Ok(())
    }

    /// Look up an entry by id.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub fn get(&self, entry_id: &str) -> Result<Option<ConfigEntry>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r"
            SELECT entry_id, title, url, options, created_at FROM config_entries
            WHERE entry_id = ?1
            ",
        )?;

        let raw = stmt.query_row([entry_id], read_row).optional()?;
        raw.map(RawEntry::into_entry).transpose()
    }

    /// Look up an entry by normalized endpoint URL.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub fn find_by_url(&self, url: &str) -> Result<Option<ConfigEntry>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r"
            SELECT entry_id, title, url, options, created_at FROM config_entries
            WHERE url = ?1
            ",
        )?;

        let raw = stmt.query_row([url], read_row).optional()?;
        raw.map(RawEntry::into_entry).transpose()
    }

    /// All entries, oldest first.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub fn list(&self) -> Result<Vec<ConfigEntry>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r"
            SELECT entry_id, title, url, options, created_at FROM config_entries
            ORDER BY created_at ASC, entry_id ASC
            ",
        )?;

        let rows = stmt
            .query_map([], read_row)?
            .collect::<rusqlite::Result<Vec<RawEntry>>>()?;

        rows.into_iter().map(RawEntry::into_entry).collect()
    }

    /// Replace the options of an entry. Returns `false` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub fn update_options(&self, entry_id: &str, options: &EntryOptions) -> Result<bool, StoreError> {
        let options =
            serde_json::to_string(options).map_err(|e| StoreError::Serialization(e.to_string()))?;

        let updated = self.conn().execute(
            "UPDATE config_entries SET options = ?1 WHERE entry_id = ?2",
            (options, entry_id),
        )?;

        Ok(updated > 0)
    }

    /// Delete an entry. Returns `false` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns error if the delete fails.
    pub fn remove(&self, entry_id: &str) -> Result<bool, StoreError> {
        let deleted = self
            .conn()
            .execute("DELETE FROM config_entries WHERE entry_id = ?1", [entry_id])?;
        Ok(deleted > 0)
    }
}

struct RawEntry {
    entry_id: String,
    title: String,
    url: String,
    options: String,
    created_at: i64,
}

impl RawEntry {
    fn into_entry(self) -> Result<ConfigEntry, StoreError> {
        let options = serde_json::from_str(&self.options)
            .map_err(|e| StoreError::Serialization(format!("entry {}: {e}", self.entry_id)))?;
        let created_at = DateTime::<Utc>::from_timestamp(self.created_at, 0).ok_or_else(|| {
            StoreError::Serialization(format!(
                "entry {}: invalid created_at {}",
                self.entry_id, self.created_at
            ))
        })?;

        Ok(ConfigEntry {
            entry_id: self.entry_id,
            title: self.title,
            url: self.url,
            options,
            created_at,
        })
    }
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<RawEntry> {
    Ok(RawEntry {
        entry_id: row.get(0)?,
        title: row.get(1)?,
        url: row.get(2)?,
        options: row.get(3)?,
        created_at: row.get(4)?,
    })
}

/// Errors from the entry store.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// `SQLite` failure
    #[error("database error: {0}")]
    Database(String),
    /// Stored options could not be (de)serialized
    #[error("serialization error: {0}")]
    Serialization(String),
    /// An entry for the URL already exists
    #[error("entry for {0} already exists")]
    DuplicateUrl(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Database(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, url: &str) -> ConfigEntry {
        ConfigEntry {
            entry_id: id.to_string(),
            title: "SensorThings (localhost)".to_string(),
            url: url.to_string(),
            options: EntryOptions::default(),
            created_at: DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap(),
        }
    }

    #[test]
    fn entry_store_basic_operations() {
        let store = EntryStore::in_memory().unwrap();

        store.insert(&entry("a", "http://localhost/v1.1")).unwrap();
        store.insert(&entry("b", "http://other/v1.1")).unwrap();

        assert_eq!(store.get("a").unwrap().unwrap().url, "http://localhost/v1.1");
        assert_eq!(
            store
                .find_by_url("http://other/v1.1")
                .unwrap()
                .unwrap()
                .entry_id,
            "b"
        );
        assert!(store.get("missing").unwrap().is_none());
        assert_eq!(store.list().unwrap().len(), 2);

        let options = EntryOptions {
            scan_interval: 120,
            mqtt_enabled: false,
            ..EntryOptions::default()
        };
        assert!(store.update_options("a", &options).unwrap());
        assert_eq!(store.get("a").unwrap().unwrap().options, options);
        assert!(!store.update_options("missing", &options).unwrap());

        assert!(store.remove("a").unwrap());
        assert!(!store.remove("a").unwrap());
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn duplicate_url_rejected() {
        let store = EntryStore::in_memory().unwrap();
        store.insert(&entry("a", "http://localhost/v1.1")).unwrap();

        let err = store
            .insert(&entry("b", "http://localhost/v1.1"))
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateUrl(url) if url == "http://localhost/v1.1"));
    }

    #[test]
    fn entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("entries.db");

        {
            let store = EntryStore::open(&path).unwrap();
            store.insert(&entry("a", "http://localhost/v1.1")).unwrap();
        }

        let store = EntryStore::open(&path).unwrap();
        let entries = store.list().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0], entry("a", "http://localhost/v1.1"));
    }
}
