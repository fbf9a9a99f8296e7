//! Registry of running config entries.

use crate::runtime::EntryRuntime;
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::Mutex;

/// Shared handle to a running entry.
pub type SharedRuntime = Arc<Mutex<EntryRuntime>>;

/// Running entries by entry id.
///
/// Cloning yields another handle to the same registry.
#[derive(Clone, Default)]
pub struct EntryRegistry {
    entries: Arc<RwLock<BTreeMap<String, SharedRuntime>>>,
}

impl EntryRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a runtime under its entry id, returning the shared handle.
    /// A runtime already registered under that id is returned as well so
    /// the caller can unload it.
    pub fn insert(&self, runtime: EntryRuntime) -> (SharedRuntime, Option<SharedRuntime>) {
        let entry_id = runtime.entry().entry_id.clone();
        let shared = Arc::new(Mutex::new(runtime));
        let previous = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(entry_id, Arc::clone(&shared));
        (shared, previous)
    }

    /// Remove an entry.
    pub fn remove(&self, entry_id: &str) -> Option<SharedRuntime> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(entry_id)
    }

    /// Look up an entry.
    #[must_use]
    pub fn get(&self, entry_id: &str) -> Option<SharedRuntime> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(entry_id)
            .cloned()
    }

    /// All entries, ordered by id.
    #[must_use]
    pub fn runtimes(&self) -> Vec<(String, SharedRuntime)> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, runtime)| (id.clone(), Arc::clone(runtime)))
            .collect()
    }

    /// Registered entry ids, sorted.
    #[must_use]
    pub fn entry_ids(&self) -> Vec<String> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Number of registered entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no entry is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove and unload every entry.
    pub async fn unload_all(&self) {
        let drained: Vec<SharedRuntime> = {
            let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *entries).into_values().collect()
        };

        for runtime in drained {
            runtime.lock().await.unload().await;
        }
    }
}
