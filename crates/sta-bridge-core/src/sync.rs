//! Dual-source state synchronizer.
//!
//! Owns the last known observation of every registered datastream. Both
//! producers (the poll loop and the MQTT subscriber) funnel into
//! [`Synchronizer::apply_observation`], which applies the merge policy from
//! [`crate::merge`] under a single map lock and notifies change listeners
//! after the lock is released.
//!
//! Notifications of one datastream pass through a per-datastream gate, so
//! listeners never see an older accepted state after a newer one. A
//! notification that lost the race to a newer one is skipped.

use crate::merge::{decide, MergeDecision, SyncState, UpdateSource};
use crate::model::{Datastream, DatastreamId, Observation};
use std::collections::HashMap;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Notification delivered to listeners on every accepted update.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    /// Datastream that changed
    pub datastream_id: DatastreamId,
    /// New state
    pub state: SyncState,
}

/// Callback invoked on accepted updates.
pub type Listener = Arc<dyn Fn(&ChangeEvent) -> Result<(), ListenerError> + Send + Sync>;

/// Registration token returned by [`Synchronizer::on_change`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ListenerHandle {
    datastream_id: DatastreamId,
    id: u64,
}

impl ListenerHandle {
    /// Datastream the listener is registered for.
    #[must_use]
    pub fn datastream_id(&self) -> &DatastreamId {
        &self.datastream_id
    }
}

/// Result of [`Synchronizer::apply_observation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Stored and listeners notified
    Applied,
    /// Not newer than the stored observation
    Discarded(MergeDecision),
    /// Datastream was never registered
    Unknown,
    /// Synchronizer has been closed
    Closed,
}

impl ApplyOutcome {
    /// Whether the observation was stored.
    #[must_use]
    pub fn is_applied(self) -> bool {
        matches!(self, ApplyOutcome::Applied)
    }
}

/// Source of out-of-band observation fetches used by
/// [`Synchronizer::force_refresh`].
pub trait ObservationFetcher: Send + Sync {
    /// Fetch the most recent observation of a datastream.
    ///
    /// Returns `Ok(None)` when the datastream has no observations.
    fn fetch_latest(
        &self,
        datastream_id: &DatastreamId,
    ) -> impl Future<Output = Result<Option<Observation>, FetchError>> + Send;
}

#[derive(Default)]
struct Inner {
    datastreams: HashMap<DatastreamId, Datastream>,
    states: HashMap<DatastreamId, SyncState>,
    listeners: HashMap<DatastreamId, Vec<(u64, Listener)>>,
    // Last sequence number delivered to listeners, per datastream.
    gates: HashMap<DatastreamId, Arc<Mutex<u64>>>,
    sequence: u64,
}

/// Authoritative last-known-value map, shared by both producers.
#[derive(Default)]
pub struct Synchronizer {
    inner: Mutex<Inner>,
    next_listener: AtomicU64,
    closed: AtomicBool,
}

impl Synchronizer {
    /// Create an empty synchronizer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a datastream so that observations for it are accepted.
    ///
    /// Re-registering replaces the metadata and keeps the stored state.
    pub fn register_datastream(&self, datastream: Datastream) {
        let mut inner = self.lock();
        tracing::debug!(
            datastream_id = %datastream.id,
            thing_id = %datastream.thing_id,
            name = %datastream.name,
            "Registered datastream"
        );
        inner.datastreams.insert(datastream.id.clone(), datastream);
    }

    /// Whether a datastream has been registered.
    #[must_use]
    pub fn is_known(&self, datastream_id: &DatastreamId) -> bool {
        self.lock().datastreams.contains_key(datastream_id)
    }

    /// Metadata of a registered datastream.
    #[must_use]
    pub fn datastream(&self, datastream_id: &DatastreamId) -> Option<Datastream> {
        self.lock().datastreams.get(datastream_id).cloned()
    }

    /// Identifiers of all registered datastreams, sorted.
    #[must_use]
    pub fn known_datastreams(&self) -> Vec<DatastreamId> {
        let mut ids: Vec<_> = self.lock().datastreams.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Apply an observation from either producer.
    ///
    /// Accepted only when nothing is stored yet or the phenomenon time is
    /// strictly newer than the stored one; equal or older observations are
    /// discarded without notification.
    ///
    /// Listeners run on the calling thread, in acceptance order per
    /// datastream. A listener must not apply observations to its own
    /// datastream.
    pub fn apply_observation(
        &self,
        datastream_id: &DatastreamId,
        observation: Observation,
        source: UpdateSource,
    ) -> ApplyOutcome {
        let (event, listeners, sequence, gate) = {
            let mut inner = self.lock();

            if self.closed.load(Ordering::Acquire) {
                tracing::debug!(%datastream_id, %source, "Synchronizer closed, dropping observation");
                return ApplyOutcome::Closed;
            }

            if !inner.datastreams.contains_key(datastream_id) {
                tracing::debug!(%datastream_id, %source, "Observation for unknown datastream");
                return ApplyOutcome::Unknown;
            }

            let decision = decide(inner.states.get(datastream_id), &observation);
            if !decision.is_accept() {
                tracing::trace!(
                    %datastream_id,
                    %source,
                    phenomenon_time = %observation.phenomenon_time,
                    ?decision,
                    "Discarded observation"
                );
                return ApplyOutcome::Discarded(decision);
            }

            let state = SyncState::new(observation, source);
            inner.states.insert(datastream_id.clone(), state.clone());
            inner.sequence += 1;
            let sequence = inner.sequence;
            let gate = Arc::clone(inner.gates.entry(datastream_id.clone()).or_default());

            let listeners: Vec<Listener> = inner
                .listeners
                .get(datastream_id)
                .map(|list| list.iter().map(|(_, l)| Arc::clone(l)).collect())
                .unwrap_or_default();

            (
                ChangeEvent {
                    datastream_id: datastream_id.clone(),
                    state,
                },
                listeners,
                sequence,
                gate,
            )
        };

        tracing::debug!(
            %datastream_id,
            %source,
            phenomenon_time = %event.state.observation.phenomenon_time,
            result = %event.state.observation.result,
            listeners = listeners.len(),
            "Applied observation"
        );

        let mut delivered = gate.lock().unwrap_or_else(PoisonError::into_inner);
        if *delivered > sequence {
            tracing::trace!(%datastream_id, %source, "Notification superseded by a newer update");
            return ApplyOutcome::Applied;
        }
        *delivered = sequence;

        for listener in listeners {
            notify(&listener, &event);
        }

        ApplyOutcome::Applied
    }

    /// Current state of a datastream, if any observation was accepted.
    #[must_use]
    pub fn get_state(&self, datastream_id: &DatastreamId) -> Option<SyncState> {
        self.lock().states.get(datastream_id).cloned()
    }

    /// Register a listener invoked on every accepted update of a datastream.
    pub fn on_change<F>(&self, datastream_id: &DatastreamId, listener: F) -> ListenerHandle
    where
        F: Fn(&ChangeEvent) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.lock()
            .listeners
            .entry(datastream_id.clone())
            .or_default()
            .push((id, Arc::new(listener)));

        ListenerHandle {
            datastream_id: datastream_id.clone(),
            id,
        }
    }

    /// Unregister a listener. Returns `false` if it was already removed.
    pub fn remove_listener(&self, handle: &ListenerHandle) -> bool {
        let mut inner = self.lock();
        let Some(list) = inner.listeners.get_mut(&handle.datastream_id) else {
            return false;
        };
        let before = list.len();
        list.retain(|(id, _)| *id != handle.id);
        let removed = list.len() != before;
        if list.is_empty() {
            inner.listeners.remove(&handle.datastream_id);
        }
        removed
    }

    /// Number of listeners registered for a datastream.
    #[must_use]
    pub fn listener_count(&self, datastream_id: &DatastreamId) -> usize {
        self.lock().listeners.get(datastream_id).map_or(0, Vec::len)
    }

    /// Fetch the latest observation out of band and apply it as a poll
    /// result.
    ///
    /// Returns `Ok(None)` when the datastream has no observations upstream.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::NotFound`] for unregistered datastreams (no
    /// fetch is attempted) and [`SyncError::Fetch`] when the fetch fails.
    pub async fn force_refresh<F>(
        &self,
        fetcher: &F,
        datastream_id: &DatastreamId,
    ) -> Result<Option<ApplyOutcome>, SyncError>
    where
        F: ObservationFetcher,
    {
        if !self.is_known(datastream_id) {
            return Err(SyncError::NotFound(datastream_id.clone()));
        }

        tracing::debug!(%datastream_id, "Forced refresh");

        let Some(observation) = fetcher.fetch_latest(datastream_id).await? else {
            return Ok(None);
        };

        Ok(Some(self.apply_observation(
            datastream_id,
            observation,
            UpdateSource::Poll,
        )))
    }

    /// Stop accepting writes. Pending fetch results are discarded.
    pub fn close(&self) {
        // Taken under the map lock so no apply is mid-flight.
        let _guard = self.lock();
        self.closed.store(true, Ordering::Release);
    }

    /// Whether [`Synchronizer::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

fn notify(listener: &Listener, event: &ChangeEvent) {
    match catch_unwind(AssertUnwindSafe(|| listener(event))) {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            tracing::warn!(datastream_id = %event.datastream_id, error = %err, "Change listener failed");
        }
        Err(_) => {
            tracing::error!(datastream_id = %event.datastream_id, "Change listener panicked");
        }
    }
}

/// Error reported by a change listener.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct ListenerError(pub String);

/// Errors fetching observations out of band.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    /// Transport failure, timeout, or non-success status
    #[error("network error: {0}")]
    Network(String),
    /// Malformed JSON or missing fields
    #[error("parse error: {0}")]
    Parse(String),
}

/// Errors from synchronizer operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SyncError {
    /// Datastream was never registered
    #[error("datastream {0} not found")]
    NotFound(DatastreamId),
    /// Out-of-band fetch failed
    #[error(transparent)]
    Fetch(#[from] FetchError),
}
