//! REST polling of the latest observation per datastream.

use crate::scheduler::{ScheduledTask, Scheduler};
use chrono::{DateTime, Utc};
use sta_bridge_client::{Catalog, ClientError, StaClient};
use sta_bridge_core::{ApplyOutcome, ObservationFetcher, Synchronizer, UpdateSource};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;

/// Outcome of one poll cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollReport {
    /// Observations accepted by the synchronizer
    pub applied: usize,
    /// Observations that were not newer than the stored state
    pub discarded: usize,
    /// Datastreams without any observation upstream
    pub empty: usize,
    /// Fetches that failed
    pub failed: usize,
    /// First failure of the cycle
    pub first_error: Option<String>,
}

impl PollReport {
    /// Number of datastreams visited.
    #[must_use]
    pub fn visited(&self) -> usize {
        self.applied + self.discarded + self.empty + self.failed
    }

    /// A cycle fails when it visited datastreams and every fetch failed.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        self.failed > 0 && self.failed == self.visited()
    }
}

#[derive(Debug, Default)]
struct HealthInner {
    last_success: Option<DateTime<Utc>>,
    last_error: Option<String>,
    consecutive_failures: u32,
}

/// Health of the poll loop, read by entity availability.
///
/// The failing flag is also published on a watch channel; only transitions
/// wake watchers.
#[derive(Debug)]
pub struct PollHealth {
    inner: Mutex<HealthInner>,
    failing: watch::Sender<bool>,
}

impl Default for PollHealth {
    fn default() -> Self {
        let (failing, _rx) = watch::channel(false);
        Self {
            inner: Mutex::default(),
            failing,
        }
    }
}

impl PollHealth {
    fn lock(&self) -> MutexGuard<'_, HealthInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a successful cycle.
    pub fn record_success(&self) {
        let mut inner = self.lock();
        inner.last_success = Some(Utc::now());
        inner.consecutive_failures = 0;
        self.publish(false);
    }

    /// Record a failed cycle.
    pub fn record_failure(&self, error: impl Into<String>) {
        let mut inner = self.lock();
        inner.last_error = Some(error.into());
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        self.publish(true);
    }

    fn publish(&self, failing: bool) {
        let changed = self.failing.send_if_modified(|current| {
            let changed = *current != failing;
            *current = failing;
            changed
        });
        if changed {
            tracing::info!(failing, "Poll health changed");
        }
    }

    /// Watch transitions of the failing flag.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.failing.subscribe()
    }

    /// Whether the most recent cycle failed.
    #[must_use]
    pub fn is_failing(&self) -> bool {
        self.lock().consecutive_failures > 0
    }

    /// Failed cycles since the last success.
    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    /// Wall-clock time of the last successful cycle.
    #[must_use]
    pub fn last_success(&self) -> Option<DateTime<Utc>> {
        self.lock().last_success
    }

    /// Most recent failure message.
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.lock().last_error.clone()
    }
}

/// Polls the latest observation of every known datastream.
pub struct Poller<F = StaClient> {
    fetcher: F,
    sync: Arc<Synchronizer>,
    health: Arc<PollHealth>,
}

impl<F: ObservationFetcher> Poller<F> {
    /// Create a poller feeding `sync`.
    pub fn new(fetcher: F, sync: Arc<Synchronizer>) -> Self {
        Self {
            fetcher,
            sync,
            health: Arc::new(PollHealth::default()),
        }
    }

    /// Shared poll health.
    #[must_use]
    pub fn health(&self) -> Arc<PollHealth> {
        Arc::clone(&self.health)
    }

    /// The synchronizer this poller feeds.
    #[must_use]
    pub fn synchronizer(&self) -> &Arc<Synchronizer> {
        &self.sync
    }

    /// The fetcher used for each datastream.
    #[must_use]
    pub fn fetcher(&self) -> &F {
        &self.fetcher
    }

    /// Run one poll cycle.
    ///
    /// Errors are logged and recorded in [`PollHealth`]; they never abort
    /// the remaining datastreams of the cycle.
    pub async fn poll_once(&self) -> PollReport {
        let mut report = PollReport::default();

        if self.sync.is_closed() {
            return report;
        }

        for datastream_id in self.sync.known_datastreams() {
            match self.fetcher.fetch_latest(&datastream_id).await {
                Ok(Some(observation)) => {
                    match self
                        .sync
                        .apply_observation(&datastream_id, observation, UpdateSource::Poll)
                    {
                        ApplyOutcome::Applied => report.applied += 1,
                        ApplyOutcome::Closed => {
                            tracing::debug!("Synchronizer closed during poll cycle");
                            return report;
                        }
                        ApplyOutcome::Discarded(_) | ApplyOutcome::Unknown => {
                            report.discarded += 1;
                        }
                    }
                }
                Ok(None) => report.empty += 1,
                Err(e) => {
                    tracing::warn!(%datastream_id, error = %e, "Poll fetch failed");
                    report.failed += 1;
                    report.first_error.get_or_insert_with(|| e.to_string());
                }
            }
        }

        if report.is_failure() {
            let error = report.first_error.clone().unwrap_or_default();
            tracing::error!(failed = report.failed, error = %error, "Poll cycle failed");
            self.health.record_failure(error);
        } else {
            tracing::debug!(
                applied = report.applied,
                discarded = report.discarded,
                empty = report.empty,
                failed = report.failed,
                "Poll cycle complete"
            );
            self.health.record_success();
        }

        report
    }
}

impl<F: ObservationFetcher + 'static> Poller<F> {
    /// Poll every `period` on `scheduler` until the returned task is
    /// cancelled or dropped.
    pub fn spawn<S: Scheduler>(self: Arc<Self>, scheduler: &S, period: Duration) -> ScheduledTask {
        tracing::info!(period_secs = period.as_secs(), "Starting poll loop");
        scheduler.every(period, move || {
            let poller = Arc::clone(&self);
            async move {
                poller.poll_once().await;
            }
        })
    }
}

impl Poller<StaClient> {
    /// Discover all Things and Datastreams and register the datastreams
    /// with the synchronizer.
    ///
    /// # Errors
    ///
    /// Returns error if discovery fails; nothing is registered in that case.
    pub async fn discover(&self) -> Result<Catalog, PollerError> {
        let catalog = self.fetcher.fetch_catalog().await?;

        for datastream in catalog.datastreams() {
            self.sync.register_datastream(datastream.clone());
        }

        tracing::info!(
            endpoint = %self.fetcher.endpoint(),
            things = catalog.things.len(),
            datastreams = catalog.datastreams().count(),
            "Discovery complete"
        );

        Ok(catalog)
    }
}

/// Errors that can occur with the poller.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PollerError {
    /// Thing or Datastream discovery failed
    #[error("discovery failed: {0}")]
    Discovery(#[from] ClientError),
}
