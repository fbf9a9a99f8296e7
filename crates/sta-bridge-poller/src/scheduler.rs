//! Periodic task scheduling.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

/// Capability to run a task periodically.
pub trait Scheduler: Send + Sync {
    /// Run `task` every `period`, starting one period from now.
    ///
    /// Each run is awaited before the next tick is considered, so runs of
    /// the same task never overlap. Dropping or cancelling the returned
    /// handle stops the schedule.
    fn every<F, Fut>(&self, period: Duration, task: F) -> ScheduledTask
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static;
}

/// Handle to a running schedule.
#[derive(Debug)]
pub struct ScheduledTask {
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    /// Wrap a spawned task.
    #[must_use]
    pub fn from_handle(handle: JoinHandle<()>) -> Self {
        Self { handle }
    }

    /// Stop the schedule. A run in progress is dropped at its next await
    /// point.
    pub fn cancel(&self) {
        self.handle.abort();
    }

    /// Whether the schedule has stopped.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// [`Scheduler`] backed by the Tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn every<F, Fut>(&self, period: Duration, mut task: F) -> ScheduledTask
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        // `interval_at` panics on a zero period.
        let period = period.max(Duration::from_millis(1));

        let handle = tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                task().await;
            }
        });

        ScheduledTask::from_handle(handle)
    }
}
