//! # SensorThings Poller
//!
//! Timer-driven REST polling that feeds the [`Synchronizer`].
//!
//! ## Scheduling
//!
//! Periodic work goes through the [`Scheduler`] capability rather than a
//! runtime timer directly, so a poll loop can be driven by the Tokio timer
//! in production and by paused time in tests. A cycle is always awaited
//! before the next tick is considered: cycles never overlap and missed
//! ticks are delayed, not replayed in a burst.
//!
//! [`Synchronizer`]: sta_bridge_core::Synchronizer

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod poller;
pub mod scheduler;

pub use poller::{PollHealth, PollReport, Poller, PollerError};
pub use scheduler::{ScheduledTask, Scheduler, TokioScheduler};
