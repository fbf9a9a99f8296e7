//! # SensorThings Bridge Core
//!
//! Observation model and dual-source state synchronization for the
//! SensorThings bridge.
//!
//! This crate provides:
//! - The SensorThings entity model (Things, Datastreams, Observations)
//! - Phenomenon time parsing for instants and intervals
//! - The last-writer-wins merge policy keyed on phenomenon time
//! - The [`Synchronizer`] that reconciles poll and MQTT updates
//! - MQTT connectivity tracking with de-duplicated transitions

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod connectivity;
pub mod merge;
pub mod model;
pub mod sync;
pub mod time;

pub use connectivity::ConnectivityState;
pub use merge::{MergeDecision, SyncState, UpdateSource};
pub use model::{
    Datastream, DatastreamId, EntityId, Observation, ObservationResult, Thing, ThingId,
    UnitOfMeasurement,
};
pub use sync::{
    ApplyOutcome, ChangeEvent, FetchError, ListenerError, ListenerHandle, ObservationFetcher,
    SyncError, Synchronizer,
};
pub use time::PhenomenonTime;
