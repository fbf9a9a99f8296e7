//! # SensorThings Client
//!
//! HTTP client for the OGC SensorThings API.
//!
//! ## Addressing Rules
//!
//! - The endpoint URL ends in a version segment (`.../v1.1`)
//! - Entities are addressed by key: `Things(5)`, `Things('abc')`
//! - String keys are single-quoted with embedded quotes doubled
//! - Collections are paged through `@iot.nextLink`, which is followed to
//!   completion

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod endpoint;

pub use client::{
    Catalog, CatalogThing, ClientError, ErrorKind, ServiceDocument, StaClient, StaClientConfig,
};
pub use endpoint::{Endpoint, EndpointError};
