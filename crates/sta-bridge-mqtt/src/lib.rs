//! # SensorThings MQTT Subscriber
//!
//! Push delivery of new Observations from the MQTT extension of the
//! SensorThings API.
//!
//! ## Topics
//!
//! Servers publish every created Observation on:
//! - `{version}/Datastreams({id})/Observations` (per datastream)
//! - `{version}/Observations` (all observations, with an expanded
//!   `Datastream` in the payload)
//!
//! The subscriber listens on the per-datastream topics of the datastreams
//! it is asked for, re-issuing every subscription after each reconnect.
//!
//! ## Reconnection
//!
//! Connection loss flips the connectivity flag off immediately. The event
//! loop then retries with exponential backoff (1 s doubling up to 30 s),
//! resetting the delay on every successful `CONNACK`.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod payload;
pub mod subscriber;
pub mod topics;

pub use payload::{parse_observation, PayloadError};
pub use subscriber::{
    parse_mqtt_url, Backoff, ConnectError, MqttSubscriber, MqttSubscriberConfig,
    SubscriberError, SubscriptionHandle,
};
pub use topics::{TopicError, TopicScheme, TopicTarget};
