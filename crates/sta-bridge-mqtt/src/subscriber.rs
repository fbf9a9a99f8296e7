//! SensorThings MQTT subscriber for observation push delivery.

use crate::payload::parse_observation;
use crate::topics::{TopicError, TopicScheme};
use rumqttc::{
    AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, SubscribeFilter,
};
use sta_bridge_core::{ConnectivityState, DatastreamId, Observation};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use url::Url;

/// Default MQTT broker port.
pub const DEFAULT_MQTT_PORT: u16 = 1883;

/// Capacity of the observation channel handed to the consumer.
///
/// The event loop never waits on a full channel; excess messages are
/// dropped and the next poll cycle catches up.
pub const OBSERVATION_CHANNEL_CAPACITY: usize = 100;

/// How long a graceful disconnect may take before the loop is aborted.
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

/// Configuration for the MQTT subscriber.
#[derive(Debug, Clone)]
pub struct MqttSubscriberConfig {
    /// Broker host
    pub host: String,
    /// Broker port
    pub port: u16,
    /// Client ID for the MQTT connection
    pub client_id: String,
    /// Keep-alive interval
    pub keep_alive: Duration,
    /// Topic scheme of the endpoint's API version
    pub topics: TopicScheme,
    /// Delay between reconnect attempts
    pub backoff: Backoff,
}

impl MqttSubscriberConfig {
    /// Configuration for a broker at `host:port` serving API `version`.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16, version: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            client_id: format!("sta-bridge-{}", uuid::Uuid::new_v4().simple()),
            keep_alive: Duration::from_secs(60),
            topics: TopicScheme::new(version),
            backoff: Backoff::default(),
        }
    }

    /// Configuration from a broker address such as `mqtt://host:1883`,
    /// `host:1883` or `host`. `default_port` applies when none is given.
    ///
    /// # Errors
    ///
    /// Returns error if the address cannot be parsed.
    pub fn from_broker(
        broker: &str,
        default_port: u16,
        version: impl Into<String>,
    ) -> Result<Self, SubscriberError> {
        let (host, port) = parse_mqtt_url(broker, default_port)?;
        Ok(Self::new(host, port, version))
    }
}

/// Exponential reconnect delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }
}

impl Backoff {
    /// Backoff starting at `initial` and doubling up to `max`.
    #[must_use]
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    /// Start over after a successful connection.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

type TopicSet = Arc<Mutex<BTreeSet<DatastreamId>>>;

fn lock_topics(topics: &TopicSet) -> MutexGuard<'_, BTreeSet<DatastreamId>> {
    topics.lock().unwrap_or_else(PoisonError::into_inner)
}

/// MQTT subscriber for SensorThings observations.
pub struct MqttSubscriber {
    client: AsyncClient,
    eventloop: EventLoop,
    config: MqttSubscriberConfig,
    connectivity: Arc<ConnectivityState>,
}

impl MqttSubscriber {
    /// Create a new subscriber. No network activity happens until
    /// [`MqttSubscriber::connect`] or [`MqttSubscriber::start`].
    #[must_use]
    pub fn new(config: MqttSubscriberConfig) -> Self {
        let mut mqtt_options = MqttOptions::new(&config.client_id, &config.host, config.port);
        mqtt_options.set_keep_alive(config.keep_alive);

        let (client, eventloop) = AsyncClient::new(mqtt_options, 100);

        Self {
            client,
            eventloop,
            config,
            connectivity: Arc::new(ConnectivityState::new()),
        }
    }

    /// Report connection changes to an existing connectivity state.
    #[must_use]
    pub fn with_connectivity(mut self, connectivity: Arc<ConnectivityState>) -> Self {
        self.connectivity = connectivity;
        self
    }

    /// Broker address as `host:port`.
    #[must_use]
    pub fn broker(&self) -> String {
        format!("{}:{}", self.config.host, self.config.port)
    }

    /// Establish the connection, waiting at most `timeout` for `CONNACK`.
    ///
    /// # Errors
    ///
    /// Returns error if the broker refuses or cannot be reached in time.
    pub async fn connect(&mut self, timeout: Duration) -> Result<(), ConnectError> {
        tracing::info!(broker = %self.broker(), "Connecting to MQTT broker");

        let eventloop = &mut self.eventloop;
        let handshake = async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
                    Ok(_) => {}
                    Err(e) => return Err(ConnectError::Connection(e.to_string())),
                }
            }
        };

        let result = tokio::time::timeout(timeout, handshake).await;
        match result {
            Ok(Ok(())) => {
                tracing::info!(broker = %self.broker(), "Connected to MQTT broker");
                self.connectivity.mark_connected();
                Ok(())
            }
            Ok(Err(e)) => {
                self.connectivity.mark_disconnected();
                Err(e)
            }
            Err(_) => {
                self.connectivity.mark_disconnected();
                Err(ConnectError::Timeout(timeout))
            }
        }
    }

    /// Start the event loop.
    ///
    /// Returns a handle for managing subscriptions and a channel of parsed
    /// observations. Malformed messages are logged and dropped.
    #[must_use]
    pub fn start(self) -> (SubscriptionHandle, mpsc::Receiver<Observation>) {
        let (tx, rx) = mpsc::channel(OBSERVATION_CHANNEL_CAPACITY);
        let topics: TopicSet = Arc::default();

        let task = tokio::spawn(run_event_loop(
            self.eventloop,
            self.client.clone(),
            self.config.topics.clone(),
            self.config.backoff.clone(),
            Arc::clone(&topics),
            Arc::clone(&self.connectivity),
            tx,
        ));

        let handle = SubscriptionHandle {
            client: self.client,
            scheme: self.config.topics,
            topics,
            connectivity: self.connectivity,
            task: Some(task),
        };

        (handle, rx)
    }
}

async fn run_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    scheme: TopicScheme,
    mut backoff: Backoff,
    topics: TopicSet,
    connectivity: Arc<ConnectivityState>,
    tx: mpsc::Sender<Observation>,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let payload_len = publish.payload.len();
                tracing::debug!(topic = %publish.topic, payload_len, "Received MQTT message");

                match parse_observation(&scheme, &publish.topic, &publish.payload) {
                    Ok(observation) => {
                        if !forward(&tx, observation) {
                            tracing::warn!("Observation receiver dropped, stopping subscriber");
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(
                            error = %err,
                            topic = %publish.topic,
                            payload_len,
                            "Dropping malformed observation"
                        );
                    }
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                tracing::info!("Connected to MQTT broker");
                connectivity.mark_connected();
                backoff.reset();
                resubscribe(&client, &scheme, &topics);
            }
            Ok(Event::Incoming(Packet::SubAck(_))) => {
                tracing::debug!("Subscription acknowledged");
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                tracing::warn!("Broker closed the MQTT session");
                connectivity.mark_disconnected();
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                tracing::info!("Disconnected from MQTT broker");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                connectivity.mark_disconnected();
                let delay = backoff.next_delay();
                tracing::warn!(
                    error = %e,
                    retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "MQTT connection error"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }

    connectivity.mark_disconnected();
}

/// Hand an observation to the consumer without waiting, so keep-alive
/// traffic is never held up. Returns `false` once the receiver is gone.
fn forward(tx: &mpsc::Sender<Observation>, observation: Observation) -> bool {
    match tx.try_send(observation) {
        Ok(()) => true,
        Err(TrySendError::Full(dropped)) => {
            tracing::warn!(
                datastream_id = %dropped.datastream_id,
                capacity = OBSERVATION_CHANNEL_CAPACITY,
                "Observation channel full, dropping message"
            );
            true
        }
        Err(TrySendError::Closed(_)) => false,
    }
}

/// Re-issue every subscription after a (re)connect.
fn resubscribe(client: &AsyncClient, scheme: &TopicScheme, topics: &TopicSet) {
    let filters: Vec<SubscribeFilter> = lock_topics(topics)
        .iter()
        .filter_map(|id| scheme.observations(id).ok())
        .map(|topic| SubscribeFilter::new(topic, QoS::AtLeastOnce))
        .collect();

    if filters.is_empty() {
        return;
    }

    let count = filters.len();
    match client.try_subscribe_many(filters) {
        Ok(()) => tracing::info!(count, "Re-subscribed observation topics"),
        Err(e) => tracing::error!(error = %e, count, "Failed to re-subscribe observation topics"),
    }
}

/// Handle to a running subscriber.
pub struct SubscriptionHandle {
    client: AsyncClient,
    scheme: TopicScheme,
    topics: TopicSet,
    connectivity: Arc<ConnectivityState>,
    task: Option<JoinHandle<()>>,
}

impl SubscriptionHandle {
    /// Subscribe to the observations of a datastream.
    ///
    /// The subscription is remembered and re-issued after every reconnect;
    /// while disconnected it is only remembered.
    ///
    /// # Errors
    ///
    /// Returns error if the datastream id cannot form a topic (nothing is
    /// remembered then) or the subscribe request cannot be queued.
    pub async fn subscribe(&self, datastream_id: &DatastreamId) -> Result<(), SubscriberError> {
        let topic = self.scheme.observations(datastream_id)?;
        let inserted = lock_topics(&self.topics).insert(datastream_id.clone());
        if !inserted || !self.is_connected() {
            return Ok(());
        }

        tracing::debug!(topic, "Subscribing to observations");

        self.client
            .subscribe(&topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| SubscriberError::Subscribe(e.to_string()))
    }

    /// Stop receiving observations of a datastream.
    ///
    /// # Errors
    ///
    /// Returns error if the unsubscribe request cannot be queued.
    pub async fn unsubscribe(&self, datastream_id: &DatastreamId) -> Result<(), SubscriberError> {
        let removed = lock_topics(&self.topics).remove(datastream_id);
        if !removed || !self.is_connected() {
            return Ok(());
        }

        let topic = self.scheme.observations(datastream_id)?;
        tracing::debug!(topic, "Unsubscribing from observations");

        self.client
            .unsubscribe(&topic)
            .await
            .map_err(|e| SubscriberError::Subscribe(e.to_string()))
    }

    /// Datastreams currently subscribed, sorted.
    #[must_use]
    pub fn subscribed(&self) -> Vec<DatastreamId> {
        lock_topics(&self.topics).iter().cloned().collect()
    }

    /// Whether the session is currently connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connectivity.is_connected()
    }

    /// Watch connectivity transitions.
    #[must_use]
    pub fn connectivity(&self) -> watch::Receiver<bool> {
        self.connectivity.subscribe()
    }

    /// Disconnect and stop the event loop. Idempotent.
    pub async fn disconnect(&mut self) {
        let Some(mut task) = self.task.take() else {
            return;
        };

        if self.is_connected()
            && self.client.disconnect().await.is_ok()
            && tokio::time::timeout(DISCONNECT_GRACE, &mut task)
                .await
                .is_err()
        {
            tracing::warn!("MQTT event loop did not stop in time, aborting");
        }

        task.abort();
        self.connectivity.mark_disconnected();
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Parse an MQTT broker address into host and port.
///
/// Accepts `tcp://` and `mqtt://` URLs as well as bare `host[:port]`.
///
/// # Errors
///
/// Returns error if the address is malformed.
pub fn parse_mqtt_url(input: &str, default_port: u16) -> Result<(String, u16), SubscriberError> {
    if input.contains("://") {
        let url =
            Url::parse(input).map_err(|e| SubscriberError::InvalidUrl(format!("{input}: {e}")))?;

        match url.scheme() {
            "tcp" | "mqtt" => {}
            scheme => {
                return Err(SubscriberError::InvalidUrl(format!(
                    "{input}: unsupported scheme '{scheme}'"
                )));
            }
        }

        let host = url
            .host_str()
            .ok_or_else(|| SubscriberError::InvalidUrl(format!("{input}: missing host")))?;
        let port = url.port().unwrap_or(default_port);

        return Ok((host.to_string(), port));
    }

    let mut parts = input.split(':');
    let host = parts
        .next()
        .filter(|value| !value.is_empty())
        .ok_or_else(|| SubscriberError::InvalidUrl(format!("{input}: missing host")))?;
    let port = match parts.next() {
        None => default_port,
        Some(port) => port
            .parse()
            .map_err(|_| SubscriberError::InvalidUrl(format!("{input}: invalid port '{port}'")))?,
    };
    if parts.next().is_some() {
        return Err(SubscriberError::InvalidUrl(format!(
            "{input}: too many ':' separators"
        )));
    }

    Ok((host.to_string(), port))
}

/// Errors establishing the initial MQTT connection.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnectError {
    /// Broker unreachable or refused the connection
    #[error("MQTT connection failed: {0}")]
    Connection(String),
    /// No `CONNACK` within the timeout
    #[error("MQTT connection timed out after {0:?}")]
    Timeout(Duration),
}

/// Errors that can occur with the subscriber.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SubscriberError {
    /// Invalid MQTT URL
    #[error("invalid MQTT URL: {0}")]
    InvalidUrl(String),
    /// Subscription request failed
    #[error("subscription error: {0}")]
    Subscribe(String),
    /// Datastream id cannot form a topic
    #[error(transparent)]
    Topic(#[from] TopicError),
}
