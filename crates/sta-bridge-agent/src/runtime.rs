//! Per-entry runtime.
//!
//! An [`EntryRuntime`] owns everything one config entry needs: the REST
//! client, the synchronizer, the poll schedule, the optional MQTT session
//! and the entities rendering the state.

use crate::config::HttpConfig;
use crate::entities::{EntityContext, EntitySet, EntitySink};
use crate::store::ConfigEntry;
use sta_bridge_client::{Catalog, ClientError, Endpoint, EndpointError, StaClient, StaClientConfig};
use sta_bridge_core::{
    ApplyOutcome, ConnectivityState, DatastreamId, Observation, Synchronizer, UpdateSource,
};
use sta_bridge_mqtt::{MqttSubscriber, MqttSubscriberConfig, SubscriptionHandle};
use sta_bridge_poller::{PollHealth, Poller, PollerError, ScheduledTask, Scheduler};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Outcome of a forced refresh of every datastream of an entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    /// Newer observations applied
    pub refreshed: usize,
    /// Fetched observations that were not newer
    pub unchanged: usize,
    /// Datastreams without observations upstream
    pub empty: usize,
    /// Fetches that failed
    pub failed: usize,
}

impl RefreshSummary {
    /// Add the counts of `other`.
    pub fn merge(&mut self, other: RefreshSummary) {
        self.refreshed += other.refreshed;
        self.unchanged += other.unchanged;
        self.empty += other.empty;
        self.failed += other.failed;
    }
}

struct MqttSession {
    handle: SubscriptionHandle,
    drain: JoinHandle<()>,
}

impl MqttSession {
    async fn stop(mut self) {
        self.handle.disconnect().await;
        self.drain.abort();
    }
}

/// Running state of one config entry.
pub struct EntryRuntime {
    entry: ConfigEntry,
    endpoint: Endpoint,
    http: HttpConfig,
    poller: Arc<Poller<StaClient>>,
    connectivity: Arc<ConnectivityState>,
    catalog: Catalog,
    entities: EntitySet,
    poll_task: Option<ScheduledTask>,
    mqtt: Option<MqttSession>,
    unloaded: bool,
}

impl EntryRuntime {
    /// Discover the endpoint, run the first poll cycle, attach the entities
    /// to `sink` and start the poll schedule and, if enabled, MQTT.
    ///
    /// An unreachable broker does not fail the start; the session keeps
    /// retrying in the background.
    ///
    /// # Errors
    ///
    /// Returns error if the stored URL is invalid, the client cannot be
    /// built, or discovery fails.
    pub async fn start<S: Scheduler>(
        entry: ConfigEntry,
        http: &HttpConfig,
        scheduler: &S,
        sink: Arc<dyn EntitySink>,
    ) -> Result<Self, RuntimeError> {
        let endpoint = Endpoint::parse(&entry.url)?;
        let client = StaClient::new(StaClientConfig {
            endpoint: endpoint.clone(),
            timeout: http.timeout,
            bearer_token: http.bearer_token.clone(),
            ca_cert_path: http.ca_cert_path.clone(),
        })?;

        let sync = Arc::new(Synchronizer::new());
        let poller = Arc::new(Poller::new(client, Arc::clone(&sync)));
        let catalog = poller.discover().await?;

        let report = poller.poll_once().await;
        tracing::info!(
            entry_id = %entry.entry_id,
            applied = report.applied,
            empty = report.empty,
            failed = report.failed,
            "Initial poll complete"
        );

        let connectivity = Arc::new(ConnectivityState::new());
        let ctx = EntityContext {
            sync,
            health: poller.health(),
            connectivity: Arc::clone(&connectivity),
            mqtt_enabled: entry.options.mqtt_enabled,
        };
        let mut entities = EntitySet::from_catalog(&catalog, &endpoint, &ctx);
        entities.attach(&sink);

        let poll_task = Some(Arc::clone(&poller).spawn(scheduler, entry.options.scan_interval()));

        let mut runtime = Self {
            entry,
            endpoint,
            http: http.clone(),
            poller,
            connectivity,
            catalog,
            entities,
            poll_task,
            mqtt: None,
            unloaded: false,
        };

        if runtime.entry.options.mqtt_enabled {
            runtime.mqtt = runtime.start_mqtt().await;
        }

        tracing::info!(
            entry_id = %runtime.entry.entry_id,
            title = %runtime.entry.title,
            sensors = runtime.entities.sensors.len(),
            things = runtime.entities.connectivity.len(),
            mqtt = runtime.mqtt.is_some(),
            "Entry started"
        );

        Ok(runtime)
    }

    async fn start_mqtt(&self) -> Option<MqttSession> {
        let options = &self.entry.options;
        let host = options.broker_host(&self.endpoint);

        let config = match MqttSubscriberConfig::from_broker(
            host,
            options.mqtt_port,
            self.endpoint.version(),
        ) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(entry_id = %self.entry.entry_id, error = %e, "Invalid MQTT broker, push updates disabled");
                return None;
            }
        };

        let mut subscriber =
            MqttSubscriber::new(config).with_connectivity(Arc::clone(&self.connectivity));

        if let Err(e) = subscriber.connect(self.http.mqtt_connect_timeout).await {
            tracing::warn!(
                entry_id = %self.entry.entry_id,
                broker = %subscriber.broker(),
                error = %e,
                "MQTT broker unavailable, retrying in background"
            );
        }

        let (handle, observations) = subscriber.start();
        for datastream_id in self.poller.synchronizer().known_datastreams() {
            if let Err(e) = handle.subscribe(&datastream_id).await {
                tracing::warn!(%datastream_id, error = %e, "Failed to subscribe datastream");
            }
        }

        let drain = tokio::spawn(drain_observations(
            observations,
            Arc::clone(self.poller.synchronizer()),
        ));

        Some(MqttSession { handle, drain })
    }

    /// Fetch the latest observation of every known datastream out of band.
    pub async fn force_refresh_all(&self) -> RefreshSummary {
        let mut summary = RefreshSummary::default();
        if self.unloaded {
            return summary;
        }

        let sync = self.poller.synchronizer();
        for datastream_id in sync.known_datastreams() {
            match sync.force_refresh(self.poller.fetcher(), &datastream_id).await {
                Ok(Some(ApplyOutcome::Applied)) => summary.refreshed += 1,
                Ok(Some(_)) => summary.unchanged += 1,
                Ok(None) => summary.empty += 1,
                Err(e) => {
                    summary.failed += 1;
                    tracing::warn!(entry_id = %self.entry.entry_id, %datastream_id, error = %e, "Forced refresh failed");
                }
            }
        }

        tracing::info!(
            entry_id = %self.entry.entry_id,
            refreshed = summary.refreshed,
            unchanged = summary.unchanged,
            failed = summary.failed,
            "Forced refresh complete"
        );
        summary
    }

    /// Tear down and re-establish the MQTT session.
    ///
    /// Returns `false` when MQTT is disabled for this entry or the entry is
    /// unloaded.
    pub async fn reconnect_mqtt(&mut self) -> bool {
        if self.unloaded || !self.entry.options.mqtt_enabled {
            return false;
        }

        tracing::info!(entry_id = %self.entry.entry_id, "Reconnecting MQTT");

        if let Some(session) = self.mqtt.take() {
            session.stop().await;
        }

        self.mqtt = self.start_mqtt().await;
        self.mqtt.is_some()
    }

    /// Stop all background work. Idempotent.
    ///
    /// Entities detach first so nothing reaches the host after this
    /// returns; the synchronizer is closed last so in-flight results are
    /// discarded.
    pub async fn unload(&mut self) {
        if self.unloaded {
            return;
        }
        self.unloaded = true;

        self.entities.detach();

        if let Some(task) = self.poll_task.take() {
            task.cancel();
        }

        if let Some(session) = self.mqtt.take() {
            session.stop().await;
        }

        self.poller.synchronizer().close();
        tracing::info!(entry_id = %self.entry.entry_id, "Entry unloaded");
    }

    /// The config entry.
    #[must_use]
    pub fn entry(&self) -> &ConfigEntry {
        &self.entry
    }

    /// The parsed endpoint.
    #[must_use]
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Things and Datastreams discovered at start.
    #[must_use]
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// The state map.
    #[must_use]
    pub fn synchronizer(&self) -> &Arc<Synchronizer> {
        self.poller.synchronizer()
    }

    /// Poll loop health.
    #[must_use]
    pub fn health(&self) -> Arc<PollHealth> {
        self.poller.health()
    }

    /// MQTT session state.
    #[must_use]
    pub fn connectivity(&self) -> &Arc<ConnectivityState> {
        &self.connectivity
    }

    /// Entities of this entry.
    #[must_use]
    pub fn entities(&self) -> &EntitySet {
        &self.entities
    }

    /// Datastreams subscribed over MQTT.
    #[must_use]
    pub fn mqtt_subscriptions(&self) -> Vec<DatastreamId> {
        self.mqtt
            .as_ref()
            .map(|s| s.handle.subscribed())
            .unwrap_or_default()
    }

    /// Whether the MQTT session is running, connected or retrying.
    #[must_use]
    pub fn mqtt_running(&self) -> bool {
        self.mqtt.is_some()
    }

    /// Whether [`EntryRuntime::unload`] has run.
    #[must_use]
    pub fn is_unloaded(&self) -> bool {
        self.unloaded
    }
}

/// Apply observations from the MQTT channel until it closes or the
/// synchronizer is closed.
pub async fn drain_observations(mut rx: mpsc::Receiver<Observation>, sync: Arc<Synchronizer>) {
    while let Some(observation) = rx.recv().await {
        let datastream_id = observation.datastream_id.clone();
        match sync.apply_observation(&datastream_id, observation, UpdateSource::Mqtt) {
            ApplyOutcome::Closed => break,
            ApplyOutcome::Unknown => {
                tracing::debug!(%datastream_id, "Ignoring observation for unknown datastream");
            }
            outcome => tracing::trace!(%datastream_id, ?outcome, "MQTT observation"),
        }
    }
}

/// Errors starting an entry.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RuntimeError {
    /// Stored URL no longer parses
    #[error(transparent)]
    Endpoint(#[from] EndpointError),
    /// HTTP client could not be built
    #[error(transparent)]
    Client(#[from] ClientError),
    /// Discovery failed
    #[error(transparent)]
    Discovery(#[from] PollerError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{ChannelSink, EntityState, EntityUpdate, SensorEntity};
    use crate::flow::EntryOptions;
    use chrono::Utc;
    use mockito::Matcher;
    use sta_bridge_core::{EntityId, ObservationResult, PhenomenonTime};
    use std::future::Future;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::oneshot;

    const CONNACK: [u8; 4] = [0x20, 0x02, 0x00, 0x00];

    /// Records requested periods and never fires.
    #[derive(Default)]
    struct ManualScheduler {
        periods: Mutex<Vec<Duration>>,
    }

    impl Scheduler for ManualScheduler {
        fn every<F, Fut>(&self, period: Duration, _task: F) -> ScheduledTask
        where
            F: FnMut() -> Fut + Send + 'static,
            Fut: Future<Output = ()> + Send + 'static,
        {
            self.periods.lock().unwrap().push(period);
            ScheduledTask::from_handle(tokio::spawn(std::future::pending()))
        }
    }

    async fn two_thing_server() -> mockito::ServerGuard {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", Matcher::Regex(r"^/v1\.1/Things$".to_string()))
            .with_body(
                r#"{"value": [{"@iot.id": 1, "name": "Station A"},
                              {"@iot.id": 2, "name": "Station B"}]}"#,
            )
            .create_async()
            .await;
        for (thing, ds) in [(1, 10), (2, 20)] {
            server
                .mock(
                    "GET",
                    Matcher::Regex(format!(r"^/v1\.1/Things\({thing}\)/Datastreams$")),
                )
                .with_body(format!(
                    r#"{{"value": [{{"@iot.id": {ds}, "name": "Temperature",
                        "unitOfMeasurement": {{"symbol": "°C"}}}}]}}"#
                ))
                .create_async()
                .await;
            server
                .mock(
                    "GET",
                    Matcher::Regex(format!(r"^/v1\.1/Datastreams\({ds}\)/Observations$")),
                )
                .with_body(format!(
                    r#"{{"value": [{{"@iot.id": {ds}00, "result": {ds}.5,
                        "phenomenonTime": "2024-01-01T12:00:00Z"}}]}}"#
                ))
                .create_async()
                .await;
        }
        server
    }

    fn entry_for(server: &mockito::ServerGuard, options: EntryOptions) -> ConfigEntry {
        ConfigEntry {
            entry_id: "entry-1".into(),
            title: "SensorThings (127.0.0.1)".into(),
            url: format!("{}/v1.1", server.url()),
            options,
            created_at: Utc::now(),
        }
    }

    fn polling_only() -> EntryOptions {
        EntryOptions {
            mqtt_enabled: false,
            ..EntryOptions::default()
        }
    }

    fn sensor_value(update: &EntityUpdate) -> Option<ObservationResult> {
        match &update.state {
            EntityState::Sensor(state) => state.value.clone(),
            EntityState::Binary(_) => None,
        }
    }

    fn observation(ds: i64, value: f64, at: &str) -> Observation {
        Observation {
            id: None,
            datastream_id: EntityId::Number(ds),
            result: ObservationResult::Number(value),
            phenomenon_time: PhenomenonTime::parse(at).unwrap(),
            result_time: None,
        }
    }

    fn sensor_available(update: &EntityUpdate) -> Option<bool> {
        match &update.state {
            EntityState::Sensor(state) => Some(state.available),
            EntityState::Binary(_) => None,
        }
    }

    async fn fail_observation_fetches(server: &mut mockito::ServerGuard) {
        for ds in [10, 20] {
            server
                .mock(
                    "GET",
                    Matcher::Regex(format!(r"^/v1\.1/Datastreams\({ds}\)/Observations$")),
                )
                .with_status(503)
                .create_async()
                .await;
        }
    }

    /// Wait for `count` sensor updates, skipping connectivity updates.
    async fn sensor_updates(
        updates: &mut mpsc::UnboundedReceiver<EntityUpdate>,
        count: usize,
    ) -> Vec<EntityUpdate> {
        let mut sensors = Vec::new();
        while sensors.len() < count {
            let update = tokio::time::timeout(Duration::from_secs(5), updates.recv())
                .await
                .expect("timed out waiting for sensor updates")
                .unwrap();
            if matches!(update.state, EntityState::Sensor(_)) {
                sensors.push(update);
            }
        }
        sensors
    }

    async fn read_packet(stream: &mut TcpStream) -> std::io::Result<(u8, Vec<u8>)> {
        let header = stream.read_u8().await?;
        let mut len = 0usize;
        let mut shift = 0;
        loop {
            let byte = stream.read_u8().await?;
            len |= usize::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let mut body = vec![0; len];
        stream.read_exact(&mut body).await?;
        Ok((header, body))
    }

    /// Broker serving a single session; hangs up and stops listening once
    /// `hang_up` fires.
    async fn single_session_broker(listener: TcpListener, hang_up: oneshot::Receiver<()>) {
        let (mut stream, _) = listener.accept().await.unwrap();
        let (header, _) = read_packet(&mut stream).await.unwrap();
        assert_eq!(header >> 4, 1, "expected CONNECT");
        stream.write_all(&CONNACK).await.unwrap();

        let serve = async {
            while let Ok((header, body)) = read_packet(&mut stream).await {
                if header >> 4 == 8 {
                    let suback = [0x90, 0x03, body[0], body[1], 0x01];
                    if stream.write_all(&suback).await.is_err() {
                        break;
                    }
                }
            }
        };

        tokio::select! {
            () = serve => {}
            _ = hang_up => {}
        }
    }

    #[tokio::test]
    async fn poll_then_push_updates_only_pushed_datastream() {
        let server = two_thing_server().await;
        let scheduler = ManualScheduler::default();
        let (sink, mut updates) = ChannelSink::new();

        let mut runtime = EntryRuntime::start(
            entry_for(&server, polling_only()),
            &HttpConfig::default(),
            &scheduler,
            Arc::new(sink),
        )
        .await
        .unwrap();

        assert_eq!(
            scheduler.periods.lock().unwrap().as_slice(),
            &[Duration::from_secs(60)]
        );

        let entities = runtime.entities();
        assert_eq!(entities.sensors.len(), 2);
        let ds1 = EntityId::Number(10);
        let ds2 = EntityId::Number(20);
        assert_eq!(
            entities.sensor(&ds1).unwrap().value(),
            Some(ObservationResult::Number(10.5))
        );
        assert_eq!(
            entities.sensor(&ds2).unwrap().value(),
            Some(ObservationResult::Number(20.5))
        );

        // Initial states: two sensors and two connectivity entities.
        for _ in 0..4 {
            updates.try_recv().unwrap();
        }

        let (tx, rx) = mpsc::channel(8);
        let drain = tokio::spawn(drain_observations(rx, Arc::clone(runtime.synchronizer())));

        tx.send(observation(10, 11.0, "2024-01-01T12:05:00Z"))
            .await
            .unwrap();
        let update = updates.recv().await.unwrap();
        assert_eq!(update.unique_id, "sensorthings_10");
        assert_eq!(sensor_value(&update), Some(ObservationResult::Number(11.0)));

        let entities = runtime.entities();
        assert_eq!(
            entities.sensor(&ds1).unwrap().value(),
            Some(ObservationResult::Number(11.0))
        );
        assert_eq!(
            entities.sensor(&ds2).unwrap().value(),
            Some(ObservationResult::Number(20.5))
        );

        // Older push after a newer value is discarded.
        tx.send(observation(10, 9.0, "2024-01-01T11:00:00Z"))
            .await
            .unwrap();
        drop(tx);
        drain.await.unwrap();
        assert!(updates.try_recv().is_err());

        runtime.unload().await;
    }

    #[tokio::test]
    async fn force_refresh_all_applies_newer_observations() {
        let mut server = two_thing_server().await;
        let scheduler = ManualScheduler::default();
        let (sink, _updates) = ChannelSink::new();

        let runtime = EntryRuntime::start(
            entry_for(&server, polling_only()),
            &HttpConfig::default(),
            &scheduler,
            Arc::new(sink),
        )
        .await
        .unwrap();

        // The original mock is already satisfied, so the unhit one answers.
        server
            .mock(
                "GET",
                Matcher::Regex(r"^/v1\.1/Datastreams\(10\)/Observations$".to_string()),
            )
            .with_body(
                r#"{"value": [{"result": 12.0, "phenomenonTime": "2024-01-01T13:00:00Z"}]}"#,
            )
            .create_async()
            .await;

        let summary = runtime.force_refresh_all().await;
        assert_eq!(
            summary,
            RefreshSummary {
                refreshed: 1,
                unchanged: 1,
                empty: 0,
                failed: 0
            }
        );
        assert_eq!(
            runtime
                .entities()
                .sensor(&EntityId::Number(10))
                .unwrap()
                .value(),
            Some(ObservationResult::Number(12.0))
        );
    }

    #[tokio::test]
    async fn unload_is_idempotent_and_stops_writes() {
        let server = two_thing_server().await;
        let scheduler = ManualScheduler::default();
        let (sink, mut updates) = ChannelSink::new();

        let mut runtime = EntryRuntime::start(
            entry_for(&server, polling_only()),
            &HttpConfig::default(),
            &scheduler,
            Arc::new(sink),
        )
        .await
        .unwrap();
        while updates.try_recv().is_ok() {}

        runtime.unload().await;
        runtime.unload().await;
        assert!(runtime.is_unloaded());

        let outcome = runtime.synchronizer().apply_observation(
            &EntityId::Number(10),
            observation(10, 99.0, "2030-01-01T00:00:00Z"),
            UpdateSource::Mqtt,
        );
        assert_eq!(outcome, ApplyOutcome::Closed);
        assert!(updates.try_recv().is_err());

        assert_eq!(runtime.force_refresh_all().await, RefreshSummary::default());
        assert!(!runtime.reconnect_mqtt().await);
    }

    #[tokio::test]
    async fn failed_polls_mark_sensors_unavailable() {
        let mut server = two_thing_server().await;
        let (sink, mut updates) = ChannelSink::new();

        let mut runtime = EntryRuntime::start(
            entry_for(&server, polling_only()),
            &HttpConfig::default(),
            &ManualScheduler::default(),
            Arc::new(sink),
        )
        .await
        .unwrap();
        while updates.try_recv().is_ok() {}

        fail_observation_fetches(&mut server).await;
        let report = runtime.poller.poll_once().await;
        assert_eq!(report.failed, 2);
        assert!(runtime.health().is_failing());

        let published = sensor_updates(&mut updates, 2).await;
        let mut ids: Vec<_> = published.iter().map(|u| u.unique_id.as_str()).collect();
        ids.sort_unstable();
        assert_eq!(ids, ["sensorthings_10", "sensorthings_20"]);
        for update in &published {
            assert_eq!(sensor_available(update), Some(false));
            // The last value stays visible.
            assert!(sensor_value(update).is_some());
        }

        // Still failing is not a transition.
        runtime.poller.poll_once().await;
        tokio::task::yield_now().await;
        assert!(updates.try_recv().is_err());

        runtime.unload().await;
    }

    #[tokio::test]
    async fn broker_drop_marks_sensors_unavailable_while_polls_fail() {
        let mut server = two_thing_server().await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (hang_up, hung_up) = oneshot::channel();
        let broker = tokio::spawn(single_session_broker(listener, hung_up));

        let options = EntryOptions {
            mqtt_host: Some("127.0.0.1".into()),
            mqtt_port: port,
            ..EntryOptions::default()
        };
        let (sink, mut updates) = ChannelSink::new();
        let mut runtime = EntryRuntime::start(
            entry_for(&server, options),
            &HttpConfig::default(),
            &ManualScheduler::default(),
            Arc::new(sink),
        )
        .await
        .unwrap();
        assert!(runtime.connectivity().is_connected());

        fail_observation_fetches(&mut server).await;
        runtime.poller.poll_once().await;
        assert!(runtime.health().is_failing());

        // Push is live, so the sensors stay available.
        assert!(runtime.entities().sensors.iter().all(SensorEntity::available));
        tokio::time::sleep(Duration::from_millis(100)).await;
        while let Ok(update) = updates.try_recv() {
            assert_ne!(sensor_available(&update), Some(false));
        }

        hang_up.send(()).unwrap();
        broker.await.unwrap();

        let published = sensor_updates(&mut updates, 2).await;
        for update in &published {
            assert_eq!(sensor_available(update), Some(false));
        }
        assert!(!runtime.connectivity().is_connected());
        assert!(!runtime.entities().connectivity[0].is_on());

        runtime.unload().await;
    }

    #[tokio::test]
    async fn discovery_failure_fails_start() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", Matcher::Regex(r"^/v1\.1/Things$".to_string()))
            .with_status(500)
            .create_async()
            .await;

        let (sink, _updates) = ChannelSink::new();
        let result = EntryRuntime::start(
            entry_for(&server, polling_only()),
            &HttpConfig::default(),
            &ManualScheduler::default(),
            Arc::new(sink),
        )
        .await;

        assert!(matches!(result, Err(RuntimeError::Discovery(_))));
    }

    #[tokio::test]
    async fn unreachable_broker_keeps_subscriptions_for_retry() {
        let server = two_thing_server().await;
        let options = EntryOptions {
            mqtt_host: Some("127.0.0.1".into()),
            mqtt_port: 1,
            ..EntryOptions::default()
        };
        let http = HttpConfig {
            mqtt_connect_timeout: Duration::from_secs(2),
            ..HttpConfig::default()
        };
        let (sink, _updates) = ChannelSink::new();

        let mut runtime = EntryRuntime::start(
            entry_for(&server, options),
            &http,
            &ManualScheduler::default(),
            Arc::new(sink),
        )
        .await
        .unwrap();

        assert!(runtime.mqtt_running());
        assert!(!runtime.connectivity().is_connected());
        assert_eq!(
            runtime.mqtt_subscriptions(),
            vec![EntityId::Number(10), EntityId::Number(20)]
        );
        assert!(!runtime.entities().connectivity[0].is_on());

        assert!(runtime.reconnect_mqtt().await);
        assert_eq!(runtime.mqtt_subscriptions().len(), 2);

        runtime.unload().await;
        assert!(!runtime.mqtt_running());
    }
}
