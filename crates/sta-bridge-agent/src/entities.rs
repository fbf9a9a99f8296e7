//! Entity adapters.
//!
//! Every Datastream is rendered as one sensor entity and every Thing as one
//! connectivity entity. Adapters read the synchronizer and forward accepted
//! updates to an [`EntitySink`]; they never raise, failures surface as an
//! unavailable entity. Sensors also republish when poll health or MQTT
//! connectivity flips their availability.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sta_bridge_client::{Catalog, Endpoint};
use sta_bridge_core::{
    ConnectivityState, Datastream, DatastreamId, ListenerHandle, ObservationResult,
    PhenomenonTime, SyncState, Synchronizer, Thing, UpdateSource,
};
use sta_bridge_poller::PollHealth;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Identifier namespace of devices and entities.
pub const DOMAIN: &str = "sensorthings";

const DEFAULT_MODEL: &str = "SensorThings Thing";
const DEFAULT_MANUFACTURER: &str = "Unknown";

/// Device registry information of a Thing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    /// `(DOMAIN, thing id)`
    pub identifier: (String, String),
    /// Thing display name
    pub name: String,
    /// `model` property, or a generic model name
    pub model: String,
    /// `manufacturer` property, or "Unknown"
    pub manufacturer: String,
    /// `firmware_version` property, when present
    pub sw_version: Option<String>,
    /// Endpoint the Thing was discovered on
    pub configuration_url: String,
}

impl DeviceInfo {
    /// Device information for `thing` on `endpoint`.
    #[must_use]
    pub fn from_thing(thing: &Thing, endpoint: &Endpoint) -> Self {
        Self {
            identifier: (DOMAIN.to_string(), thing.id.to_string()),
            name: thing.display_name(),
            model: thing
                .property_str("model")
                .unwrap_or(DEFAULT_MODEL)
                .to_string(),
            manufacturer: thing
                .property_str("manufacturer")
                .unwrap_or(DEFAULT_MANUFACTURER)
                .to_string(),
            sw_version: thing
                .property_str("firmware_version")
                .filter(|v| !v.is_empty())
                .map(str::to_string),
            configuration_url: endpoint.to_string(),
        }
    }
}

/// Whether a datastream reports a battery or power level.
#[must_use]
pub fn is_battery_datastream(datastream: &Datastream) -> bool {
    let name = datastream.name.to_lowercase();
    name.contains("battery") || name.contains("power")
}

/// How a sensor renders its datastream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    /// Plain measurement with the datastream's unit
    Measurement,
    /// Diagnostic battery level in percent
    BatteryLevel,
}

/// Host-visible state of a sensor entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorState {
    /// Displayed value
    pub value: Option<ObservationResult>,
    /// Unit of measurement
    pub unit: Option<String>,
    /// Phenomenon time of the displayed value
    pub phenomenon_time: Option<PhenomenonTime>,
    /// When the displayed value was accepted
    pub last_updated: Option<DateTime<Utc>>,
    /// Producer of the displayed value
    pub source: Option<UpdateSource>,
    /// Icon
    pub icon: Option<&'static str>,
    /// Whether the value can be trusted
    pub available: bool,
}

/// Host-visible state of a connectivity entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BinaryState {
    /// Connected
    pub is_on: bool,
    /// Icon
    pub icon: &'static str,
}

/// State carried by an [`EntityUpdate`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntityState {
    /// Sensor entity state
    Sensor(SensorState),
    /// Binary sensor state
    Binary(BinaryState),
}

/// One host-visible entity state change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityUpdate {
    /// Entity unique id
    pub unique_id: String,
    /// Entity name
    pub name: String,
    /// New state
    pub state: EntityState,
}

/// Receiver of entity state changes.
pub trait EntitySink: Send + Sync {
    /// Publish a state change. Must not block.
    fn publish(&self, update: EntityUpdate);
}

/// Sink that logs every update.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl EntitySink for LogSink {
    fn publish(&self, update: EntityUpdate) {
        match &update.state {
            EntityState::Sensor(state) => {
                let value = state
                    .value
                    .as_ref()
                    .map_or_else(|| "unknown".to_string(), ToString::to_string);
                tracing::info!(
                    unique_id = %update.unique_id,
                    name = %update.name,
                    value = %value,
                    unit = state.unit.as_deref().unwrap_or_default(),
                    available = state.available,
                    source = ?state.source,
                    "Sensor state"
                );
            }
            EntityState::Binary(state) => {
                tracing::info!(
                    unique_id = %update.unique_id,
                    name = %update.name,
                    is_on = state.is_on,
                    "Connectivity state"
                );
            }
        }
    }
}

/// Sink forwarding updates into a channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<EntityUpdate>,
}

impl ChannelSink {
    /// Create a sink and the receiving end of its channel.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<EntityUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EntitySink for ChannelSink {
    fn publish(&self, update: EntityUpdate) {
        if self.tx.send(update).is_err() {
            tracing::debug!("Entity update receiver dropped");
        }
    }
}

/// Shared runtime state read by all entities of one config entry.
#[derive(Clone)]
pub struct EntityContext {
    /// State map
    pub sync: Arc<Synchronizer>,
    /// Poll loop health
    pub health: Arc<PollHealth>,
    /// MQTT session state
    pub connectivity: Arc<ConnectivityState>,
    /// Whether MQTT is configured for the entry
    pub mqtt_enabled: bool,
}

impl EntityContext {
    fn signals(&self) -> Signals {
        Signals {
            health: Arc::clone(&self.health),
            connectivity: Arc::clone(&self.connectivity),
            mqtt_enabled: self.mqtt_enabled,
        }
    }
}

// Availability inputs, held by listeners without keeping the synchronizer
// alive.
#[derive(Clone)]
struct Signals {
    health: Arc<PollHealth>,
    connectivity: Arc<ConnectivityState>,
    mqtt_enabled: bool,
}

impl Signals {
    fn mqtt_connected(&self) -> bool {
        self.mqtt_enabled && self.connectivity.is_connected()
    }

    fn reachable(&self) -> bool {
        !self.health.is_failing() || self.mqtt_connected()
    }
}

/// Static description of a sensor entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorDescriptor {
    /// Entity unique id
    pub unique_id: String,
    /// Entity name
    pub name: String,
    /// Rendering
    pub kind: SensorKind,
    /// Backing datastream
    pub datastream_id: DatastreamId,
    /// Unit of measurement
    pub unit: Option<String>,
    /// Diagnostic entities are hidden from default dashboards
    pub diagnostic: bool,
    /// Owning device
    pub device: DeviceInfo,
}

impl SensorDescriptor {
    /// Describe a datastream of `thing`.
    #[must_use]
    pub fn new(thing: &Thing, datastream: &Datastream, kind: SensorKind, device: DeviceInfo) -> Self {
        match kind {
            SensorKind::Measurement => {
                let unit = datastream.unit_symbol();
                Self {
                    unique_id: format!("{DOMAIN}_{}", datastream.id),
                    name: format!("{} {}", thing.display_name(), datastream.name),
                    kind,
                    datastream_id: datastream.id.clone(),
                    unit: (!unit.is_empty()).then(|| unit.to_string()),
                    diagnostic: false,
                    device,
                }
            }
            SensorKind::BatteryLevel => Self {
                unique_id: format!("{DOMAIN}_battery_level_{}", thing.id),
                name: format!("{} Battery Level", thing.display_name()),
                kind,
                datastream_id: datastream.id.clone(),
                unit: Some("%".to_string()),
                diagnostic: true,
                device,
            },
        }
    }

    /// Icon for a displayed value.
    #[must_use]
    pub fn icon(&self, value: Option<&ObservationResult>) -> Option<&'static str> {
        match self.kind {
            SensorKind::Measurement => None,
            SensorKind::BatteryLevel => Some(battery_icon(value.and_then(ObservationResult::as_f64))),
        }
    }

    /// Render a state snapshot.
    #[must_use]
    pub fn render(&self, state: Option<&SyncState>, reachable: bool) -> EntityUpdate {
        let value = state.map(|s| s.observation.result.clone());
        let icon = self.icon(value.as_ref());

        EntityUpdate {
            unique_id: self.unique_id.clone(),
            name: self.name.clone(),
            state: EntityState::Sensor(SensorState {
                icon,
                value,
                unit: self.unit.clone(),
                phenomenon_time: state.map(|s| s.observation.phenomenon_time),
                last_updated: state.map(|s| s.updated_at),
                source: state.map(|s| s.source),
                available: reachable && state.is_some(),
            }),
        }
    }
}

fn battery_icon(level: Option<f64>) -> &'static str {
    match level {
        None => "mdi:battery-unknown",
        Some(l) if l > 75.0 => "mdi:battery",
        Some(l) if l > 50.0 => "mdi:battery-75",
        Some(l) if l > 25.0 => "mdi:battery-50",
        Some(l) if l > 10.0 => "mdi:battery-25",
        Some(_) => "mdi:battery-alert",
    }
}

// Last state handed to the sink. Shared by the change listener and the
// availability task so neither can publish behind the other.
#[derive(Debug, Default)]
struct Published {
    phenomenon_time: Option<PhenomenonTime>,
    available: Option<bool>,
}

struct SensorPublisher {
    descriptor: SensorDescriptor,
    signals: Signals,
    sink: Arc<dyn EntitySink>,
    last: Mutex<Published>,
}

impl SensorPublisher {
    fn lock(&self) -> MutexGuard<'_, Published> {
        self.last.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Forward an accepted update unless a newer value already went out.
    fn accepted(&self, state: &SyncState) {
        let mut last = self.lock();
        let time = state.observation.phenomenon_time;
        if last
            .phenomenon_time
            .is_some_and(|published| !time.is_newer_than(&published))
        {
            return;
        }

        let reachable = self.signals.reachable();
        last.phenomenon_time = Some(time);
        last.available = Some(reachable);
        self.sink.publish(self.descriptor.render(Some(state), reachable));
    }

    /// Re-render the stored state. Without `force`, publishes only when
    /// availability flipped.
    fn refresh(&self, sync: &Synchronizer, force: bool) {
        let mut last = self.lock();
        let state = sync.get_state(&self.descriptor.datastream_id);
        let reachable = self.signals.reachable();
        let available = reachable && state.is_some();
        if !force && last.available == Some(available) {
            return;
        }

        if let Some(time) = state.as_ref().map(|s| s.observation.phenomenon_time) {
            if last
                .phenomenon_time
                .map_or(true, |published| time.is_newer_than(&published))
            {
                last.phenomenon_time = Some(time);
            }
        }
        last.available = Some(available);
        self.sink.publish(self.descriptor.render(state.as_ref(), reachable));
    }
}

/// Sensor entity backed by one datastream.
pub struct SensorEntity {
    descriptor: SensorDescriptor,
    ctx: EntityContext,
    listener: Option<ListenerHandle>,
    task: Option<JoinHandle<()>>,
}

impl SensorEntity {
    /// Create a detached entity.
    #[must_use]
    pub fn new(descriptor: SensorDescriptor, ctx: EntityContext) -> Self {
        Self {
            descriptor,
            ctx,
            listener: None,
            task: None,
        }
    }

    /// Static description.
    #[must_use]
    pub fn descriptor(&self) -> &SensorDescriptor {
        &self.descriptor
    }

    /// Entity unique id.
    #[must_use]
    pub fn unique_id(&self) -> &str {
        &self.descriptor.unique_id
    }

    /// Displayed value.
    #[must_use]
    pub fn value(&self) -> Option<ObservationResult> {
        self.ctx
            .sync
            .get_state(&self.descriptor.datastream_id)
            .map(|s| s.observation.result)
    }

    /// Unavailable while polling fails without a live MQTT session, or
    /// before any observation was accepted.
    #[must_use]
    pub fn available(&self) -> bool {
        self.ctx.signals().reachable()
            && self
                .ctx
                .sync
                .get_state(&self.descriptor.datastream_id)
                .is_some()
    }

    /// Current icon.
    #[must_use]
    pub fn icon(&self) -> Option<&'static str> {
        self.descriptor.icon(self.value().as_ref())
    }

    /// Current rendered state.
    #[must_use]
    pub fn state(&self) -> EntityUpdate {
        let state = self.ctx.sync.get_state(&self.descriptor.datastream_id);
        self.descriptor
            .render(state.as_ref(), self.ctx.signals().reachable())
    }

    /// Publish the current state, then every accepted update and every
    /// availability change to `sink`. Re-attaching replaces the previous
    /// registration.
    ///
    /// Must be called within a Tokio runtime.
    pub fn attach(&mut self, sink: Arc<dyn EntitySink>) {
        self.detach();

        let publisher = Arc::new(SensorPublisher {
            descriptor: self.descriptor.clone(),
            signals: self.ctx.signals(),
            sink,
            last: Mutex::default(),
        });

        let mut health = self.ctx.health.subscribe();
        let mut connected = self.ctx.connectivity.subscribe();
        publisher.refresh(&self.ctx.sync, true);

        let listener = Arc::clone(&publisher);
        self.listener = Some(
            self.ctx
                .sync
                .on_change(&self.descriptor.datastream_id, move |event| {
                    listener.accepted(&event.state);
                    Ok(())
                }),
        );

        let sync = Arc::clone(&self.ctx.sync);
        self.task = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = health.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    changed = connected.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                publisher.refresh(&sync, false);
            }
        }));
    }

    /// Stop forwarding updates. Idempotent.
    pub fn detach(&mut self) {
        if let Some(handle) = self.listener.take() {
            self.ctx.sync.remove_listener(&handle);
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    /// Whether the entity is attached to a sink.
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.listener.is_some()
    }
}

impl Drop for SensorEntity {
    fn drop(&mut self) {
        self.detach();
    }
}

/// Binary entity reporting the MQTT session of a Thing's endpoint.
pub struct ConnectivityEntity {
    unique_id: String,
    name: String,
    device: DeviceInfo,
    ctx: EntityContext,
    task: Option<JoinHandle<()>>,
}

impl ConnectivityEntity {
    /// Create a detached entity for `thing`.
    #[must_use]
    pub fn new(thing: &Thing, device: DeviceInfo, ctx: EntityContext) -> Self {
        Self {
            unique_id: format!("{DOMAIN}_connectivity_{}", thing.id),
            name: format!("{} Connected", thing.display_name()),
            device,
            ctx,
            task: None,
        }
    }

    /// Entity unique id.
    #[must_use]
    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }

    /// Entity name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Owning device.
    #[must_use]
    pub fn device(&self) -> &DeviceInfo {
        &self.device
    }

    /// Always diagnostic.
    #[must_use]
    pub fn diagnostic(&self) -> bool {
        true
    }

    /// Whether the MQTT session is up. Always `false` with MQTT disabled.
    #[must_use]
    pub fn is_on(&self) -> bool {
        self.ctx.signals().mqtt_connected()
    }

    /// Current icon.
    #[must_use]
    pub fn icon(&self) -> &'static str {
        connectivity_icon(self.is_on())
    }

    /// Current rendered state.
    #[must_use]
    pub fn state(&self) -> EntityUpdate {
        render_connectivity(&self.unique_id, &self.name, self.is_on())
    }

    /// Publish the current state and every later transition to `sink`.
    ///
    /// Must be called within a Tokio runtime when MQTT is enabled.
    pub fn attach(&mut self, sink: Arc<dyn EntitySink>) {
        self.detach();

        if !self.ctx.mqtt_enabled {
            sink.publish(self.state());
            return;
        }

        let mut rx = self.ctx.connectivity.subscribe();
        sink.publish(self.state());
        let unique_id = self.unique_id.clone();
        let name = self.name.clone();

        self.task = Some(tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let connected = *rx.borrow_and_update();
                sink.publish(render_connectivity(&unique_id, &name, connected));
            }
        }));
    }

    /// Stop forwarding transitions. Idempotent.
    pub fn detach(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for ConnectivityEntity {
    fn drop(&mut self) {
        self.detach();
    }
}

fn connectivity_icon(connected: bool) -> &'static str {
    if connected {
        "mdi:wifi"
    } else {
        "mdi:wifi-off"
    }
}

fn render_connectivity(unique_id: &str, name: &str, connected: bool) -> EntityUpdate {
    EntityUpdate {
        unique_id: unique_id.to_string(),
        name: name.to_string(),
        state: EntityState::Binary(BinaryState {
            is_on: connected,
            icon: connectivity_icon(connected),
        }),
    }
}

/// Entities of one config entry.
#[derive(Default)]
pub struct EntitySet {
    /// One per Datastream
    pub sensors: Vec<SensorEntity>,
    /// One per Thing
    pub connectivity: Vec<ConnectivityEntity>,
}

impl EntitySet {
    /// Build the entities of a discovered catalog.
    ///
    /// The first battery or power datastream of a Thing is rendered as its
    /// battery-level sensor; every other datastream as a measurement.
    #[must_use]
    pub fn from_catalog(catalog: &Catalog, endpoint: &Endpoint, ctx: &EntityContext) -> Self {
        let mut set = Self::default();

        for entry in &catalog.things {
            let device = DeviceInfo::from_thing(&entry.thing, endpoint);
            let mut battery_seen = false;

            for datastream in &entry.datastreams {
                let kind = if !battery_seen && is_battery_datastream(datastream) {
                    battery_seen = true;
                    SensorKind::BatteryLevel
                } else {
                    SensorKind::Measurement
                };

                let descriptor =
                    SensorDescriptor::new(&entry.thing, datastream, kind, device.clone());
                set.sensors.push(SensorEntity::new(descriptor, ctx.clone()));
            }

            set.connectivity
                .push(ConnectivityEntity::new(&entry.thing, device, ctx.clone()));
        }

        set
    }

    /// Attach every entity to `sink`.
    pub fn attach(&mut self, sink: &Arc<dyn EntitySink>) {
        for sensor in &mut self.sensors {
            sensor.attach(Arc::clone(sink));
        }
        for entity in &mut self.connectivity {
            entity.attach(Arc::clone(sink));
        }
    }

    /// Detach every entity. Idempotent.
    pub fn detach(&mut self) {
        for sensor in &mut self.sensors {
            sensor.detach();
        }
        for entity in &mut self.connectivity {
            entity.detach();
        }
    }

    /// Sensor backed by a datastream.
    #[must_use]
    pub fn sensor(&self, datastream_id: &DatastreamId) -> Option<&SensorEntity> {
        self.sensors
            .iter()
            .find(|s| &s.descriptor.datastream_id == datastream_id)
    }
}
