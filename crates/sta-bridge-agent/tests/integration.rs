use chrono::Utc;
use mockito::Matcher;
use rumqttc::{AsyncClient, EventLoop, MqttOptions, QoS};
use sta_bridge_agent::entities::EntityState;
use sta_bridge_agent::{ChannelSink, ConfigEntry, EntryOptions, EntryRuntime, HttpConfig};
use sta_bridge_core::ObservationResult;
use sta_bridge_mqtt::parse_mqtt_url;
use sta_bridge_poller::TokioScheduler;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use uuid::Uuid;

async fn spawn_eventloop(mut eventloop: EventLoop) {
    loop {
        if eventloop.poll().await.is_err() {
            break;
        }
    }
}

async fn sta_server() -> mockito::ServerGuard {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", Matcher::Regex(r"^/v1\.1/Things$".to_string()))
        .with_body(r#"{"value": [{"@iot.id": 1, "name": "Station"}]}"#)
        .create_async()
        .await;
    server
        .mock("GET", Matcher::Regex(r"^/v1\.1/Things\(1\)/Datastreams$".to_string()))
        .with_body(
            r#"{"value": [{"@iot.id": 10, "name": "Temperature",
                "unitOfMeasurement": {"symbol": "°C"}}]}"#,
        )
        .create_async()
        .await;
    server
        .mock(
            "GET",
            Matcher::Regex(r"^/v1\.1/Datastreams\(10\)/Observations$".to_string()),
        )
        .with_body(r#"{"value": [{"result": 20.0, "phenomenonTime": "2024-01-01T12:00:00Z"}]}"#)
        .create_async()
        .await;
    server
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mqtt_push_reaches_entity() {
    if std::env::var("STA_BRIDGE_INTEGRATION").is_err() {
        eprintln!("Skipping integration test; set STA_BRIDGE_INTEGRATION=1 to run");
        return;
    }

    let broker = std::env::var("STA_BRIDGE_MQTT_BROKER")
        .unwrap_or_else(|_| "tcp://localhost:1883".to_string());
    let (host, port) = parse_mqtt_url(&broker, 1883).unwrap();

    let server = sta_server().await;
    let entry = ConfigEntry {
        entry_id: Uuid::new_v4().to_string(),
        title: "SensorThings (127.0.0.1)".into(),
        url: format!("{}/v1.1", server.url()),
        options: EntryOptions {
            mqtt_host: Some(host.clone()),
            mqtt_port: port,
            ..EntryOptions::default()
        },
        created_at: Utc::now(),
    };

    let (sink, mut updates) = ChannelSink::new();
    let mut runtime = EntryRuntime::start(
        entry,
        &HttpConfig::default(),
        &TokioScheduler,
        Arc::new(sink),
    )
    .await
    .unwrap();
    assert!(runtime.connectivity().is_connected());
    while updates.try_recv().is_ok() {}

    let mut pub_opts = MqttOptions::new(format!("pub-{}", Uuid::new_v4()), host, port);
    pub_opts.set_keep_alive(Duration::from_secs(5));
    let (pub_client, pub_eventloop) = AsyncClient::new(pub_opts, 10);
    tokio::spawn(spawn_eventloop(pub_eventloop));

    tokio::time::sleep(Duration::from_millis(200)).await;

    pub_client
        .publish(
            "v1.1/Datastreams(10)/Observations",
            QoS::AtLeastOnce,
            false,
            r#"{"@iot.id": 77, "result": 23.5, "phenomenonTime": "2024-01-01T12:10:00Z"}"#,
        )
        .await
        .unwrap();

    let update = timeout(Duration::from_secs(5), updates.recv())
        .await
        .expect("timeout waiting for entity update")
        .expect("sink dropped");

    assert_eq!(update.unique_id, "sensorthings_10");
    match update.state {
        EntityState::Sensor(state) => {
            assert_eq!(state.value, Some(ObservationResult::Number(23.5)));
            assert!(state.available);
        }
        EntityState::Binary(_) => panic!("expected sensor update"),
    }

    runtime.unload().await;
    assert!(!runtime.connectivity().is_connected());
}
