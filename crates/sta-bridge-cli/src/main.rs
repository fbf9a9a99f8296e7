//! # SensorThings Bridge CLI
//!
//! Command-line utilities for checking endpoints and debugging topics.

use anyhow::{Context, Result};
use sta_bridge_client::{Endpoint, StaClient, StaClientConfig};
use sta_bridge_core::EntityId;
use sta_bridge_mqtt::TopicScheme;
use std::env;

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_help();
        return Ok(());
    }

    match args[1].as_str() {
        "validate" => {
            if args.len() < 3 {
                eprintln!("Usage: sta-bridge validate <url>");
                std::process::exit(1);
            }
            let client = client_for(&args[2])?;
            let document = client
                .fetch_service_document()
                .await
                .context("Endpoint validation failed")?;

            println!("OK: {}", client.endpoint());
            for resource in &document.value {
                println!("  {:<24} {}", resource.name, resource.url);
            }
            for mqtt in document.mqtt_endpoints() {
                println!("  MQTT                     {mqtt}");
            }
        }
        "things" => {
            if args.len() < 3 {
                eprintln!("Usage: sta-bridge things <url>");
                std::process::exit(1);
            }
            let client = client_for(&args[2])?;
            let catalog = client.fetch_catalog().await.context("Discovery failed")?;

            for entry in &catalog.things {
                println!("{} ({})", entry.thing.display_name(), entry.thing.id);
                for ds in &entry.datastreams {
                    println!("  {} ({}) [{}]", ds.name, ds.id, ds.unit_symbol());
                }
            }
        }
        "latest" => {
            if args.len() < 4 {
                eprintln!("Usage: sta-bridge latest <url> <datastream-id>");
                std::process::exit(1);
            }
            let client = client_for(&args[2])?;
            let id = EntityId::from_key(&args[3]);
            match client
                .fetch_latest_observation(&id)
                .await
                .context("Fetch failed")?
            {
                Some(observation) => {
                    println!("{}", serde_json::to_string_pretty(&observation)?);
                }
                None => println!("No observations for datastream {id}"),
            }
        }
        "topic" => {
            if args.len() < 4 {
                eprintln!("Usage: sta-bridge topic <url> <datastream-id>");
                std::process::exit(1);
            }
            let endpoint = Endpoint::parse(&args[2]).context("Invalid endpoint URL")?;
            let scheme = TopicScheme::new(endpoint.version());
            let topic = scheme
                .observations(&EntityId::from_key(&args[3]))
                .context("Invalid datastream id")?;
            println!("{topic}");
        }
        "help" | "--help" | "-h" => {
            print_help();
        }
        cmd => {
            eprintln!("Unknown command: {cmd}");
            print_help();
            std::process::exit(1);
        }
    }

    Ok(())
}

fn client_for(url: &str) -> Result<StaClient> {
    let endpoint = Endpoint::parse(url).context("Invalid endpoint URL")?;
    let mut config = StaClientConfig::new(endpoint);
    config.bearer_token = env::var("STA_BRIDGE_BEARER_TOKEN").ok();
    StaClient::new(config).context("Failed to create client")
}

fn print_help() {
    println!(
        r"SensorThings Bridge CLI

USAGE:
    sta-bridge <COMMAND> [OPTIONS]

COMMANDS:
    validate <url>          Check that an endpoint serves a service document
    things <url>            List Things and their Datastreams
    latest <url> <id>       Print the latest Observation of a Datastream
    topic <url> <id>        Print the MQTT observation topic of a Datastream
    help                    Show this help message

EXAMPLES:
    sta-bridge validate http://localhost:8080/FROST-Server/v1.1
    sta-bridge latest http://localhost:8080/FROST-Server/v1.1 42
"
    );
}
