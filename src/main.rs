use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use log::info;
use tokio::sync::mpsc;

mod config;
mod manager;
mod messages;
mod mqtt;
mod registry;
mod room;
mod topics;

#[cfg(test)]
mod test_support;

#[derive(Parser, Debug)]
#[command(author, version, about = "Room occupancy from ESPresense nodes over MQTT")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    pretty_env_logger::formatted_builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let args = Args::parse();
    let config = config::AppConfig::load(&args.config).await?;

    let configured: Vec<&str> = config
        .rooms
        .iter()
        .flatten()
        .map(|room| room.name.as_str())
        .collect();
    info!("Configured rooms: {:?}", configured);

    let (mqtt_client, mut eventloop) = mqtt::MqttClient::new(&config.mqtt);
    let transport: Arc<dyn mqtt::Transport> = Arc::new(mqtt_client.clone());

    let registry_config = config.registry.clone().unwrap_or_default();
    let registry = registry::MqttAccessoryRegistry::load(
        transport.clone(),
        registry_config
            .state_topic_path
            .unwrap_or("presence".to_string()),
        registry_config.cache_path,
    )
    .await?;

    let (tx, rx) = mpsc::unbounded_channel();
    let core = manager::Manager::new(config, transport, Arc::new(registry));

    tokio::select! {
        result = mqtt::MqttClient::event_loop(&mut eventloop, tx) => {
            result.context("MQTT connection failed")?;
        }
        result = core.run_loop(rx) => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            mqtt_client.shutdown(&mut eventloop).await?;
        }
    }

    Ok(())
}
