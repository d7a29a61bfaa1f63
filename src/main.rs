use std::path::PathBuf;

use anyhow::Context as _;
use clap::Parser;
use log::info;

mod config;
mod error;
mod manager;
mod messages;
mod mqtt;
mod publisher;
mod scanner;
mod tracker;

/// Publishes BLE beacon signal strength to Home Assistant over MQTT.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pretty_env_logger::formatted_timed_builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let args = Args::parse();
    let config_contents = std::fs::read_to_string(&args.config)
        .with_context(|| format!("could not read {}", args.config.display()))?;
    let config: config::AppConfig = toml::de::from_str(&config_contents)
        .with_context(|| format!("could not parse {}", args.config.display()))?;
    config.validate()?;

    let scanner = scanner::BtleScanner::new(config.scan.adapter_index()).await?;
    let session = publisher::PublishSession::new(
        mqtt::MqttBroker::new(&config.mqtt),
        config.mqtt.discovery_prefix(),
    );
    let tracker = tracker::PresenceTracker::new(config.tracker.clone());

    let mut core = manager::Manager::new(scanner, tracker, session, &config.scan);
    tokio::select! {
        _ = core.run_loop() => {}
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }
    core.shutdown().await;

    Ok(())
}
