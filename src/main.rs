use anyhow::Context;
use bluetti_bridge::{BluestTransport, BridgeConfig, StationClient};
use std::path::PathBuf;
use std::time::Instant;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const TICK: Duration = Duration::from_millis(100);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = BridgeConfig::load(config_path.as_deref()).context("Invalid configuration")?;
    info!("Starting with {config:?}");

    let transport = BluestTransport::new().await?;
    let mut client = StationClient::new(transport, &config);
    let mut snapshots = client.subscribe_snapshot();

    let mut ticker = interval(TICK);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                client.tick(Instant::now());
                if snapshots.has_changed().unwrap_or(false) {
                    let snapshot = snapshots.borrow_and_update().clone();
                    match serde_json::to_string(&snapshot) {
                        Ok(json) => info!("{json}"),
                        Err(err) => warn!("Failed to serialize snapshot: {err}"),
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                client.set_enabled(false);
                break;
            }
        }
    }

    Ok(())
}
