use bluetti_bridge::{BluestTransport, BridgeConfig, StationClient};
use std::time::{Duration, Instant};

/// Connect, switch the AC output on once, then print the battery level every 5 s.
#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let config = BridgeConfig::load(None)?;
    let transport = BluestTransport::new().await?;
    let mut client = StationClient::new(transport, &config);

    let mut switched = false;
    let mut last_print = Instant::now();
    loop {
        client.tick(Instant::now());
        if client.is_connected() && !switched {
            client.request_output(Some(true), None)?;
            switched = true;
        }
        if last_print.elapsed() >= Duration::from_secs(5) {
            let snapshot = client.snapshot();
            println!(
                "{:?}: {}% {}W in {}W out",
                snapshot.connection,
                snapshot.battery_percent,
                snapshot.input_power,
                snapshot.ac_output_power as u32 + snapshot.dc_output_power as u32
            );
            last_print = Instant::now();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
