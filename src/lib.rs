//! Monitor and control Bluetti style battery power stations over Bluetooth Low Energy
//!
//! Tested with an EB3A. Other units of the same generation speak the same protocol but may
//! refuse some of the control registers.
//!
//! The station has a BLE interface with one write and one notify characteristic. On top of
//! that it speaks MODBUS-RTU, once it has been woken by a short vendor command. The register
//! map is not documented; the layout used here was worked out by observation.
//!
//! Currently the following data can be accessed:
//!
//! - Battery level (%) and battery voltage (V)
//! - AC and DC input power (W)
//! - AC and DC output power (W) and switch state
//! - Charging mode, eco mode, eco shutdown delay, power lifting and LED mode
//! - Model name
//!
//! And the following can be controlled:
//!
//! - AC and DC outputs
//! - Charging mode, eco mode, eco shutdown delay, power lifting and LED mode
//! - Power off
//!
//! Writes the station refuses are remembered and not attempted again on the same link.
//!
//! # Example
//!
//! ```no_run
//! # use std::time::{Duration, Instant};
//! #
//! # #[tokio::main]
//! # pub async fn main() -> anyhow::Result<()> {
//!     let config = bluetti_bridge::BridgeConfig::load(None)?;
//!     let transport = bluetti_bridge::BluestTransport::new().await?;
//!     let mut client = bluetti_bridge::StationClient::new(transport, &config);
//!     loop {
//!         client.tick(Instant::now());
//!         println!("{:?}", client.snapshot());
//!         tokio::time::sleep(Duration::from_millis(100)).await;
//!     }
//! # }
//! ```

mod ble;
pub mod capability;
pub mod config;
pub mod connection;
pub mod error;
pub mod frame;
pub mod interpreter;
pub mod registers;
pub mod scheduler;
pub mod session;
pub mod snapshot;
mod station_client;
pub mod transport;

pub use ble::BluestTransport;
pub use config::BridgeConfig;
pub use error::{CommandError, ConfigError};
pub use registers::{ChargingMode, LedMode};
pub use session::ConnectionStatus;
pub use snapshot::DeviceSnapshot;
pub use station_client::StationClient;
