//! The device session engine.
//!
//! [`StationClient`] ties the connection machine, the poll scheduler and the register
//! interpreter together behind one non-blocking [`StationClient::tick`]. The host calls
//! `tick` on its own cadence (every 100 ms is plenty) and reads results from the
//! [`DeviceSnapshot`]. Control requests are checked synchronously and sent on the spot.
//!
//! ```no_run
//! # use std::time::{Duration, Instant};
//! # use bluetti_bridge::{BluestTransport, BridgeConfig, StationClient};
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let config = BridgeConfig::load(None)?;
//! let transport = BluestTransport::new().await?;
//! let mut client = StationClient::new(transport, &config);
//! loop {
//!     client.tick(Instant::now());
//!     if client.is_connected() {
//!         println!("{}%", client.snapshot().battery_percent);
//!     }
//!     tokio::time::sleep(Duration::from_millis(100)).await;
//! }
//! # }
//! ```
use crate::capability::CapabilityLedger;
use crate::config::{BridgeConfig, MAX_TIMING_MS, MIN_POLL_INTERVAL_MS};
use crate::connection::{ConnectionMachine, LinkEvent};
use crate::error::{CommandError, ConfigError};
use crate::frame::{self, build_write_single, CommandFrame, ResponseFrame, DEVICE_ADDRESS};
use crate::interpreter::{decode_block, decode_single};
use crate::registers::{ChargingMode, ControlRegister, LedMode};
use crate::scheduler::{PollScheduler, Routed};
use crate::session::{ConnectionStatus, Session};
use crate::snapshot::{DeviceSnapshot, DeviceStateStore};
use crate::transport::{NotificationSink, PeerFilter, Transport};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Joins read responses that the BLE stack split over several notifications.
///
/// A partial frame is given up once it is older than `max_age`, or as soon as a
/// notification arrives that is a complete frame on its own.
#[derive(Debug)]
struct FrameAssembler {
    partial: Vec<u8>,
    started: Option<Instant>,
    max_age: Duration,
}

impl FrameAssembler {
    fn new(max_age: Duration) -> Self {
        Self { partial: Vec::new(), started: None, max_age }
    }

    /// Feed one notification. Returns a frame once it is complete.
    fn push(&mut self, bytes: Vec<u8>, now: Instant) -> Option<Vec<u8>> {
        if self.started.is_some_and(|at| now.saturating_duration_since(at) >= self.max_age) {
            debug!("Dropping stale partial frame {}", hex::encode(&self.partial));
            self.clear();
        }
        if !self.partial.is_empty() && Self::is_complete_frame(&bytes) {
            debug!("Dropping partial frame {}, a complete one arrived", hex::encode(&self.partial));
            self.clear();
        }

        if self.partial.is_empty() {
            if Self::is_truncated_read(&bytes) {
                self.partial = bytes;
                self.started = Some(now);
                return None;
            }
            return Some(bytes);
        }

        self.partial.extend_from_slice(&bytes);
        if Self::is_truncated_read(&self.partial) {
            None
        } else {
            self.started = None;
            Some(std::mem::take(&mut self.partial))
        }
    }

    fn is_truncated_read(bytes: &[u8]) -> bool {
        bytes.len() >= 3 && bytes[0] == DEVICE_ADDRESS && bytes[1] == 0x03 && bytes.len() < bytes[2] as usize + 3
    }

    /// A well formed frame with a valid CRC. Continuation fragments practically never are.
    fn is_complete_frame(bytes: &[u8]) -> bool {
        frame::verify_checksum(bytes) && !matches!(frame::parse(bytes), ResponseFrame::Malformed { .. })
    }

    fn clear(&mut self) {
        self.partial.clear();
        self.started = None;
    }
}

pub struct StationClient<T: Transport> {
    transport: T,
    connection: ConnectionMachine<T>,
    scheduler: PollScheduler,
    store: DeviceStateStore,
    ledger: CapabilityLedger,
    sink: NotificationSink,
    notifications: mpsc::UnboundedReceiver<Vec<u8>>,
    assembler: FrameAssembler,
    stale_grace: Duration,
    reset_capabilities_on_reconnect: bool,
    /// Time of the latest tick. Requests made between ticks are stamped with it.
    now: Instant,
}

impl<T: Transport> StationClient<T> {
    pub fn new(transport: T, config: &BridgeConfig) -> Self {
        let (sink, notifications) = NotificationSink::channel();
        Self {
            transport,
            connection: ConnectionMachine::new(config),
            scheduler: PollScheduler::new(
                config.update_interval(),
                Duration::from_millis(config.request_gap_ms),
                Duration::from_millis(config.request_timeout_ms),
            ),
            store: DeviceStateStore::new(),
            ledger: CapabilityLedger::new(),
            sink,
            notifications,
            assembler: FrameAssembler::new(Duration::from_millis(config.request_timeout_ms)),
            stale_grace: Duration::from_millis(config.stale_grace_ms),
            reset_capabilities_on_reconnect: config.reset_capabilities_on_reconnect,
            now: Instant::now(),
        }
    }

    /// Process received frames, advance the connection and send the next due read.
    pub fn tick(&mut self, now: Instant) {
        self.now = now;

        while let Ok(bytes) = self.notifications.try_recv() {
            self.handle_notification(bytes, now);
        }

        let stale_after = self.scheduler.interval() + self.stale_grace;
        match self.connection.tick(&mut self.transport, &self.sink, stale_after, now) {
            Some(LinkEvent::Ready) => {
                if self.reset_capabilities_on_reconnect && self.ledger.rejected().next().is_some() {
                    info!("New link, forgetting rejected registers");
                    self.ledger.clear();
                    self.publish_capabilities();
                }
                self.scheduler.start(now);
            }
            Some(LinkEvent::Reactivated) => self.scheduler.request_block_now(now),
            Some(LinkEvent::Lost) => self.link_lost(),
            None => {}
        }

        if self.connection.is_polling() {
            if let Some(frame) = self.scheduler.next_frame(now) {
                self.send(&frame);
            }
        }

        self.publish_status();
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        self.store.snapshot()
    }

    /// A receiver woken whenever the snapshot changes.
    pub fn subscribe_snapshot(&self) -> watch::Receiver<DeviceSnapshot> {
        self.store.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_polling()
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    pub fn session(&self) -> &Session {
        self.connection.session()
    }

    pub fn capabilities(&self) -> &CapabilityLedger {
        &self.ledger
    }

    pub fn is_enabled(&self) -> bool {
        self.connection.is_enabled()
    }

    /// Enable or disable the bridge. Disabling drops the link at once.
    pub fn set_enabled(&mut self, enabled: bool) {
        if enabled != self.connection.is_enabled() {
            info!("Bridge {}", if enabled { "enabled" } else { "disabled" });
        }
        if self.connection.set_enabled(enabled, &mut self.transport, self.now) {
            self.link_lost();
        }
        self.publish_status();
    }

    /// Change which peer to look for. Used from the next scan on.
    pub fn set_peer_filter(&mut self, filter: PeerFilter) -> Result<(), ConfigError> {
        if filter.is_empty() {
            return Err(ConfigError::EmptyPeerIdentifier);
        }
        self.connection.set_filter(filter);
        Ok(())
    }

    pub fn poll_interval(&self) -> u64 {
        self.scheduler.interval().as_millis() as u64
    }

    pub fn set_poll_interval(&mut self, interval_ms: u64) -> Result<(), CommandError> {
        if interval_ms < MIN_POLL_INTERVAL_MS {
            return Err(CommandError::InvalidParameter("poll interval below 2000 ms"));
        }
        if interval_ms > MAX_TIMING_MS {
            return Err(CommandError::InvalidParameter("poll interval above one day"));
        }
        debug!("Poll interval set to {interval_ms} ms");
        self.scheduler.set_interval(Duration::from_millis(interval_ms));
        Ok(())
    }

    /// Switch the AC and/or DC outputs. The snapshot reflects the request right away and is
    /// corrected by the next telemetry block if the station did not follow.
    ///
    /// Nothing is sent unless every selected output may be written.
    pub fn request_output(&mut self, ac: Option<bool>, dc: Option<bool>) -> Result<(), CommandError> {
        let outputs: Vec<(ControlRegister, bool)> = [(ControlRegister::AcOutput, ac), (ControlRegister::DcOutput, dc)]
            .into_iter()
            .filter_map(|(register, on)| on.map(|on| (register, on)))
            .collect();
        if outputs.is_empty() {
            return Err(CommandError::InvalidParameter("no output selected"));
        }
        for &(register, _) in &outputs {
            self.check_writable(register)?;
        }

        for (register, on) in outputs {
            self.write_control(register, on as u16)?;
            self.store.update(|snapshot| match register {
                ControlRegister::AcOutput => snapshot.ac_output_on = on,
                _ => snapshot.dc_output_on = on,
            });
        }
        Ok(())
    }

    pub fn request_charging_mode(&mut self, mode: ChargingMode) -> Result<(), CommandError> {
        self.write_setting(ControlRegister::ChargingMode, mode as u16)
    }

    pub fn request_eco_mode(&mut self, on: bool) -> Result<(), CommandError> {
        self.write_setting(ControlRegister::EcoMode, on as u16)
    }

    pub fn request_power_lifting(&mut self, on: bool) -> Result<(), CommandError> {
        self.write_setting(ControlRegister::PowerLifting, on as u16)
    }

    pub fn request_led_mode(&mut self, mode: LedMode) -> Result<(), CommandError> {
        self.write_setting(ControlRegister::LedMode, mode as u16)
    }

    /// Hours of idle output before eco mode switches it off, 1-4.
    pub fn request_eco_shutdown(&mut self, hours: u8) -> Result<(), CommandError> {
        if !(1..=4).contains(&hours) {
            return Err(CommandError::InvalidParameter("eco shutdown must be 1-4 hours"));
        }
        self.write_setting(ControlRegister::EcoShutdown, hours as u16)
    }

    pub fn request_power_off(&mut self) -> Result<(), CommandError> {
        warn!("Powering the station off");
        self.write_control(ControlRegister::PowerOff, 1)
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Write a setting and read it back on the next free slot.
    fn write_setting(&mut self, register: ControlRegister, value: u16) -> Result<(), CommandError> {
        self.write_control(register, value)?;
        self.scheduler.queue_confirm(register.address());
        Ok(())
    }

    fn check_writable(&self, register: ControlRegister) -> Result<T::Characteristic, CommandError> {
        let Some(characteristic) = self.connection.write_characteristic().cloned() else {
            return Err(CommandError::NotConnected);
        };
        if !self.ledger.may_write(register.address()) {
            debug!("Not writing {register:?}, the station rejected it before");
            return Err(CommandError::Unsupported { register: register.address() });
        }
        Ok(characteristic)
    }

    fn write_control(&mut self, register: ControlRegister, value: u16) -> Result<(), CommandError> {
        let address = register.address();
        let characteristic = self.check_writable(register)?;

        let frame = build_write_single(address, value);
        let bytes = frame.to_bytes();
        debug!("TX: {} ({register:?} = {value})", hex::encode(bytes));
        if !self.transport.write_no_response(&characteristic, &bytes) {
            warn!("Transport refused the write to {register:?}");
            return Err(CommandError::TransportRejected { register: address });
        }
        self.scheduler.record_write(address, self.now);
        Ok(())
    }

    fn send(&mut self, frame: &CommandFrame) {
        let Some(characteristic) = self.connection.write_characteristic() else {
            return;
        };
        let bytes = frame.to_bytes();
        debug!("TX: {}", hex::encode(bytes));
        if !self.transport.write_no_response(characteristic, &bytes) {
            warn!("Transport refused read of {:#06x}", frame.register());
        }
    }

    fn handle_notification(&mut self, bytes: Vec<u8>, now: Instant) {
        debug!("RX: {}", hex::encode(&bytes));
        let Some(bytes) = self.assembler.push(bytes, now) else {
            return;
        };
        if bytes.len() >= 5 && !frame::verify_checksum(&bytes) {
            debug!("Checksum mismatch on {}", hex::encode(&bytes));
        }

        match self.scheduler.on_response(frame::parse(&bytes), now) {
            Routed::Block(registers) => {
                self.connection.record_data(now);
                let reading = decode_block(&registers);
                self.store.update(|snapshot| {
                    reading.apply(snapshot);
                    snapshot.touch(now);
                });
            }
            Routed::Single { address, value } => {
                self.connection.record_data(now);
                if let Some(setting) = decode_single(address, value) {
                    self.store.update(|snapshot| {
                        setting.apply(snapshot);
                        snapshot.touch(now);
                    });
                }
            }
            Routed::WriteAccepted { register, value } => {
                self.connection.record_data(now);
                debug!("Write of {value} to {register:#06x} acknowledged");
                self.ledger.record_acceptance(register);
                self.publish_capabilities();
            }
            Routed::WriteRejected { register, exception_code } => {
                self.connection.record_data(now);
                warn!("Station rejected the write to {register:#06x} (exception {exception_code:#04x}), not writing it again");
                self.ledger.record_rejection(register, exception_code);
                self.publish_capabilities();
            }
            Routed::ReadRejected { request, exception_code } => {
                self.connection.record_data(now);
                warn!("Station rejected the {request:?} read (exception {exception_code:#04x})");
            }
            Routed::Discarded => {}
        }
    }

    fn link_lost(&mut self) {
        self.scheduler.stop();
        self.assembler.clear();
        // Frames from the old link must not be matched against the new one.
        while self.notifications.try_recv().is_ok() {}
    }

    fn publish_capabilities(&self) {
        let ledger = &self.ledger;
        self.store.update_if(|snapshot| {
            if snapshot.capabilities == *ledger {
                return false;
            }
            snapshot.capabilities = ledger.clone();
            true
        });
    }

    fn publish_status(&self) {
        let status = self.connection.status();
        self.store.update_if(|snapshot| {
            if snapshot.connection == status {
                return false;
            }
            snapshot.connection = status;
            true
        });
    }
}
