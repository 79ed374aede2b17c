use crate::capability::CapabilityLedger;
use crate::registers::{ChargingMode, LedMode};
use crate::session::ConnectionStatus;
use serde::Serialize;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// The last known state of the power station, as seen by every consumer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceSnapshot {
    pub connection: ConnectionStatus,
    /// Battery level in %, 0-100
    pub battery_percent: u8,
    /// False when no battery register looked plausible and `battery_percent` is a placeholder
    pub battery_percent_known: bool,
    /// AC output power in W
    pub ac_output_power: u16,
    /// DC output power in W
    pub dc_output_power: u16,
    pub ac_output_on: bool,
    pub dc_output_on: bool,
    /// AC (grid) input power in W
    pub ac_input_power: u16,
    /// DC (solar/car) input power in W
    pub dc_input_power: u16,
    /// Sum of AC and DC input power in W
    pub input_power: u32,
    /// Battery pack voltage in V, one decimal
    pub battery_voltage: f32,
    pub charging_mode: Option<ChargingMode>,
    pub eco_mode: Option<bool>,
    pub power_lifting: Option<bool>,
    pub led_mode: Option<LedMode>,
    pub eco_shutdown_hours: Option<u8>,
    pub model: String,
    /// The telemetry block as last received, for diagnostics
    pub registers: Vec<u16>,
    pub capabilities: CapabilityLedger,
    /// Number of accepted telemetry updates. Never decreases.
    pub update_count: u64,
    #[serde(skip)]
    pub last_updated: Option<Instant>,
}

impl Default for DeviceSnapshot {
    fn default() -> Self {
        Self {
            connection: ConnectionStatus::Disconnected,
            battery_percent: 0,
            battery_percent_known: false,
            ac_output_power: 0,
            dc_output_power: 0,
            ac_output_on: false,
            dc_output_on: false,
            ac_input_power: 0,
            dc_input_power: 0,
            input_power: 0,
            battery_voltage: 0.0,
            charging_mode: None,
            eco_mode: None,
            power_lifting: None,
            led_mode: None,
            eco_shutdown_hours: None,
            model: String::new(),
            registers: Vec::new(),
            capabilities: CapabilityLedger::new(),
            update_count: 0,
            last_updated: None,
        }
    }
}

impl DeviceSnapshot {
    /// How old the data is, or `None` if nothing was ever received.
    pub fn age(&self, now: Instant) -> Option<Duration> {
        self.last_updated.map(|at| now.saturating_duration_since(at))
    }

    /// True when the station refused writes to `register` this session.
    pub fn is_unsupported(&self, register: u16) -> bool {
        !self.capabilities.may_write(register)
    }

    pub(crate) fn touch(&mut self, now: Instant) {
        self.update_count += 1;
        self.last_updated = Some(now);
    }
}

/// Holds the single shared [`DeviceSnapshot`].
///
/// The session engine is the only writer. Readers get value copies, or a watch receiver
/// to be woken on change.
#[derive(Debug)]
pub struct DeviceStateStore {
    tx: watch::Sender<DeviceSnapshot>,
}

impl Default for DeviceStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceStateStore {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(DeviceSnapshot::default());
        Self { tx }
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<DeviceSnapshot> {
        self.tx.subscribe()
    }

    /// Apply `change` as a single update visible to readers all at once.
    pub(crate) fn update(&self, change: impl FnOnce(&mut DeviceSnapshot)) {
        self.tx.send_modify(change);
    }

    /// Like [`Self::update`], but readers are only woken when `change` returns true.
    pub(crate) fn update_if(&self, change: impl FnOnce(&mut DeviceSnapshot) -> bool) -> bool {
        self.tx.send_if_modified(change)
    }
}

#[test]
fn test_age() {
    let now = Instant::now();
    let mut snapshot = DeviceSnapshot::default();
    assert_eq!(snapshot.age(now), None);
    snapshot.touch(now);
    assert_eq!(snapshot.age(now + Duration::from_secs(3)), Some(Duration::from_secs(3)));
    assert_eq!(snapshot.update_count, 1);
}

#[test]
fn test_store_updates_are_seen_by_subscribers() {
    let store = DeviceStateStore::new();
    let mut rx = store.subscribe();
    store.update(|snapshot| snapshot.battery_percent = 42);
    assert!(rx.has_changed().unwrap());
    assert_eq!(rx.borrow_and_update().battery_percent, 42);
    assert_eq!(store.snapshot().battery_percent, 42);
}
