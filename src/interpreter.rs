//! Turns register values into snapshot fields.
//!
//! The telemetry layout was reverse engineered and differs slightly between firmware
//! revisions, so the less certain fields (battery level, model name) are decoded through
//! ordered rule tables: the first rule whose register is present and whose value is
//! plausible wins. Fields whose register lies beyond a short read are left as `None` so the
//! cached value survives.
use crate::registers::{core, ChargingMode, ControlRegister, LedMode, CORE_BLOCK_START};
use crate::snapshot::DeviceSnapshot;
use std::ops::RangeInclusive;
use tracing::{debug, warn};

/// Battery level reported when no battery register is plausible.
const UNKNOWN_BATTERY_PERCENT: u8 = 100;

#[derive(Debug, Clone, Copy)]
enum Scale {
    Percent,
    Tenths,
}

/// One way of reading the battery level.
struct PercentRule {
    register: u16,
    scale: Scale,
    plausible: RangeInclusive<u16>,
}

const BATTERY_PERCENT_RULES: [PercentRule; 3] = [
    PercentRule { register: core::BATTERY_PERCENT, scale: Scale::Percent, plausible: 1..=100 },
    PercentRule { register: core::BATTERY_PERCENT, scale: Scale::Tenths, plausible: 101..=1050 },
    PercentRule { register: core::BATTERY_PERCENT_TENTHS, scale: Scale::Tenths, plausible: 1..=1050 },
];

/// Candidate locations of the 4 byte model name, in order of preference.
const MODEL_RULES: [u16; 2] = [core::MODEL, core::MODEL_FALLBACK];

const BATTERY_VOLTAGE_PLAUSIBLE: RangeInclusive<u16> = 1..=1000;

/// An output whose switch state is read from a dedicated register, or inferred from its
/// power draw when that register is not in the payload.
struct OutputRule {
    state: u16,
    power: u16,
}

const AC_OUTPUT: OutputRule = OutputRule { state: core::AC_OUTPUT_STATE, power: core::AC_OUTPUT_POWER };
const DC_OUTPUT: OutputRule = OutputRule { state: core::DC_OUTPUT_STATE, power: core::DC_OUTPUT_POWER };

/// A window onto a block of registers read from `base`.
struct BlockView<'a> {
    base: u16,
    registers: &'a [u16],
}

impl BlockView<'_> {
    fn get(&self, register: u16) -> Option<u16> {
        let index = register.checked_sub(self.base)?;
        self.registers.get(index as usize).copied()
    }

    fn output_state(&self, rule: &OutputRule) -> Option<bool> {
        match self.get(rule.state) {
            Some(raw) => Some(raw & 0x00ff == 1),
            None => self.get(rule.power).map(|watts| watts > 0),
        }
    }

    fn ascii(&self, register: u16) -> Option<String> {
        let mut bytes = Vec::with_capacity(4);
        bytes.extend_from_slice(&self.get(register)?.to_be_bytes());
        bytes.extend_from_slice(&self.get(register + 1)?.to_be_bytes());
        let printable = bytes.iter().all(|&b| b.is_ascii_graphic() || b == b' ')
            && bytes.iter().any(|b| b.is_ascii_alphanumeric());
        printable.then(|| String::from_utf8_lossy(&bytes).trim_end().to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatteryReading {
    Measured(u8),
    /// Battery registers were present but none held a plausible value.
    Unknown,
}

/// Everything decoded from one telemetry block. `None` means "not in this payload".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BlockReading {
    pub battery: Option<BatteryReading>,
    pub ac_input_power: Option<u16>,
    pub dc_input_power: Option<u16>,
    pub ac_output_power: Option<u16>,
    pub dc_output_power: Option<u16>,
    pub ac_output_on: Option<bool>,
    pub dc_output_on: Option<bool>,
    pub battery_voltage: Option<f32>,
    pub model: Option<String>,
    pub registers: Vec<u16>,
}

/// Decode a telemetry block read from [`CORE_BLOCK_START`].
pub fn decode_block(registers: &[u16]) -> BlockReading {
    let block = BlockView { base: CORE_BLOCK_START, registers };

    BlockReading {
        battery: decode_battery(&block),
        ac_input_power: block.get(core::AC_INPUT_POWER),
        dc_input_power: block.get(core::DC_INPUT_POWER),
        ac_output_power: block.get(core::AC_OUTPUT_POWER),
        dc_output_power: block.get(core::DC_OUTPUT_POWER),
        ac_output_on: block.output_state(&AC_OUTPUT),
        dc_output_on: block.output_state(&DC_OUTPUT),
        battery_voltage: block
            .get(core::BATTERY_VOLTAGE)
            .filter(|raw| BATTERY_VOLTAGE_PLAUSIBLE.contains(raw))
            .map(|raw| raw as f32 / 10.0),
        model: MODEL_RULES.iter().find_map(|&register| block.ascii(register)),
        registers: registers.to_vec(),
    }
}

fn decode_battery(block: &BlockView) -> Option<BatteryReading> {
    let mut any_present = false;
    for rule in &BATTERY_PERCENT_RULES {
        let Some(raw) = block.get(rule.register) else {
            continue;
        };
        any_present = true;
        if !rule.plausible.contains(&raw) {
            continue;
        }
        let percent = match rule.scale {
            Scale::Percent => raw,
            Scale::Tenths => raw / 10,
        };
        return Some(BatteryReading::Measured(percent.min(100) as u8));
    }
    any_present.then_some(BatteryReading::Unknown)
}

impl BlockReading {
    /// Copy every decoded field into `snapshot`, leaving the others untouched.
    pub fn apply(self, snapshot: &mut DeviceSnapshot) {
        match self.battery {
            Some(BatteryReading::Measured(percent)) => {
                snapshot.battery_percent = percent;
                snapshot.battery_percent_known = true;
            }
            Some(BatteryReading::Unknown) => {
                warn!("No plausible battery level in telemetry, reporting {UNKNOWN_BATTERY_PERCENT}%");
                snapshot.battery_percent = UNKNOWN_BATTERY_PERCENT;
                snapshot.battery_percent_known = false;
            }
            None => {}
        }

        if let Some(watts) = self.ac_input_power {
            snapshot.ac_input_power = watts;
        }
        if let Some(watts) = self.dc_input_power {
            snapshot.dc_input_power = watts;
        }
        snapshot.input_power = snapshot.ac_input_power as u32 + snapshot.dc_input_power as u32;

        if let Some(watts) = self.ac_output_power {
            snapshot.ac_output_power = watts;
        }
        if let Some(watts) = self.dc_output_power {
            snapshot.dc_output_power = watts;
        }
        if let Some(on) = self.ac_output_on {
            snapshot.ac_output_on = on;
        }
        if let Some(on) = self.dc_output_on {
            snapshot.dc_output_on = on;
        }
        if let Some(volts) = self.battery_voltage {
            snapshot.battery_voltage = volts;
        }
        if let Some(model) = self.model {
            snapshot.model = model;
        }
        if !self.registers.is_empty() {
            snapshot.registers = self.registers;
        }
    }
}

/// A setting read back from one control register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingReading {
    ChargingMode(ChargingMode),
    EcoMode(bool),
    PowerLifting(bool),
    LedMode(LedMode),
    EcoShutdown(u8),
}

fn flag(value: u16) -> Option<bool> {
    match value {
        0 => Some(false),
        1 => Some(true),
        _ => None,
    }
}

/// Decode a single register read of `address`. Returns `None` for registers that are not
/// settings and for values outside the register's enumeration.
pub fn decode_single(address: u16, value: u16) -> Option<SettingReading> {
    let reading = match ControlRegister::from_address(address)? {
        ControlRegister::ChargingMode => ChargingMode::try_from(value).ok().map(SettingReading::ChargingMode),
        ControlRegister::EcoMode => flag(value).map(SettingReading::EcoMode),
        ControlRegister::PowerLifting => flag(value).map(SettingReading::PowerLifting),
        ControlRegister::LedMode => LedMode::try_from(value).ok().map(SettingReading::LedMode),
        ControlRegister::EcoShutdown => {
            (1..=4).contains(&value).then_some(SettingReading::EcoShutdown(value as u8))
        }
        ControlRegister::AcOutput | ControlRegister::DcOutput | ControlRegister::PowerOff => None,
    };
    if reading.is_none() {
        debug!("Ignoring value {value} read from register {address:#06x}");
    }
    reading
}

impl SettingReading {
    pub fn apply(self, snapshot: &mut DeviceSnapshot) {
        match self {
            Self::ChargingMode(mode) => snapshot.charging_mode = Some(mode),
            Self::EcoMode(on) => snapshot.eco_mode = Some(on),
            Self::PowerLifting(on) => snapshot.power_lifting = Some(on),
            Self::LedMode(mode) => snapshot.led_mode = Some(mode),
            Self::EcoShutdown(hours) => snapshot.eco_shutdown_hours = Some(hours),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::CORE_BLOCK_LEN;

    fn block_with(values: &[(u16, u16)]) -> Vec<u16> {
        let mut registers = vec![0u16; CORE_BLOCK_LEN as usize];
        for &(register, value) in values {
            registers[(register - CORE_BLOCK_START) as usize] = value;
        }
        registers
    }

    #[test]
    fn test_battery_percent_direct() {
        let reading = decode_block(&block_with(&[(0x002b, 85)]));
        assert_eq!(reading.battery, Some(BatteryReading::Measured(85)));
    }

    #[test]
    fn test_battery_percent_tenths_is_clamped() {
        let reading = decode_block(&block_with(&[(0x002b, 1019)]));
        assert_eq!(reading.battery, Some(BatteryReading::Measured(100)));
    }

    #[test]
    fn test_battery_percent_adjacent_fallback() {
        let reading = decode_block(&block_with(&[(0x002b, 0), (0x002c, 634)]));
        assert_eq!(reading.battery, Some(BatteryReading::Measured(63)));
    }

    #[test]
    fn test_battery_percent_unknown() {
        let reading = decode_block(&block_with(&[(0x002b, 0xffff), (0x002c, 0)]));
        assert_eq!(reading.battery, Some(BatteryReading::Unknown));

        let mut snapshot = DeviceSnapshot::default();
        reading.apply(&mut snapshot);
        assert_eq!(snapshot.battery_percent, 100);
        assert!(!snapshot.battery_percent_known);
    }

    #[test]
    fn test_power_and_state() {
        let reading = decode_block(&block_with(&[
            (0x0024, 120),
            (0x0025, 300),
            (0x0026, 45),
            (0x0027, 0),
            (0x0030, 0x0001),
            (0x0031, 0x0100),
            (0x0013, 537),
        ]));
        let mut snapshot = DeviceSnapshot::default();
        reading.apply(&mut snapshot);
        assert_eq!(snapshot.dc_input_power, 120);
        assert_eq!(snapshot.ac_input_power, 300);
        assert_eq!(snapshot.input_power, 420);
        assert_eq!(snapshot.ac_output_power, 45);
        assert!(snapshot.ac_output_on);
        assert!(!snapshot.dc_output_on);
        assert!((snapshot.battery_voltage - 53.7).abs() < 1e-4);
        assert_eq!(snapshot.registers.len(), 40);
    }

    #[test]
    fn test_short_block_keeps_cached_values() {
        let mut snapshot = DeviceSnapshot {
            battery_percent: 77,
            battery_percent_known: true,
            ac_output_power: 210,
            ac_output_on: true,
            dc_output_on: true,
            battery_voltage: 52.1,
            ..Default::default()
        };
        // Covers 0x000a..=0x0027: powers present, battery and state registers missing.
        let mut registers = block_with(&[(0x0026, 0), (0x0027, 15)]);
        registers.truncate(30);
        decode_block(&registers).apply(&mut snapshot);

        assert_eq!(snapshot.battery_percent, 77);
        assert!(snapshot.battery_percent_known);
        assert_eq!(snapshot.ac_output_power, 0);
        assert_eq!(snapshot.dc_output_power, 15);
        // State registers were out of range, so state follows power.
        assert!(!snapshot.ac_output_on);
        assert!(snapshot.dc_output_on);
    }

    #[test]
    fn test_model_primary_and_fallback() {
        let primary = block_with(&[(0x000a, u16::from_be_bytes(*b"EB")), (0x000b, u16::from_be_bytes(*b"3A"))]);
        assert_eq!(decode_block(&primary).model.as_deref(), Some("EB3A"));

        let fallback = block_with(&[
            (0x000a, 0x03fb),
            (0x000b, 0xcbb8),
            (0x000e, u16::from_be_bytes(*b"EB")),
            (0x000f, u16::from_be_bytes(*b"3A")),
        ]);
        assert_eq!(decode_block(&fallback).model.as_deref(), Some("EB3A"));

        assert_eq!(decode_block(&block_with(&[])).model, None);
    }

    #[test]
    fn test_decode_single() {
        assert_eq!(decode_single(0x0bf9, 2), Some(SettingReading::ChargingMode(ChargingMode::Turbo)));
        assert_eq!(decode_single(0x0bf7, 1), Some(SettingReading::EcoMode(true)));
        assert_eq!(decode_single(0x0bfa, 0), Some(SettingReading::PowerLifting(false)));
        assert_eq!(decode_single(0x0bda, 4), Some(SettingReading::LedMode(LedMode::Off)));
        assert_eq!(decode_single(0x0bf8, 3), Some(SettingReading::EcoShutdown(3)));
        assert_eq!(decode_single(0x0bf8, 5), None);
        assert_eq!(decode_single(0x0bf9, 9), None);
        assert_eq!(decode_single(0x0bbf, 1), None);
        assert_eq!(decode_single(0x1234, 1), None);
    }
}
