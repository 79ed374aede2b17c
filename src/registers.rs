//! Register map of the EB3A class power stations.
//!
//! Telemetry lives in a 40 register block starting at [`CORE_BLOCK_START`]. The control
//! registers sit in the 0x0BBF.. range and are read one at a time. Which of them accept
//! writes depends on the firmware revision, see [`crate::CapabilityLedger`].
use serde::{Deserialize, Serialize};

/// First register of the telemetry block.
pub const CORE_BLOCK_START: u16 = 0x000a;
/// Number of registers in the telemetry block.
pub const CORE_BLOCK_LEN: u16 = 40;

/// Telemetry registers inside the core block.
pub mod core {
    /// __R__ - Model identifier, 4 ASCII bytes over two registers.
    pub const MODEL: u16 = 0x000a;
    /// __R__ - Model identifier as laid out by firmware answering with the 0x0006 page.
    pub const MODEL_FALLBACK: u16 = 0x000e;
    /// __R__ - Battery pack voltage in V/10.
    pub const BATTERY_VOLTAGE: u16 = 0x0013;
    /// __R__ - DC (solar/car) input power in W.
    pub const DC_INPUT_POWER: u16 = 0x0024;
    /// __R__ - AC (grid) input power in W.
    pub const AC_INPUT_POWER: u16 = 0x0025;
    /// __R__ - AC output power in W.
    pub const AC_OUTPUT_POWER: u16 = 0x0026;
    /// __R__ - DC output power in W.
    pub const DC_OUTPUT_POWER: u16 = 0x0027;
    /// __R__ - Battery level. Either % or %/10 depending on firmware.
    pub const BATTERY_PERCENT: u16 = 0x002b;
    /// __R__ - Battery level in %/10 on firmware that leaves 0x002B unset.
    pub const BATTERY_PERCENT_TENTHS: u16 = 0x002c;
    /// __R__ - AC output switch, low byte 1 = on.
    pub const AC_OUTPUT_STATE: u16 = 0x0030;
    /// __R__ - DC output switch, low byte 1 = on.
    pub const DC_OUTPUT_STATE: u16 = 0x0031;
}

/// Control registers, written with function 0x06 and read back one at a time.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u16)]
pub enum ControlRegister {
    /// __W__ - AC output switch.
    /// * `0` - Off.
    /// * `1` - On.
    AcOutput = 0x0bbf,
    /// __W__ - DC output switch.
    DcOutput = 0x0bc0,
    /// __R/W__ - LED mode. See [`LedMode`].
    LedMode = 0x0bda,
    /// __W__ - Power the station off. Write `1`.
    PowerOff = 0x0bf4,
    /// __R/W__ - Eco mode (automatic shutdown of idle outputs).
    EcoMode = 0x0bf7,
    /// __R/W__ - Eco shutdown delay in hours, 1-4.
    EcoShutdown = 0x0bf8,
    /// __R/W__ - Charging mode. See [`ChargingMode`].
    ChargingMode = 0x0bf9,
    /// __R/W__ - Power lifting (run resistive loads above the inverter rating at reduced voltage).
    PowerLifting = 0x0bfa,
}

impl ControlRegister {
    pub fn address(self) -> u16 {
        self as u16
    }

    pub fn from_address(address: u16) -> Option<Self> {
        [
            Self::AcOutput,
            Self::DcOutput,
            Self::LedMode,
            Self::PowerOff,
            Self::EcoMode,
            Self::EcoShutdown,
            Self::ChargingMode,
            Self::PowerLifting,
        ]
        .into_iter()
        .find(|register| register.address() == address)
    }
}

impl From<ControlRegister> for u16 {
    fn from(value: ControlRegister) -> Self {
        value as u16
    }
}

/// Charging speed selected on the station.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChargingMode {
    Standard = 0,
    Silent = 1,
    Turbo = 2,
}

impl TryFrom<u16> for ChargingMode {
    type Error = u16;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Standard),
            1 => Ok(Self::Silent),
            2 => Ok(Self::Turbo),
            other => Err(other),
        }
    }
}

/// Front light mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedMode {
    Low = 1,
    High = 2,
    Sos = 3,
    Off = 4,
}

impl TryFrom<u16> for LedMode {
    type Error = u16;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Low),
            2 => Ok(Self::High),
            3 => Ok(Self::Sos),
            4 => Ok(Self::Off),
            other => Err(other),
        }
    }
}
