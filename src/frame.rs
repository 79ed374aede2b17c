//! MODBUS-RTU framing as tunnelled over the power station's BLE write/notify pair.
//!
//! Request format (both supported functions):
//!
//! Start Byte | End Byte | Meaning
//! 0          | 0        | Device address, always 0x01
//! 1          | 1        | Function code (0x03 read holding registers, 0x06 write single register)
//! 2          | 3        | Register address, big endian
//! 4          | 5        | Register count (0x03) or value (0x06), big endian
//! 6          | 7        | A MODBUS CRC over bytes 0-5, low byte first
//!
//! Read responses carry `address, 0x03, byte count, data..., [CRC]`. The peer does not
//! always append a valid CRC to notification frames, so parsing never rejects on the
//! checksum; [`verify_checksum`] is available as a diagnostic.

use crc16::{State, MODBUS};

/// The only device address the peer answers to.
pub const DEVICE_ADDRESS: u8 = 0x01;
/// The largest register count the peer serves in one read.
pub const MAX_READ_COUNT: u16 = 40;

const EXCEPTION_FLAG: u8 = 0x80;
const MIN_FRAME_LEN: usize = 5;
const READ_HEADER_LEN: usize = 3;
const WRITE_ACK_LEN: usize = 6;
const CRC_LEN: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FunctionCode {
    ReadHoldingRegisters = 0x03,
    WriteSingleRegister = 0x06,
}

impl FunctionCode {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x03 => Some(Self::ReadHoldingRegisters),
            0x06 => Some(Self::WriteSingleRegister),
            _ => None,
        }
    }
}

/// An outgoing request. Immutable once built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandFrame {
    function: FunctionCode,
    register: u16,
    payload: u16,
    crc: u16,
}

impl CommandFrame {
    fn new(function: FunctionCode, register: u16, payload: u16) -> Self {
        let [reg_hi, reg_lo] = register.to_be_bytes();
        let [val_hi, val_lo] = payload.to_be_bytes();
        let crc = checksum(&[DEVICE_ADDRESS, function as u8, reg_hi, reg_lo, val_hi, val_lo]);
        Self { function, register, payload, crc }
    }

    pub fn function(&self) -> FunctionCode {
        self.function
    }

    /// The first register read, or the register written.
    pub fn register(&self) -> u16 {
        self.register
    }

    /// Register count for reads, register value for writes.
    pub fn payload(&self) -> u16 {
        self.payload
    }

    /// The wire representation, CRC low byte first.
    pub fn to_bytes(&self) -> [u8; 8] {
        let [reg_hi, reg_lo] = self.register.to_be_bytes();
        let [val_hi, val_lo] = self.payload.to_be_bytes();
        let [crc_lo, crc_hi] = self.crc.to_le_bytes();
        [DEVICE_ADDRESS, self.function as u8, reg_hi, reg_lo, val_hi, val_lo, crc_lo, crc_hi]
    }
}

/// A parsed inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseFrame {
    /// A read response. The wire format does not echo the start register.
    DataBlock { registers: Vec<u16> },
    /// A one-register read response attributed to the register that was asked for.
    SingleRegister { address: u16, value: u16 },
    WriteAck { address: u16, value: u16 },
    /// `function_code` has the exception bit cleared, i.e. 0x03 or 0x06.
    Exception { function_code: u8, exception_code: u8 },
    Malformed { reason: &'static str },
}

impl ResponseFrame {
    /// Turn a one-register data block into a [`ResponseFrame::SingleRegister`] for
    /// `requested`. Any other frame is returned unchanged.
    pub fn attribute(self, requested: u16) -> Self {
        match self {
            Self::DataBlock { registers } if registers.len() == 1 => Self::SingleRegister {
                address: requested,
                value: registers[0],
            },
            other => other,
        }
    }
}

/// Build a read holding registers request. `count` is clamped to `1..=MAX_READ_COUNT`.
pub fn build_read_block(start: u16, count: u16) -> CommandFrame {
    CommandFrame::new(
        FunctionCode::ReadHoldingRegisters,
        start,
        count.clamp(1, MAX_READ_COUNT),
    )
}

pub fn build_write_single(address: u16, value: u16) -> CommandFrame {
    CommandFrame::new(FunctionCode::WriteSingleRegister, address, value)
}

/// Compute the MODBUS CRC16 (reflected 0xA001, seed 0xFFFF) of the given bytes.
pub fn checksum(data: &[u8]) -> u16 {
    State::<MODBUS>::calculate(data)
}

/// Check the trailing two bytes of `frame` against the CRC of everything before them.
///
/// Diagnostic only: the peer is known to send notification frames without a valid CRC.
pub fn verify_checksum(frame: &[u8]) -> bool {
    if frame.len() <= CRC_LEN {
        return false;
    }
    let (body, crc) = frame.split_at(frame.len() - CRC_LEN);
    checksum(body).to_le_bytes() == crc
}

/// Parse an inbound frame.
pub fn parse(bytes: &[u8]) -> ResponseFrame {
    if bytes.len() < MIN_FRAME_LEN {
        return ResponseFrame::Malformed { reason: "Too short" };
    }
    if bytes[0] != DEVICE_ADDRESS {
        return ResponseFrame::Malformed { reason: "Unexpected device address" };
    }

    let function = bytes[1];
    if function & EXCEPTION_FLAG != 0 {
        return match FunctionCode::from_byte(function & !EXCEPTION_FLAG) {
            Some(code) => ResponseFrame::Exception {
                function_code: code as u8,
                exception_code: bytes[2],
            },
            None => ResponseFrame::Malformed { reason: "Unexpected function code" },
        };
    }

    match FunctionCode::from_byte(function) {
        Some(FunctionCode::ReadHoldingRegisters) => parse_read(bytes),
        Some(FunctionCode::WriteSingleRegister) => parse_write_ack(bytes),
        None => ResponseFrame::Malformed { reason: "Unexpected function code" },
    }
}

fn parse_read(bytes: &[u8]) -> ResponseFrame {
    let byte_count = bytes[2] as usize;
    if byte_count == 0 || byte_count % 2 != 0 {
        return ResponseFrame::Malformed { reason: "Odd or empty byte count" };
    }

    let without_crc = READ_HEADER_LEN + byte_count;
    if bytes.len() != without_crc && bytes.len() != without_crc + CRC_LEN {
        return ResponseFrame::Malformed { reason: "Byte count does not match frame length" };
    }

    let registers = bytes[READ_HEADER_LEN..without_crc]
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect();
    ResponseFrame::DataBlock { registers }
}

fn parse_write_ack(bytes: &[u8]) -> ResponseFrame {
    if bytes.len() != WRITE_ACK_LEN && bytes.len() != WRITE_ACK_LEN + CRC_LEN {
        return ResponseFrame::Malformed { reason: "Write ack has the wrong length" };
    }
    ResponseFrame::WriteAck {
        address: u16::from_be_bytes([bytes[2], bytes[3]]),
        value: u16::from_be_bytes([bytes[4], bytes[5]]),
    }
}
