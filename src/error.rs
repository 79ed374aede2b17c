//! Error types for configuration and consumer requests.
//!
//! Transport and protocol faults never surface here: the session engine recovers from them
//! and reports them through the snapshot's connection status instead.

use thiserror::Error;

/// Configuration could not be loaded or is unusable.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    /// Neither a peer address nor any advertisement name pattern is set
    #[error("No peer address or name pattern configured")]
    EmptyPeerIdentifier,

    #[error("Poll interval must be at least {min_ms} ms, got {actual_ms} ms")]
    PollIntervalTooShort {
        /// Smallest accepted interval
        min_ms: u64,
        /// Interval that was configured
        actual_ms: u64,
    },

    #[error("{field} must be at most {max_ms} ms, got {actual_ms} ms")]
    TimingOutOfRange { field: &'static str, max_ms: u64, actual_ms: u64 },
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Load(Box::new(err))
    }
}

/// A control request was refused before reaching the radio.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// The session is not in the polling state
    #[error("Power station not connected")]
    NotConnected,

    /// The station rejected an earlier write to this register
    #[error("Register {register:#06x} does not accept writes on this unit")]
    Unsupported {
        /// Control register address
        register: u16,
    },

    #[error("Invalid parameter: {0}")]
    InvalidParameter(&'static str),

    /// The BLE stack did not accept the write
    #[error("Transport refused the write to register {register:#06x}")]
    TransportRejected {
        /// Control register address
        register: u16,
    },
}
