//! Bridge configuration.
//!
//! Defaults match the behaviour tuned against the EB3A. Values are read from an optional
//! TOML file and then from `BRIDGE_`-prefixed environment variables, e.g.
//! `BRIDGE_PEER_ADDRESS=AA:BB:CC:DD:EE:FF` or `BRIDGE_UPDATE_INTERVAL_MS=30000`.
use crate::error::ConfigError;
use crate::session::BackoffPolicy;
use crate::transport::PeerFilter;
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Shortest accepted poll interval. Each poll cycle costs three round trips on the air.
pub const MIN_POLL_INTERVAL_MS: u64 = 2_000;
/// Upper bound for every `_ms` setting, one day.
pub const MAX_TIMING_MS: u64 = 24 * 60 * 60 * 1_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// When false the session stays disconnected
    pub enabled: bool,
    /// MAC address of the station
    pub peer_address: Option<String>,
    /// Advertised name fragments that identify the station
    pub name_patterns: Vec<String>,
    pub use_bonding: bool,
    /// Interval between poll cycles
    pub update_interval_ms: u64,
    pub scan_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    /// Connect attempts per sequence before giving up
    pub connect_attempts: u32,
    /// Delay between connect attempts within a sequence
    pub connect_retry_delay_ms: u64,
    pub fast_retry_ms: u64,
    pub slow_retry_ms: u64,
    /// Failed sequences before switching to `slow_retry_ms`
    pub slow_after_failures: u32,
    /// Spacing between the two activation commands
    pub wake_spacing_ms: u64,
    /// Silence tolerated beyond `update_interval_ms` before re-activating
    pub stale_grace_ms: u64,
    /// Unanswered re-activations before forcing a reconnect
    pub max_reactivations: u32,
    /// How long a read may stay unanswered
    pub request_timeout_ms: u64,
    /// Gap between consecutive reads in one poll cycle
    pub request_gap_ms: u64,
    /// Forget rejected registers when a new link is set up
    pub reset_capabilities_on_reconnect: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            peer_address: None,
            name_patterns: vec!["EB3A".to_string(), "BLUETTI".to_string()],
            use_bonding: true,
            update_interval_ms: 20_000,
            scan_timeout_ms: 5_000,
            connect_timeout_ms: 10_000,
            connect_attempts: 5,
            connect_retry_delay_ms: 2_000,
            fast_retry_ms: 10_000,
            slow_retry_ms: 5 * 60 * 1_000,
            slow_after_failures: 6,
            wake_spacing_ms: 2_000,
            stale_grace_ms: 10_000,
            max_reactivations: 3,
            request_timeout_ms: 3_000,
            request_gap_ms: 500,
            reset_capabilities_on_reconnect: true,
        }
    }
}

impl BridgeConfig {
    /// Load defaults, then `path` if given, then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        let config: Self = figment.merge(Env::prefixed("BRIDGE_")).extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.peer_filter().is_empty() {
            return Err(ConfigError::EmptyPeerIdentifier);
        }
        if self.update_interval_ms < MIN_POLL_INTERVAL_MS {
            return Err(ConfigError::PollIntervalTooShort {
                min_ms: MIN_POLL_INTERVAL_MS,
                actual_ms: self.update_interval_ms,
            });
        }
        for (field, actual_ms) in self.timings_ms() {
            if actual_ms > MAX_TIMING_MS {
                return Err(ConfigError::TimingOutOfRange { field, max_ms: MAX_TIMING_MS, actual_ms });
            }
        }
        Ok(())
    }

    fn timings_ms(&self) -> [(&'static str, u64); 10] {
        [
            ("update_interval_ms", self.update_interval_ms),
            ("scan_timeout_ms", self.scan_timeout_ms),
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("connect_retry_delay_ms", self.connect_retry_delay_ms),
            ("fast_retry_ms", self.fast_retry_ms),
            ("slow_retry_ms", self.slow_retry_ms),
            ("wake_spacing_ms", self.wake_spacing_ms),
            ("stale_grace_ms", self.stale_grace_ms),
            ("request_timeout_ms", self.request_timeout_ms),
            ("request_gap_ms", self.request_gap_ms),
        ]
    }

    pub fn peer_filter(&self) -> PeerFilter {
        PeerFilter {
            address: self.peer_address.clone(),
            name_patterns: self.name_patterns.clone(),
        }
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            fast: Duration::from_millis(self.fast_retry_ms),
            slow: Duration::from_millis(self.slow_retry_ms),
            slow_after: self.slow_after_failures,
        }
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_interval_ms)
    }
}
