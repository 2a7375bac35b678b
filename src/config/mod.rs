//! Configuration management.
//!
//! Supports configuration from:
//! - TOML config files
//! - Environment variables
//! - CLI arguments (for the `candycom` binary)
//!
//! Every protocol delay is expressed in *time units*; one unit is
//! `time_unit_ms` milliseconds (one second by default). Tests shrink the
//! unit instead of rewriting every interval.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CandyError, Result};
use crate::protocol::{DEFAULT_CAPACITY, DEFAULT_WATCHDOG_TIMEOUT};
use crate::transport::{TransportKind, DEFAULT_BAUD_RATE};

/// Main configuration struct
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Protocol timing and sizing
    #[serde(default)]
    pub protocol: ProtocolConfig,

    /// Link selection
    #[serde(default)]
    pub transport: TransportConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path)
            .map_err(|e| CandyError::Config(format!("Failed to read config file: {e}")))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| CandyError::Config(format!("Failed to parse config: {e}")))?;
        config.protocol.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Default config file location (`<config_dir>/candycom/config.toml`)
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("candycom").join("config.toml"))
    }

    /// Default file if present, then environment overrides
    pub fn load() -> Result<Self> {
        let base = match Self::default_path() {
            Some(path) if path.exists() => Self::from_file(path)?,
            _ => Self::default(),
        };
        let config = base.with_env_overrides();
        config.protocol.validate()?;
        Ok(config)
    }

    /// Apply `CANDYCOM_*` environment variables on top of this config
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(val) = env_parse("CANDYCOM_TIME_UNIT_MS") {
            self.protocol.time_unit_ms = val;
        }
        if let Some(val) = env_parse("CANDYCOM_BUFFER_CAPACITY") {
            self.protocol.buffer_capacity = val;
        }
        if let Some(val) = env_parse("CANDYCOM_WATCHDOG_TIMEOUT") {
            self.protocol.watchdog_timeout = val;
        }
        if let Some(kind) = env_parse("CANDYCOM_TRANSPORT") {
            self.transport.kind = kind;
        }
        if let Ok(device) = std::env::var("CANDYCOM_DEVICE") {
            self.transport.device = Some(PathBuf::from(device));
        }
        if let Some(baud) = env_parse("CANDYCOM_BAUD_RATE") {
            self.transport.baud_rate = baud;
        }
        if let Ok(address) = std::env::var("CANDYCOM_ADDRESS") {
            self.transport.address = address;
        }
        self
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Protocol sizing and timing.
///
/// Interval fields are in time units.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Length of one time unit in milliseconds
    pub time_unit_ms: u64,

    /// Slots per message buffer
    pub buffer_capacity: usize,

    /// Silent watchdog ticks before the session is declared dead
    pub watchdog_timeout: u32,

    /// Watchdog tick period
    pub watchdog_period: f64,

    /// Host per-handler deadline
    pub handler_timeout: f64,

    /// Host delay between `~ES` attempts
    pub host_retry: f64,

    /// Client delay between handshake polls
    pub client_poll: f64,

    /// Scheduler back-off when a sub-step has nothing to do
    pub idle_yield: f64,

    /// How long the dispense indicator stays lit
    pub indicator_hold: f64,

    /// Taken-sensor poll interval
    pub taken_poll: f64,

    /// Pause after reporting a taken event
    pub taken_settle: f64,

    /// Host wait for `@fl` before tearing down locally
    pub disconnect_grace: f64,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            time_unit_ms: 1000,
            buffer_capacity: DEFAULT_CAPACITY,
            watchdog_timeout: DEFAULT_WATCHDOG_TIMEOUT,
            watchdog_period: 5.0,
            handler_timeout: 2.0,
            host_retry: 1.0,
            client_poll: 0.5,
            idle_yield: 0.01,
            indicator_hold: 0.5,
            taken_poll: 0.1,
            taken_settle: 1.0,
            disconnect_grace: 2.0,
        }
    }
}

impl ProtocolConfig {
    /// Same defaults with a different time unit
    pub fn with_time_unit(mut self, unit: Duration) -> Self {
        self.time_unit_ms = unit.as_millis() as u64;
        self
    }

    /// Set watchdog ceiling
    pub fn with_watchdog_timeout(mut self, ticks: u32) -> Self {
        self.watchdog_timeout = ticks;
        self
    }

    /// Set buffer capacity
    pub fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.time_unit_ms == 0 {
            return Err(CandyError::Config("time_unit_ms must be non-zero".to_string()));
        }
        if self.buffer_capacity == 0 {
            return Err(CandyError::Config("buffer_capacity must be non-zero".to_string()));
        }
        if self.watchdog_timeout == 0 {
            return Err(CandyError::Config("watchdog_timeout must be non-zero".to_string()));
        }
        let intervals = [
            ("watchdog_period", self.watchdog_period),
            ("handler_timeout", self.handler_timeout),
            ("host_retry", self.host_retry),
            ("client_poll", self.client_poll),
            ("idle_yield", self.idle_yield),
            ("indicator_hold", self.indicator_hold),
            ("taken_poll", self.taken_poll),
            ("taken_settle", self.taken_settle),
            ("disconnect_grace", self.disconnect_grace),
        ];
        for (name, value) in intervals {
            if !value.is_finite() || value <= 0.0 {
                return Err(CandyError::Config(format!("{name} must be positive")));
            }
        }
        Ok(())
    }

    /// Convert a count of time units to a duration
    pub fn units(&self, n: f64) -> Duration {
        Duration::from_secs_f64(self.time_unit_ms as f64 * n / 1000.0)
    }

    /// Resolve every interval to a duration
    pub fn timing(&self) -> Timing {
        Timing {
            watchdog_period: self.units(self.watchdog_period),
            handler_timeout: self.units(self.handler_timeout),
            host_retry: self.units(self.host_retry),
            client_poll: self.units(self.client_poll),
            idle_yield: self.units(self.idle_yield),
            indicator_hold: self.units(self.indicator_hold),
            taken_poll: self.units(self.taken_poll),
            taken_settle: self.units(self.taken_settle),
            disconnect_grace: self.units(self.disconnect_grace),
        }
    }
}

/// Resolved protocol intervals
#[derive(Debug, Clone, Copy)]
pub struct Timing {
    /// Watchdog tick period
    pub watchdog_period: Duration,
    /// Host per-handler deadline
    pub handler_timeout: Duration,
    /// Host `~ES` retry interval
    pub host_retry: Duration,
    /// Client handshake poll interval
    pub client_poll: Duration,
    /// Scheduler idle back-off
    pub idle_yield: Duration,
    /// Dispense indicator hold time
    pub indicator_hold: Duration,
    /// Taken-sensor poll interval
    pub taken_poll: Duration,
    /// Pause after a taken event
    pub taken_settle: Duration,
    /// Host wait for `@fl`
    pub disconnect_grace: Duration,
}

/// Link selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Which medium to use
    pub kind: TransportKind,

    /// Serial device path; probed discovery when unset
    pub device: Option<PathBuf>,

    /// Serial line rate
    pub baud_rate: u32,

    /// TCP address for stream bridges
    pub address: String,

    /// Per-read deadline in milliseconds
    pub read_timeout_ms: u64,

    /// Run the `"correct port"` probe before the handshake
    pub probe: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::Serial,
            device: None,
            baud_rate: DEFAULT_BAUD_RATE,
            address: "127.0.0.1:7878".to_string(),
            read_timeout_ms: 1000,
            probe: true,
        }
    }
}

impl TransportConfig {
    /// Per-read deadline
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}
