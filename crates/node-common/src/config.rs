//! Configuration structures for the node runtime.
//!
//! Supports TOML deserialization with defaults matching the firmware's
//! build-time parameter set. Sizes that determine memory layout (queue
//! capacity, persisted block size) are constants in [`crate::nvcfg`] and
//! [`QUEUE_CAPACITY`], not configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Capacity of the scheduled command queue.
pub const QUEUE_CAPACITY: usize = 10;

/// Smallest accepted board watchdog window (when enabled).
pub const MIN_BOARD_WATCHDOG: Duration = Duration::from_secs(120);

/// Upper bound for the wake period and the board reset pulse. The reset
/// pulse is queued as a relative time, which must stay below one day.
pub const MAX_RELATIVE_DELAY: Duration = Duration::from_secs(86_399);

/// Top-level node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node identifier used for message addressing.
    pub node_id: u16,

    /// Period of the duty cycle wake timer.
    #[serde(with = "humantime_serde")]
    pub wake_period: Duration,

    /// Frequency of the local tick source in Hz.
    pub tick_frequency_hz: u64,

    /// Ticks subtracted from a captured time-request edge to account for
    /// wakeup and interrupt entry latency.
    pub isr_latency_ticks: u64,

    /// Sleep level used between duty cycles.
    pub low_power_mode: LowPowerMode,

    /// Time synchronization parameters.
    pub timesync: TimesyncConfig,

    /// Attached board control parameters.
    pub board: BoardConfig,

    /// Inbound link parameters.
    pub link: LinkConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: 2,
            wake_period: Duration::from_secs(60),
            tick_frequency_hz: 32_768,
            isr_latency_ticks: 1,
            low_power_mode: LowPowerMode::default(),
            timesync: TimesyncConfig::default(),
            board: BoardConfig::default(),
            link: LinkConfig::default(),
        }
    }
}

/// Sleep level entered while the node is idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LowPowerMode {
    /// Light sleep: only the tick is suspended, no deep-sleep sequence.
    Sleep,
    /// Stop level 2: RAM and registers retained, low-power timer running.
    #[default]
    Stop2,
    /// Standby: additionally stops the low-power timer.
    Standby,
    /// Shutdown: lowest level, additionally stops the low-power timer.
    Shutdown,
}

impl LowPowerMode {
    /// Returns true if this level requires the full deep-sleep sequence.
    #[must_use]
    pub fn is_deep(&self) -> bool {
        !matches!(self, Self::Sleep)
    }
}

/// Drift bounds for the time synchronization engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimesyncConfig {
    /// Drift magnitude above which a soft warning is logged, in ppm.
    pub typical_drift_ppm: i32,
    /// Drift magnitude at which a sample is rejected, in ppm.
    pub max_drift_ppm: i32,
}

impl Default for TimesyncConfig {
    fn default() -> Self {
        Self {
            typical_drift_ppm: 40,
            max_drift_ppm: 100,
        }
    }
}

/// Attached board (baseboard) control parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BoardConfig {
    /// Power-cycle the board if no time request arrived within this window.
    /// Zero disables the watchdog.
    #[serde(with = "humantime_serde")]
    pub watchdog: Duration,

    /// Delay before a power-cycled board is re-enabled.
    #[serde(with = "humantime_serde")]
    pub reset_pulse: Duration,

    /// Synchronous low pulse used when the re-enable cannot be scheduled.
    #[serde(with = "humantime_serde")]
    pub fallback_pulse: Duration,

    /// Length of the indicator pulse emitted every duty cycle.
    #[serde(with = "humantime_serde")]
    pub indicator_pulse: Duration,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            watchdog: Duration::from_secs(900),
            reset_pulse: Duration::from_secs(2),
            fallback_pulse: Duration::from_millis(60),
            indicator_pulse: Duration::from_millis(100),
        }
    }
}

/// Inbound message link parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Maximum number of inbound messages processed per cycle.
    pub max_reads_per_cycle: u32,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            max_reads_per_cycle: 100,
        }
    }
}

impl NodeConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or the values are inconsistent.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Check the parameter set for consistency.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first violated rule.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_frequency_hz == 0 {
            return Err(ConfigError::Invalid("tick_frequency_hz must be > 0".into()));
        }
        if self.wake_period.is_zero() {
            return Err(ConfigError::Invalid("wake_period must be > 0".into()));
        }
        if self.wake_period > MAX_RELATIVE_DELAY {
            return Err(ConfigError::Invalid(format!(
                "wake_period must be <= {}",
                humantime::format_duration(MAX_RELATIVE_DELAY)
            )));
        }
        if self.board.reset_pulse > MAX_RELATIVE_DELAY {
            return Err(ConfigError::Invalid(format!(
                "board reset_pulse must be <= {}",
                humantime::format_duration(MAX_RELATIVE_DELAY)
            )));
        }
        let drift = &self.timesync;
        if drift.typical_drift_ppm < 0 || drift.max_drift_ppm <= 0 {
            return Err(ConfigError::Invalid("drift bounds must be positive".into()));
        }
        if drift.typical_drift_ppm >= drift.max_drift_ppm {
            return Err(ConfigError::Invalid(format!(
                "typical_drift_ppm ({}) must be below max_drift_ppm ({})",
                drift.typical_drift_ppm, drift.max_drift_ppm
            )));
        }
        if drift.max_drift_ppm >= 1_000_000 {
            return Err(ConfigError::Invalid("max_drift_ppm must be below 1000000".into()));
        }
        if !self.board.watchdog.is_zero() && self.board.watchdog < MIN_BOARD_WATCHDOG {
            return Err(ConfigError::Invalid(format!(
                "board watchdog must be 0 or >= {}",
                humantime::format_duration(MIN_BOARD_WATCHDOG)
            )));
        }
        Ok(())
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File I/O error.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// TOML parsing error.
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize TOML: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Parameter set violates a consistency rule.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Serde helper module for `Duration` using humantime format.
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
