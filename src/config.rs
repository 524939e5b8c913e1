//! Driver configuration types and loading
//!
//! Every field has a default, so an empty JSON object is a valid config.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::orientation::OrthogonalityCorrection;
use crate::protocol::LedMask;

/// Root configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Stream and decode accelerometer/gyroscope data
    #[serde(default = "default_true")]
    pub enable_imu: bool,

    /// Fuse IMU samples into an orientation estimate. When off, only the
    /// raw accel/gyro fields are refreshed.
    #[serde(default = "default_true")]
    pub localize_imu: bool,

    /// DCM filter weight (alpha)
    #[serde(default = "default_filter_weight")]
    pub filter_weight: f32,

    /// Re-orthogonalization used by the DCM filter
    #[serde(default)]
    pub orthogonality_correction: OrthogonalityCorrection,

    /// Player LED mask sent on attach
    #[serde(default = "default_leds")]
    pub leds: u8,

    /// Poll task cadence in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Consumer task rate in Hz
    #[serde(default = "default_consumer_rate")]
    pub consumer_rate_hz: u32,

    /// Subcommand reply timeout in milliseconds
    #[serde(default = "default_command_timeout")]
    pub command_timeout_ms: u64,

    /// Consecutive failed polls before the link is considered dropped
    #[serde(default = "default_max_poll_attempts")]
    pub max_poll_attempts: u32,

    /// Attempts per SPI flash read
    #[serde(default = "default_max_spi_attempts")]
    pub max_spi_attempts: usize,

    /// Average the stick over this many samples (0 or 1 disables)
    #[serde(default)]
    pub stick_smoothing: usize,
}

fn default_true() -> bool {
    true
}

fn default_filter_weight() -> f32 {
    0.05
}

fn default_leds() -> u8 {
    LedMask::ONE
}

fn default_poll_interval() -> u64 {
    5
}

fn default_consumer_rate() -> u32 {
    60
}

fn default_command_timeout() -> u64 {
    50
}

fn default_max_poll_attempts() -> u32 {
    1000
}

fn default_max_spi_attempts() -> usize {
    100
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            enable_imu: true,
            localize_imu: true,
            filter_weight: default_filter_weight(),
            orthogonality_correction: OrthogonalityCorrection::default(),
            leds: default_leds(),
            poll_interval_ms: default_poll_interval(),
            consumer_rate_hz: default_consumer_rate(),
            command_timeout_ms: default_command_timeout(),
            max_poll_attempts: default_max_poll_attempts(),
            max_spi_attempts: default_max_spi_attempts(),
            stick_smoothing: 0,
        }
    }
}

impl DriverConfig {
    /// Load configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: DriverConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Load `path` if given, otherwise use defaults
    pub fn load_or_default<P: AsRef<Path>>(path: Option<P>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    /// Save configuration as pretty JSON
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn consumer_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.consumer_rate_hz.max(1) as f64)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}
