//! Scan Configuration using Figment
//!
//! This module provides strongly-typed configuration loading for the
//! acquisition engine. Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. Environment variables (prefixed with TDIDAQ_)
//!
//! Tolerances and timeouts depend on the specific stage, lasers and filter
//! wheels fitted to an instrument, so they have no built-in defaults and must
//! be present in the configuration.
//!
//! # Example
//!
//! ```toml
//! [application]
//! name = "HiSeq A"
//! log_level = "info"
//!
//! [motion]
//! pre_roll = 0.8
//! post_roll = 0.8
//! arrival_tolerance = 0.002
//! velocity_tolerance = 0.05
//! motion_timeout_ms = 10000
//! velocity_timeout_ms = 2000
//! poll_interval_ms = 10
//!
//! [triggering]
//! frame_timeout_ms = 500
//! channel_schedule = "interleaved"
//!
//! [illumination]
//! power_tolerance = 2.0
//! filter_tolerance = 0.01
//! focus_tolerance = 5.0
//! settle_timeout_ms = 5000
//! poll_interval_ms = 20
//!
//! [[channels]]
//! id = "558"
//! laser = { device = "laser_green", power = 100.0 }
//! filters = [{ wheel = "ex_wheel_green", position = 0.6 }]
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::acquisition::request::ChannelId;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration load error: {0}")]
    LoadError(#[from] Box<figment::Error>),
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level acquisition configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Stage motion settings
    pub motion: MotionConfig,
    /// Frame triggering settings
    pub triggering: TriggeringConfig,
    /// Light path settling settings
    pub illumination: IlluminationConfig,
    /// Channel-to-hardware mapping
    pub channels: Vec<ChannelDefinition>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Instrument name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Emit JSON-formatted log lines
    #[serde(default)]
    pub json_logs: bool,
}

/// Scan stage motion configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MotionConfig {
    /// Extra travel before the region so the stage is at speed on the first row
    pub pre_roll: f64,
    /// Extra travel after the region for deceleration
    pub post_roll: f64,
    /// Max |position - target| to count as arrived
    pub arrival_tolerance: f64,
    /// Max |velocity - cruise| to count as at speed
    pub velocity_tolerance: f64,
    /// Timeout for reaching the start and end positions (ms)
    pub motion_timeout_ms: u64,
    /// Timeout for reaching cruise velocity (ms)
    pub velocity_timeout_ms: u64,
    /// Interval between stage/camera status polls (ms)
    pub poll_interval_ms: u64,
}

impl MotionConfig {
    /// Arrival timeout
    pub fn motion_timeout(&self) -> Duration {
        Duration::from_millis(self.motion_timeout_ms)
    }

    /// Acceleration timeout
    pub fn velocity_timeout(&self) -> Duration {
        Duration::from_millis(self.velocity_timeout_ms)
    }

    /// Poll interval
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Channel capture policy for multi-channel requests
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelSchedule {
    /// Every channel settled once up front, then one settle + scan per
    /// channel
    #[default]
    Sequential,
    /// All channels settled together and captured in consecutive passes of a
    /// single scan
    Interleaved,
}

/// Frame triggering configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggeringConfig {
    /// Max wait for each frame once triggering has started (ms)
    pub frame_timeout_ms: u64,
    /// Read the stage fault flag every N frames
    #[serde(default = "default_stage_check_interval")]
    pub stage_check_interval: u32,
    /// Channel capture policy
    #[serde(default)]
    pub channel_schedule: ChannelSchedule,
}

impl TriggeringConfig {
    /// Per-frame timeout
    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }
}

/// Light path settling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IlluminationConfig {
    /// Max |power - target| (mW)
    pub power_tolerance: f64,
    /// Max |wheel position - target|
    pub filter_tolerance: f64,
    /// Max |objective position - target| (steps)
    pub focus_tolerance: f64,
    /// Timeout for all devices to settle (ms)
    pub settle_timeout_ms: u64,
    /// Interval between status polls (ms)
    pub poll_interval_ms: u64,
}

impl IlluminationConfig {
    /// Settle timeout
    pub fn settle_timeout(&self) -> Duration {
        Duration::from_millis(self.settle_timeout_ms)
    }

    /// Poll interval
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Laser and power used by a channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaserSetting {
    /// Laser device id
    pub device: String,
    /// Output power (mW)
    pub power: f64,
}

/// Filter wheel position used by a channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterSetting {
    /// Filter wheel device id
    pub wheel: String,
    /// Wheel position
    pub position: f64,
}

/// Hardware configuration of one fluorescence channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelDefinition {
    /// Channel identifier
    pub id: ChannelId,
    /// Excitation laser
    pub laser: LaserSetting,
    /// Excitation/emission filter positions
    #[serde(default)]
    pub filters: Vec<FilterSetting>,
    /// Camera gain for this channel
    #[serde(default = "default_gain")]
    pub gain: u8,
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_stage_check_interval() -> u32 {
    1
}

fn default_gain() -> u8 {
    100
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl ScanConfig {
    /// Load configuration from `config/scan.toml` and environment variables
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config/scan.toml")
    }

    /// Load configuration from a specific file path
    ///
    /// Environment variables (TDIDAQ_ prefix) take precedence over the file.
    /// After loading, configuration is validated.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::from_figment(
            Figment::new()
                .merge(Toml::file(path.as_ref()))
                .merge(Env::prefixed("TDIDAQ_").split("__")),
        )
    }

    /// Parse and validate configuration from a TOML string (no environment overrides)
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        Self::from_figment(Figment::new().merge(Toml::string(toml)))
    }

    fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment
            .extract()
            .map_err(|e| ConfigError::LoadError(Box::new(e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Tolerances and roll margins are finite and non-negative
    /// - Timeouts, poll intervals and the stage check interval are non-zero
    /// - Channel IDs are unique and reference named devices
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let non_negative = [
            ("motion.pre_roll", self.motion.pre_roll),
            ("motion.post_roll", self.motion.post_roll),
            ("motion.arrival_tolerance", self.motion.arrival_tolerance),
            ("motion.velocity_tolerance", self.motion.velocity_tolerance),
            ("illumination.power_tolerance", self.illumination.power_tolerance),
            ("illumination.filter_tolerance", self.illumination.filter_tolerance),
            ("illumination.focus_tolerance", self.illumination.focus_tolerance),
        ];
        for (key, value) in non_negative {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid {} {}. Must be finite and >= 0",
                    key, value
                )));
            }
        }

        let non_zero = [
            ("motion.motion_timeout_ms", self.motion.motion_timeout_ms),
            ("motion.velocity_timeout_ms", self.motion.velocity_timeout_ms),
            ("motion.poll_interval_ms", self.motion.poll_interval_ms),
            ("triggering.frame_timeout_ms", self.triggering.frame_timeout_ms),
            (
                "triggering.stage_check_interval",
                u64::from(self.triggering.stage_check_interval),
            ),
            (
                "illumination.settle_timeout_ms",
                self.illumination.settle_timeout_ms,
            ),
            (
                "illumination.poll_interval_ms",
                self.illumination.poll_interval_ms,
            ),
        ];
        for (key, value) in non_zero {
            if value == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid {}: must be > 0",
                    key
                )));
            }
        }

        let mut ids = HashSet::new();
        for channel in &self.channels {
            if !ids.insert(&channel.id) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate channel ID: '{}'",
                    channel.id
                )));
            }
            self.validate_channel(channel)?;
        }

        Ok(())
    }

    /// Validate a specific channel's hardware mapping
    fn validate_channel(&self, channel: &ChannelDefinition) -> Result<(), ConfigError> {
        if channel.id.as_str().is_empty() {
            return Err(ConfigError::ValidationError(
                "Channel ID cannot be empty".to_string(),
            ));
        }
        if channel.laser.device.is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "Channel '{}': 'laser.device' cannot be empty",
                channel.id
            )));
        }
        if !channel.laser.power.is_finite() || channel.laser.power < 0.0 {
            return Err(ConfigError::ValidationError(format!(
                "Channel '{}': invalid laser power {}",
                channel.id, channel.laser.power
            )));
        }
        for filter in &channel.filters {
            if filter.wheel.is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "Channel '{}': filter 'wheel' cannot be empty",
                    channel.id
                )));
            }
            if !filter.position.is_finite() {
                return Err(ConfigError::ValidationError(format!(
                    "Channel '{}': invalid position for wheel '{}'",
                    channel.id, filter.wheel
                )));
            }
        }
        Ok(())
    }

    /// Look up a channel's hardware mapping
    pub fn channel(&self, id: &ChannelId) -> Option<&ChannelDefinition> {
        self.channels.iter().find(|channel| &channel.id == id)
    }
}
