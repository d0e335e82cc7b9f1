//! Scan Configuration System
//!
//! This module provides configuration management for the acquisition engine using Figment.
//!
//! # Configuration Sources
//!
//! Configuration is loaded from (in order of precedence):
//! 1. Environment variables prefixed with `TDIDAQ_`
//! 2. TOML configuration file (default: `config/scan.toml`)
//!
//! # Example
//!
//! ```no_run
//! use tdi_daq::config::ScanConfig;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ScanConfig::load_from("config/scan.toml")?;
//!
//!     println!("Instrument: {}", config.application.name);
//!     println!("Frame timeout: {:?}", config.triggering.frame_timeout());
//!     println!("Channels: {}", config.channels.len());
//!
//!     Ok(())
//! }
//! ```
//!
//! # Environment Variables
//!
//! Any configuration value can be overridden via environment variables with the
//! `TDIDAQ_` prefix; nested keys are separated by a double underscore:
//!
//! ```text
//! TDIDAQ_APPLICATION__LOG_LEVEL=debug
//! TDIDAQ_TRIGGERING__FRAME_TIMEOUT_MS=250
//! TDIDAQ_ILLUMINATION__SETTLE_TIMEOUT_MS=5000
//! ```

pub mod scan_config;

pub use scan_config::{
    ApplicationConfig, ChannelDefinition, ChannelSchedule, ConfigError, FilterSetting,
    IlluminationConfig, LaserSetting, MotionConfig, ScanConfig, TriggeringConfig,
};
