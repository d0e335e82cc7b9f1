//! Core library for the tdi_daq acquisition engine.
//!
//! Synchronizes continuous stage motion with triggered line-scan (TDI) camera
//! capture on a flow-cell imaging instrument, coordinating laser power,
//! filter wheels and objective focus so the light path is stable for the
//! whole scan. Captured lines are assembled into one image bundle per
//! fluorescence channel.
//!
//! Device drivers plug in through the traits in [`hardware::capabilities`];
//! [`acquisition::AcquisitionController`] is the entry point.

pub mod acquisition;
pub mod config;
pub mod error;
pub mod hardware;
pub mod logging;

pub use acquisition::{AcquisitionController, AcquisitionRequest, ChannelId, ImageBundle};
pub use error::{AcqResult, AcquisitionError, DeviceFault};
