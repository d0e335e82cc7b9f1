//! Device interfaces and scripted test doubles.
//!
//! - [`capabilities`]: async traits for the scan axis, line camera and light
//!   path actuators
//! - [`mock`]: in-memory implementations with a shared command log

pub mod capabilities;
pub mod mock;

pub use capabilities::{
    ActuatorStatus, AxisLimits, AxisState, CameraGeometry, CameraStatus, ExposureSetting,
    FilterWheel, FrameError, FrameRecord, Laser, LineCamera, ObjectiveStage, ScanAxis,
};
