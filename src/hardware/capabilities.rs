//! Device capability traits consumed by the acquisition engine.
//!
//! Hardware-agnostic interfaces for the scan stage, the line-scan camera and
//! the illumination/optics actuators. Concrete drivers handle protocol details
//! (FPGA trigger board, serial stage controllers, frame grabbers); the engine
//! only relies on the primitive operations below.
//!
//! ## Blocking semantics
//! - Commands (`move_to`, `arm`, `set_power`, ...) return once the device has
//!   accepted the command, not when the motion or ramp has finished.
//! - Completion is observed by polling `read_state` / `status` / `get_status`.
//! - `LineCamera::next_frame` suspends until a frame is available, the given
//!   timeout elapses, or the camera faults.
//!
//! ## Faults
//! Every call may fail with [`DeviceFault`], carrying the device identity.
//! Status snapshots additionally expose a fault flag so faults raised while a
//! device is merely being observed are surfaced too.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::acquisition::request::ChannelId;
use crate::error::DeviceFault;

// =============================================================================
// Scan axis
// =============================================================================

/// Axis position, velocity and fault snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct AxisState {
    /// Axis identifier
    pub axis: String,
    /// Current position in stage units
    pub position: f64,
    /// Current velocity in stage units/second (0 when idle)
    pub velocity: f64,
    /// Fault reason if the axis reports a hardware fault
    pub fault: Option<String>,
}

impl AxisState {
    /// Convert the fault flag into a [`DeviceFault`].
    pub fn check_fault(&self) -> Result<(), DeviceFault> {
        match &self.fault {
            Some(reason) => Err(DeviceFault::new(self.axis.clone(), reason.clone())),
            None => Ok(()),
        }
    }
}

/// Travel range and rated velocity of an axis
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AxisLimits {
    /// Minimum reachable position (soft limit)
    pub min_position: f64,
    /// Maximum reachable position (soft limit)
    pub max_position: f64,
    /// Rated maximum velocity in stage units/second
    pub max_velocity: f64,
}

impl AxisLimits {
    /// True if `position` lies inside the travel range.
    pub fn contains(&self, position: f64) -> bool {
        position >= self.min_position && position <= self.max_position
    }
}

/// Scan stage axis.
#[async_trait]
pub trait ScanAxis: Send + Sync {
    /// Device identifier used in logs and fault reports
    fn id(&self) -> &str;

    /// Travel range and rated velocity (static configuration of the axis)
    fn limits(&self) -> AxisLimits;

    /// Command an absolute move at the currently configured velocity
    async fn move_to(&self, position: f64) -> Result<(), DeviceFault>;

    /// Read position, velocity and fault flag
    async fn read_state(&self) -> Result<AxisState, DeviceFault>;

    /// Set the velocity used by subsequent moves
    async fn set_velocity(&self, velocity: f64) -> Result<(), DeviceFault>;

    /// Decelerate to a stop and hold position
    async fn stop(&self) -> Result<(), DeviceFault>;

    /// Current position
    async fn get_position(&self) -> Result<f64, DeviceFault> {
        Ok(self.read_state().await?.position)
    }

    /// Current velocity
    async fn get_velocity(&self) -> Result<f64, DeviceFault> {
        Ok(self.read_state().await?.velocity)
    }
}

// =============================================================================
// Line-scan camera
// =============================================================================

/// Fixed optical/electrical characteristics of a camera + optics pairing
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraGeometry {
    /// Stage travel per trigger (one image row), in stage units
    pub line_pitch: f64,
    /// Fastest line rate the camera can sustain, in Hz
    pub max_trigger_rate: f64,
    /// Slowest line rate that still produces a valid TDI exposure, in Hz
    pub min_trigger_rate: f64,
    /// Samples per captured line
    pub line_width: usize,
    /// Largest trigger count a single arm can buffer (None = unbounded)
    #[serde(default)]
    pub max_frames_per_arm: Option<u32>,
}

/// Per-channel exposure settings handed to the camera when arming
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExposureSetting {
    /// Channel captured with these settings
    pub channel: ChannelId,
    /// Time between triggers at cruise velocity
    pub line_period: Duration,
    /// Sensor gain (0-100, hardware interprets as appropriate scale)
    pub gain: u8,
}

/// One captured line
#[derive(Debug, Clone, PartialEq)]
pub struct FrameRecord {
    /// Index within the scan, starting at 0
    pub sequence: u64,
    /// Capture time reported by the frame grabber
    pub timestamp: DateTime<Utc>,
    /// Channel this line belongs to
    pub channel: ChannelId,
    /// Raw intensity samples
    pub line: Vec<u16>,
}

/// Camera acquisition status snapshot
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CameraStatus {
    /// Camera accepted an arm and waits for (or is receiving) triggers
    pub armed: bool,
    /// All armed triggers have been captured
    pub capture_complete: bool,
    /// Frames captured but not yet read via `next_frame`
    pub pending_frames: usize,
    /// Fault reason if the camera reports a hardware fault
    pub fault: Option<String>,
}

/// Failure of [`LineCamera::next_frame`]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FrameError {
    /// No frame arrived within the given timeout
    #[error("no frame within {0:?}")]
    Timeout(Duration),
    /// Camera reported a hardware fault
    #[error(transparent)]
    Fault(#[from] DeviceFault),
}

/// Triggered line-scan camera.
///
/// Triggers come from the stage encoder via the trigger board, one per
/// `line_pitch` of travel once armed; software never fires triggers itself.
#[async_trait]
pub trait LineCamera: Send + Sync {
    /// Device identifier used in logs and fault reports
    fn id(&self) -> &str;

    /// Optical and timing characteristics
    fn geometry(&self) -> CameraGeometry;

    /// Arm for `trigger_count` externally triggered lines.
    ///
    /// With several exposure settings the trigger count is split into equal
    /// consecutive passes, one per setting in order.
    async fn arm(
        &self,
        trigger_count: u32,
        exposures: &[ExposureSetting],
    ) -> Result<(), DeviceFault>;

    /// Wait up to `timeout` for the next captured line
    async fn next_frame(&self, timeout: Duration) -> Result<FrameRecord, FrameError>;

    /// Read armed / completion / fault status
    async fn status(&self) -> Result<CameraStatus, DeviceFault>;

    /// Leave triggered mode and drop any pending lines
    async fn disarm(&self) -> Result<(), DeviceFault>;
}

// =============================================================================
// Illumination and optics actuators
// =============================================================================

/// Status snapshot of a settling actuator (laser, filter wheel, objective)
#[derive(Debug, Clone, PartialEq)]
pub struct ActuatorStatus {
    /// Measured value (power, wheel position or objective position)
    pub reading: f64,
    /// Device reports its commanded target reached
    pub settled: bool,
    /// Fault reason if the device reports a hardware fault
    pub fault: Option<String>,
}

/// Excitation laser with controllable output power.
#[async_trait]
pub trait Laser: Send + Sync {
    /// Device identifier
    fn id(&self) -> &str;
    /// Command output power (mW)
    async fn set_power(&self, power: f64) -> Result<(), DeviceFault>;
    /// Read output power and settle state
    async fn get_status(&self) -> Result<ActuatorStatus, DeviceFault>;
}

/// Excitation or emission filter wheel.
#[async_trait]
pub trait FilterWheel: Send + Sync {
    /// Device identifier
    fn id(&self) -> &str;
    /// Command wheel position
    async fn set_position(&self, position: f64) -> Result<(), DeviceFault>;
    /// Read wheel position and settle state
    async fn get_status(&self) -> Result<ActuatorStatus, DeviceFault>;
}

/// Motorized objective (focus) stage.
#[async_trait]
pub trait ObjectiveStage: Send + Sync {
    /// Device identifier
    fn id(&self) -> &str;
    /// Command an absolute focus position (objective steps)
    async fn move_to(&self, position: f64) -> Result<(), DeviceFault>;
    /// Read focus position and settle state
    async fn get_status(&self) -> Result<ActuatorStatus, DeviceFault>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_axis_fault_flag() {
        let state = AxisState {
            axis: "y".to_string(),
            position: 0.0,
            velocity: 0.0,
            fault: Some("following error".to_string()),
        };
        let fault = state.check_fault().unwrap_err();
        assert_eq!(fault.device, "y");
        assert_eq!(fault.reason, "following error");
    }

    #[test]
    fn test_axis_limits_contains() {
        let limits = AxisLimits {
            min_position: -10.0,
            max_position: 10.0,
            max_velocity: 5.0,
        };
        assert!(limits.contains(-10.0));
        assert!(limits.contains(10.0));
        assert!(!limits.contains(10.5));
    }
}
