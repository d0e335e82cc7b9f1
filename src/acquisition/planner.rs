//! Motion profile planning.
//!
//! Turns an [`AcquisitionRequest`] plus the fixed camera/stage characteristics
//! into a [`ScanProfile`]. Planning is pure: no device I/O and deterministic
//! for identical inputs, so infeasible requests are rejected before a single
//! device command is issued.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::request::{AcquisitionRequest, ChannelId};
use crate::config::{MotionConfig, ScanConfig};
use crate::error::{AcqResult, AcquisitionError};
use crate::hardware::capabilities::{AxisLimits, CameraGeometry, ExposureSetting};

/// Planned stage trajectory and trigger layout for one scan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanProfile {
    /// Stage position before acceleration (region start minus pre-roll)
    pub start: f64,
    /// Stage position after deceleration (region end plus post-roll)
    pub end: f64,
    /// Velocity held while triggering
    pub cruise_velocity: f64,
    /// Stage travel between triggers
    pub trigger_pitch: f64,
    /// Triggers the camera is armed for
    pub trigger_count: u32,
    /// Exposure settings, one per capture pass in order
    pub exposures: Vec<ExposureSetting>,
}

impl ScanProfile {
    /// Line rate at cruise velocity (Hz)
    pub fn trigger_rate(&self) -> f64 {
        self.cruise_velocity / self.trigger_pitch
    }

    /// Expected time spent triggering
    pub fn triggering_duration(&self) -> Duration {
        Duration::from_secs_f64(f64::from(self.trigger_count) / self.trigger_rate())
    }
}

/// Computes scan profiles for one stage axis / camera pairing.
#[derive(Debug, Clone)]
pub struct MotionPlanner {
    geometry: CameraGeometry,
    limits: AxisLimits,
    pre_roll: f64,
    post_roll: f64,
}

impl MotionPlanner {
    /// Create a planner from device characteristics and roll margins.
    pub fn new(geometry: CameraGeometry, limits: AxisLimits, motion: &MotionConfig) -> Self {
        Self {
            geometry,
            limits,
            pre_roll: motion.pre_roll,
            post_roll: motion.post_roll,
        }
    }

    /// Plan a scan of `request.region` capturing `channels` in consecutive
    /// passes.
    ///
    /// # Errors
    /// `ProfileInfeasible` when the capped line rate is below what the camera
    /// sustains, the frame count exceeds what one arm can buffer, the region
    /// is too short for the frame count, or pre/post-roll leave the travel
    /// range.
    pub fn plan(
        &self,
        request: &AcquisitionRequest,
        channels: &[ChannelId],
        config: &ScanConfig,
    ) -> AcqResult<ScanProfile> {
        let infeasible = |msg: String| Err(AcquisitionError::ProfileInfeasible(msg));
        let geometry = &self.geometry;

        if !(geometry.line_pitch > 0.0) || !(geometry.max_trigger_rate > 0.0) {
            return infeasible(format!(
                "camera geometry has non-positive line pitch ({}) or trigger rate ({})",
                geometry.line_pitch, geometry.max_trigger_rate
            ));
        }

        let ideal_velocity = geometry.line_pitch * geometry.max_trigger_rate;
        let cruise_velocity = ideal_velocity.min(self.limits.max_velocity);
        let trigger_rate = cruise_velocity / geometry.line_pitch;
        if !(trigger_rate >= geometry.min_trigger_rate) || !(cruise_velocity > 0.0) {
            return infeasible(format!(
                "stage limited to {} units/s gives {:.1} Hz line rate, camera needs >= {:.1} Hz",
                self.limits.max_velocity, trigger_rate, geometry.min_trigger_rate
            ));
        }

        if let Some(capacity) = geometry.max_frames_per_arm {
            if request.frame_count > capacity {
                return infeasible(format!(
                    "{} frames exceed camera capacity of {} per arm",
                    request.frame_count, capacity
                ));
            }
        }

        let travel = f64::from(request.frame_count) * geometry.line_pitch;
        // Allow for float rounding in region bounds computed from the pitch.
        let slack = geometry.line_pitch * 1e-6;
        if travel > request.region.length() + slack {
            return infeasible(format!(
                "{} frames need {} units of travel, region is {} long",
                request.frame_count,
                travel,
                request.region.length()
            ));
        }

        let direction = request.region.direction();
        let start = request.region.start - direction * self.pre_roll;
        let end = request.region.end + direction * self.post_roll;
        if !self.limits.contains(start) || !self.limits.contains(end) {
            return infeasible(format!(
                "scan from {} to {} (with roll margins) leaves travel range [{}, {}]",
                start, end, self.limits.min_position, self.limits.max_position
            ));
        }

        let line_period = Duration::from_secs_f64(1.0 / trigger_rate);
        let exposures = channels
            .iter()
            .map(|channel| {
                config
                    .channel(channel)
                    .map(|definition| ExposureSetting {
                        channel: channel.clone(),
                        line_period,
                        gain: definition.gain,
                    })
                    .ok_or_else(|| {
                        AcquisitionError::InvalidRequest(format!(
                            "channel {} is not configured",
                            channel
                        ))
                    })
            })
            .collect::<AcqResult<Vec<_>>>()?;

        Ok(ScanProfile {
            start,
            end,
            cruise_velocity,
            trigger_pitch: geometry.line_pitch,
            trigger_count: request.frame_count,
            exposures,
        })
    }
}
