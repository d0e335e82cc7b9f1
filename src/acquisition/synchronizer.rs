//! Scan synchronizer: drives one scan from stage positioning to capture
//! completion.
//!
//! # State machine
//!
//! ```text
//! Idle -> Arming -> Accelerating -> Triggering -> Decelerating -> Complete
//!   \________\___________\______________\______________\-> Aborting
//! ```
//!
//! - **Idle**: arm the camera for the profile's trigger count, move the stage
//!   to the pre-roll start.
//! - **Arming**: wait until the stage is at start and the camera reports
//!   armed, then set cruise velocity and start the move to the post-roll end.
//! - **Accelerating**: wait until the stage runs at cruise velocity.
//! - **Triggering**: pull frames in strict sequence order into the bundle
//!   assembler, checking the stage fault flag periodically.
//! - **Decelerating**: wait until the stage is at end and the camera has
//!   delivered every captured frame.
//!
//! Any error moves the machine to **Aborting**, which sends a best-effort
//! `stop` and `disarm` before the originating error is returned. Every device
//! command is issued once per transition; nothing is retried.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use tracing::{debug, info, warn};

use super::assembler::BundleAssembler;
use super::illumination::IlluminationState;
use super::planner::ScanProfile;
use super::wait::{poll_until, Checkpoint, WaitPolicy};
use crate::config::{MotionConfig, ScanConfig, TriggeringConfig};
use crate::error::{AcqResult, AcquisitionError, AcquisitionStage, DeviceFault};
use crate::hardware::capabilities::{FrameError, LineCamera, ScanAxis};

/// Scan lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ScanState {
    /// Nothing commanded yet
    Idle,
    /// Camera armed, stage moving to start
    Arming,
    /// Stage ramping to cruise velocity
    Accelerating,
    /// Capturing frames
    Triggering,
    /// Stage running out to end, camera draining
    Decelerating,
    /// Scan finished
    Complete,
    /// Scan failed or was aborted; devices being stopped
    Aborting,
}

impl ScanState {
    /// Lowercase state name used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanState::Idle => "idle",
            ScanState::Arming => "arming",
            ScanState::Accelerating => "accelerating",
            ScanState::Triggering => "triggering",
            ScanState::Decelerating => "decelerating",
            ScanState::Complete => "complete",
            ScanState::Aborting => "aborting",
        }
    }

    /// True for `Complete` and `Aborting`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ScanState::Complete | ScanState::Aborting)
    }
}

impl fmt::Display for ScanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Summary of a completed scan
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanReport {
    /// Frames consumed from the camera
    pub frames_received: u64,
    /// States visited, starting with `Idle`
    pub states: Vec<ScanState>,
    /// Velocity held while triggering
    pub cruise_velocity: f64,
    /// First device command
    pub started_at: DateTime<Utc>,
    /// Transition to `Complete`
    pub finished_at: DateTime<Utc>,
}

/// Runs the scan state machine for one stage axis and camera.
pub struct ScanSynchronizer<'a> {
    stage: &'a dyn ScanAxis,
    camera: &'a dyn LineCamera,
    motion: &'a MotionConfig,
    triggering: &'a TriggeringConfig,
    checkpoint: &'a Checkpoint,
    state: ScanState,
    history: Vec<ScanState>,
}

impl<'a> ScanSynchronizer<'a> {
    /// Create a synchronizer in `Idle`.
    pub fn new(
        stage: &'a dyn ScanAxis,
        camera: &'a dyn LineCamera,
        config: &'a ScanConfig,
        checkpoint: &'a Checkpoint,
    ) -> Self {
        Self {
            stage,
            camera,
            motion: &config.motion,
            triggering: &config.triggering,
            checkpoint,
            state: ScanState::Idle,
            history: vec![ScanState::Idle],
        }
    }

    /// Current state
    pub fn state(&self) -> ScanState {
        self.state
    }

    /// States visited so far, in order
    pub fn history(&self) -> &[ScanState] {
        &self.history
    }

    /// Execute `profile`, feeding every frame into `assembler`.
    ///
    /// # Errors
    /// - `NotSettled` before any device command if `illumination` is not settled
    /// - `MotionTimeout`, `FrameTimeout`, `FrameSequenceError`, `DeviceFault`,
    ///   assembly errors, `Aborted` or `BudgetExceeded` from the scan itself
    ///   (attributed to motion or triggering by the state they interrupted);
    ///   the devices have been sent `stop` and `disarm` in that case
    pub async fn run(
        &mut self,
        profile: &ScanProfile,
        illumination: &IlluminationState,
        assembler: &mut BundleAssembler,
    ) -> AcqResult<ScanReport> {
        if !illumination.is_settled() {
            return Err(AcquisitionError::NotSettled);
        }

        let started_at = Utc::now();
        let mut frames_received = 0u64;
        info!(
            stage = self.stage.id(),
            camera = self.camera.id(),
            start = profile.start,
            end = profile.end,
            cruise_velocity = profile.cruise_velocity,
            trigger_count = profile.trigger_count,
            "Starting scan"
        );

        while !self.state.is_terminal() {
            let next = match self.state {
                ScanState::Idle => self.start(profile).await,
                ScanState::Arming => self.arrive_at_start(profile).await,
                ScanState::Accelerating => self.reach_cruise(profile).await,
                ScanState::Triggering => {
                    self.capture(profile, assembler, &mut frames_received)
                        .await
                }
                ScanState::Decelerating => self.finish_motion(profile).await,
                ScanState::Complete | ScanState::Aborting => break,
            };

            match next {
                Ok(state) => self.transition(state),
                Err(err) => {
                    self.abort(&err).await;
                    return Err(err);
                }
            }
        }

        Ok(ScanReport {
            frames_received,
            states: self.history.clone(),
            cruise_velocity: profile.cruise_velocity,
            started_at,
            finished_at: Utc::now(),
        })
    }

    fn transition(&mut self, next: ScanState) {
        info!(from = %self.state, to = %next, "Scan state transition");
        self.state = next;
        self.history.push(next);
    }

    /// Idle -> Arming
    async fn start(&self, profile: &ScanProfile) -> AcqResult<ScanState> {
        self.checkpoint.check(AcquisitionStage::Motion)?;
        self.camera
            .arm(profile.trigger_count, &profile.exposures)
            .await
            .map_err(|fault| AcquisitionError::device(AcquisitionStage::Triggering, fault))?;
        self.stage
            .move_to(profile.start)
            .await
            .map_err(|fault| AcquisitionError::device(AcquisitionStage::Motion, fault))?;
        Ok(ScanState::Arming)
    }

    /// Arming -> Accelerating
    async fn arrive_at_start(&self, profile: &ScanProfile) -> AcqResult<ScanState> {
        let policy = WaitPolicy::new(self.motion.motion_timeout(), self.motion.poll_interval());
        let ready = poll_until(policy, self.checkpoint, AcquisitionStage::Motion, || {
            self.at_start(profile.start)
        })
        .await?;
        if ready.is_none() {
            return Err(AcquisitionError::MotionTimeout {
                condition: format!("stage at start {} with camera armed", profile.start),
                timeout: policy.timeout,
            });
        }

        self.checkpoint.check(AcquisitionStage::Motion)?;
        self.stage
            .set_velocity(profile.cruise_velocity)
            .await
            .map_err(|fault| AcquisitionError::device(AcquisitionStage::Motion, fault))?;
        self.stage
            .move_to(profile.end)
            .await
            .map_err(|fault| AcquisitionError::device(AcquisitionStage::Motion, fault))?;
        Ok(ScanState::Accelerating)
    }

    async fn at_start(&self, start: f64) -> AcqResult<Option<()>> {
        let axis = self
            .stage
            .read_state()
            .await
            .and_then(|state| state.check_fault().map(|()| state))
            .map_err(|fault| AcquisitionError::device(AcquisitionStage::Motion, fault))?;
        let camera = self
            .camera
            .status()
            .await
            .map_err(|fault| AcquisitionError::device(AcquisitionStage::Triggering, fault))?;
        if let Some(reason) = camera.fault {
            return Err(AcquisitionError::device(
                AcquisitionStage::Triggering,
                DeviceFault::new(self.camera.id(), reason),
            ));
        }

        let arrived = (axis.position - start).abs() <= self.motion.arrival_tolerance;
        debug!(
            position = axis.position,
            target = start,
            camera_armed = camera.armed,
            "Waiting for scan start"
        );
        Ok((arrived && camera.armed).then_some(()))
    }

    /// Accelerating -> Triggering
    async fn reach_cruise(&self, profile: &ScanProfile) -> AcqResult<ScanState> {
        let policy = WaitPolicy::new(self.motion.velocity_timeout(), self.motion.poll_interval());
        let cruise = profile.cruise_velocity;
        let tolerance = self.motion.velocity_tolerance;

        let at_speed = poll_until(policy, self.checkpoint, AcquisitionStage::Motion, || async move {
            let axis = self
                .stage
                .read_state()
                .await
                .and_then(|state| state.check_fault().map(|()| state))
                .map_err(|fault| AcquisitionError::device(AcquisitionStage::Motion, fault))?;
            debug!(velocity = axis.velocity, cruise, "Waiting for cruise velocity");
            Ok(((axis.velocity.abs() - cruise).abs() <= tolerance).then_some(()))
        })
        .await?;

        match at_speed {
            Some(()) => Ok(ScanState::Triggering),
            None => Err(AcquisitionError::MotionTimeout {
                condition: format!("cruise velocity {}", cruise),
                timeout: policy.timeout,
            }),
        }
    }

    /// Triggering -> Decelerating
    async fn capture(
        &self,
        profile: &ScanProfile,
        assembler: &mut BundleAssembler,
        frames_received: &mut u64,
    ) -> AcqResult<ScanState> {
        let timeout = self.triggering.frame_timeout();
        let check_interval = u64::from(self.triggering.stage_check_interval.max(1));
        let expected_total = u64::from(profile.trigger_count);
        let mut previous: Option<u64> = None;

        while *frames_received < expected_total {
            self.checkpoint.check(AcquisitionStage::Triggering)?;

            let frame = self.camera.next_frame(timeout).await.map_err(|err| match err {
                FrameError::Timeout(timeout) => AcquisitionError::FrameTimeout {
                    timeout,
                    received: *frames_received,
                },
                FrameError::Fault(fault) => {
                    AcquisitionError::device(AcquisitionStage::Triggering, fault)
                }
            })?;

            // A repeat of the previous index hits an already-filled row.
            if previous != Some(frame.sequence) && frame.sequence != *frames_received {
                return Err(AcquisitionError::FrameSequenceError {
                    expected: *frames_received,
                    received: frame.sequence,
                });
            }
            assembler.insert(&frame)?;
            previous = Some(frame.sequence);
            *frames_received += 1;

            if *frames_received % check_interval == 0 {
                self.stage
                    .read_state()
                    .await
                    .and_then(|state| state.check_fault())
                    .map_err(|fault| {
                        AcquisitionError::device(AcquisitionStage::Triggering, fault)
                    })?;
            }
        }

        debug!(frames = *frames_received, "All triggers captured");
        Ok(ScanState::Decelerating)
    }

    /// Decelerating -> Complete
    async fn finish_motion(&self, profile: &ScanProfile) -> AcqResult<ScanState> {
        let policy = WaitPolicy::new(self.motion.motion_timeout(), self.motion.poll_interval());
        let end = profile.end;

        let done = poll_until(policy, self.checkpoint, AcquisitionStage::Motion, || async move {
            let axis = self
                .stage
                .read_state()
                .await
                .and_then(|state| state.check_fault().map(|()| state))
                .map_err(|fault| AcquisitionError::device(AcquisitionStage::Motion, fault))?;
            let camera = self
                .camera
                .status()
                .await
                .map_err(|fault| AcquisitionError::device(AcquisitionStage::Triggering, fault))?;
            if let Some(reason) = camera.fault {
                return Err(AcquisitionError::device(
                    AcquisitionStage::Triggering,
                    DeviceFault::new(self.camera.id(), reason),
                ));
            }

            let arrived = (axis.position - end).abs() <= self.motion.arrival_tolerance;
            let drained = camera.capture_complete && camera.pending_frames == 0;
            debug!(position = axis.position, target = end, drained, "Waiting for scan end");
            Ok((arrived && drained).then_some(()))
        })
        .await?;

        match done {
            Some(()) => Ok(ScanState::Complete),
            None => Err(AcquisitionError::MotionTimeout {
                condition: format!("stage at end {} with capture complete", end),
                timeout: policy.timeout,
            }),
        }
    }

    /// Stop the stage and disarm the camera after `cause`.
    async fn abort(&mut self, cause: &AcquisitionError) {
        warn!(state = %self.state, error = %cause, "Aborting scan");
        self.transition(ScanState::Aborting);

        if let Err(fault) = self.stage.stop().await {
            warn!(device = %fault.device, reason = %fault.reason, "Cleanup: stage stop failed");
        }
        if let Err(fault) = self.camera.disarm().await {
            warn!(device = %fault.device, reason = %fault.reason, "Cleanup: camera disarm failed");
        }
    }
}
