//! Acquisition controller: the single entry point for imaging requests.
//!
//! Holds the instrument's exclusive acquisition lock for the whole request and
//! runs validate -> plan -> settle -> scan -> assemble, propagating the first
//! error. Every channel group is planned before any device is touched, so an
//! infeasible request never moves hardware. With more than one channel group,
//! every group's light path is settled once before the first scan, so an
//! unreachable channel fails the request with the stage untouched.
//!
//! Once a scan has run, a later failure outside the scan itself still sends
//! best-effort `stop` and `disarm` before the error is returned.

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::assembler::{BundleAssembler, ImageBundle};
use super::illumination::{IlluminationCoordinator, LightPath};
use super::planner::MotionPlanner;
use super::request::{AcquisitionRequest, ChannelId};
use super::synchronizer::ScanSynchronizer;
use super::wait::{AbortHandle, Checkpoint};
use crate::config::{ChannelSchedule, ScanConfig};
use crate::error::{AcqResult, AcquisitionError};
use crate::hardware::capabilities::{LineCamera, ScanAxis};

/// Devices the controller drives
#[derive(Clone)]
pub struct Instrument {
    /// Scan axis
    pub stage: Arc<dyn ScanAxis>,
    /// Line-scan camera triggered by the scan axis
    pub camera: Arc<dyn LineCamera>,
    /// Lasers, filter wheels and objective
    pub light_path: LightPath,
}

/// Objective focus positions for a z-stack
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ZStack {
    /// Focus position the stack is centred on
    pub center: f64,
    /// Distance between planes
    pub step: f64,
    /// Number of planes
    pub planes: u32,
}

impl ZStack {
    /// Focus position of every plane, lowest first.
    pub fn positions(&self) -> Vec<f64> {
        let first = self.center - self.step * f64::from(self.planes.saturating_sub(1)) / 2.0;
        (0..self.planes)
            .map(|plane| first + self.step * f64::from(plane))
            .collect()
    }

    fn validate(&self) -> AcqResult<()> {
        if self.planes == 0 {
            return Err(AcquisitionError::InvalidRequest(
                "z-stack needs at least one plane".to_string(),
            ));
        }
        if !self.center.is_finite() || !self.step.is_finite() || self.step <= 0.0 {
            return Err(AcquisitionError::InvalidRequest(format!(
                "z-stack centre {} / step {} must be finite with step > 0",
                self.center, self.step
            )));
        }
        Ok(())
    }
}

/// Bundles captured at one focus position
#[derive(Debug, Clone, PartialEq)]
pub struct ZPlane {
    /// Objective focus position
    pub focus: f64,
    /// One bundle per channel
    pub bundles: BTreeMap<ChannelId, ImageBundle>,
}

/// Serializes acquisitions on one instrument.
pub struct AcquisitionController {
    instrument: Instrument,
    config: ScanConfig,
    lock: Mutex<()>,
}

impl AcquisitionController {
    /// Create a controller for `instrument` using `config`.
    pub fn new(instrument: Instrument, config: ScanConfig) -> Self {
        Self {
            instrument,
            config,
            lock: Mutex::new(()),
        }
    }

    /// Active configuration
    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    /// Acquire one bundle per requested channel, waiting for any acquisition
    /// already in progress.
    pub async fn acquire(
        &self,
        request: AcquisitionRequest,
    ) -> AcqResult<BTreeMap<ChannelId, ImageBundle>> {
        self.acquire_abortable(request, AbortHandle::new()).await
    }

    /// Like [`acquire`](Self::acquire) but fails with `Busy` instead of
    /// waiting for the lock.
    pub async fn try_acquire(
        &self,
        request: AcquisitionRequest,
    ) -> AcqResult<BTreeMap<ChannelId, ImageBundle>> {
        let _guard = self.lock.try_lock().map_err(|_| AcquisitionError::Busy)?;
        let checkpoint = Checkpoint::new(AbortHandle::new(), request.budget);
        self.run(&request, &checkpoint).await
    }

    /// Like [`acquire`](Self::acquire); triggering `abort` stops the request
    /// at its next suspension point with `Aborted`, naming the stage it
    /// interrupted.
    pub async fn acquire_abortable(
        &self,
        request: AcquisitionRequest,
        abort: AbortHandle,
    ) -> AcqResult<BTreeMap<ChannelId, ImageBundle>> {
        let _guard = self.lock.lock().await;
        let checkpoint = Checkpoint::new(abort, request.budget);
        self.run(&request, &checkpoint).await
    }

    /// Image `request.region` at every focus position of `stack`, holding the
    /// lock for the whole stack. The request's budget covers all planes.
    pub async fn acquire_z_stack(
        &self,
        request: AcquisitionRequest,
        stack: ZStack,
    ) -> AcqResult<Vec<ZPlane>> {
        stack.validate()?;
        let _guard = self.lock.lock().await;
        let checkpoint = Checkpoint::new(AbortHandle::new(), request.budget);

        let positions = stack.positions();
        info!(
            planes = positions.len(),
            center = stack.center,
            step = stack.step,
            "Starting z-stack"
        );

        let mut planes = Vec::with_capacity(positions.len());
        for focus in positions {
            let plane_request = request.clone().with_focus(focus);
            let bundles = self.run(&plane_request, &checkpoint).await?;
            planes.push(ZPlane { focus, bundles });
        }
        Ok(planes)
    }

    async fn run(
        &self,
        request: &AcquisitionRequest,
        checkpoint: &Checkpoint,
    ) -> AcqResult<BTreeMap<ChannelId, ImageBundle>> {
        let acquisition_id = Uuid::new_v4();
        info!(
            %acquisition_id,
            channels = ?request.channels,
            frame_count = request.frame_count,
            bundle_height = request.bundle_height,
            "Acquisition requested"
        );

        let result = self.execute(acquisition_id, request, checkpoint).await;
        match &result {
            Ok(bundles) => info!(%acquisition_id, bundles = bundles.len(), "Acquisition complete"),
            Err(err) => warn!(
                %acquisition_id,
                stage = %err.stage(),
                error = %err,
                "Acquisition failed"
            ),
        }
        result
    }

    async fn execute(
        &self,
        acquisition_id: Uuid,
        request: &AcquisitionRequest,
        checkpoint: &Checkpoint,
    ) -> AcqResult<BTreeMap<ChannelId, ImageBundle>> {
        let stage = self.instrument.stage.as_ref();
        let camera = self.instrument.camera.as_ref();
        let limits = stage.limits();
        let geometry = camera.geometry();

        request.validate(&limits, &self.config)?;

        let groups: Vec<Vec<ChannelId>> = match self.config.triggering.channel_schedule {
            ChannelSchedule::Interleaved => vec![request.channels.clone()],
            ChannelSchedule::Sequential => request
                .channels
                .iter()
                .map(|channel| vec![channel.clone()])
                .collect(),
        };

        let planner = MotionPlanner::new(geometry, limits, &self.config.motion);
        let profiles = groups
            .iter()
            .map(|group| planner.plan(request, group, &self.config))
            .collect::<AcqResult<Vec<_>>>()?;

        let coordinator = IlluminationCoordinator::new(&self.instrument.light_path, &self.config);
        if groups.len() > 1 {
            debug!(groups = groups.len(), "Pre-flight settle of every channel group");
            for group in &groups {
                coordinator.settle(group, request.focus, checkpoint).await?;
            }
        }

        let mut bundles = BTreeMap::new();
        for (index, (group, profile)) in groups.iter().zip(&profiles).enumerate() {
            let illumination = match coordinator.settle(group, request.focus, checkpoint).await {
                Ok(illumination) => illumination,
                Err(err) => {
                    if index > 0 {
                        self.release_devices().await;
                    }
                    return Err(err);
                }
            };

            let mut assembler = BundleAssembler::new(
                group,
                geometry.line_width,
                request.bundle_height as usize,
                request.indexing,
            );
            let mut synchronizer = ScanSynchronizer::new(stage, camera, &self.config, checkpoint);
            match synchronizer.run(profile, &illumination, &mut assembler).await {
                Ok(report) => debug!(
                    channels = ?group,
                    frames = report.frames_received,
                    "Scan finished"
                ),
                Err(err) => {
                    assembler.discard();
                    return Err(err);
                }
            }
            match assembler.finish(acquisition_id) {
                Ok(group_bundles) => bundles.extend(group_bundles),
                Err(err) => {
                    self.release_devices().await;
                    return Err(err);
                }
            }
        }
        Ok(bundles)
    }

    /// Best-effort stop and disarm after a failure outside a scan.
    async fn release_devices(&self) {
        if let Err(fault) = self.instrument.stage.stop().await {
            warn!(device = %fault.device, reason = %fault.reason, "Cleanup: stage stop failed");
        }
        if let Err(fault) = self.instrument.camera.disarm().await {
            warn!(device = %fault.device, reason = %fault.reason, "Cleanup: camera disarm failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_z_stack_positions_centred() {
        let stack = ZStack {
            center: 1000.0,
            step: 50.0,
            planes: 3,
        };
        assert_eq!(stack.positions(), vec![950.0, 1000.0, 1050.0]);

        let even = ZStack {
            center: 0.0,
            step: 2.0,
            planes: 4,
        };
        assert_eq!(even.positions(), vec![-3.0, -1.0, 1.0, 3.0]);
    }

    #[test]
    fn test_z_stack_validation() {
        let empty = ZStack {
            center: 0.0,
            step: 1.0,
            planes: 0,
        };
        assert!(matches!(empty.validate(), Err(AcquisitionError::InvalidRequest(_))));

        let flat = ZStack {
            center: 0.0,
            step: 0.0,
            planes: 2,
        };
        assert!(flat.validate().is_err());
    }
}
