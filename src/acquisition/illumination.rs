//! Illumination and optics settling.
//!
//! Resolves the laser power and filter positions each requested channel
//! needs, commands every device concurrently, then polls until all of them
//! report a reading within tolerance of their target.

use futures::future::join_all;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

use super::request::ChannelId;
use super::wait::{poll_until, Checkpoint, WaitPolicy};
use crate::config::{IlluminationConfig, LaserSetting, ScanConfig};
use crate::error::{AcqResult, AcquisitionError, AcquisitionStage, DeviceFault};
use crate::hardware::capabilities::{ActuatorStatus, FilterWheel, Laser, ObjectiveStage};

/// Resolved light path for one set of channels.
///
/// Only [`IlluminationCoordinator::settle`] hands out a settled state.
#[derive(Debug, Clone, PartialEq)]
pub struct IlluminationState {
    channels: Vec<ChannelId>,
    laser_power: BTreeMap<ChannelId, LaserSetting>,
    filter_positions: BTreeMap<String, f64>,
    focus: Option<f64>,
    settled: bool,
}

impl IlluminationState {
    /// Channels this light path serves
    pub fn channels(&self) -> &[ChannelId] {
        &self.channels
    }

    /// Laser and power resolved for each channel
    pub fn laser_power(&self) -> &BTreeMap<ChannelId, LaserSetting> {
        &self.laser_power
    }

    /// Target position per filter wheel
    pub fn filter_positions(&self) -> &BTreeMap<String, f64> {
        &self.filter_positions
    }

    /// Objective focus target, if one was requested
    pub fn focus(&self) -> Option<f64> {
        self.focus
    }

    /// True once every device reported a reading within tolerance
    pub fn is_settled(&self) -> bool {
        self.settled
    }

    #[cfg(test)]
    pub(crate) fn settled_for_test(channels: Vec<ChannelId>) -> Self {
        Self {
            channels,
            laser_power: BTreeMap::new(),
            filter_positions: BTreeMap::new(),
            focus: None,
            settled: true,
        }
    }

    #[cfg(test)]
    pub(crate) fn unsettled_for_test(channels: Vec<ChannelId>) -> Self {
        Self {
            settled: false,
            ..Self::settled_for_test(channels)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ActuatorKind {
    Laser,
    FilterWheel,
    Objective,
}

/// One device and the value it must settle at
#[derive(Debug, Clone, PartialEq)]
struct Target {
    kind: ActuatorKind,
    device: String,
    value: f64,
}

/// Light path devices by id.
#[derive(Clone, Default)]
pub struct LightPath {
    /// Excitation lasers
    pub lasers: HashMap<String, Arc<dyn Laser>>,
    /// Excitation/emission filter wheels
    pub filter_wheels: HashMap<String, Arc<dyn FilterWheel>>,
    /// Focus stage
    pub objective: Option<Arc<dyn ObjectiveStage>>,
}

impl LightPath {
    /// Register a laser under its id.
    pub fn with_laser(mut self, laser: Arc<dyn Laser>) -> Self {
        self.lasers.insert(laser.id().to_string(), laser);
        self
    }

    /// Register a filter wheel under its id.
    pub fn with_filter_wheel(mut self, wheel: Arc<dyn FilterWheel>) -> Self {
        self.filter_wheels.insert(wheel.id().to_string(), wheel);
        self
    }

    /// Set the objective focus stage.
    pub fn with_objective(mut self, objective: Arc<dyn ObjectiveStage>) -> Self {
        self.objective = Some(objective);
        self
    }
}

/// Drives lasers, filter wheels and the objective to a channel set's targets.
pub struct IlluminationCoordinator<'a> {
    light_path: &'a LightPath,
    config: &'a ScanConfig,
}

impl<'a> IlluminationCoordinator<'a> {
    /// Create a coordinator over `light_path` using the channel map and
    /// tolerances in `config`.
    pub fn new(light_path: &'a LightPath, config: &'a ScanConfig) -> Self {
        Self { light_path, config }
    }

    fn settings(&self) -> &IlluminationConfig {
        &self.config.illumination
    }

    /// Resolve device targets for `channels`.
    ///
    /// Two channels that need the same device at different values cannot
    /// share one light path and are rejected.
    fn resolve(
        &self,
        channels: &[ChannelId],
        focus: Option<f64>,
    ) -> AcqResult<(IlluminationState, Vec<Target>)> {
        let mut laser_power = BTreeMap::new();
        let mut filter_positions: BTreeMap<String, f64> = BTreeMap::new();
        let mut laser_targets: BTreeMap<String, f64> = BTreeMap::new();

        for channel in channels {
            let definition = self.config.channel(channel).ok_or_else(|| {
                AcquisitionError::InvalidRequest(format!("channel {} is not configured", channel))
            })?;

            let laser = &definition.laser;
            if !self.light_path.lasers.contains_key(&laser.device) {
                return Err(AcquisitionError::InvalidRequest(format!(
                    "channel {} uses unknown laser '{}'",
                    channel, laser.device
                )));
            }
            insert_target(&mut laser_targets, &laser.device, laser.power, channel)?;
            laser_power.insert(channel.clone(), laser.clone());

            for filter in &definition.filters {
                if !self.light_path.filter_wheels.contains_key(&filter.wheel) {
                    return Err(AcquisitionError::InvalidRequest(format!(
                        "channel {} uses unknown filter wheel '{}'",
                        channel, filter.wheel
                    )));
                }
                insert_target(&mut filter_positions, &filter.wheel, filter.position, channel)?;
            }
        }

        let mut targets: Vec<Target> = laser_targets
            .iter()
            .map(|(device, value)| Target {
                kind: ActuatorKind::Laser,
                device: device.clone(),
                value: *value,
            })
            .collect();
        targets.extend(filter_positions.iter().map(|(device, value)| Target {
            kind: ActuatorKind::FilterWheel,
            device: device.clone(),
            value: *value,
        }));

        if let Some(position) = focus {
            let objective = self.light_path.objective.as_ref().ok_or_else(|| {
                AcquisitionError::InvalidRequest(
                    "focus requested but no objective stage is fitted".to_string(),
                )
            })?;
            targets.push(Target {
                kind: ActuatorKind::Objective,
                device: objective.id().to_string(),
                value: position,
            });
        }

        let state = IlluminationState {
            channels: channels.to_vec(),
            laser_power,
            filter_positions,
            focus,
            settled: false,
        };
        Ok((state, targets))
    }

    /// Apply and settle the light path for `channels` (and optional focus).
    ///
    /// # Errors
    /// - `InvalidRequest` for unknown channels/devices or conflicting targets
    /// - `DeviceFault` as soon as any device reports a fault
    /// - `IlluminationTimeout` if not all devices settle in time
    /// - `Aborted` or `BudgetExceeded` at the illumination stage
    pub async fn settle(
        &self,
        channels: &[ChannelId],
        focus: Option<f64>,
        checkpoint: &Checkpoint,
    ) -> AcqResult<IlluminationState> {
        let (mut state, targets) = self.resolve(channels, focus)?;
        checkpoint.check(AcquisitionStage::Illumination)?;

        info!(
            channels = ?channels,
            devices = targets.len(),
            "Settling light path"
        );

        let commands = targets.iter().map(|target| self.command(target));
        for result in join_all(commands).await {
            result
                .map_err(|fault| AcquisitionError::device(AcquisitionStage::Illumination, fault))?;
        }

        let policy = WaitPolicy::new(
            self.settings().settle_timeout(),
            self.settings().poll_interval(),
        );
        let unsettled = Mutex::new(Vec::new());
        let (targets, pending) = (&targets, &unsettled);
        let settled = poll_until(policy, checkpoint, AcquisitionStage::Illumination, move || {
            self.read_all(targets, pending)
        })
        .await?;

        if settled.is_none() {
            let unsettled = unsettled
                .into_inner()
                .unwrap_or_else(PoisonError::into_inner);
            warn!(unsettled = ?unsettled, "Light path did not settle");
            return Err(AcquisitionError::IlluminationTimeout {
                timeout: self.settings().settle_timeout(),
                unsettled,
            });
        }

        state.settled = true;
        info!(channels = ?channels, "Light path settled");
        Ok(state)
    }

    /// Read every device once; `Some(())` when all are within tolerance.
    /// Devices still off target are recorded in `unsettled`.
    async fn read_all(
        &self,
        targets: &[Target],
        unsettled: &Mutex<Vec<String>>,
    ) -> AcqResult<Option<()>> {
        let statuses = join_all(targets.iter().map(|target| self.status(target))).await;
        let mut pending = Vec::new();
        for (target, status) in targets.iter().zip(statuses) {
            let status = status
                .map_err(|fault| AcquisitionError::device(AcquisitionStage::Illumination, fault))?;
            if let Some(reason) = status.fault {
                return Err(AcquisitionError::device(
                    AcquisitionStage::Illumination,
                    DeviceFault::new(target.device.clone(), reason),
                ));
            }
            if !self.within_tolerance(target, &status) {
                debug!(
                    device = %target.device,
                    target = target.value,
                    reading = status.reading,
                    "Device not settled"
                );
                pending.push(target.device.clone());
            }
        }
        let settled = pending.is_empty();
        *unsettled.lock().unwrap_or_else(PoisonError::into_inner) = pending;
        Ok(settled.then_some(()))
    }

    fn within_tolerance(&self, target: &Target, status: &ActuatorStatus) -> bool {
        let tolerance = match target.kind {
            ActuatorKind::Laser => self.settings().power_tolerance,
            ActuatorKind::FilterWheel => self.settings().filter_tolerance,
            ActuatorKind::Objective => self.settings().focus_tolerance,
        };
        status.settled && (status.reading - target.value).abs() <= tolerance
    }

    async fn command(&self, target: &Target) -> Result<(), DeviceFault> {
        debug!(device = %target.device, value = target.value, "Commanding light path device");
        match target.kind {
            ActuatorKind::Laser => self.laser(&target.device)?.set_power(target.value).await,
            ActuatorKind::FilterWheel => {
                self.filter_wheel(&target.device)?
                    .set_position(target.value)
                    .await
            }
            ActuatorKind::Objective => self.objective(&target.device)?.move_to(target.value).await,
        }
    }

    async fn status(&self, target: &Target) -> Result<ActuatorStatus, DeviceFault> {
        match target.kind {
            ActuatorKind::Laser => self.laser(&target.device)?.get_status().await,
            ActuatorKind::FilterWheel => self.filter_wheel(&target.device)?.get_status().await,
            ActuatorKind::Objective => self.objective(&target.device)?.get_status().await,
        }
    }

    fn laser(&self, id: &str) -> Result<&Arc<dyn Laser>, DeviceFault> {
        self.light_path
            .lasers
            .get(id)
            .ok_or_else(|| DeviceFault::new(id, "laser not registered"))
    }

    fn filter_wheel(&self, id: &str) -> Result<&Arc<dyn FilterWheel>, DeviceFault> {
        self.light_path
            .filter_wheels
            .get(id)
            .ok_or_else(|| DeviceFault::new(id, "filter wheel not registered"))
    }

    fn objective(&self, id: &str) -> Result<&Arc<dyn ObjectiveStage>, DeviceFault> {
        self.light_path
            .objective
            .as_ref()
            .filter(|objective| objective.id() == id)
            .ok_or_else(|| DeviceFault::new(id, "objective not registered"))
    }
}

fn insert_target(
    targets: &mut BTreeMap<String, f64>,
    device: &str,
    value: f64,
    channel: &ChannelId,
) -> AcqResult<()> {
    match targets.get(device) {
        Some(existing) if *existing != value => Err(AcquisitionError::InvalidRequest(format!(
            "channel {} needs '{}' at {}, another channel needs {}",
            channel, device, value, existing
        ))),
        _ => {
            targets.insert(device.to_string(), value);
            Ok(())
        }
    }
}
