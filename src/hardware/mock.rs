//! Mock Hardware Implementations
//!
//! Provides scripted device proxies for exercising the acquisition engine
//! without physical hardware. Every command is appended to a shared
//! [`CallLog`] so tests can assert on ordering (e.g. "no move was issued
//! before the light path settled").
//!
//! # Available Mocks
//!
//! - `MockStage` - Scan axis that arrives after a fixed number of state reads
//! - `MockCamera` - Line camera that emits one scripted frame per trigger
//! - `MockActuator` - Laser / filter wheel / objective that settles after a
//!   fixed number of status reads
//!
//! Mocks never sleep except `MockCamera::next_frame` on an exhausted script,
//! which waits out the requested timeout like a real frame grabber.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::sleep;

use crate::error::DeviceFault;
use crate::hardware::capabilities::{
    ActuatorStatus, AxisLimits, AxisState, CameraGeometry, CameraStatus, ExposureSetting,
    FilterWheel, FrameError, FrameRecord, Laser, LineCamera, ObjectiveStage, ScanAxis,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// CallLog - shared record of device commands
// =============================================================================

/// A command issued to a mock device
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceCommand {
    /// Axis or objective absolute move
    MoveTo(f64),
    /// Axis velocity change
    SetVelocity(f64),
    /// Axis stop
    Stop,
    /// Camera arm
    Arm {
        /// Armed trigger count
        trigger_count: u32,
    },
    /// Camera disarm
    Disarm,
    /// Laser power change
    SetPower(f64),
    /// Filter wheel position change
    SetPosition(f64),
}

/// One logged command
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceCall {
    /// Device the command was sent to
    pub device: String,
    /// The command
    pub command: DeviceCommand,
}

/// Shared, ordered log of commands sent to mock devices
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    calls: Arc<Mutex<Vec<DeviceCall>>>,
}

impl CallLog {
    /// Create an empty log
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, device: &str, command: DeviceCommand) {
        lock(&self.calls).push(DeviceCall {
            device: device.to_string(),
            command,
        });
    }

    /// All calls in issue order
    pub fn calls(&self) -> Vec<DeviceCall> {
        lock(&self.calls).clone()
    }

    /// Commands sent to `device`, in order
    pub fn calls_for(&self, device: &str) -> Vec<DeviceCommand> {
        lock(&self.calls)
            .iter()
            .filter(|call| call.device == device)
            .map(|call| call.command.clone())
            .collect()
    }

    /// Number of `MoveTo` commands sent to `device`
    pub fn move_count(&self, device: &str) -> usize {
        self.calls_for(device)
            .iter()
            .filter(|command| matches!(command, DeviceCommand::MoveTo(_)))
            .count()
    }

    /// Number of calls matching `command` sent to `device`
    pub fn count(&self, device: &str, command: &DeviceCommand) -> usize {
        self.calls_for(device)
            .iter()
            .filter(|logged| *logged == command)
            .count()
    }

    /// Index of the first call to `device` satisfying `predicate`
    pub fn position(
        &self,
        device: &str,
        predicate: impl Fn(&DeviceCommand) -> bool,
    ) -> Option<usize> {
        lock(&self.calls)
            .iter()
            .position(|call| call.device == device && predicate(&call.command))
    }

    /// True if nothing has been logged
    pub fn is_empty(&self) -> bool {
        lock(&self.calls).is_empty()
    }
}

// =============================================================================
// MockStage - Simulated scan axis
// =============================================================================

#[derive(Debug)]
struct StageSim {
    position: f64,
    velocity: f64,
    target: Option<f64>,
    reads_remaining: u32,
    reads: u32,
    fault_after_reads: Option<(u32, String)>,
    stop_fault: Option<String>,
}

/// Mock scan axis.
///
/// A move completes after `travel_reads` calls to `read_state`; until then the
/// axis reports the commanded velocity, which lets the synchronizer observe
/// "at speed" right after the scan move starts.
///
/// # Example
///
/// ```rust,ignore
/// let log = CallLog::new();
/// let stage = MockStage::new("y", limits, log.clone());
/// stage.move_to(10.0).await?;
/// ```
pub struct MockStage {
    id: String,
    limits: AxisLimits,
    travel_reads: u32,
    log: CallLog,
    sim: Mutex<StageSim>,
}

impl MockStage {
    /// Create an axis at position 0.0 that arrives after three state reads
    pub fn new(id: impl Into<String>, limits: AxisLimits, log: CallLog) -> Self {
        Self {
            id: id.into(),
            limits,
            travel_reads: 3,
            log,
            sim: Mutex::new(StageSim {
                position: 0.0,
                velocity: limits.max_velocity,
                target: None,
                reads_remaining: 0,
                reads: 0,
                fault_after_reads: None,
                stop_fault: None,
            }),
        }
    }

    /// Number of state reads a move takes (minimum 2)
    pub fn with_travel_reads(mut self, reads: u32) -> Self {
        self.travel_reads = reads.max(2);
        self
    }

    /// Report a fault on every state read after the first `reads`
    pub fn fault_after_reads(self, reads: u32, reason: impl Into<String>) -> Self {
        lock(&self.sim).fault_after_reads = Some((reads, reason.into()));
        self
    }

    /// Make `stop` fail with a fault
    pub fn stop_fails(self, reason: impl Into<String>) -> Self {
        lock(&self.sim).stop_fault = Some(reason.into());
        self
    }

    /// Current simulated position
    pub fn position(&self) -> f64 {
        lock(&self.sim).position
    }
}

#[async_trait]
impl ScanAxis for MockStage {
    fn id(&self) -> &str {
        &self.id
    }

    fn limits(&self) -> AxisLimits {
        self.limits
    }

    async fn move_to(&self, position: f64) -> Result<(), DeviceFault> {
        self.log.record(&self.id, DeviceCommand::MoveTo(position));
        if !self.limits.contains(position) {
            return Err(DeviceFault::new(
                &self.id,
                format!("target {} outside travel", position),
            ));
        }
        let mut sim = lock(&self.sim);
        sim.target = Some(position);
        sim.reads_remaining = self.travel_reads;
        Ok(())
    }

    async fn read_state(&self) -> Result<AxisState, DeviceFault> {
        let mut sim = lock(&self.sim);
        sim.reads += 1;

        let fault = match &sim.fault_after_reads {
            Some((after, reason)) if sim.reads > *after => Some(reason.clone()),
            _ => None,
        };

        let mut velocity = 0.0;
        if let Some(target) = sim.target {
            sim.reads_remaining = sim.reads_remaining.saturating_sub(1);
            if sim.reads_remaining == 0 {
                sim.position = target;
                sim.target = None;
            } else {
                velocity = sim.velocity;
            }
        }

        Ok(AxisState {
            axis: self.id.clone(),
            position: sim.position,
            velocity,
            fault,
        })
    }

    async fn set_velocity(&self, velocity: f64) -> Result<(), DeviceFault> {
        self.log.record(&self.id, DeviceCommand::SetVelocity(velocity));
        if velocity <= 0.0 || velocity > self.limits.max_velocity {
            return Err(DeviceFault::new(
                &self.id,
                format!("velocity {} outside (0, {}]", velocity, self.limits.max_velocity),
            ));
        }
        lock(&self.sim).velocity = velocity;
        Ok(())
    }

    async fn stop(&self) -> Result<(), DeviceFault> {
        self.log.record(&self.id, DeviceCommand::Stop);
        let mut sim = lock(&self.sim);
        sim.target = None;
        match &sim.stop_fault {
            Some(reason) => Err(DeviceFault::new(&self.id, reason.clone())),
            None => Ok(()),
        }
    }
}

// =============================================================================
// MockCamera - Simulated line-scan camera
// =============================================================================

#[derive(Debug, Clone)]
enum ScriptedEvent {
    Frame(FrameRecord),
    Timeout,
    Fault(String),
}

/// Deviations from a clean frame stream, applied at every arm
#[derive(Debug, Clone, Default)]
struct FrameScript {
    fault_at: Option<(u64, String)>,
    timeout_at: Option<u64>,
    duplicate_at: Option<u64>,
    drop_at: Option<u64>,
    disarm_fault: Option<String>,
}

#[derive(Debug, Default)]
struct CameraSim {
    armed: bool,
    queue: VecDeque<ScriptedEvent>,
    delivered: u64,
    fault: Option<String>,
}

/// Mock line-scan camera.
///
/// Arming queues one frame per trigger. With several exposure settings the
/// triggers are split into equal consecutive passes, each tagged with its
/// setting's channel. Each line holds a deterministic ramp derived from the
/// sequence index (see [`MockCamera::sample`]).
pub struct MockCamera {
    id: String,
    geometry: CameraGeometry,
    log: CallLog,
    script: Mutex<FrameScript>,
    sim: Mutex<CameraSim>,
}

impl MockCamera {
    /// Create an unarmed camera
    pub fn new(id: impl Into<String>, geometry: CameraGeometry, log: CallLog) -> Self {
        Self {
            id: id.into(),
            geometry,
            log,
            script: Mutex::new(FrameScript::default()),
            sim: Mutex::new(CameraSim::default()),
        }
    }

    /// Report a hardware fault instead of frame `sequence`
    pub fn fault_at_frame(self, sequence: u64, reason: impl Into<String>) -> Self {
        lock(&self.script).fault_at = Some((sequence, reason.into()));
        self
    }

    /// Time out instead of delivering frame `sequence`
    pub fn timeout_at_frame(self, sequence: u64) -> Self {
        lock(&self.script).timeout_at = Some(sequence);
        self
    }

    /// Deliver frame `sequence` twice in a row
    pub fn duplicate_frame(self, sequence: u64) -> Self {
        lock(&self.script).duplicate_at = Some(sequence);
        self
    }

    /// Never deliver frame `sequence`
    pub fn drop_frame(self, sequence: u64) -> Self {
        lock(&self.script).drop_at = Some(sequence);
        self
    }

    /// Make `disarm` fail with a fault
    pub fn disarm_fails(self, reason: impl Into<String>) -> Self {
        lock(&self.script).disarm_fault = Some(reason.into());
        self
    }

    /// Frames handed out since the last arm
    pub fn frames_delivered(&self) -> u64 {
        lock(&self.sim).delivered
    }

    /// True while armed
    pub fn is_armed(&self) -> bool {
        lock(&self.sim).armed
    }

    /// Sample value the mock writes at `index` of line `sequence`
    pub fn sample(sequence: u64, index: usize) -> u16 {
        ((sequence as usize * 31 + index) % 4096) as u16
    }

    fn build_queue(
        &self,
        trigger_count: u32,
        exposures: &[ExposureSetting],
    ) -> VecDeque<ScriptedEvent> {
        let script = lock(&self.script).clone();
        let passes = exposures.len() as u64;
        let per_pass = u64::from(trigger_count).div_ceil(passes).max(1);

        let mut queue = VecDeque::with_capacity(trigger_count as usize + 1);
        for sequence in 0..u64::from(trigger_count) {
            if script.drop_at == Some(sequence) {
                continue;
            }
            if script.timeout_at == Some(sequence) {
                queue.push_back(ScriptedEvent::Timeout);
                continue;
            }
            if let Some((at, reason)) = &script.fault_at {
                if *at == sequence {
                    queue.push_back(ScriptedEvent::Fault(reason.clone()));
                    continue;
                }
            }

            let pass = (sequence / per_pass).min(passes - 1) as usize;
            let frame = FrameRecord {
                sequence,
                timestamp: Utc::now(),
                channel: exposures[pass].channel.clone(),
                line: (0..self.geometry.line_width)
                    .map(|index| Self::sample(sequence, index))
                    .collect(),
            };
            if script.duplicate_at == Some(sequence) {
                queue.push_back(ScriptedEvent::Frame(frame.clone()));
            }
            queue.push_back(ScriptedEvent::Frame(frame));
        }
        queue
    }
}

#[async_trait]
impl LineCamera for MockCamera {
    fn id(&self) -> &str {
        &self.id
    }

    fn geometry(&self) -> CameraGeometry {
        self.geometry
    }

    async fn arm(
        &self,
        trigger_count: u32,
        exposures: &[ExposureSetting],
    ) -> Result<(), DeviceFault> {
        self.log.record(&self.id, DeviceCommand::Arm { trigger_count });
        if exposures.is_empty() {
            return Err(DeviceFault::new(&self.id, "arm without exposure settings"));
        }
        let queue = self.build_queue(trigger_count, exposures);
        let mut sim = lock(&self.sim);
        sim.armed = true;
        sim.queue = queue;
        sim.delivered = 0;
        sim.fault = None;
        Ok(())
    }

    async fn next_frame(&self, timeout: Duration) -> Result<FrameRecord, FrameError> {
        let event = {
            let mut sim = lock(&self.sim);
            if !sim.armed {
                return Err(DeviceFault::new(&self.id, "next_frame while not armed").into());
            }
            sim.queue.pop_front()
        };

        match event {
            Some(ScriptedEvent::Frame(frame)) => {
                lock(&self.sim).delivered += 1;
                Ok(frame)
            }
            Some(ScriptedEvent::Timeout) => Err(FrameError::Timeout(timeout)),
            Some(ScriptedEvent::Fault(reason)) => {
                lock(&self.sim).fault = Some(reason.clone());
                Err(DeviceFault::new(&self.id, reason).into())
            }
            None => {
                sleep(timeout).await;
                Err(FrameError::Timeout(timeout))
            }
        }
    }

    async fn status(&self) -> Result<CameraStatus, DeviceFault> {
        let sim = lock(&self.sim);
        let pending_frames = sim
            .queue
            .iter()
            .filter(|event| matches!(event, ScriptedEvent::Frame(_)))
            .count();
        Ok(CameraStatus {
            armed: sim.armed,
            capture_complete: sim.armed && sim.queue.is_empty(),
            pending_frames,
            fault: sim.fault.clone(),
        })
    }

    async fn disarm(&self) -> Result<(), DeviceFault> {
        self.log.record(&self.id, DeviceCommand::Disarm);
        {
            let mut sim = lock(&self.sim);
            sim.armed = false;
            sim.queue.clear();
        }
        match lock(&self.script).disarm_fault.clone() {
            Some(reason) => Err(DeviceFault::new(&self.id, reason)),
            None => Ok(()),
        }
    }
}

// =============================================================================
// MockActuator - Simulated laser / filter wheel / objective
// =============================================================================

#[derive(Debug)]
struct ActuatorSim {
    reading: f64,
    target: f64,
    polls_remaining: u32,
    stuck: bool,
    status_fault: Option<String>,
    command_fault: Option<(u32, String)>,
}

/// Mock settling actuator usable as a laser, filter wheel or objective.
///
/// After a command with a new target the device stays unsettled for
/// `settle_polls` status reads; re-commanding the current value settles
/// immediately.
pub struct MockActuator {
    id: String,
    settle_polls: u32,
    log: CallLog,
    sim: Mutex<ActuatorSim>,
}

impl MockActuator {
    /// Create an actuator reading 0.0 that settles immediately
    pub fn new(id: impl Into<String>, log: CallLog) -> Self {
        Self {
            id: id.into(),
            settle_polls: 0,
            log,
            sim: Mutex::new(ActuatorSim {
                reading: 0.0,
                target: 0.0,
                polls_remaining: 0,
                stuck: false,
                status_fault: None,
                command_fault: None,
            }),
        }
    }

    /// Status reads needed to settle after a target change
    pub fn with_settle_polls(mut self, polls: u32) -> Self {
        self.settle_polls = polls;
        self
    }

    /// Current reading
    pub fn reading(&self) -> f64 {
        lock(&self.sim).reading
    }

    /// Set the reading (and target) as if already commanded there
    pub fn force_reading(&self, value: f64) {
        let mut sim = lock(&self.sim);
        sim.reading = value;
        sim.target = value;
        sim.polls_remaining = 0;
    }

    /// Never reach any new target
    pub fn stick(&self) {
        lock(&self.sim).stuck = true;
    }

    /// Report a fault on every status read
    pub fn fault_on_status(&self, reason: impl Into<String>) {
        lock(&self.sim).status_fault = Some(reason.into());
    }

    /// Accept `commands` more commands, then reject every later one
    pub fn fault_after_commands(&self, commands: u32, reason: impl Into<String>) {
        lock(&self.sim).command_fault = Some((commands, reason.into()));
    }

    fn command(&self, command: DeviceCommand, value: f64) -> Result<(), DeviceFault> {
        self.log.record(&self.id, command);
        let mut sim = lock(&self.sim);
        if let Some((remaining, reason)) = &mut sim.command_fault {
            if *remaining == 0 {
                return Err(DeviceFault::new(&self.id, reason.clone()));
            }
            *remaining -= 1;
        }
        sim.target = value;
        sim.polls_remaining = if (value - sim.reading).abs() < f64::EPSILON {
            0
        } else {
            self.settle_polls
        };
        Ok(())
    }

    fn status(&self) -> ActuatorStatus {
        let mut sim = lock(&self.sim);
        if let Some(reason) = &sim.status_fault {
            return ActuatorStatus {
                reading: sim.reading,
                settled: false,
                fault: Some(reason.clone()),
            };
        }
        let at_target = (sim.reading - sim.target).abs() < f64::EPSILON;
        if sim.stuck && !at_target {
            return ActuatorStatus {
                reading: sim.reading,
                settled: false,
                fault: None,
            };
        }
        sim.polls_remaining = sim.polls_remaining.saturating_sub(1);
        if sim.polls_remaining == 0 {
            sim.reading = sim.target;
        }
        ActuatorStatus {
            reading: sim.reading,
            settled: sim.polls_remaining == 0,
            fault: None,
        }
    }
}

#[async_trait]
impl Laser for MockActuator {
    fn id(&self) -> &str {
        &self.id
    }

    async fn set_power(&self, power: f64) -> Result<(), DeviceFault> {
        self.command(DeviceCommand::SetPower(power), power)
    }

    async fn get_status(&self) -> Result<ActuatorStatus, DeviceFault> {
        Ok(self.status())
    }
}

#[async_trait]
impl FilterWheel for MockActuator {
    fn id(&self) -> &str {
        &self.id
    }

    async fn set_position(&self, position: f64) -> Result<(), DeviceFault> {
        self.command(DeviceCommand::SetPosition(position), position)
    }

    async fn get_status(&self) -> Result<ActuatorStatus, DeviceFault> {
        Ok(self.status())
    }
}

#[async_trait]
impl ObjectiveStage for MockActuator {
    fn id(&self) -> &str {
        &self.id
    }

    async fn move_to(&self, position: f64) -> Result<(), DeviceFault> {
        self.command(DeviceCommand::MoveTo(position), position)
    }

    async fn get_status(&self) -> Result<ActuatorStatus, DeviceFault> {
        Ok(self.status())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
