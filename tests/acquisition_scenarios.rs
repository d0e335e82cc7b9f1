//! End-to-end acquisition scenarios against the scripted mock instrument.

use std::sync::Arc;
use std::time::Duration;

use tdi_daq::acquisition::{
    AbortHandle, AcquisitionController, AcquisitionRequest, ChannelId, Instrument, LightPath,
    RowIndexing, ScanRegion, ZStack,
};
use tdi_daq::config::ScanConfig;
use tdi_daq::error::{AcquisitionError, AcquisitionStage, DeviceFault};
use tdi_daq::hardware::mock::{CallLog, DeviceCommand, MockActuator, MockCamera, MockStage};
use tdi_daq::hardware::{AxisLimits, CameraGeometry};
use tokio_test::{assert_err, assert_ok};

const WIDTH: usize = 16;
const PITCH: f64 = 0.001;
const MAX_RATE: f64 = 1000.0;

const SEQUENTIAL: &str = r#"
[application]
name = "Scenario sequencer"
log_level = "debug"

[motion]
pre_roll = 0.5
post_roll = 0.5
arrival_tolerance = 0.001
velocity_tolerance = 0.01
motion_timeout_ms = 500
velocity_timeout_ms = 500
poll_interval_ms = 1

[triggering]
frame_timeout_ms = 100
stage_check_interval = 50
channel_schedule = "sequential"

[illumination]
power_tolerance = 0.5
filter_tolerance = 0.01
focus_tolerance = 1.0
settle_timeout_ms = 50
poll_interval_ms = 1

[[channels]]
id = "558"
laser = { device = "laser_green", power = 100.0 }
filters = [{ wheel = "ex_wheel_green", position = 0.6 }]
gain = 40

[[channels]]
id = "687"
laser = { device = "laser_red", power = 80.0 }
filters = [{ wheel = "ex_wheel_red", position = 0.9 }]
gain = 60
"#;

struct Rig {
    log: CallLog,
    stage: Arc<MockStage>,
    camera: Arc<MockCamera>,
    red: Arc<MockActuator>,
    objective: Arc<MockActuator>,
    controller: Arc<AcquisitionController>,
}

fn limits() -> AxisLimits {
    AxisLimits {
        min_position: -10.0,
        max_position: 100.0,
        max_velocity: 5.0,
    }
}

fn geometry() -> CameraGeometry {
    CameraGeometry {
        line_pitch: PITCH,
        max_trigger_rate: MAX_RATE,
        min_trigger_rate: 100.0,
        line_width: WIDTH,
        max_frames_per_arm: Some(50_000),
    }
}

fn config(schedule: &str) -> ScanConfig {
    let toml = SEQUENTIAL.replace(
        "channel_schedule = \"sequential\"",
        &format!("channel_schedule = \"{schedule}\""),
    );
    ScanConfig::from_toml_str(&toml).unwrap()
}

fn rig_with(
    schedule: &str,
    stage: impl FnOnce(MockStage) -> MockStage,
    camera: impl FnOnce(MockCamera) -> MockCamera,
) -> Rig {
    let log = CallLog::new();
    let stage = Arc::new(stage(MockStage::new("y_stage", limits(), log.clone())));
    let camera = Arc::new(camera(MockCamera::new("line_cam", geometry(), log.clone())));
    let green = Arc::new(MockActuator::new("laser_green", log.clone()).with_settle_polls(3));
    let red = Arc::new(MockActuator::new("laser_red", log.clone()).with_settle_polls(3));
    let objective = Arc::new(MockActuator::new("objective", log.clone()).with_settle_polls(2));

    let light_path = LightPath::default()
        .with_laser(green)
        .with_laser(red.clone())
        .with_filter_wheel(Arc::new(MockActuator::new("ex_wheel_green", log.clone())))
        .with_filter_wheel(Arc::new(MockActuator::new("ex_wheel_red", log.clone())))
        .with_objective(objective.clone());

    let instrument = Instrument {
        stage: stage.clone(),
        camera: camera.clone(),
        light_path,
    };
    let controller = Arc::new(AcquisitionController::new(instrument, config(schedule)));
    Rig {
        log,
        stage,
        camera,
        red,
        objective,
        controller,
    }
}

fn rig() -> Rig {
    rig_with("sequential", |stage| stage, |camera| camera)
}

fn region(frames: u32) -> ScanRegion {
    ScanRegion {
        start: 1.0,
        end: 1.0 + f64::from(frames) * PITCH,
    }
}

fn request(channels: &[&str], frames: u32) -> AcquisitionRequest {
    AcquisitionRequest::single_pass(
        region(frames),
        channels.iter().map(|c| ChannelId::from(*c)).collect(),
        frames,
    )
}

#[tokio::test]
async fn thousand_trigger_scan_yields_one_complete_bundle() {
    let rig = rig();
    let bundles = rig
        .controller
        .acquire(request(&["558"], 1000))
        .await
        .unwrap();

    assert_eq!(bundles.len(), 1);
    let bundle = &bundles[&ChannelId::from("558")];
    assert_eq!(bundle.width, WIDTH);
    assert_eq!(bundle.height, 1000);
    assert_eq!(bundle.pixels.len(), WIDTH * 1000);
    for row in [0usize, 499, 999] {
        let expected: Vec<u16> = (0..WIDTH)
            .map(|i| MockCamera::sample(row as u64, i))
            .collect();
        assert_eq!(bundle.row(row).unwrap(), expected.as_slice());
    }

    assert_eq!(rig.camera.frames_delivered(), 1000);
    assert_eq!(
        rig.log.count("line_cam", &DeviceCommand::Arm { trigger_count: 1000 }),
        1
    );
    let cruise = PITCH * MAX_RATE;
    assert!(rig
        .log
        .calls_for("y_stage")
        .contains(&DeviceCommand::SetVelocity(cruise)));
    assert!((rig.stage.position() - 2.5).abs() < 1e-9);
}

#[tokio::test]
async fn illumination_settles_before_any_motion() {
    let rig = rig();
    assert_ok!(rig.controller.acquire(request(&["558"], 100)).await);

    let calls = rig.log.calls();
    let last_power = calls
        .iter()
        .rposition(|call| matches!(call.command, DeviceCommand::SetPower(_)))
        .unwrap();
    let first_move = calls
        .iter()
        .position(|call| call.device == "y_stage")
        .unwrap();
    assert!(last_power < first_move);
}

#[tokio::test]
async fn camera_fault_mid_scan_stops_and_disarms() {
    let rig = rig_with("sequential", |s| s, |c| c.fault_at_frame(500, "frame grabber overrun"));

    let err = rig
        .controller
        .acquire(request(&["558"], 1000))
        .await
        .unwrap_err();

    assert_eq!(
        err,
        AcquisitionError::device(
            AcquisitionStage::Triggering,
            DeviceFault::new("line_cam", "frame grabber overrun")
        )
    );
    assert_eq!(err.stage(), AcquisitionStage::Triggering);
    assert_eq!(rig.log.count("y_stage", &DeviceCommand::Stop), 1);
    assert_eq!(rig.log.count("line_cam", &DeviceCommand::Disarm), 1);
    assert_eq!(rig.camera.frames_delivered(), 500);
}

#[tokio::test]
async fn illumination_timeout_never_moves_the_stage() {
    let rig = rig_with("interleaved", |s| s, |c| c);
    rig.red.stick();

    let mut req = request(&["558", "687"], 200);
    req.bundle_height = 100;
    req.indexing = RowIndexing::Modulo;
    let err = rig.controller.acquire(req).await.unwrap_err();

    match &err {
        AcquisitionError::IlluminationTimeout { unsettled, .. } => {
            assert_eq!(unsettled, &vec!["laser_red".to_string()]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.is_retryable());
    assert_eq!(rig.log.move_count("y_stage"), 0);
    assert!(rig.log.calls_for("line_cam").is_empty());
}

#[tokio::test]
async fn sequential_illumination_timeout_never_moves_the_stage() {
    let rig = rig();
    rig.red.stick();

    let err = rig
        .controller
        .acquire(request(&["558", "687"], 100))
        .await
        .unwrap_err();

    match &err {
        AcquisitionError::IlluminationTimeout { unsettled, .. } => {
            assert_eq!(unsettled, &vec!["laser_red".to_string()]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(rig.log.move_count("y_stage"), 0);
    assert!(rig.log.calls_for("line_cam").is_empty());
    assert!(!rig.camera.is_armed());
}

#[tokio::test]
async fn later_channel_fault_stops_and_disarms() {
    let rig = rig();
    // Accepts the pre-flight command, rejects the one before its own scan.
    rig.red.fault_after_commands(1, "interlock open");

    let err = rig
        .controller
        .acquire(request(&["558", "687"], 100))
        .await
        .unwrap_err();

    assert_eq!(
        err,
        AcquisitionError::device(
            AcquisitionStage::Illumination,
            DeviceFault::new("laser_red", "interlock open")
        )
    );
    assert_eq!(
        rig.log.count("line_cam", &DeviceCommand::Arm { trigger_count: 100 }),
        1
    );
    assert_eq!(rig.log.count("y_stage", &DeviceCommand::Stop), 1);
    assert_eq!(rig.log.count("line_cam", &DeviceCommand::Disarm), 1);
    assert!(!rig.camera.is_armed());
}

#[tokio::test]
async fn repeated_sequence_index_is_a_duplicate() {
    let rig = rig_with("sequential", |s| s, |c| c.duplicate_frame(7));

    let err = rig
        .controller
        .acquire(request(&["558"], 100))
        .await
        .unwrap_err();

    assert_eq!(
        err,
        AcquisitionError::DuplicateFrame {
            channel: "558".into(),
            sequence: 7,
            row: 7,
        }
    );
    assert_eq!(rig.log.count("line_cam", &DeviceCommand::Disarm), 1);
}

#[tokio::test]
async fn missing_frame_is_a_sequence_error() {
    let rig = rig_with("sequential", |s| s, |c| c.drop_frame(42));
    let err = assert_err!(rig.controller.acquire(request(&["558"], 100)).await);
    assert_eq!(
        err,
        AcquisitionError::FrameSequenceError {
            expected: 42,
            received: 43,
        }
    );
}

#[tokio::test]
async fn sequential_schedule_scans_each_channel() {
    let rig = rig();
    let bundles = rig
        .controller
        .acquire(request(&["558", "687"], 100))
        .await
        .unwrap();

    assert_eq!(
        bundles.keys().cloned().collect::<Vec<_>>(),
        vec![ChannelId::from("558"), ChannelId::from("687")]
    );
    assert_eq!(
        rig.log.count("line_cam", &DeviceCommand::Arm { trigger_count: 100 }),
        2
    );
    let ids: Vec<_> = bundles.values().map(|b| b.acquisition_id).collect();
    assert_eq!(ids[0], ids[1]);
}

#[tokio::test]
async fn interleaved_schedule_captures_all_channels_in_one_scan() {
    let rig = rig_with("interleaved", |s| s, |c| c);

    let mut req = request(&["558", "687"], 200);
    req.bundle_height = 100;
    req.indexing = RowIndexing::Modulo;
    let bundles = rig.controller.acquire(req).await.unwrap();

    assert_eq!(
        rig.log.count("line_cam", &DeviceCommand::Arm { trigger_count: 200 }),
        1
    );
    let red = &bundles[&ChannelId::from("687")];
    assert_eq!(red.height, 100);
    let expected: Vec<u16> = (0..WIDTH).map(|i| MockCamera::sample(100, i)).collect();
    assert_eq!(red.row(0).unwrap(), expected.as_slice());
}

#[tokio::test]
async fn infeasible_profile_issues_no_device_commands() {
    let rig = rig();
    let mut req = request(&["558"], 1000);
    req.region.end = 1.1;
    req.region.start = 1.0;

    let err = rig.controller.acquire(req).await.unwrap_err();
    assert!(matches!(err, AcquisitionError::ProfileInfeasible(_)));
    assert_eq!(err.stage(), AcquisitionStage::Planning);
    assert!(rig.log.is_empty());
}

#[tokio::test]
async fn invalid_request_issues_no_device_commands() {
    let rig = rig();
    let err = rig
        .controller
        .acquire(request(&["999"], 100))
        .await
        .unwrap_err();
    assert!(matches!(err, AcquisitionError::InvalidRequest(_)));
    assert!(rig.log.is_empty());
}

#[tokio::test]
async fn concurrent_try_acquire_is_busy() {
    let rig = rig_with("sequential", |s| s.with_travel_reads(60), |c| c);

    let controller = rig.controller.clone();
    let first = tokio::spawn(async move { controller.acquire(request(&["558"], 100)).await });
    tokio::time::sleep(Duration::from_millis(20)).await;

    let err = rig
        .controller
        .try_acquire(request(&["558"], 100))
        .await
        .unwrap_err();
    assert_eq!(err, AcquisitionError::Busy);
    assert!(err.is_retryable());

    assert_ok!(first.await.unwrap());
    assert_ok!(rig.controller.try_acquire(request(&["558"], 100)).await);
}

#[tokio::test]
async fn caller_abort_stops_and_disarms() {
    let rig = rig_with("sequential", |s| s.with_travel_reads(10_000), |c| c);
    let abort = AbortHandle::new();

    let controller = rig.controller.clone();
    let handle = abort.clone();
    let scan = tokio::spawn(async move {
        controller
            .acquire_abortable(request(&["558"], 100), handle)
            .await
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    abort.abort();

    let err = scan.await.unwrap().unwrap_err();
    assert_eq!(
        err,
        AcquisitionError::Aborted {
            stage: AcquisitionStage::Motion
        }
    );
    assert_eq!(rig.log.count("y_stage", &DeviceCommand::Stop), 1);
    assert_eq!(rig.log.count("line_cam", &DeviceCommand::Disarm), 1);
}

#[tokio::test]
async fn budget_overrun_aborts_the_scan() {
    let rig = rig_with("sequential", |s| s.with_travel_reads(10_000), |c| c);
    let req = request(&["558"], 100).with_budget(Duration::from_millis(30));

    let err = rig.controller.acquire(req).await.unwrap_err();
    assert_eq!(
        err,
        AcquisitionError::BudgetExceeded {
            budget: Duration::from_millis(30),
            stage: AcquisitionStage::Motion,
        }
    );
    assert_eq!(rig.log.count("y_stage", &DeviceCommand::Stop), 1);
}

#[tokio::test]
async fn budget_overrun_while_settling_reports_illumination() {
    let rig = rig();
    rig.red.stick();
    let req = request(&["558", "687"], 100).with_budget(Duration::from_millis(20));

    let err = rig.controller.acquire(req).await.unwrap_err();
    assert_eq!(
        err,
        AcquisitionError::BudgetExceeded {
            budget: Duration::from_millis(20),
            stage: AcquisitionStage::Illumination,
        }
    );
    assert_eq!(err.stage(), AcquisitionStage::Illumination);
    assert_eq!(rig.log.move_count("y_stage"), 0);
    assert!(rig.log.calls_for("line_cam").is_empty());
}

#[tokio::test]
async fn z_stack_visits_every_focus_plane() {
    let rig = rig();
    let stack = ZStack {
        center: 2000.0,
        step: 100.0,
        planes: 3,
    };

    let planes = rig
        .controller
        .acquire_z_stack(request(&["558"], 100), stack)
        .await
        .unwrap();

    assert_eq!(planes.len(), 3);
    assert_eq!(
        planes.iter().map(|p| p.focus).collect::<Vec<_>>(),
        vec![1900.0, 2000.0, 2100.0]
    );
    assert_eq!(
        rig.log.calls_for("objective"),
        vec![
            DeviceCommand::MoveTo(1900.0),
            DeviceCommand::MoveTo(2000.0),
            DeviceCommand::MoveTo(2100.0),
        ]
    );
    assert_eq!(rig.objective.reading(), 2100.0);
    assert!(planes
        .iter()
        .all(|plane| plane.bundles[&ChannelId::from("558")].height == 100));
}
