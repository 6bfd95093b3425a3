//! Calibration persistence through the assembled turret.

use std::path::Path;
use std::sync::Arc;

use apis_turret::adapters::time::ManualClock;
use apis_turret::app::ports::Clock;
use apis_turret::app::service::{Turret, TurretPorts};
use apis_turret::config::{CameraParams, TurretConfig};
use apis_turret::control::coordinate::{CoordinateMapper, PixelCoord};
use apis_turret::drivers::servo::ServoPosition;
use apis_turret::error::{CoordError, Error};
use apis_turret::fsm::TargetState;

use crate::mock_hw::{CallLog, MockLaser, MockServo, hornet};

fn approx(a: f32, b: f32) -> bool {
    (a - b).abs() < 0.05
}

fn turret_at(path: &Path) -> (Turret, ManualClock, CallLog) {
    let clock = ManualClock::new(0);
    let log = CallLog::default();
    let ports = TurretPorts {
        servo: Box::new(MockServo(log.clone())),
        laser: Box::new(MockLaser(log.clone())),
        buzzer: None,
    };
    let config = TurretConfig {
        calibration_path: path.to_string_lossy().into_owned(),
        ..TurretConfig::default()
    };
    let turret = Turret::new(config, ports, Arc::new(clock.clone())).expect("turret");
    (turret, clock, log)
}

/// Two aiming points that put the beam 5° right of and 2° below the
/// uncalibrated guess.
fn record_offset_points(mapper: &CoordinateMapper) {
    mapper
        .add_point(PixelCoord::new(160, 120), ServoPosition::new(-10.0, 9.25))
        .unwrap();
    mapper
        .add_point(PixelCoord::new(480, 360), ServoPosition::new(20.0, -13.25))
        .unwrap();
}

#[test]
fn fitted_calibration_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("calibration.json");

    {
        let (t, clock, _log) = turret_at(&path);
        assert!(!t.mapper().is_calibrated());
        record_offset_points(t.mapper());
        clock.advance(1_234);
        let cal = t.mapper().compute_calibration().unwrap();
        assert!(approx(cal.offset_pan_deg, 5.0));
        assert!(approx(cal.offset_tilt_deg, -2.0));
        assert!(approx(cal.scale_pan, 1.0));
        assert!(approx(cal.scale_tilt, 1.0));
        t.save_calibration().unwrap();
    }
    assert!(path.exists());
    assert!(!path.with_extension("json.tmp").exists());

    let (t, _clock, _log) = turret_at(&path);
    assert!(t.mapper().is_calibrated());
    assert_eq!(t.mapper().point_count(), 2);
    let (pan, tilt) = t.mapper().offsets();
    assert!(approx(pan, 5.0));
    assert!(approx(tilt, -2.0));

    let centre = t.mapper().pixel_to_angle(PixelCoord::new(320, 240)).unwrap();
    assert!(approx(centre.pan_deg, 5.0));
    assert!(approx(centre.tilt_deg, -2.0));
}

#[test]
fn calibrated_offsets_steer_the_aim() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("calibration.json");
    let (t, clock, _log) = turret_at(&path);
    t.mapper().set_offsets(4.0, -6.0);

    clock.advance(33);
    let report = t.targeting().process_detections(&[hornet(320, 240)]);
    assert_eq!(report.state, TargetState::Acquiring);
    let aim = report.target.expect("target").angle;
    assert!(approx(aim.pan_deg, 4.0));
    assert!(approx(aim.tilt_deg, -6.0));
    let pos = t.servo().target();
    assert!(approx(pos.pan_deg, 4.0));
    assert!(approx(pos.tilt_deg, -6.0));
}

#[test]
fn missing_file_starts_uncalibrated() {
    let dir = tempfile::tempdir().unwrap();
    let (t, _clock, _log) = turret_at(&dir.path().join("absent.json"));
    assert!(!t.mapper().is_calibrated());
    assert_eq!(t.mapper().scales(), (1.0, 1.0));
}

#[test]
fn malformed_file_is_ignored_at_startup() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("calibration.json");
    std::fs::write(&path, "{ not json").unwrap();

    let (t, _clock, _log) = turret_at(&path);
    assert!(!t.mapper().is_calibrated());
    assert_eq!(t.mapper().offsets(), (0.0, 0.0));
    assert_eq!(t.mapper().load(&path), Err(CoordError::FileInvalid));
}

#[test]
fn save_into_missing_directory_reports_io() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("no/such/dir/calibration.json");
    let (t, _clock, _log) = turret_at(&path);
    assert!(matches!(t.save_calibration(), Err(Error::Coord(CoordError::Io))));
}

#[test]
fn calibration_for_other_camera_still_loads() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("calibration.json");

    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(0));
    let other = CoordinateMapper::new(
        CameraParams {
            width: 320,
            height: 240,
            ..CameraParams::default()
        },
        clock,
    );
    other.set_offsets(1.5, -1.0);
    other.save(&path).unwrap();

    let (t, _clock, _log) = turret_at(&path);
    let (pan, tilt) = t.mapper().offsets();
    assert!(approx(pan, 1.5));
    assert!(approx(tilt, -1.0));
    assert_eq!(t.mapper().camera_params(), CameraParams::default());
}

#[test]
fn config_file_drives_lost_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("turret.json");
    std::fs::write(
        &path,
        r#"{ "targeting": { "lost_timeout_ms": 1500 }, "calibration_path": "" }"#,
    )
    .unwrap();

    let config = TurretConfig::from_json_file(&path).unwrap();
    assert_eq!(config.targeting.lost_timeout_ms, 1500);
    assert_eq!(config.safety, TurretConfig::default().safety);
    assert!(config.calibration_path.is_empty());
}
