//! End-to-end targeting: detections through tracker, state machine,
//! mapper and servo down to the mock emitter.

use std::sync::{Arc, Mutex};

use apis_turret::adapters::sim::{SimLaser, SimServo};
use apis_turret::adapters::time::ManualClock;
use apis_turret::app::service::{Turret, TurretPorts};
use apis_turret::config::{TargetingConfig, TrackerConfig, TurretConfig};
use apis_turret::drivers::servo::ServoPosition;
use apis_turret::error::{LaserError, SafetyError};
use apis_turret::fsm::TargetState;
use apis_turret::vision::Detection;
use apis_turret::vision::motion::Frame;

use crate::mock_hw::{Rig, hornet, turret};

fn armed_rig() -> Rig {
    let r = Rig::new(TargetingConfig::default());
    r.button.arm();
    r.safety.set_voltage(5000);
    r
}

/// Two frames of the same hornet: Acquiring, then Tracking with the laser on.
fn engage(r: &Rig, cx: u32, cy: u32) -> u32 {
    let first = r.frame(33, &[hornet(cx, cy)]);
    assert_eq!(first.state, TargetState::Acquiring);
    let second = r.frame(33, &[hornet(cx + 2, cy + 1)]);
    assert_eq!(second.state, TargetState::Tracking);
    assert_eq!(second.laser, Some(Ok(())));
    second.target.expect("target").track_id
}

// ── Engagement ────────────────────────────────────────────────

#[test]
fn confirmed_hornet_is_aimed_and_lased() {
    let r = armed_rig();
    let id = engage(&r, 320, 360);

    assert!(r.laser.is_active());
    assert!(r.log.emitter_on());
    assert_eq!(r.log.emitter_on_count(), 1);

    let target = r.targeting.current_target().expect("target");
    assert_eq!(target.track_id, id);
    assert!(target.angle.tilt_deg < 0.0, "lower half of the frame aims down");
    assert_eq!(r.servo.target(), target.angle);
    r.settle_servo();
    let pos = r.servo.position();
    assert!((pos.pan_deg - target.angle.pan_deg).abs() < 0.01);
    assert!((pos.tilt_deg - target.angle.tilt_deg).abs() < 0.01);
}

#[test]
fn tilt_never_commanded_upward() {
    let r = armed_rig();
    // Upper rows map to positive raw tilt; the servo must stay level.
    for (cx, cy) in [(320, 20), (40, 30), (600, 60), (320, 240), (100, 470)] {
        r.frame(33, &[hornet(cx, cy)]);
        r.frame(33, &[hornet(cx, cy)]);
        r.settle_servo();
        r.targeting.cleanup();
        r.clock.advance(6_000);
    }
    let tilts = r.log.tilt_angles();
    assert!(!tilts.is_empty());
    assert!(tilts.iter().all(|&t| t <= 0.0), "upward tilt in {tilts:?}");
}

#[test]
fn unarmed_tracking_is_denied() {
    let r = Rig::new(TargetingConfig::default());
    r.frame(33, &[hornet(320, 360)]);
    let report = r.frame(33, &[hornet(321, 360)]);

    assert_eq!(report.state, TargetState::Tracking);
    assert_eq!(report.laser, Some(Err(SafetyError::NotArmed)));
    assert!(!r.log.emitter_on());
    let stats = r.targeting.stats();
    assert_eq!(stats.laser_requests, 1);
    assert_eq!(stats.laser_denials, 1);
}

#[test]
fn disarm_mid_track_cuts_the_beam() {
    let r = armed_rig();
    engage(&r, 300, 400);
    r.button.disarm();
    assert!(!r.laser.is_active());

    let report = r.frame(33, &[hornet(304, 402)]);
    assert_eq!(report.state, TargetState::Tracking);
    assert_eq!(report.laser, Some(Err(SafetyError::NotArmed)));
    assert!(!r.log.emitter_on());
}

#[test]
fn engaged_track_keeps_priority_over_larger_newcomer() {
    let r = armed_rig();
    let id = engage(&r, 150, 400);

    let big = Detection::from_box(450, 300, 40, 40, 0.9);
    let report = r.frame(33, &[hornet(152, 401), big]);
    assert_eq!(report.target.expect("target").track_id, id);
    assert_eq!(report.tracked.len(), 2);
    assert!(r.targeting.stats().multi_target_count >= 1);
}

#[test]
fn undersized_detection_never_acquires() {
    let r = armed_rig();
    let speck = Detection::from_box(300, 300, 5, 5, 0.9);
    for _ in 0..5 {
        let report = r.frame(33, &[speck]);
        assert_eq!(report.state, TargetState::Idle);
        assert_eq!(report.tracked.len(), 1);
    }
    assert_eq!(r.targeting.stats().target_count, 0);
}

// ── Loss and reacquisition ────────────────────────────────────

#[test]
fn timeout_loses_target_and_stops_laser() {
    let r = armed_rig();
    let lost = Arc::new(Mutex::new(Vec::new()));
    let sink = lost.clone();
    r.targeting.on_target_lost(move |t| sink.lock().unwrap().push(t));

    let id = engage(&r, 320, 360);
    // Brief dropouts inside the timeout keep the beam on.
    r.frame(33, &[]);
    r.frame(33, &[]);
    assert_eq!(r.targeting.state(), TargetState::Tracking);
    assert!(r.laser.is_active());

    r.clock.advance(500);
    assert_eq!(r.targeting.update(), TargetState::Lost);
    assert!(!r.laser.is_active());
    assert!(!r.safety.is_detection_active());

    let lost = lost.lock().unwrap();
    assert_eq!(lost.len(), 1);
    assert_eq!(lost[0].track_id, id);
    assert_eq!(r.targeting.stats().lost_count, 1);
}

#[test]
fn reacquire_inside_cooldown_is_denied_by_laser() {
    let r = armed_rig();
    let id = engage(&r, 320, 360);
    r.clock.advance(600);
    assert_eq!(r.targeting.update(), TargetState::Lost);

    let report = r.frame(33, &[hornet(324, 362)]);
    assert_eq!(report.state, TargetState::Tracking);
    assert_eq!(report.target.expect("target").track_id, id);
    assert!(matches!(
        report.laser,
        Some(Err(SafetyError::Laser(LaserError::Cooldown { .. })))
    ));
    assert!(!r.laser.is_active());

    let stats = r.targeting.stats();
    assert_eq!(stats.reacquired_count, 1);
    assert_eq!(stats.target_count, 1);

    // Once the cooldown lapses the next matched frame fires again.
    r.clock.advance(5_000);
    r.safety.feed_watchdog();
    let report = r.frame(33, &[hornet(326, 362)]);
    assert_eq!(report.laser, Some(Ok(())));
    assert_eq!(r.log.emitter_on_count(), 2);
}

#[test]
fn lost_target_returns_to_idle_and_sweeps() {
    let r = armed_rig();
    engage(&r, 320, 360);
    r.clock.advance(600);
    assert_eq!(r.targeting.update(), TargetState::Lost);
    r.clock.advance(600);
    assert_eq!(r.targeting.update(), TargetState::Idle);
    assert!(r.targeting.current_target().is_none());

    let before = r.log.calls().len();
    r.clock.advance(125);
    r.targeting.update();
    r.clock.advance(5);
    r.servo.tick().unwrap();
    assert!(r.log.calls().len() > before, "idle sweep commands the servo");
    let pos = r.servo.target();
    assert!((pos.tilt_deg - ServoPosition::HOME.tilt_deg).abs() < 0.01);
}

#[test]
fn expired_track_is_replaced_by_new_acquisition() {
    let tracker = TrackerConfig {
        max_disappeared: 2,
        ..TrackerConfig::default()
    };
    let r = Rig::with_tracker(TargetingConfig::default(), tracker);
    r.button.arm();
    let first = engage(&r, 320, 360);

    for _ in 0..3 {
        r.frame(33, &[]);
    }
    assert!(r.targeting.track(first).is_none());

    r.clock.advance(600);
    r.targeting.update();
    let report = r.frame(33, &[hornet(100, 400)]);
    assert_eq!(report.state, TargetState::Acquiring);
    assert_ne!(report.target.expect("target").track_id, first);
}

// ── Full turret frame path ────────────────────────────────────

#[test]
fn turret_lases_a_hornet_in_camera_frames() {
    let (t, clock, log) = turret();
    t.button().arm();
    t.set_voltage(5000);
    let cam = t.config().camera;
    let w = cam.width as usize;

    let render = |x0: usize, y0: usize| {
        let mut buf = vec![40u8; cam.pixel_count()];
        for y in y0..y0 + 20 {
            buf[y * w + x0..y * w + x0 + 20].fill(220);
        }
        buf
    };

    let blank = vec![40u8; cam.pixel_count()];
    clock.advance(33);
    let seed = t.process_frame(&Frame::gray(&blank, cam.width, cam.height)).expect("seed");
    assert!(seed.motion.detections.is_empty());

    let mut states = Vec::new();
    for step in 0..3 {
        clock.advance(33);
        let buf = render(300 + step * 2, 350);
        let report = t.process_frame(&Frame::gray(&buf, cam.width, cam.height)).expect("frame");
        assert_eq!(report.motion.detections.len(), 1);
        states.push(report.targeting.state);
        t.tick();
    }

    assert_eq!(states[0], TargetState::Acquiring);
    assert_eq!(states[1], TargetState::Tracking);
    assert!(t.laser().is_active());
    assert!(log.emitter_on());
    assert!(log.tilt_angles().iter().all(|&a| a <= 0.0));

    let snap = t.telemetry();
    assert_eq!(snap.target_state, TargetState::Tracking);
    assert!(snap.target.is_some());
    assert_eq!(snap.motion.frames_processed, 4);

    t.shutdown();
    assert!(!log.emitter_on());
    assert_eq!(t.targeting().state(), TargetState::Idle);
}

// ── Servo motion under the turret loop ────────────────────────

#[test]
fn safe_mode_parks_servo_at_home() {
    let (t, clock, _log) = turret();
    t.button().arm();
    t.targeting().process_detections(&[hornet(600, 420)]);
    assert!(t.servo().is_moving());
    clock.advance(20);
    t.tick();
    assert_ne!(t.servo().position(), ServoPosition::HOME);

    t.safety().enter_safe_mode();
    t.tick();
    assert!(!t.servo().is_moving());
    assert_eq!(t.servo().position(), ServoPosition::HOME);

    // Later frames do not move it off home.
    clock.advance(33);
    t.targeting().process_detections(&[hornet(600, 420)]);
    t.tick();
    assert_eq!(t.servo().target(), ServoPosition::HOME);
}

#[test]
fn servo_stall_disarms_the_turret() {
    let clock = ManualClock::new(0);
    let servo = SimServo::new();
    let ports = TurretPorts {
        servo: Box::new(servo.clone()),
        laser: Box::new(SimLaser::new()),
        buzzer: None,
    };
    let config = TurretConfig {
        calibration_path: String::new(),
        ..TurretConfig::default()
    };
    let t = Turret::new(config, ports, Arc::new(clock.clone())).expect("turret");
    let failures = Arc::new(Mutex::new(0u32));
    t.button().arm();
    assert!(t.laser().is_armed());

    servo.set_failing(true);
    for _ in 0..10 {
        clock.advance(100);
        t.tick();
    }
    assert!(t.servo().is_failed());
    assert!(t.servo().stats().stall_count >= 3);
    assert!(!t.button().is_armed());
    assert!(!t.laser().is_armed());

    // Only an acknowledgement brings motion back.
    servo.set_failing(false);
    let seen = failures.clone();
    t.servo().set_failure_listener(move |_| *seen.lock().unwrap() += 1);
    t.servo().clear_failure();
    clock.advance(100);
    t.tick();
    clock.advance(100);
    t.tick();
    assert!(!t.servo().is_failed());
    assert!(t.servo().is_hardware_ok());
    assert_eq!(*failures.lock().unwrap(), 0);
}
