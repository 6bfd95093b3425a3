//! Safety interlock scenarios across button, safety layer and laser.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use apis_turret::config::{SafetyConfig, TargetingConfig};
use apis_turret::drivers::button::{ButtonEvent, SystemMode};
use apis_turret::error::{LaserError, SafetyError};
use apis_turret::safety::{SafetyCheck, SafetyChecks, SafetyState};

use crate::mock_hw::Rig;

fn rig() -> Rig {
    Rig::new(TargetingConfig::default())
}

/// Everything the laser needs except arming.
fn prime(r: &Rig) {
    r.safety.set_detection_active(true);
    r.safety.feed_watchdog();
    r.safety.validate_tilt(-5.0).unwrap();
    r.safety.set_voltage(5000);
}

#[test]
fn disarmed_then_armed_laser_enable() {
    let r = rig();

    assert_eq!(r.button.mode(), SystemMode::Disarmed);
    assert_eq!(r.safety.check(SafetyCheck::Armed.into()).status, Err(SafetyError::NotArmed));
    assert!(r.safety.laser_on().is_err());
    assert!(!r.laser.is_active());

    r.button.arm();
    prime(&r);
    assert_eq!(r.safety.laser_on(), Ok(()));
    assert!(r.laser.is_active());
    assert!(r.log.emitter_on());
}

#[test]
fn fail_closed_each_missing_condition() {
    type Breaker = fn(&Rig);
    let cases: [(Breaker, SafetyError); 5] = [
        (|r| r.button.disarm(), SafetyError::NotArmed),
        (|r| r.safety.set_detection_active(false), SafetyError::NoDetection),
        (|r| r.laser.kill_switch(), SafetyError::KillSwitch),
        (|r| r.safety.set_voltage(4000), SafetyError::Brownout),
        (
            |r| {
                let _ = r.safety.validate_tilt(3.0);
            },
            SafetyError::TiltUpward,
        ),
    ];

    for (breaker, expected) in cases {
        let r = rig();
        r.button.arm();
        prime(&r);
        breaker(&r);
        let result = r.safety.check_all();
        assert!(!result.is_safe());
        assert_eq!(result.status, Err(expected));
        assert!(r.safety.laser_on().is_err());
        assert!(!r.laser.is_active());
        assert!(!r.log.emitter_on());
    }
}

#[test]
fn stale_watchdog_alone_fails_closed() {
    let r = rig();
    r.button.arm();
    prime(&r);
    let timeout = SafetyConfig::default().watchdog_timeout_ms;

    r.clock.advance(timeout + 1);
    let result = r.safety.check_all();
    assert_eq!(result.failed, SafetyChecks::from(SafetyCheck::Watchdog));
    assert_eq!(result.status, Err(SafetyError::Watchdog));
    assert_eq!(r.safety.laser_on(), Err(SafetyError::Watchdog));
    assert!(!r.laser.is_active());
    assert!(!r.log.emitter_on());
}

#[test]
fn kill_switch_fails_closed_and_raises_emergency() {
    let r = rig();
    r.button.arm();
    prime(&r);
    r.laser.kill_switch();
    let result = r.safety.check_all();
    assert!(result.failed.contains(SafetyCheck::KillSwitch));
    assert!(result.kill_switch_engaged);
    r.safety.update();
    assert_eq!(r.safety.state(), SafetyState::Emergency);
}

#[test]
fn laser_off_is_idempotent() {
    let r = rig();
    r.button.arm();
    prime(&r);
    r.safety.laser_on().unwrap();

    for _ in 0..3 {
        assert_eq!(r.safety.laser_off(), Ok(()));
        assert!(!r.laser.is_active());
        assert!(!r.log.emitter_on());
    }
    assert_eq!(r.log.emitter_on_count(), 1);
}

#[test]
fn watchdog_expiry_enters_safe_mode_until_reset() {
    let r = rig();
    r.button.arm();
    prime(&r);
    r.safety.laser_on().unwrap();

    r.clock.advance(30_001);
    r.safety.update();
    assert_eq!(r.safety.state(), SafetyState::SafeMode);
    assert!(!r.laser.is_active());
    assert!(r.laser.is_kill_switch_engaged());
    assert_eq!(r.button.mode(), SystemMode::Disarmed);

    r.safety.feed_watchdog();
    assert_eq!(r.safety.laser_on(), Err(SafetyError::SafeMode));
    let result = r.safety.check_all();
    assert_eq!(result.failed, SafetyChecks::ALL);

    r.safety.reset();
    assert_eq!(r.safety.state(), SafetyState::Normal);
    assert!(!r.laser.is_kill_switch_engaged());
    r.clock.advance(5_000);
    r.safety.feed_watchdog();
    assert_eq!(r.safety.laser_on(), Err(SafetyError::NotArmed));

    r.button.arm();
    assert_eq!(r.safety.laser_on(), Ok(()));
}

#[test]
fn cooldown_blocks_reactivation() {
    let r = rig();
    r.button.arm();
    prime(&r);
    r.safety.laser_on().unwrap();
    r.clock.advance(100);
    r.safety.laser_off().unwrap();

    r.clock.advance(1_000);
    assert!(matches!(
        r.safety.laser_on(),
        Err(SafetyError::Laser(LaserError::Cooldown { .. }))
    ));
    r.clock.advance(4_100);
    r.safety.feed_watchdog();
    assert_eq!(r.safety.laser_on(), Ok(()));
}

#[test]
fn auto_off_beats_max_on_time() {
    let r = rig();
    r.button.arm();
    prime(&r);
    r.safety.laser_on().unwrap();

    r.clock.advance(9_600);
    r.safety.feed_watchdog();
    r.safety.update();
    assert!(!r.laser.is_active());
    assert_eq!(r.safety.stats().forced_off_count, 1);
    assert_eq!(r.laser.stats().safety_timeout_count, 0);
}

#[test]
fn short_press_then_undo_restores_mode() {
    let r = rig();
    let press = |ms: u64| {
        r.button.update(true);
        r.clock.advance(ms);
        r.button.update(false)
    };

    assert_eq!(press(200), Some(ButtonEvent::ShortPress));
    assert_eq!(r.button.mode(), SystemMode::Armed);
    assert!(r.laser.is_armed());

    r.clock.advance(300);
    assert_eq!(press(200), Some(ButtonEvent::Undo));
    assert_eq!(r.button.mode(), SystemMode::Disarmed);
    assert!(!r.laser.is_armed());

    r.clock.advance(2_500);
    assert_eq!(press(200), Some(ButtonEvent::ShortPress));
    assert_eq!(r.button.mode(), SystemMode::Armed);
}

#[test]
fn long_press_is_emergency_stop() {
    let r = rig();
    r.button.arm();
    prime(&r);
    r.safety.laser_on().unwrap();

    r.button.update(true);
    r.clock.advance(3_000);
    assert_eq!(r.button.update(true), Some(ButtonEvent::LongPress));
    assert_eq!(r.button.mode(), SystemMode::EmergencyStop);
    assert!(!r.laser.is_active());
    assert!(r.laser.is_kill_switch_engaged());
    assert_eq!(r.safety.laser_on(), Err(SafetyError::Multiple));
}

#[test]
fn failure_listener_sees_denials() {
    let r = rig();
    let count = Arc::new(AtomicU32::new(0));
    let seen = count.clone();
    r.safety.set_failure_listener(move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
    });
    let _ = r.safety.laser_on();
    let _ = r.safety.laser_on();
    assert_eq!(count.load(Ordering::SeqCst), 2);
}
