//! embedded-hal adapters against mock pins.

use std::sync::Arc;

use apis_turret::adapters::hardware::{GpioButton, GpioLaser, PwmServo};
use apis_turret::adapters::time::ManualClock;
use apis_turret::app::ports::{ButtonPort, Clock, LaserPort, ServoPort};
use apis_turret::config::{ButtonConfig, LaserConfig, SafetyConfig};
use apis_turret::drivers::button::{ButtonEvent, ButtonHandler};
use apis_turret::drivers::laser::LaserController;
use apis_turret::drivers::servo::{ServoAxis, ServoController, ServoPosition};
use apis_turret::error::{LaserError, ServoError};
use apis_turret::safety::SafetyLayer;

use crate::mock_hw::{MockPin, MockPwm};

// ── PwmServo ──────────────────────────────────────────────────

#[test]
fn pwm_duty_equals_pulse_width() {
    let (pan, tilt) = (MockPwm::default(), MockPwm::default());
    let mut servo = PwmServo::new(pan.clone(), tilt.clone());

    servo.set_pulse_width(ServoAxis::Pan, 1500).unwrap();
    servo.set_pulse_width(ServoAxis::Tilt, 1000).unwrap();
    assert_eq!(pan.duty(), Some(1500));
    assert_eq!(tilt.duty(), Some(1000));

    // Never more than one full period.
    servo.set_pulse_width(ServoAxis::Pan, 25_000).unwrap();
    assert_eq!(pan.duty(), Some(MockPwm::MAX_DUTY));
}

#[test]
fn pwm_write_failure_is_hardware_error() {
    let (pan, tilt) = (MockPwm::default(), MockPwm::default());
    tilt.set_failing(true);
    let mut servo = PwmServo::new(pan, tilt);
    assert_eq!(servo.set_pulse_width(ServoAxis::Tilt, 1500), Err(ServoError::Hardware));
}

#[test]
fn controller_over_pwm_homes_and_clamps() {
    let (pan, tilt) = (MockPwm::default(), MockPwm::default());
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(0));
    let ctrl = ServoController::new(Box::new(PwmServo::new(pan.clone(), tilt.clone())), clock);

    // Home is pan 0°, tilt −15°: both at mid-range.
    assert_eq!(pan.duty(), Some(1500));
    assert_eq!(tilt.duty(), Some(1500));

    let mv = ctrl.move_immediate(ServoPosition::new(45.0, -30.0)).unwrap();
    assert!(!mv.clamped);
    assert_eq!(pan.duty(), Some(2000));
    assert_eq!(tilt.duty(), Some(1000));

    let mv = ctrl.move_immediate(ServoPosition::new(-90.0, 12.0)).unwrap();
    assert!(mv.clamped);
    assert_eq!(mv.position, ServoPosition::new(-45.0, 0.0));
    assert_eq!(pan.duty(), Some(1000));
    assert_eq!(tilt.duty(), Some(2000));
}

#[test]
fn controller_reports_pwm_fault_and_recovers() {
    let (pan, tilt) = (MockPwm::default(), MockPwm::default());
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(0));
    let ctrl = ServoController::new(Box::new(PwmServo::new(pan.clone(), tilt)), clock);

    pan.set_failing(true);
    assert_eq!(ctrl.move_immediate(ServoPosition::new(10.0, -10.0)), Err(ServoError::Hardware));
    assert!(!ctrl.is_hardware_ok());
    assert_eq!(ctrl.position(), ServoPosition::HOME);
    assert_eq!(ctrl.stats().hardware_faults, 1);

    pan.set_failing(false);
    ctrl.move_immediate(ServoPosition::new(10.0, -10.0)).unwrap();
    assert!(ctrl.is_hardware_ok());
    assert_eq!(ctrl.position(), ServoPosition::new(10.0, -10.0));
}

// ── GpioLaser ─────────────────────────────────────────────────

#[test]
fn laser_gate_starts_low() {
    let pin = MockPin::new(true);
    let _laser = GpioLaser::new(pin.clone()).unwrap();
    assert!(!pin.is_set_high());
    assert_eq!(pin.writes(), 1);
}

#[test]
fn laser_gate_init_failure_is_reported() {
    let pin = MockPin::new(false);
    pin.set_failing(true);
    assert!(matches!(GpioLaser::new(pin), Err(LaserError::Hardware)));
}

#[test]
fn laser_gate_follows_emitter_commands() {
    let pin = MockPin::new(false);
    let mut laser = GpioLaser::new(pin.clone()).unwrap();
    laser.set_emitter(true).unwrap();
    assert!(pin.is_set_high());
    laser.set_emitter(false).unwrap();
    assert!(!pin.is_set_high());

    pin.set_failing(true);
    assert_eq!(laser.set_emitter(true), Err(LaserError::Hardware));
}

#[test]
fn gated_laser_drives_the_pin_through_safety() {
    let clock = ManualClock::new(0);
    let shared: Arc<dyn Clock> = Arc::new(clock.clone());
    let pin = MockPin::new(false);
    let laser = Arc::new(LaserController::new(
        Box::new(GpioLaser::new(pin.clone()).unwrap()),
        LaserConfig::default(),
        shared.clone(),
    ));
    let button = Arc::new(ButtonHandler::new(
        ButtonConfig::default(),
        shared.clone(),
        Some(laser.clone()),
    ));
    let safety = SafetyLayer::new(SafetyConfig::default(), shared, laser.clone(), button.clone());

    button.arm();
    safety.set_detection_active(true);
    safety.validate_tilt(-10.0).unwrap();
    safety.feed_watchdog();
    safety.laser_on().unwrap();
    assert!(pin.is_set_high());

    clock.advance(1_000);
    laser.kill_switch();
    assert!(!pin.is_set_high());
    assert!(safety.laser_on().is_err());
    assert!(!pin.is_set_high());
}

#[test]
fn laser_write_fault_leaves_controller_off() {
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(0));
    let pin = MockPin::new(false);
    let laser = Arc::new(LaserController::new(
        Box::new(GpioLaser::new(pin.clone()).unwrap()),
        LaserConfig::default(),
        clock.clone(),
    ));
    let button = Arc::new(ButtonHandler::new(ButtonConfig::default(), clock.clone(), Some(laser.clone())));
    let safety = SafetyLayer::new(SafetyConfig::default(), clock, laser.clone(), button.clone());

    button.arm();
    safety.set_detection_active(true);
    safety.validate_tilt(-10.0).unwrap();
    pin.set_failing(true);
    assert!(safety.laser_on().is_err());
    assert!(!laser.is_active());
    assert!(laser.stats().hardware_faults >= 1);
}

// ── GpioButton ────────────────────────────────────────────────

#[test]
fn button_is_active_low() {
    let pin = MockPin::new(true);
    let mut button = GpioButton::new(pin.clone());
    assert!(!button.is_pressed());
    pin.set_level(false);
    assert!(button.is_pressed());
}

#[test]
fn button_read_error_reads_released() {
    let pin = MockPin::new(false);
    let mut button = GpioButton::new(pin.clone());
    assert!(button.is_pressed());
    pin.set_failing(true);
    assert!(!button.is_pressed());
}

#[test]
fn polled_short_press_arms_the_laser() {
    let clock = ManualClock::new(0);
    let shared: Arc<dyn Clock> = Arc::new(clock.clone());
    let laser = Arc::new(LaserController::new(
        Box::new(GpioLaser::new(MockPin::new(false)).unwrap()),
        LaserConfig::default(),
        shared.clone(),
    ));
    let handler = ButtonHandler::new(ButtonConfig::default(), shared, Some(laser.clone()));
    let pin = MockPin::new(true);
    let mut button = GpioButton::new(pin.clone());

    assert_eq!(handler.poll(&mut button), None);
    pin.set_level(false);
    assert_eq!(handler.poll(&mut button), None);
    clock.advance(200);
    pin.set_level(true);
    assert_eq!(handler.poll(&mut button), Some(ButtonEvent::ShortPress));
    assert!(handler.is_armed());
    assert!(laser.is_armed());
}
