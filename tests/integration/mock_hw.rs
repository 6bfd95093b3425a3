//! Mock hardware for integration tests.
//!
//! Records every servo and laser call so tests can assert on the full
//! command history, and provides embedded-hal pins for the hardware
//! adapters.  Also builds the wired subsystem set the tests drive.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use apis_turret::adapters::time::ManualClock;
use apis_turret::app::ports::{Clock, LaserPort, ServoPort};
use apis_turret::app::service::{Turret, TurretPorts};
use apis_turret::app::targeting::Targeting;
use apis_turret::config::{
    ButtonConfig, CameraParams, LaserConfig, SafetyConfig, ServoConfig, TargetingConfig, TrackerConfig,
    TurretConfig,
};
use apis_turret::control::coordinate::CoordinateMapper;
use apis_turret::drivers::button::ButtonHandler;
use apis_turret::drivers::laser::LaserController;
use apis_turret::drivers::servo::{ServoAxis, ServoController, pulse_to_angle};
use apis_turret::error::{LaserError, ServoError};
use apis_turret::safety::SafetyLayer;
use apis_turret::vision::Detection;

// ── Call records ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HwCall {
    Pulse { axis: ServoAxis, pulse_us: u32 },
    Emitter(bool),
}

#[derive(Clone, Default)]
pub struct CallLog {
    calls: Arc<Mutex<Vec<HwCall>>>,
}

impl CallLog {
    pub fn push(&self, call: HwCall) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<HwCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Every tilt angle ever commanded, converted back from pulse width.
    pub fn tilt_angles(&self) -> Vec<f32> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                HwCall::Pulse {
                    axis: ServoAxis::Tilt,
                    pulse_us,
                } => Some(pulse_to_angle(ServoAxis::Tilt, pulse_us)),
                _ => None,
            })
            .collect()
    }

    pub fn emitter_on(&self) -> bool {
        self.calls()
            .iter()
            .rev()
            .find_map(|c| match c {
                HwCall::Emitter(on) => Some(*on),
                HwCall::Pulse { .. } => None,
            })
            .unwrap_or(false)
    }

    pub fn emitter_on_count(&self) -> usize {
        self.calls().iter().filter(|c| **c == HwCall::Emitter(true)).count()
    }
}

// ── MockServo / MockLaser ─────────────────────────────────────

pub struct MockServo(pub CallLog);

impl ServoPort for MockServo {
    fn set_pulse_width(&mut self, axis: ServoAxis, pulse_us: u32) -> Result<(), ServoError> {
        self.0.push(HwCall::Pulse { axis, pulse_us });
        Ok(())
    }
}

pub struct MockLaser(pub CallLog);

impl LaserPort for MockLaser {
    fn set_emitter(&mut self, on: bool) -> Result<(), LaserError> {
        self.0.push(HwCall::Emitter(on));
        Ok(())
    }
}

// ── embedded-hal pins ─────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinFault;

impl embedded_hal::digital::Error for PinFault {
    fn kind(&self) -> embedded_hal::digital::ErrorKind {
        embedded_hal::digital::ErrorKind::Other
    }
}

impl embedded_hal::pwm::Error for PinFault {
    fn kind(&self) -> embedded_hal::pwm::ErrorKind {
        embedded_hal::pwm::ErrorKind::Other
    }
}

#[derive(Default)]
struct PinState {
    high: bool,
    writes: u32,
    failing: bool,
}

/// Digital pin shared between the adapter and the test.
#[derive(Clone, Default)]
pub struct MockPin {
    state: Arc<Mutex<PinState>>,
}

impl MockPin {
    pub fn new(high: bool) -> Self {
        let pin = Self::default();
        pin.set_level(high);
        pin
    }

    pub fn set_level(&self, high: bool) {
        self.state.lock().unwrap().high = high;
    }

    pub fn is_set_high(&self) -> bool {
        self.state.lock().unwrap().high
    }

    pub fn writes(&self) -> u32 {
        self.state.lock().unwrap().writes
    }

    pub fn set_failing(&self, failing: bool) {
        self.state.lock().unwrap().failing = failing;
    }
}

impl embedded_hal::digital::ErrorType for MockPin {
    type Error = PinFault;
}

impl embedded_hal::digital::OutputPin for MockPin {
    fn set_low(&mut self) -> Result<(), PinFault> {
        let mut s = self.state.lock().unwrap();
        if s.failing {
            return Err(PinFault);
        }
        s.high = false;
        s.writes += 1;
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), PinFault> {
        let mut s = self.state.lock().unwrap();
        if s.failing {
            return Err(PinFault);
        }
        s.high = true;
        s.writes += 1;
        Ok(())
    }
}

impl embedded_hal::digital::InputPin for MockPin {
    fn is_high(&mut self) -> Result<bool, PinFault> {
        let s = self.state.lock().unwrap();
        if s.failing {
            return Err(PinFault);
        }
        Ok(s.high)
    }

    fn is_low(&mut self) -> Result<bool, PinFault> {
        self.is_high().map(|h| !h)
    }
}

/// PWM channel with a 20000-step period, so duty equals microseconds.
#[derive(Clone, Default)]
pub struct MockPwm {
    duty: Arc<Mutex<Option<u16>>>,
    failing: Arc<Mutex<bool>>,
}

impl MockPwm {
    pub const MAX_DUTY: u16 = 20_000;

    pub fn duty(&self) -> Option<u16> {
        *self.duty.lock().unwrap()
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }
}

impl embedded_hal::pwm::ErrorType for MockPwm {
    type Error = PinFault;
}

impl embedded_hal::pwm::SetDutyCycle for MockPwm {
    fn max_duty_cycle(&self) -> u16 {
        Self::MAX_DUTY
    }

    fn set_duty_cycle(&mut self, duty: u16) -> Result<(), PinFault> {
        if *self.failing.lock().unwrap() {
            return Err(PinFault);
        }
        *self.duty.lock().unwrap() = Some(duty);
        Ok(())
    }
}

// ── Wired subsystems ──────────────────────────────────────────

pub struct Rig {
    pub clock: ManualClock,
    pub log: CallLog,
    pub laser: Arc<LaserController>,
    pub button: Arc<ButtonHandler>,
    pub safety: Arc<SafetyLayer>,
    pub servo: Arc<ServoController>,
    pub mapper: Arc<CoordinateMapper>,
    pub targeting: Targeting,
}

impl Rig {
    pub fn new(targeting: TargetingConfig) -> Self {
        Self::with_tracker(targeting, TrackerConfig::default())
    }

    pub fn with_tracker(targeting: TargetingConfig, tracker: TrackerConfig) -> Self {
        let clock = ManualClock::new(10_000);
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        let log = CallLog::default();
        let laser = Arc::new(LaserController::new(
            Box::new(MockLaser(log.clone())),
            LaserConfig::default(),
            shared.clone(),
        ));
        let button = Arc::new(ButtonHandler::new(
            ButtonConfig::default(),
            shared.clone(),
            Some(laser.clone()),
        ));
        let safety = Arc::new(SafetyLayer::new(
            SafetyConfig::default(),
            shared.clone(),
            laser.clone(),
            button.clone(),
        ));
        let servo = Arc::new(ServoController::new(Box::new(MockServo(log.clone())), shared.clone()));
        let mapper = Arc::new(CoordinateMapper::new(CameraParams::default(), shared.clone()));
        let targeting = Targeting::new(
            targeting,
            tracker,
            safety.clone(),
            servo.clone(),
            mapper.clone(),
            shared,
        );
        Self {
            clock,
            log,
            laser,
            button,
            safety,
            servo,
            mapper,
            targeting,
        }
    }

    /// One frame: advance the clock, feed the watchdog, process.
    pub fn frame(&self, dt_ms: u64, detections: &[Detection]) -> apis_turret::app::targeting::ProcessReport {
        self.clock.advance(dt_ms);
        let report = self.targeting.process_detections(detections);
        self.safety.feed_watchdog();
        report
    }

    /// Tick the servo through one full interpolated move.
    pub fn settle_servo(&self) {
        let profile = ServoConfig::default();
        for _ in 0..profile.steps() {
            self.clock.advance(profile.step_ms);
            let _ = self.servo.tick();
        }
    }
}

pub fn hornet(cx: u32, cy: u32) -> Detection {
    Detection::from_box(cx - 10, cy - 10, 20, 20, 0.9)
}

/// A turret over mock hardware with no calibration file.
pub fn turret() -> (Turret, ManualClock, CallLog) {
    let clock = ManualClock::new(0);
    let log = CallLog::default();
    let ports = TurretPorts {
        servo: Box::new(MockServo(log.clone())),
        laser: Box::new(MockLaser(log.clone())),
        buzzer: None,
    };
    let config = TurretConfig {
        calibration_path: String::new(),
        ..TurretConfig::default()
    };
    let turret = Turret::new(config, ports, Arc::new(clock.clone())).expect("turret");
    (turret, clock, log)
}
