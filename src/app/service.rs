//! Turret assembly: the hexagonal core wired from one configuration.
//!
//! [`Turret`] owns every subsystem and exposes the two entry points the
//! outer loops drive.  All I/O flows through port traits handed in at
//! construction, so the whole turret runs on the host against simulated
//! hardware.
//!
//! ```text
//!  Frame ──▶ ┌──────────────────────────────┐ ──▶ ServoPort
//!            │            Turret            │
//!  tick() ──▶│ Motion · Targeting · Safety  │ ──▶ LaserPort
//!            │ Button · Laser · Mapper      │
//!  Button ──▶└──────────────────────────────┘ ──▶ TelemetrySnapshot
//! ```
//!
//! Frame path: motion → targeting → watchdog feed.
//! Periodic path: laser max-on-time → safety → safe-mode park → servo
//! interpolation → targeting (sweep, lost).
//!
//! A servo stall failure disarms the turret through the button, which
//! switches the laser off with it.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, error, info, warn};

use crate::config::TurretConfig;
use crate::control::coordinate::CoordinateMapper;
use crate::drivers::button::{ButtonEvent, ButtonHandler};
use crate::drivers::laser::LaserController;
use crate::drivers::servo::{ServoController, ServoPosition};
use crate::error::{CoordError, Error, Result};
use crate::fsm::TargetState;
use crate::safety::SafetyLayer;
use crate::sync::lock;
use crate::vision::motion::{DetectionResult, Frame, MotionDetector};

use super::events::TelemetrySnapshot;
use super::ports::{ButtonPort, BuzzerPort, Clock, LaserPort, ServoPort};
use super::targeting::{ProcessReport, Targeting};

/// Hardware handed to [`Turret::new`].
pub struct TurretPorts {
    pub servo: Box<dyn ServoPort>,
    pub laser: Box<dyn LaserPort>,
    pub buzzer: Option<Box<dyn BuzzerPort>>,
}

/// Result of one frame through the pipeline.
#[derive(Debug, Clone)]
pub struct FrameReport {
    pub motion: DetectionResult,
    pub targeting: ProcessReport,
}

// ───────────────────────────────────────────────────────────────
// Turret
// ───────────────────────────────────────────────────────────────

pub struct Turret {
    config: TurretConfig,
    clock: Arc<dyn Clock>,
    motion: Mutex<MotionDetector>,
    laser: Arc<LaserController>,
    button: Arc<ButtonHandler>,
    safety: Arc<SafetyLayer>,
    servo: Arc<ServoController>,
    mapper: Arc<CoordinateMapper>,
    targeting: Targeting,
    /// Servo already parked for the current safe-mode episode.
    parked: AtomicBool,
}

impl Turret {
    /// Build every subsystem, leaves first.  A stored calibration at
    /// `calibration_path` is loaded when present.
    pub fn new(config: TurretConfig, ports: TurretPorts, clock: Arc<dyn Clock>) -> Result<Self> {
        config.camera.validate().map_err(Error::Config)?;
        let config = config.sanitized();

        let laser = Arc::new(LaserController::new(ports.laser, config.laser, Arc::clone(&clock)));
        let mut button = ButtonHandler::new(config.button, Arc::clone(&clock), Some(Arc::clone(&laser)));
        if let Some(buzzer) = ports.buzzer {
            button = button.with_buzzer(buzzer);
        }
        let button = Arc::new(button);
        let safety = Arc::new(SafetyLayer::new(
            config.safety,
            Arc::clone(&clock),
            Arc::clone(&laser),
            Arc::clone(&button),
        ));
        let servo = Arc::new(ServoController::with_config(ports.servo, config.servo, Arc::clone(&clock)));
        {
            let button = Arc::clone(&button);
            servo.set_failure_listener(move |e| {
                error!("Servo failure ({e}), disarming");
                button.disarm();
            });
        }
        let mapper = Arc::new(CoordinateMapper::new(config.camera, Arc::clone(&clock)));

        if !config.calibration_path.is_empty() {
            match mapper.load(Path::new(&config.calibration_path)) {
                Ok(_) => {}
                Err(CoordError::FileNotFound) => info!("No stored calibration, using defaults"),
                Err(e) => warn!("Stored calibration ignored: {e}"),
            }
        }

        let motion = MotionDetector::new(config.camera, config.motion, Arc::clone(&clock));
        let targeting = Targeting::new(
            config.targeting,
            config.tracker,
            Arc::clone(&safety),
            Arc::clone(&servo),
            Arc::clone(&mapper),
            Arc::clone(&clock),
        )
        .with_classifier(config.classifier);

        info!(
            "Turret assembled ({}x{} camera, lost timeout {} ms)",
            config.camera.width, config.camera.height, config.targeting.lost_timeout_ms
        );

        Ok(Self {
            config,
            clock,
            motion: Mutex::new(motion),
            laser,
            button,
            safety,
            servo,
            mapper,
            targeting,
            parked: AtomicBool::new(false),
        })
    }

    // ── Frame path ────────────────────────────────────────────

    /// Segment `frame`, hand the detections to targeting, then feed the
    /// watchdog.  A rejected frame does not feed it.
    pub fn process_frame(&self, frame: &Frame<'_>) -> Result<FrameReport> {
        let mut motion = DetectionResult::default();
        lock(&self.motion).detect(frame, &mut motion)?;
        let targeting = self.targeting.process_detections(&motion.detections);
        self.safety.feed_watchdog();
        Ok(FrameReport { motion, targeting })
    }

    // ── Periodic path ─────────────────────────────────────────

    pub fn tick(&self) -> TargetState {
        if self.laser.update() {
            warn!("Laser forced off by max on-time");
        }
        self.safety.update();
        if self.safety.is_safe_mode() {
            if !self.parked.swap(true, Ordering::SeqCst) {
                match self.servo.move_immediate(ServoPosition::HOME) {
                    Ok(_) => info!("Safe mode: servo parked at home"),
                    Err(e) => warn!("Safe mode: servo park failed: {e}"),
                }
            }
        } else {
            self.parked.store(false, Ordering::SeqCst);
        }
        if let Err(e) = self.servo.tick() {
            debug!("Servo tick: {e}");
        }
        self.targeting.update()
    }

    // ── Inputs ────────────────────────────────────────────────

    pub fn poll_button(&self, port: &mut impl ButtonPort) -> Option<ButtonEvent> {
        self.button.poll(port)
    }

    pub fn set_voltage(&self, mv: u32) {
        self.safety.set_voltage(mv);
    }

    // ── Lifecycle ─────────────────────────────────────────────

    pub fn save_calibration(&self) -> Result<()> {
        if self.config.calibration_path.is_empty() {
            return Err(Error::Config("no calibration path configured"));
        }
        self.mapper.save(Path::new(&self.config.calibration_path))?;
        Ok(())
    }

    /// Laser off and disarmed, turret homed and idle.
    pub fn shutdown(&self) {
        self.targeting.cleanup();
        self.button.disarm();
        info!("Turret shut down");
    }

    // ── Queries ───────────────────────────────────────────────

    pub fn telemetry(&self) -> TelemetrySnapshot {
        let targeting = self.targeting.stats();
        TelemetrySnapshot {
            timestamp_ms: self.clock.now_ms(),
            mode: self.button.mode(),
            safety_state: self.safety.state(),
            target_state: targeting.state,
            laser_state: self.laser.state(),
            target: self.targeting.current_target(),
            targeting,
            motion: lock(&self.motion).stats(),
            tracker: self.targeting.tracker_stats(),
            classifier: self.targeting.classifier_stats(),
            safety: self.safety.stats(),
            laser: self.laser.stats(),
            servo: self.servo.stats(),
            coord: self.mapper.stats(),
            button: self.button.stats(),
        }
    }

    pub fn config(&self) -> &TurretConfig {
        &self.config
    }

    pub fn targeting(&self) -> &Targeting {
        &self.targeting
    }

    pub fn safety(&self) -> &Arc<SafetyLayer> {
        &self.safety
    }

    pub fn button(&self) -> &Arc<ButtonHandler> {
        &self.button
    }

    pub fn laser(&self) -> &Arc<LaserController> {
        &self.laser
    }

    pub fn servo(&self) -> &Arc<ServoController> {
        &self.servo
    }

    pub fn mapper(&self) -> &Arc<CoordinateMapper> {
        &self.mapper
    }
}
