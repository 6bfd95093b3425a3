//! Pan/tilt servo axis model and controller.
//!
//! ## Axis limits
//!
//! | Axis | Range (deg)  | Center | Pulse (µs)  |
//! |------|--------------|--------|-------------|
//! | Pan  | -45 .. +45   | 0      | 1000 - 2000 |
//! | Tilt | -30 .. 0     | -15    | 1000 - 2000 |
//!
//! 0° tilt is horizontal, negative is downward.  Positive tilt would aim
//! the beam at the sky (and at people); [`clamp_angle`] and
//! [`is_angle_valid`] both make it unrepresentable, including for raw
//! axis ids that name no axis and for NaN inputs.
//!
//! Pulse conversion is linear between the axis' (min angle, min pulse) and
//! (max angle, max pulse) pairs, 50 Hz PWM frame.

use std::sync::{Arc, Mutex};

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use crate::app::ports::{Clock, ServoPort};
use crate::config::ServoConfig;
use crate::error::ServoError;
use crate::sync::lock;

pub const SERVO_PWM_FREQUENCY_HZ: u32 = 50;
pub const SERVO_PERIOD_US: u32 = 1_000_000 / SERVO_PWM_FREQUENCY_HZ;

/// Tolerance used by [`is_angle_valid`].
pub const ANGLE_EPSILON_DEG: f32 = 0.01;

/// Returned for unknown axis ids; inside both axis ranges.
pub const SAFE_DEFAULT_DEG: f32 = 0.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ServoAxis {
    Pan = 0,
    Tilt = 1,
}

/// Hard limits for one axis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisLimits {
    pub min_deg: f32,
    pub max_deg: f32,
    pub center_deg: f32,
    pub min_pulse_us: u32,
    pub max_pulse_us: u32,
}

const PAN_LIMITS: AxisLimits = AxisLimits {
    min_deg: -45.0,
    max_deg: 45.0,
    center_deg: 0.0,
    min_pulse_us: 1000,
    max_pulse_us: 2000,
};

const TILT_LIMITS: AxisLimits = AxisLimits {
    min_deg: -30.0,
    max_deg: 0.0,
    center_deg: -15.0,
    min_pulse_us: 1000,
    max_pulse_us: 2000,
};

impl ServoAxis {
    pub const ALL: [Self; 2] = [Self::Pan, Self::Tilt];

    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(Self::Pan),
            1 => Some(Self::Tilt),
            _ => None,
        }
    }

    pub const fn limits(self) -> AxisLimits {
        match self {
            Self::Pan => PAN_LIMITS,
            Self::Tilt => TILT_LIMITS,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Pan => "pan",
            Self::Tilt => "tilt",
        }
    }
}

impl TryFrom<u8> for ServoAxis {
    type Error = ServoError;

    fn try_from(id: u8) -> Result<Self, Self::Error> {
        Self::from_id(id).ok_or(ServoError::InvalidAxis(id))
    }
}

// ── Axis model (pure functions) ───────────────────────────────

/// Clamp `angle` into the axis range.  NaN maps to the axis center.
pub fn clamp_angle(axis: ServoAxis, angle: f32) -> f32 {
    let l = axis.limits();
    if angle.is_nan() {
        return l.center_deg;
    }
    angle.clamp(l.min_deg, l.max_deg)
}

/// `true` when `angle` already lies inside the axis range.
pub fn is_angle_valid(axis: ServoAxis, angle: f32) -> bool {
    !angle.is_nan() && (clamp_angle(axis, angle) - angle).abs() < ANGLE_EPSILON_DEG
}

/// [`clamp_angle`] for a raw axis id; unknown ids yield [`SAFE_DEFAULT_DEG`].
pub fn clamp_angle_by_id(axis_id: u8, angle: f32) -> f32 {
    ServoAxis::from_id(axis_id).map_or(SAFE_DEFAULT_DEG, |axis| clamp_angle(axis, angle))
}

/// [`is_angle_valid`] for a raw axis id; unknown ids are never valid.
pub fn is_angle_valid_by_id(axis_id: u8, angle: f32) -> bool {
    ServoAxis::from_id(axis_id).is_some_and(|axis| is_angle_valid(axis, angle))
}

/// Angle → pulse width (µs), clamping the angle first.
pub fn angle_to_pulse(axis: ServoAxis, angle: f32) -> u32 {
    let l = axis.limits();
    let angle = clamp_angle(axis, angle);
    let norm = (angle - l.min_deg) / (l.max_deg - l.min_deg);
    let span = (l.max_pulse_us - l.min_pulse_us) as f32;
    l.min_pulse_us + (norm * span).round() as u32
}

/// Pulse width (µs) → angle, clamping the pulse first.
pub fn pulse_to_angle(axis: ServoAxis, pulse_us: u32) -> f32 {
    let l = axis.limits();
    let pulse = pulse_us.clamp(l.min_pulse_us, l.max_pulse_us);
    let norm = (pulse - l.min_pulse_us) as f32 / (l.max_pulse_us - l.min_pulse_us) as f32;
    l.min_deg + norm * (l.max_deg - l.min_deg)
}

// ── Positions ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ServoPosition {
    pub pan_deg: f32,
    pub tilt_deg: f32,
}

impl ServoPosition {
    pub const HOME: Self = Self {
        pan_deg: PAN_LIMITS.center_deg,
        tilt_deg: TILT_LIMITS.center_deg,
    };

    pub const fn new(pan_deg: f32, tilt_deg: f32) -> Self {
        Self { pan_deg, tilt_deg }
    }

    /// Clamp both axes; the flag reports whether either axis moved.
    pub fn clamped(self) -> (Self, bool) {
        let out = Self {
            pan_deg: clamp_angle(ServoAxis::Pan, self.pan_deg),
            tilt_deg: clamp_angle(ServoAxis::Tilt, self.tilt_deg),
        };
        let changed = !is_angle_valid(ServoAxis::Pan, self.pan_deg)
            || !is_angle_valid(ServoAxis::Tilt, self.tilt_deg);
        (out, changed)
    }

    pub fn angle(&self, axis: ServoAxis) -> f32 {
        match axis {
            ServoAxis::Pan => self.pan_deg,
            ServoAxis::Tilt => self.tilt_deg,
        }
    }
}

impl Default for ServoPosition {
    fn default() -> Self {
        Self::HOME
    }
}

/// Outcome of a commanded move.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ServoMove {
    /// Position actually commanded (always within limits).
    pub position: ServoPosition,
    /// The request had to be clamped.
    pub clamped: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ServoStats {
    pub move_count: u32,
    pub clamp_count: u32,
    pub hardware_faults: u32,
    /// Moves that overran the stall deadline.
    pub stall_count: u32,
    pub current: ServoPosition,
    pub target: ServoPosition,
    pub is_moving: bool,
    pub hardware_ok: bool,
    /// Latched by repeated stalls; see [`ServoController::clear_failure`].
    pub failed: bool,
    pub uptime_ms: u64,
}

// ── Controller ────────────────────────────────────────────────

pub type ServoFailureListener = Arc<dyn Fn(ServoError) + Send + Sync>;

/// A move stalls when no step has landed for this many move times.
pub const STALL_FACTOR: u64 = 4;

/// Interpolated move in flight.
#[derive(Debug, Clone, Copy)]
struct Motion {
    from: ServoPosition,
    to: ServoPosition,
    step: u32,
    total_steps: u32,
    started_ms: u64,
    deadline_ms: u64,
}

impl Motion {
    fn at(&self, step: u32) -> ServoPosition {
        let t = step as f32 / self.total_steps as f32;
        ServoPosition::new(
            self.from.pan_deg + t * (self.to.pan_deg - self.from.pan_deg),
            self.from.tilt_deg + t * (self.to.tilt_deg - self.from.tilt_deg),
        )
    }
}

struct ServoInner {
    port: Box<dyn ServoPort>,
    config: ServoConfig,
    position: ServoPosition,
    target: ServoPosition,
    motion: Option<Motion>,
    move_count: u32,
    clamp_count: u32,
    hardware_faults: u32,
    stall_count: u32,
    consecutive_stalls: u32,
    hardware_ok: bool,
    failed: bool,
    on_failure: Option<ServoFailureListener>,
}

impl ServoInner {
    fn count_move(&mut self, clamped: bool) {
        self.move_count = self.move_count.saturating_add(1);
        if clamped {
            self.clamp_count = self.clamp_count.saturating_add(1);
        }
    }

    /// Write both pulses.  The position only changes when both land.
    fn write(&mut self, position: ServoPosition) -> Result<(), ServoError> {
        for axis in ServoAxis::ALL {
            let pulse = angle_to_pulse(axis, position.angle(axis));
            if let Err(e) = self.port.set_pulse_width(axis, pulse) {
                self.hardware_faults = self.hardware_faults.saturating_add(1);
                if self.hardware_ok {
                    error!("SERVO FAULT: {} write failed: {e}", axis.name());
                }
                self.hardware_ok = false;
                return Err(e);
            }
        }
        self.position = position;
        self.hardware_ok = true;
        Ok(())
    }

    /// Write the newest step that is due at `now_ms`.
    fn advance(&mut self, now_ms: u64) -> Result<(), ServoError> {
        let Some(mut motion) = self.motion else {
            return Ok(());
        };
        let elapsed = now_ms.saturating_sub(motion.started_ms);
        let due = (elapsed / self.config.step_ms) as u32;
        let due = due.min(motion.total_steps);
        if due <= motion.step {
            return Ok(());
        }
        self.write(motion.at(due))?;
        motion.step = due;
        motion.deadline_ms = now_ms.saturating_add(self.stall_limit_ms());
        if due == motion.total_steps {
            // Exact target, no interpolation rounding left over.
            self.position = motion.to;
            self.motion = None;
            self.consecutive_stalls = 0;
            debug!(
                "Servo move complete ({:.1}, {:.1})",
                motion.to.pan_deg, motion.to.tilt_deg
            );
        } else {
            self.motion = Some(motion);
        }
        Ok(())
    }

    /// Count an overrun; returns `true` when it latches the failure.
    fn check_stall(&mut self, now_ms: u64) -> bool {
        let limit = self.stall_limit_ms();
        let Some(motion) = self.motion.as_mut() else {
            return false;
        };
        if now_ms <= motion.deadline_ms {
            return false;
        }
        motion.deadline_ms = now_ms.saturating_add(limit);
        self.stall_count = self.stall_count.saturating_add(1);
        self.consecutive_stalls = self.consecutive_stalls.saturating_add(1);
        warn!(
            "Servo move overran {} ms ({} of {} stalls)",
            limit, self.consecutive_stalls, self.config.max_consecutive_stalls
        );
        if self.consecutive_stalls < self.config.max_consecutive_stalls {
            return false;
        }
        error!("SERVO FAILURE: movement timeout exceeded");
        self.failed = true;
        self.motion = None;
        true
    }

    fn stall_limit_ms(&self) -> u64 {
        self.config.move_time_ms.saturating_mul(STALL_FACTOR)
    }
}

/// Thread-safe owner of the servo hardware port.
///
/// [`move_to`](Self::move_to) only records a motion; [`tick`](Self::tick)
/// walks it to the target in `move_time / step` linear steps and watches
/// for motions that stop making progress.  A replacing move inherits the
/// stall deadline of the one it cancels, so a stream of retargets over
/// dead hardware still stalls.  `max_consecutive_stalls` overruns in a
/// row latch the controller as failed and call the failure listener
/// after the lock is released.
pub struct ServoController {
    inner: Mutex<ServoInner>,
    clock: Arc<dyn Clock>,
    started_ms: u64,
}

impl ServoController {
    /// Take ownership of `port` with the default motion profile and
    /// command the home position.
    pub fn new(port: Box<dyn ServoPort>, clock: Arc<dyn Clock>) -> Self {
        Self::with_config(port, ServoConfig::default(), clock)
    }

    pub fn with_config(port: Box<dyn ServoPort>, config: ServoConfig, clock: Arc<dyn Clock>) -> Self {
        let config = config.sanitized();
        let started_ms = clock.now_ms();
        let controller = Self {
            inner: Mutex::new(ServoInner {
                port,
                config,
                position: ServoPosition::HOME,
                target: ServoPosition::HOME,
                motion: None,
                move_count: 0,
                clamp_count: 0,
                hardware_faults: 0,
                stall_count: 0,
                consecutive_stalls: 0,
                hardware_ok: true,
                failed: false,
                on_failure: None,
            }),
            clock,
            started_ms,
        };
        {
            let mut inner = lock(&controller.inner);
            if let Err(e) = inner.write(ServoPosition::HOME) {
                warn!("Servo home on startup failed: {e}");
            }
            inner.count_move(false);
        }
        debug!(
            "Servo ready ({} ms moves in {} steps)",
            config.move_time_ms,
            config.steps()
        );
        controller
    }

    /// Clamp `requested` and start an interpolated move towards it from
    /// the current position, replacing any move in flight.  With a zero
    /// move time the pulses are written at once.
    pub fn move_to(&self, requested: ServoPosition) -> Result<ServoMove, ServoError> {
        let (position, clamped) = clamp_request(requested);
        let now = self.clock.now_ms();
        let mut inner = lock(&self.inner);
        if inner.failed {
            return Err(ServoError::Stalled);
        }
        inner.count_move(clamped);
        inner.target = position;
        if inner.config.move_time_ms == 0 {
            inner.motion = None;
            inner.write(position)?;
        } else {
            let deadline_ms = match inner.motion {
                Some(in_flight) => in_flight.deadline_ms,
                None => now.saturating_add(inner.stall_limit_ms()),
            };
            inner.motion = Some(Motion {
                from: inner.position,
                to: position,
                step: 0,
                total_steps: inner.config.steps(),
                started_ms: now,
                deadline_ms,
            });
        }
        Ok(ServoMove { position, clamped })
    }

    /// Cancel any move in flight and write `requested` straight away.
    /// Allowed while failed so a faulted turret can still be parked.
    pub fn move_immediate(&self, requested: ServoPosition) -> Result<ServoMove, ServoError> {
        let (position, clamped) = clamp_request(requested);
        let mut inner = lock(&self.inner);
        inner.motion = None;
        inner.count_move(clamped);
        inner.target = position;
        inner.write(position)?;
        debug!("Servo jump to ({:.1}, {:.1})", position.pan_deg, position.tilt_deg);
        Ok(ServoMove { position, clamped })
    }

    /// Move a single axis, keeping the other at its current target.
    pub fn move_axis(&self, axis: ServoAxis, angle: f32) -> Result<ServoMove, ServoError> {
        let mut target = self.target();
        match axis {
            ServoAxis::Pan => target.pan_deg = angle,
            ServoAxis::Tilt => target.tilt_deg = angle,
        }
        self.move_to(target)
    }

    pub fn home(&self) -> Result<ServoMove, ServoError> {
        self.move_to(ServoPosition::HOME)
    }

    /// Advance the move in flight and run the stall check.
    pub fn tick(&self) -> Result<(), ServoError> {
        let now = self.clock.now_ms();
        let (result, listener) = {
            let mut inner = lock(&self.inner);
            let result = inner.advance(now);
            let latched = inner.check_stall(now);
            (result, if latched { inner.on_failure.clone() } else { None })
        };
        if let Some(f) = listener {
            f(ServoError::Stalled);
        }
        if self.is_failed() {
            return Err(ServoError::Stalled);
        }
        result
    }

    /// Last position written to the hardware.
    pub fn position(&self) -> ServoPosition {
        lock(&self.inner).position
    }

    /// Position the current (or last) move is heading for.
    pub fn target(&self) -> ServoPosition {
        lock(&self.inner).target
    }

    pub fn is_moving(&self) -> bool {
        lock(&self.inner).motion.is_some()
    }

    pub fn is_hardware_ok(&self) -> bool {
        let inner = lock(&self.inner);
        inner.hardware_ok && !inner.failed
    }

    pub fn is_failed(&self) -> bool {
        lock(&self.inner).failed
    }

    /// Operator acknowledgement of a stall failure.
    pub fn clear_failure(&self) {
        let mut inner = lock(&self.inner);
        if inner.failed {
            info!("Servo failure cleared");
        }
        inner.failed = false;
        inner.consecutive_stalls = 0;
    }

    pub fn set_failure_listener(&self, f: impl Fn(ServoError) + Send + Sync + 'static) {
        lock(&self.inner).on_failure = Some(Arc::new(f));
    }

    pub fn stats(&self) -> ServoStats {
        let inner = lock(&self.inner);
        ServoStats {
            move_count: inner.move_count,
            clamp_count: inner.clamp_count,
            hardware_faults: inner.hardware_faults,
            stall_count: inner.stall_count,
            current: inner.position,
            target: inner.target,
            is_moving: inner.motion.is_some(),
            hardware_ok: inner.hardware_ok,
            failed: inner.failed,
            uptime_ms: self.clock.now_ms().saturating_sub(self.started_ms),
        }
    }
}

fn clamp_request(requested: ServoPosition) -> (ServoPosition, bool) {
    let (position, clamped) = requested.clamped();
    if clamped {
        debug!(
            "Servo request ({:.1}, {:.1}) clamped to ({:.1}, {:.1})",
            requested.pan_deg, requested.tilt_deg, position.pan_deg, position.tilt_deg
        );
    }
    (position, clamped)
}
