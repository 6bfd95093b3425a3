//! Safety layer: the only path by which the laser may be switched on.
//!
//! Every `laser_on` request re-evaluates all interlocks.  Any failure
//! forces the laser off before the error is returned, so the system
//! always degrades toward "laser off".
//!
//! ## Checks (priority order)
//!
//! | Check       | Fails when                                             |
//! |-------------|--------------------------------------------------------|
//! | Armed       | Button mode is not Armed                               |
//! | Detection   | No active detection has been reported                  |
//! | Tilt        | Last validated tilt is upward, NaN, or never validated |
//! | Time        | Continuous on-time reached `max_continuous_on_ms`      |
//! | KillSwitch  | Laser kill switch engaged                              |
//! | Watchdog    | No feed within `watchdog_timeout_ms`                   |
//! | Brownout    | 0 < supply voltage < `voltage_min_mv`                  |
//!
//! A single failure is reported as its own `SafetyError`; two or more
//! collapse into `SafetyError::Multiple` with the breakdown in
//! [`SafetyResult::failed`].
//!
//! ## States
//!
//! ```text
//!   Normal ──watchdog warning──► Warning ──feed──► Normal
//!     │                            │
//!     ├──kill switch──► Emergency ─┘ (cleared ⇒ Normal)
//!     │
//!     └──watchdog expiry / enter_safe_mode──► SafeMode ──reset()──► Normal
//! ```
//!
//! SafeMode is sticky: every check fails with `SafeMode` until `reset()`.
//! Entering it latches the laser kill switch and disarms the button.

use core::fmt;
use std::sync::{Arc, Mutex};

use heapless::Vec as HVec;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use crate::app::ports::Clock;
use crate::config::SafetyConfig;
use crate::drivers::button::ButtonHandler;
use crate::drivers::laser::LaserController;
use crate::error::SafetyError;
use crate::sync::lock;

// ── Check masks ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SafetyCheck {
    Armed = 1 << 0,
    Detection = 1 << 1,
    Tilt = 1 << 2,
    Time = 1 << 3,
    KillSwitch = 1 << 4,
    Watchdog = 1 << 5,
    Brownout = 1 << 6,
}

impl SafetyCheck {
    /// All checks, highest priority first.
    pub const PRIORITY: [Self; 7] = [
        Self::Armed,
        Self::Detection,
        Self::Tilt,
        Self::Time,
        Self::KillSwitch,
        Self::Watchdog,
        Self::Brownout,
    ];

    pub const fn mask(self) -> u8 {
        self as u8
    }

    pub const fn error(self) -> SafetyError {
        match self {
            Self::Armed => SafetyError::NotArmed,
            Self::Detection => SafetyError::NoDetection,
            Self::Tilt => SafetyError::TiltUpward,
            Self::Time => SafetyError::TimeExceeded,
            Self::KillSwitch => SafetyError::KillSwitch,
            Self::Watchdog => SafetyError::Watchdog,
            Self::Brownout => SafetyError::Brownout,
        }
    }
}

impl fmt::Display for SafetyCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Armed => "ARMED",
            Self::Detection => "DETECTION",
            Self::Tilt => "TILT",
            Self::Time => "TIME",
            Self::KillSwitch => "KILL_SWITCH",
            Self::Watchdog => "WATCHDOG",
            Self::Brownout => "BROWNOUT",
        };
        f.write_str(name)
    }
}

/// Set of [`SafetyCheck`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize)]
pub struct SafetyChecks(u8);

impl SafetyChecks {
    pub const NONE: Self = Self(0);
    pub const ALL: Self = Self(0x7F);

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits & Self::ALL.0)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, check: SafetyCheck) -> bool {
        self.0 & check.mask() != 0
    }

    pub fn insert(&mut self, check: SafetyCheck) {
        self.0 |= check.mask();
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn count(self) -> u32 {
        self.0.count_ones()
    }

    /// Members in priority order.
    pub fn iter(self) -> impl Iterator<Item = SafetyCheck> {
        SafetyCheck::PRIORITY.into_iter().filter(move |c| self.contains(*c))
    }
}

impl From<SafetyCheck> for SafetyChecks {
    fn from(check: SafetyCheck) -> Self {
        Self(check.mask())
    }
}

impl core::ops::BitOr for SafetyChecks {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl core::ops::BitOr<SafetyCheck> for SafetyChecks {
    type Output = Self;
    fn bitor(self, rhs: SafetyCheck) -> Self {
        Self(self.0 | rhs.mask())
    }
}

impl core::ops::BitOr for SafetyCheck {
    type Output = SafetyChecks;
    fn bitor(self, rhs: Self) -> SafetyChecks {
        SafetyChecks(self.mask() | rhs.mask())
    }
}

// ── State & results ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SafetyState {
    Normal,
    Warning,
    SafeMode,
    Emergency,
}

impl fmt::Display for SafetyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Normal => "NORMAL",
            Self::Warning => "WARNING",
            Self::SafeMode => "SAFE_MODE",
            Self::Emergency => "EMERGENCY",
        };
        f.write_str(name)
    }
}

/// Outcome of a safety evaluation with every raw sub-result.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SafetyResult {
    pub status: Result<(), SafetyError>,
    pub failed: SafetyChecks,
    pub is_armed: bool,
    pub detection_active: bool,
    /// Last validated tilt, if any.
    pub tilt_deg: Option<f32>,
    pub tilt_safe: bool,
    pub kill_switch_engaged: bool,
    pub watchdog_remaining_ms: u64,
    pub voltage_mv: u32,
    pub brownout: bool,
    pub continuous_on_ms: u64,
}

impl SafetyResult {
    pub fn is_safe(&self) -> bool {
        self.status.is_ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SafetyStats {
    pub checks_performed: u32,
    pub checks_passed: u32,
    pub checks_failed: u32,
    pub armed_failures: u32,
    pub detection_failures: u32,
    pub tilt_failures: u32,
    pub time_failures: u32,
    pub kill_switch_failures: u32,
    pub watchdog_failures: u32,
    pub brownout_failures: u32,
    pub safe_mode_entries: u32,
    pub watchdog_warnings: u32,
    pub voltage_warnings: u32,
    pub forced_off_count: u32,
    pub uptime_ms: u64,
}

impl SafetyStats {
    fn bump(&mut self, check: SafetyCheck) {
        let counter = match check {
            SafetyCheck::Armed => &mut self.armed_failures,
            SafetyCheck::Detection => &mut self.detection_failures,
            SafetyCheck::Tilt => &mut self.tilt_failures,
            SafetyCheck::Time => &mut self.time_failures,
            SafetyCheck::KillSwitch => &mut self.kill_switch_failures,
            SafetyCheck::Watchdog => &mut self.watchdog_failures,
            SafetyCheck::Brownout => &mut self.brownout_failures,
        };
        *counter = counter.saturating_add(1);
    }
}

pub type StateListener = Arc<dyn Fn(SafetyState, SafetyState) + Send + Sync>;
pub type FailureListener = Arc<dyn Fn(SafetyError) + Send + Sync>;
pub type WatchdogListener = Arc<dyn Fn(u64) + Send + Sync>;

#[derive(Clone, Copy)]
enum Notice {
    State(SafetyState, SafetyState),
    Failure(SafetyError),
    WatchdogWarning(u64),
}

type Notices = HVec<Notice, 8>;

struct SafetyInner {
    config: SafetyConfig,
    state: SafetyState,
    detection_active: bool,
    tilt_deg: Option<f32>,
    last_feed_ms: u64,
    watchdog_warned: bool,
    voltage_mv: u32,
    voltage_warned: bool,
    pulse_deadline_ms: Option<u64>,
    stats: SafetyStats,
    on_state: Option<StateListener>,
    on_failure: Option<FailureListener>,
    on_watchdog: Option<WatchdogListener>,
}

impl SafetyInner {
    fn set_state(&mut self, new: SafetyState, notices: &mut Notices) {
        let old = self.state;
        if old == new {
            return;
        }
        self.state = new;
        if new == SafetyState::SafeMode || new == SafetyState::Emergency {
            error!("Safety state: {old} -> {new}");
        } else {
            info!("Safety state: {old} -> {new}");
        }
        let _ = notices.push(Notice::State(old, new));
    }

    fn is_brownout(&self) -> bool {
        self.voltage_mv > 0 && self.voltage_mv < self.config.voltage_min_mv
    }

    fn is_voltage_warning(&self) -> bool {
        self.voltage_mv > 0 && self.voltage_mv < self.config.voltage_warning_mv
    }

    fn watchdog_remaining(&self, now: u64) -> u64 {
        let elapsed = now.saturating_sub(self.last_feed_ms);
        self.config.watchdog_timeout_ms.saturating_sub(elapsed)
    }
}

type Listeners = (Option<StateListener>, Option<FailureListener>, Option<WatchdogListener>);

pub struct SafetyLayer {
    inner: Mutex<SafetyInner>,
    laser: Arc<LaserController>,
    button: Arc<ButtonHandler>,
    clock: Arc<dyn Clock>,
    started_ms: u64,
}

impl SafetyLayer {
    pub fn new(
        config: SafetyConfig,
        clock: Arc<dyn Clock>,
        laser: Arc<LaserController>,
        button: Arc<ButtonHandler>,
    ) -> Self {
        let config = config.sanitized();
        let now = clock.now_ms();
        info!(
            "Safety layer initialized (watchdog={} ms, brownout<{} mV)",
            config.watchdog_timeout_ms, config.voltage_min_mv
        );
        Self {
            inner: Mutex::new(SafetyInner {
                config,
                state: SafetyState::Normal,
                detection_active: false,
                tilt_deg: None,
                last_feed_ms: now,
                watchdog_warned: false,
                voltage_mv: 0,
                voltage_warned: false,
                pulse_deadline_ms: None,
                stats: SafetyStats::default(),
                on_state: None,
                on_failure: None,
                on_watchdog: None,
            }),
            laser,
            button,
            clock,
            started_ms: now,
        }
    }

    // ── Checks ────────────────────────────────────────────────

    pub fn check_all(&self) -> SafetyResult {
        self.check(SafetyChecks::ALL)
    }

    /// Evaluate the checks in `mask`.  The raw sub-results cover every
    /// check regardless of the mask.
    pub fn check(&self, mask: SafetyChecks) -> SafetyResult {
        self.with_notices(|this, inner, now, notices| this.evaluate(inner, mask, now, notices))
    }

    // ── Laser wrappers ────────────────────────────────────────

    /// Switch the laser on if every check passes.  Any failure, including
    /// a refusal from the laser itself, leaves the laser off.
    pub fn laser_on(&self) -> Result<(), SafetyError> {
        self.with_notices(|this, inner, now, notices| this.laser_on_locked(inner, now, notices))
    }

    pub fn laser_off(&self) -> Result<(), SafetyError> {
        let mut inner = lock(&self.inner);
        inner.pulse_deadline_ms = None;
        self.laser.off();
        Ok(())
    }

    /// Fire a bounded pulse that [`update`](Self::update) ends.  Returns
    /// the granted duration, capped at `max_activation_ms`.
    pub fn laser_activate(&self, duration_ms: u64) -> Result<u64, SafetyError> {
        self.with_notices(|this, inner, now, notices| {
            let granted = duration_ms.min(inner.config.max_activation_ms);
            this.laser_on_locked(inner, now, notices)?;
            inner.pulse_deadline_ms = Some(now.saturating_add(granted));
            debug!("Laser pulse for {granted} ms");
            Ok(granted)
        })
    }

    // ── Safe mode ─────────────────────────────────────────────

    pub fn enter_safe_mode(&self) {
        if self.with_notices(|this, inner, _now, notices| this.enter_safe_mode_locked(inner, notices)) {
            self.button.disarm();
        }
    }

    pub fn is_safe_mode(&self) -> bool {
        lock(&self.inner).state == SafetyState::SafeMode
    }

    /// Leave SafeMode/Emergency: re-feeds the watchdog, resets the laser
    /// kill switch and clears a button emergency.  The turret stays
    /// disarmed until the operator arms it again.
    pub fn reset(&self) {
        self.with_notices(|_this, inner, now, notices| {
            inner.last_feed_ms = now;
            inner.watchdog_warned = false;
            inner.pulse_deadline_ms = None;
            inner.set_state(SafetyState::Normal, notices);
        });
        self.laser.reset_kill_switch();
        self.button.clear_emergency();
        info!("Safety layer reset");
    }

    // ── Inputs ────────────────────────────────────────────────

    pub fn feed_watchdog(&self) {
        self.with_notices(|_this, inner, now, notices| {
            inner.last_feed_ms = now;
            inner.watchdog_warned = false;
            if inner.state == SafetyState::Warning {
                inner.set_state(SafetyState::Normal, notices);
            }
        });
    }

    /// Record the commanded tilt.  Anything but a finite non-positive
    /// angle is rejected and turns the laser off.
    pub fn validate_tilt(&self, tilt_deg: f32) -> Result<(), SafetyError> {
        self.with_notices(|this, inner, _now, notices| {
            inner.tilt_deg = Some(tilt_deg);
            if tilt_deg <= 0.0 {
                return Ok(());
            }
            inner.stats.bump(SafetyCheck::Tilt);
            error!("SAFETY: upward tilt {tilt_deg} deg rejected");
            this.force_off(inner);
            let _ = notices.push(Notice::Failure(SafetyError::TiltUpward));
            Err(SafetyError::TiltUpward)
        })
    }

    pub fn set_detection_active(&self, active: bool) {
        lock(&self.inner).detection_active = active;
    }

    pub fn is_detection_active(&self) -> bool {
        lock(&self.inner).detection_active
    }

    /// Push a supply voltage reading; 0 means "no reading".
    pub fn set_voltage(&self, mv: u32) {
        let mut inner = lock(&self.inner);
        let was_brownout = inner.is_brownout();
        inner.voltage_mv = mv;
        if inner.is_voltage_warning() {
            if !inner.voltage_warned {
                inner.stats.voltage_warnings = inner.stats.voltage_warnings.saturating_add(1);
                warn!("Supply voltage low: {mv} mV");
            }
            inner.voltage_warned = true;
        } else {
            inner.voltage_warned = false;
        }
        if inner.is_brownout() && !was_brownout {
            error!("BROWNOUT: {mv} mV < {} mV", inner.config.voltage_min_mv);
        } else if was_brownout && !inner.is_brownout() {
            info!("Brownout cleared ({mv} mV)");
        }
    }

    pub fn is_voltage_warning(&self) -> bool {
        lock(&self.inner).is_voltage_warning()
    }

    pub fn is_brownout(&self) -> bool {
        lock(&self.inner).is_brownout()
    }

    pub fn watchdog_remaining_ms(&self) -> u64 {
        let now = self.clock.now_ms();
        lock(&self.inner).watchdog_remaining(now)
    }

    pub fn state(&self) -> SafetyState {
        lock(&self.inner).state
    }

    pub fn stats(&self) -> SafetyStats {
        let mut stats = lock(&self.inner).stats;
        stats.uptime_ms = self.clock.now_ms().saturating_sub(self.started_ms);
        stats
    }

    // ── Periodic ──────────────────────────────────────────────

    /// Time-driven supervision: watchdog, pulse expiry, auto-off,
    /// brownout cut-off and kill-switch mirroring.
    pub fn update(&self) {
        let entered_safe_mode = self.with_notices(|this, inner, now, notices| {
            let mut entered = false;
            if inner.state != SafetyState::SafeMode {
                let remaining = inner.watchdog_remaining(now);
                let elapsed = now.saturating_sub(inner.last_feed_ms);
                if remaining == 0 {
                    error!("SAFETY: watchdog expired ({elapsed} ms without feed)");
                    entered = this.enter_safe_mode_locked(inner, notices);
                } else if elapsed >= inner.config.watchdog_warning_ms && !inner.watchdog_warned {
                    inner.watchdog_warned = true;
                    inner.stats.watchdog_warnings = inner.stats.watchdog_warnings.saturating_add(1);
                    warn!("Watchdog warning: {remaining} ms remaining");
                    let _ = notices.push(Notice::WatchdogWarning(remaining));
                    if inner.state == SafetyState::Normal {
                        inner.set_state(SafetyState::Warning, notices);
                    }
                }
            }

            if inner.pulse_deadline_ms.is_some_and(|d| now >= d) {
                inner.pulse_deadline_ms = None;
                this.laser.off();
                debug!("Laser pulse expired");
            }

            if this.laser.is_active() && this.laser.current_on_time_ms() >= inner.config.auto_off_ms {
                inner.stats.bump(SafetyCheck::Time);
                warn!("SAFETY: laser auto-off after {} ms", this.laser.current_on_time_ms());
                this.force_off(inner);
            }

            if inner.is_brownout() && this.laser.is_active() {
                warn!("SAFETY: brownout, laser forced off");
                this.force_off(inner);
            }

            let kill = this.laser.is_kill_switch_engaged();
            match inner.state {
                SafetyState::Normal | SafetyState::Warning if kill => {
                    inner.set_state(SafetyState::Emergency, notices);
                }
                SafetyState::Emergency if !kill => inner.set_state(SafetyState::Normal, notices),
                _ => {}
            }
            entered
        });
        if entered_safe_mode {
            self.button.disarm();
        }
    }

    // ── Observers ─────────────────────────────────────────────

    pub fn set_state_listener(&self, f: impl Fn(SafetyState, SafetyState) + Send + Sync + 'static) {
        lock(&self.inner).on_state = Some(Arc::new(f));
    }

    pub fn set_failure_listener(&self, f: impl Fn(SafetyError) + Send + Sync + 'static) {
        lock(&self.inner).on_failure = Some(Arc::new(f));
    }

    pub fn set_watchdog_warning_listener(&self, f: impl Fn(u64) + Send + Sync + 'static) {
        lock(&self.inner).on_watchdog = Some(Arc::new(f));
    }

    pub fn clear_listeners(&self) {
        let mut inner = lock(&self.inner);
        inner.on_state = None;
        inner.on_failure = None;
        inner.on_watchdog = None;
    }

    // ── Internal ──────────────────────────────────────────────

    /// Run `f` under the lock, then deliver the queued notices unlocked.
    fn with_notices<R>(
        &self,
        f: impl FnOnce(&Self, &mut SafetyInner, u64, &mut Notices) -> R,
    ) -> R {
        let now = self.clock.now_ms();
        let mut notices = Notices::new();
        let (result, listeners) = {
            let mut inner = lock(&self.inner);
            let result = f(self, &mut *inner, now, &mut notices);
            let listeners: Listeners = (
                inner.on_state.clone(),
                inner.on_failure.clone(),
                inner.on_watchdog.clone(),
            );
            (result, listeners)
        };
        Self::notify(&listeners, &notices);
        result
    }

    fn notify(listeners: &Listeners, notices: &Notices) {
        let (on_state, on_failure, on_watchdog) = listeners;
        for notice in notices {
            match *notice {
                Notice::State(old, new) => {
                    if let Some(f) = on_state {
                        f(old, new);
                    }
                }
                Notice::Failure(e) => {
                    if let Some(f) = on_failure {
                        f(e);
                    }
                }
                Notice::WatchdogWarning(remaining) => {
                    if let Some(f) = on_watchdog {
                        f(remaining);
                    }
                }
            }
        }
    }

    fn evaluate(
        &self,
        inner: &mut SafetyInner,
        mask: SafetyChecks,
        now: u64,
        notices: &mut Notices,
    ) -> SafetyResult {
        let is_armed = self.button.is_armed();
        let continuous_on_ms = self.laser.current_on_time_ms();
        let kill_switch_engaged = self.laser.is_kill_switch_engaged();
        let watchdog_remaining_ms = inner.watchdog_remaining(now);
        let tilt_safe = inner.tilt_deg.is_some_and(|t| t <= 0.0);
        let brownout = inner.is_brownout();

        let mut result = SafetyResult {
            status: Ok(()),
            failed: SafetyChecks::NONE,
            is_armed,
            detection_active: inner.detection_active,
            tilt_deg: inner.tilt_deg,
            tilt_safe,
            kill_switch_engaged,
            watchdog_remaining_ms,
            voltage_mv: inner.voltage_mv,
            brownout,
            continuous_on_ms,
        };
        inner.stats.checks_performed = inner.stats.checks_performed.saturating_add(1);

        if inner.state == SafetyState::SafeMode {
            result.status = Err(SafetyError::SafeMode);
            result.failed = mask;
            inner.stats.checks_failed = inner.stats.checks_failed.saturating_add(1);
            let _ = notices.push(Notice::Failure(SafetyError::SafeMode));
            return result;
        }

        for check in mask.iter() {
            let passed = match check {
                SafetyCheck::Armed => is_armed,
                SafetyCheck::Detection => inner.detection_active,
                SafetyCheck::Tilt => tilt_safe,
                SafetyCheck::Time => continuous_on_ms < inner.config.max_continuous_on_ms,
                SafetyCheck::KillSwitch => !kill_switch_engaged,
                SafetyCheck::Watchdog => watchdog_remaining_ms > 0,
                SafetyCheck::Brownout => !brownout,
            };
            if !passed {
                result.failed.insert(check);
                inner.stats.bump(check);
                debug!("Safety check failed: {check}");
            }
        }

        result.status = match result.failed.count() {
            0 => Ok(()),
            1 => Err(result.failed.iter().next().map_or(SafetyError::Multiple, SafetyCheck::error)),
            _ => Err(SafetyError::Multiple),
        };
        match result.status {
            Ok(()) => inner.stats.checks_passed = inner.stats.checks_passed.saturating_add(1),
            Err(e) => {
                inner.stats.checks_failed = inner.stats.checks_failed.saturating_add(1);
                let _ = notices.push(Notice::Failure(e));
            }
        }
        result
    }

    fn laser_on_locked(
        &self,
        inner: &mut SafetyInner,
        now: u64,
        notices: &mut Notices,
    ) -> Result<(), SafetyError> {
        let result = self.evaluate(inner, SafetyChecks::ALL, now, notices);
        if let Err(e) = result.status {
            self.force_off(inner);
            return Err(e);
        }
        if let Err(e) = self.laser.on() {
            warn!("Laser refused activation: {e}");
            self.force_off(inner);
            let err = SafetyError::Laser(e);
            let _ = notices.push(Notice::Failure(err));
            return Err(err);
        }
        Ok(())
    }

    /// Laser off and kill switch latched.  The caller disarms the button
    /// once the lock is released.
    fn enter_safe_mode_locked(&self, inner: &mut SafetyInner, notices: &mut Notices) -> bool {
        if inner.state == SafetyState::SafeMode {
            return false;
        }
        inner.stats.safe_mode_entries = inner.stats.safe_mode_entries.saturating_add(1);
        self.force_off(inner);
        self.laser.kill_switch();
        inner.set_state(SafetyState::SafeMode, notices);
        warn!("SAFE MODE: manual reset required");
        true
    }

    fn force_off(&self, inner: &mut SafetyInner) {
        inner.pulse_deadline_ms = None;
        if self.laser.is_active() {
            inner.stats.forced_off_count = inner.stats.forced_off_count.saturating_add(1);
        }
        self.laser.off();
    }
}
