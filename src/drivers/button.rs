//! Debounced arming button with short/long press gestures and undo.
//!
//! ## Hardware
//!
//! Momentary switch sampled by the control loop ([`ButtonHandler::poll`]
//! or [`ButtonHandler::update`] with the raw level).  Debounce, gesture
//! classification and mode derivation all happen here.
//!
//! ## Gesture detection
//!
//! | Gesture      | Condition                                  | Effect                       |
//! |-------------|---------------------------------------------|------------------------------|
//! | Short press | Release after < `short_press_max_ms`        | Disarmed ⇄ Armed, or Undo    |
//! | Long press  | Held ≥ `long_press_ms`                      | EmergencyStop                |
//! | Medium      | Anything in between                         | Ignored (counted)            |
//!
//! A short press within `undo_window_ms` of the previous short-press
//! toggle reverts that toggle and emits [`ButtonEvent::Undo`].  A short
//! press in EmergencyStop clears it to Disarmed.
//!
//! Every mode change is propagated to the laser controller (arm, disarm,
//! kill switch) under the button lock; observers run after it is released.

use std::sync::{Arc, Mutex};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::app::ports::{BuzzerPort, ButtonPort, Clock};
use crate::config::ButtonConfig;
use crate::drivers::laser::LaserController;
use crate::sync::lock;

const BUZZER_ARM: (u32, u32) = (1000, 100);
const BUZZER_DISARM: (u32, u32) = (500, 200);
const BUZZER_EMERGENCY: (u32, u32) = (2000, 500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SystemMode {
    Disarmed,
    Armed,
    EmergencyStop,
}

impl SystemMode {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Disarmed => "DISARMED",
            Self::Armed => "ARMED",
            Self::EmergencyStop => "EMERGENCY_STOP",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ButtonState {
    Released,
    Pressed,
    /// Held past the long-press threshold; the release is swallowed.
    Held,
}

/// Classified press, delivered to the event observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ButtonEvent {
    ShortPress,
    LongPress,
    Undo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ButtonStats {
    pub short_press_count: u32,
    pub long_press_count: u32,
    pub undo_count: u32,
    pub ignored_press_count: u32,
    pub debounce_reject_count: u32,
    pub arm_count: u32,
    pub disarm_count: u32,
    pub emergency_count: u32,
    pub uptime_ms: u64,
}

pub type ModeListener = Arc<dyn Fn(SystemMode, SystemMode) + Send + Sync>;
pub type EventListener = Arc<dyn Fn(ButtonEvent) + Send + Sync>;

#[derive(Clone, Copy)]
struct PendingUndo {
    toggled_at_ms: u64,
    revert_to: SystemMode,
}

struct ButtonInner {
    config: ButtonConfig,
    state: ButtonState,
    raw_pressed: bool,
    last_edge_ms: Option<u64>,
    press_start_ms: u64,
    mode: SystemMode,
    undo: Option<PendingUndo>,
    stats: ButtonStats,
    buzzer: Option<Box<dyn BuzzerPort>>,
    on_mode: Option<ModeListener>,
    on_event: Option<EventListener>,
}

/// Deferred observer work collected under the lock.
#[derive(Default)]
struct Notices {
    event: Option<ButtonEvent>,
    mode_change: Option<(SystemMode, SystemMode)>,
}

pub struct ButtonHandler {
    inner: Mutex<ButtonInner>,
    laser: Option<Arc<LaserController>>,
    clock: Arc<dyn Clock>,
    started_ms: u64,
}

impl ButtonHandler {
    /// Starts Disarmed and Released.  `laser` receives every mode change.
    pub fn new(
        config: ButtonConfig,
        clock: Arc<dyn Clock>,
        laser: Option<Arc<LaserController>>,
    ) -> Self {
        let started_ms = clock.now_ms();
        Self {
            inner: Mutex::new(ButtonInner {
                config: config.sanitized(),
                state: ButtonState::Released,
                raw_pressed: false,
                last_edge_ms: None,
                press_start_ms: 0,
                mode: SystemMode::Disarmed,
                undo: None,
                stats: ButtonStats::default(),
                buzzer: None,
                on_mode: None,
                on_event: None,
            }),
            laser,
            clock,
            started_ms,
        }
    }

    pub fn with_buzzer(self, buzzer: Box<dyn BuzzerPort>) -> Self {
        lock(&self.inner).buzzer = Some(buzzer);
        self
    }

    // ── Input ─────────────────────────────────────────────────

    /// Sample the hardware and feed the level to [`update`](Self::update).
    pub fn poll(&self, port: &mut impl ButtonPort) -> Option<ButtonEvent> {
        self.update(port.is_pressed())
    }

    /// Feed the raw button level.  Returns the gesture classified by this
    /// sample, if any.
    pub fn update(&self, pressed: bool) -> Option<ButtonEvent> {
        let now = self.clock.now_ms();
        let mut notices = Notices::default();
        let listeners = {
            let mut inner = lock(&self.inner);

            if pressed != inner.raw_pressed {
                let too_soon = inner
                    .last_edge_ms
                    .is_some_and(|t| now.saturating_sub(t) < inner.config.debounce_ms);
                if too_soon {
                    inner.stats.debounce_reject_count =
                        inner.stats.debounce_reject_count.saturating_add(1);
                    debug!("Button edge rejected by debounce");
                } else {
                    inner.raw_pressed = pressed;
                    inner.last_edge_ms = Some(now);
                    if pressed {
                        inner.state = ButtonState::Pressed;
                        inner.press_start_ms = now;
                    } else {
                        self.on_release(&mut inner, now, &mut notices);
                    }
                }
            }

            if inner.state == ButtonState::Pressed
                && now.saturating_sub(inner.press_start_ms) >= inner.config.long_press_ms
            {
                inner.state = ButtonState::Held;
                self.long_press(&mut inner, &mut notices);
            }

            (inner.on_mode.clone(), inner.on_event.clone())
        };
        Self::notify(listeners, &notices);
        notices.event
    }

    // ── Remote API (server, tests, other writers) ─────────────

    pub fn arm(&self) {
        self.set_mode(SystemMode::Armed);
    }

    pub fn disarm(&self) {
        self.set_mode(SystemMode::Disarmed);
    }

    pub fn emergency_stop(&self) {
        self.set_mode(SystemMode::EmergencyStop);
    }

    /// Leave EmergencyStop for Disarmed; no effect in other modes.
    pub fn clear_emergency(&self) {
        let mut notices = Notices::default();
        let listeners = {
            let mut inner = lock(&self.inner);
            if inner.mode == SystemMode::EmergencyStop {
                inner.undo = None;
                notices.mode_change = self.apply_mode(&mut inner, SystemMode::Disarmed);
            }
            (inner.on_mode.clone(), inner.on_event.clone())
        };
        Self::notify(listeners, &notices);
    }

    /// Force a mode.  Closes any pending undo window.
    pub fn set_mode(&self, mode: SystemMode) {
        let mut notices = Notices::default();
        let listeners = {
            let mut inner = lock(&self.inner);
            inner.undo = None;
            notices.mode_change = self.apply_mode(&mut inner, mode);
            (inner.on_mode.clone(), inner.on_event.clone())
        };
        Self::notify(listeners, &notices);
    }

    pub fn mode(&self) -> SystemMode {
        lock(&self.inner).mode
    }

    pub fn is_armed(&self) -> bool {
        self.mode() == SystemMode::Armed
    }

    pub fn button_state(&self) -> ButtonState {
        lock(&self.inner).state
    }

    pub fn stats(&self) -> ButtonStats {
        let mut stats = lock(&self.inner).stats;
        stats.uptime_ms = self.clock.now_ms().saturating_sub(self.started_ms);
        stats
    }

    // ── Observers ─────────────────────────────────────────────

    pub fn set_mode_listener(&self, f: impl Fn(SystemMode, SystemMode) + Send + Sync + 'static) {
        lock(&self.inner).on_mode = Some(Arc::new(f));
    }

    pub fn set_event_listener(&self, f: impl Fn(ButtonEvent) + Send + Sync + 'static) {
        lock(&self.inner).on_event = Some(Arc::new(f));
    }

    pub fn clear_listeners(&self) {
        let mut inner = lock(&self.inner);
        inner.on_mode = None;
        inner.on_event = None;
    }

    // ── Internal ──────────────────────────────────────────────

    fn on_release(&self, inner: &mut ButtonInner, now: u64, notices: &mut Notices) {
        let held_ms = now.saturating_sub(inner.press_start_ms);
        let was = inner.state;
        inner.state = ButtonState::Released;
        if was == ButtonState::Held {
            return;
        }
        if held_ms >= inner.config.long_press_ms {
            // Released before a sample saw the hold threshold.
            self.long_press(inner, notices);
        } else if held_ms < inner.config.short_press_max_ms {
            self.short_press(inner, now, notices);
        } else {
            inner.stats.ignored_press_count = inner.stats.ignored_press_count.saturating_add(1);
            debug!("Button press of {held_ms} ms ignored (between short and long)");
        }
    }

    fn short_press(&self, inner: &mut ButtonInner, now: u64, notices: &mut Notices) {
        inner.stats.short_press_count = inner.stats.short_press_count.saturating_add(1);

        if inner.mode == SystemMode::EmergencyStop {
            inner.undo = None;
            notices.event = Some(ButtonEvent::ShortPress);
            notices.mode_change = self.apply_mode(inner, SystemMode::Disarmed);
            return;
        }

        let window = inner.config.undo_window_ms;
        if let Some(undo) = inner
            .undo
            .take()
            .filter(|u| now.saturating_sub(u.toggled_at_ms) < window)
        {
            inner.stats.undo_count = inner.stats.undo_count.saturating_add(1);
            info!("Button undo: reverting to {}", undo.revert_to.name());
            notices.event = Some(ButtonEvent::Undo);
            notices.mode_change = self.apply_mode(inner, undo.revert_to);
            return;
        }

        let previous = inner.mode;
        let target = match previous {
            SystemMode::Armed => SystemMode::Disarmed,
            _ => SystemMode::Armed,
        };
        inner.undo = Some(PendingUndo {
            toggled_at_ms: now,
            revert_to: previous,
        });
        notices.event = Some(ButtonEvent::ShortPress);
        notices.mode_change = self.apply_mode(inner, target);
    }

    fn long_press(&self, inner: &mut ButtonInner, notices: &mut Notices) {
        inner.stats.long_press_count = inner.stats.long_press_count.saturating_add(1);
        inner.undo = None;
        notices.event = Some(ButtonEvent::LongPress);
        notices.mode_change = self.apply_mode(inner, SystemMode::EmergencyStop);
    }

    /// Switch mode and drive the laser to match.  `None` if unchanged.
    fn apply_mode(
        &self,
        inner: &mut ButtonInner,
        mode: SystemMode,
    ) -> Option<(SystemMode, SystemMode)> {
        let old = inner.mode;
        if old == mode {
            return None;
        }
        inner.mode = mode;

        let tone = match mode {
            SystemMode::Armed => {
                inner.stats.arm_count = inner.stats.arm_count.saturating_add(1);
                if let Some(laser) = &self.laser {
                    laser.reset_kill_switch();
                    if let Err(e) = laser.arm() {
                        warn!("Laser did not arm: {e}");
                    }
                }
                BUZZER_ARM
            }
            SystemMode::Disarmed => {
                inner.stats.disarm_count = inner.stats.disarm_count.saturating_add(1);
                if let Some(laser) = &self.laser {
                    laser.disarm();
                }
                BUZZER_DISARM
            }
            SystemMode::EmergencyStop => {
                inner.stats.emergency_count = inner.stats.emergency_count.saturating_add(1);
                if let Some(laser) = &self.laser {
                    laser.kill_switch();
                }
                BUZZER_EMERGENCY
            }
        };

        if inner.config.buzzer_enabled {
            if let Some(buzzer) = inner.buzzer.as_mut() {
                buzzer.tone(tone.0, tone.1);
            }
        }

        info!("System mode: {} -> {}", old.name(), mode.name());
        Some((old, mode))
    }

    fn notify(listeners: (Option<ModeListener>, Option<EventListener>), notices: &Notices) {
        let (on_mode, on_event) = listeners;
        if let (Some(f), Some(event)) = (on_event, notices.event) {
            f(event);
        }
        if let (Some(f), Some((old, new))) = (on_mode, notices.mode_change) {
            f(old, new);
        }
    }
}
