//! Laser emitter driver (MOSFET-gated diode module).
//!
//! Owns the [`LaserPort`] and enforces the actuator-level limits:
//!
//! - never on while disarmed or with the kill switch engaged;
//! - maximum continuous on-time, enforced by [`LaserController::update`];
//! - a cooldown after every on → off edge before it may fire again.
//!
//! Nothing outside [`crate::safety`] turns the laser on.  Everybody may
//! turn it off.

use std::sync::{Arc, Mutex};

use log::{error, info, warn};
use serde::{Deserialize, Serialize};

use crate::app::ports::{Clock, LaserPort};
use crate::config::LaserConfig;
use crate::error::LaserError;
use crate::sync::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LaserState {
    Off,
    Armed,
    Active,
    Cooldown,
    EmergencyStop,
    /// Last emitter write failed.
    Fault,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LaserStats {
    pub activation_count: u32,
    pub safety_timeout_count: u32,
    pub cooldown_block_count: u32,
    pub kill_switch_count: u32,
    pub hardware_faults: u32,
    pub total_on_time_ms: u64,
    pub last_activation_ms: Option<u64>,
    pub uptime_ms: u64,
}

struct LaserInner {
    port: Box<dyn LaserPort>,
    config: LaserConfig,
    state: LaserState,
    armed: bool,
    kill_switch: bool,
    on_since_ms: Option<u64>,
    off_at_ms: Option<u64>,
    stats: LaserStats,
}

impl LaserInner {
    fn cooldown_remaining(&self, now: u64) -> u64 {
        self.off_at_ms.map_or(0, |off| {
            self.config.cooldown_ms.saturating_sub(now.saturating_sub(off))
        })
    }

    /// Resting state derived from the flags (laser assumed off).
    fn resting_state(&self, now: u64) -> LaserState {
        if self.kill_switch {
            LaserState::EmergencyStop
        } else if !self.armed {
            LaserState::Off
        } else if self.cooldown_remaining(now) > 0 {
            LaserState::Cooldown
        } else {
            LaserState::Armed
        }
    }

    fn switch_off(&mut self, now: u64) {
        let write = self.port.set_emitter(false);
        if let Some(since) = self.on_since_ms.take() {
            self.stats.total_on_time_ms += now.saturating_sub(since);
            self.off_at_ms = Some(now);
            info!("Laser OFF after {} ms", now.saturating_sub(since));
        }
        if let Err(e) = write {
            self.stats.hardware_faults = self.stats.hardware_faults.saturating_add(1);
            error!("LASER FAULT: emitter off write failed: {e}");
            self.state = LaserState::Fault;
            return;
        }
        self.state = self.resting_state(now);
    }
}

pub struct LaserController {
    inner: Mutex<LaserInner>,
    clock: Arc<dyn Clock>,
    started_ms: u64,
}

impl LaserController {
    /// Take ownership of `port`; the emitter is driven low immediately.
    pub fn new(port: Box<dyn LaserPort>, config: LaserConfig, clock: Arc<dyn Clock>) -> Self {
        let started_ms = clock.now_ms();
        let mut inner = LaserInner {
            port,
            config: config.sanitized(),
            state: LaserState::Off,
            armed: false,
            kill_switch: false,
            on_since_ms: None,
            off_at_ms: None,
            stats: LaserStats::default(),
        };
        inner.switch_off(started_ms);
        Self {
            inner: Mutex::new(inner),
            clock,
            started_ms,
        }
    }

    /// Energise the emitter.  Idempotent while already on.
    ///
    /// Crate-private: the only caller is the safety layer's gated wrapper.
    pub(crate) fn on(&self) -> Result<(), LaserError> {
        let now = self.clock.now_ms();
        let mut inner = lock(&self.inner);
        if inner.kill_switch {
            return Err(LaserError::KillSwitch);
        }
        if !inner.armed {
            return Err(LaserError::NotArmed);
        }
        if inner.on_since_ms.is_some() {
            return Ok(());
        }
        let remaining_ms = inner.cooldown_remaining(now);
        if remaining_ms > 0 {
            inner.stats.cooldown_block_count = inner.stats.cooldown_block_count.saturating_add(1);
            return Err(LaserError::Cooldown { remaining_ms });
        }
        if let Err(e) = inner.port.set_emitter(true) {
            inner.stats.hardware_faults = inner.stats.hardware_faults.saturating_add(1);
            error!("LASER FAULT: emitter on write failed: {e}");
            inner.switch_off(now);
            inner.state = LaserState::Fault;
            return Err(e);
        }
        inner.on_since_ms = Some(now);
        inner.stats.activation_count = inner.stats.activation_count.saturating_add(1);
        inner.stats.last_activation_ms = Some(now);
        inner.state = LaserState::Active;
        info!("Laser ON");
        Ok(())
    }

    /// De-energise the emitter.  Always succeeds, from any state.
    pub fn off(&self) {
        let now = self.clock.now_ms();
        lock(&self.inner).switch_off(now);
    }

    /// Refused while the kill switch is engaged.
    pub fn arm(&self) -> Result<(), LaserError> {
        let now = self.clock.now_ms();
        let mut inner = lock(&self.inner);
        if inner.kill_switch {
            warn!("Laser arm refused: kill switch engaged");
            return Err(LaserError::KillSwitch);
        }
        inner.armed = true;
        if inner.on_since_ms.is_none() {
            inner.state = inner.resting_state(now);
        }
        Ok(())
    }

    pub fn disarm(&self) {
        let now = self.clock.now_ms();
        let mut inner = lock(&self.inner);
        inner.armed = false;
        inner.switch_off(now);
    }

    /// Emergency stop: off, disarmed, and latched until
    /// [`reset_kill_switch`](Self::reset_kill_switch).
    pub fn kill_switch(&self) {
        let now = self.clock.now_ms();
        let mut inner = lock(&self.inner);
        inner.kill_switch = true;
        inner.armed = false;
        inner.switch_off(now);
        inner.stats.kill_switch_count = inner.stats.kill_switch_count.saturating_add(1);
        warn!("Laser KILL SWITCH engaged");
    }

    /// The only path that clears the kill switch.  Leaves the laser disarmed.
    pub fn reset_kill_switch(&self) {
        let now = self.clock.now_ms();
        let mut inner = lock(&self.inner);
        if inner.kill_switch {
            info!("Laser kill switch reset");
        }
        inner.kill_switch = false;
        if inner.on_since_ms.is_none() {
            inner.state = inner.resting_state(now);
        }
    }

    /// Enforce the maximum continuous on-time.  Returns `true` if the laser
    /// was forced off by this call.
    pub fn update(&self) -> bool {
        let now = self.clock.now_ms();
        let mut inner = lock(&self.inner);
        let Some(since) = inner.on_since_ms else {
            if inner.state == LaserState::Cooldown {
                inner.state = inner.resting_state(now);
            }
            return false;
        };
        if now.saturating_sub(since) < inner.config.max_on_time_ms {
            return false;
        }
        warn!("Laser max on-time ({} ms) reached, forcing off", inner.config.max_on_time_ms);
        inner.switch_off(now);
        inner.stats.safety_timeout_count = inner.stats.safety_timeout_count.saturating_add(1);
        true
    }

    pub fn state(&self) -> LaserState {
        let now = self.clock.now_ms();
        let inner = lock(&self.inner);
        match inner.state {
            LaserState::Cooldown => inner.resting_state(now),
            other => other,
        }
    }

    pub fn is_active(&self) -> bool {
        lock(&self.inner).on_since_ms.is_some()
    }

    pub fn is_armed(&self) -> bool {
        lock(&self.inner).armed
    }

    pub fn is_kill_switch_engaged(&self) -> bool {
        lock(&self.inner).kill_switch
    }

    /// Milliseconds the laser has been continuously on (0 when off).
    pub fn current_on_time_ms(&self) -> u64 {
        let now = self.clock.now_ms();
        lock(&self.inner)
            .on_since_ms
            .map_or(0, |since| now.saturating_sub(since))
    }

    pub fn on_time_remaining_ms(&self) -> u64 {
        let max = lock(&self.inner).config.max_on_time_ms;
        max.saturating_sub(self.current_on_time_ms())
    }

    pub fn cooldown_remaining_ms(&self) -> u64 {
        let now = self.clock.now_ms();
        lock(&self.inner).cooldown_remaining(now)
    }

    pub fn stats(&self) -> LaserStats {
        let now = self.clock.now_ms();
        let inner = lock(&self.inner);
        let mut stats = inner.stats;
        if let Some(since) = inner.on_since_ms {
            stats.total_on_time_ms += now.saturating_sub(since);
        }
        stats.uptime_ms = now.saturating_sub(self.started_ms);
        stats
    }
}
