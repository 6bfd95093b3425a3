//! In-memory hardware for host simulation.
//!
//! Each simulated device is a cheap handle over shared state: hand one
//! clone to the subsystem and keep another to observe what it commanded.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::app::ports::{LaserPort, ServoPort};
use crate::drivers::servo::ServoAxis;
use crate::error::{LaserError, ServoError};
use crate::sync::lock;

// ── Servo ─────────────────────────────────────────────────────

#[derive(Default)]
struct ServoState {
    pulses: [Option<u32>; 2],
    writes: u32,
}

#[derive(Clone, Default)]
pub struct SimServo {
    state: Arc<Mutex<ServoState>>,
    failing: Arc<AtomicBool>,
}

impl SimServo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last pulse written to `axis`.
    pub fn pulse(&self, axis: ServoAxis) -> Option<u32> {
        lock(&self.state).pulses[axis as usize]
    }

    pub fn writes(&self) -> u32 {
        lock(&self.state).writes
    }

    /// Make subsequent writes fail with [`ServoError::Hardware`].
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl ServoPort for SimServo {
    fn set_pulse_width(&mut self, axis: ServoAxis, pulse_us: u32) -> Result<(), ServoError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ServoError::Hardware);
        }
        let mut state = lock(&self.state);
        state.pulses[axis as usize] = Some(pulse_us);
        state.writes += 1;
        Ok(())
    }
}

// ── Laser ─────────────────────────────────────────────────────

#[derive(Clone, Default)]
pub struct SimLaser {
    emitting: Arc<AtomicBool>,
    switch_ons: Arc<AtomicU32>,
    failing: Arc<AtomicBool>,
}

impl SimLaser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_emitting(&self) -> bool {
        self.emitting.load(Ordering::SeqCst)
    }

    /// Number of off → on edges seen by the emitter.
    pub fn switch_ons(&self) -> u32 {
        self.switch_ons.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl LaserPort for SimLaser {
    fn set_emitter(&mut self, on: bool) -> Result<(), LaserError> {
        if self.failing.load(Ordering::SeqCst) && on {
            return Err(LaserError::Hardware);
        }
        let was = self.emitting.swap(on, Ordering::SeqCst);
        if on && !was {
            self.switch_ons.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}
