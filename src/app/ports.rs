//! Port traits: the hexagonal boundary between the control core and the
//! outside world.
//!
//! ```text
//!   Adapter ──▶ Port trait ──▶ Subsystem (domain)
//! ```
//!
//! Hardware adapters (servo PWM, laser GPIO, button GPIO, buzzer) and the
//! time source implement these traits.  Subsystems receive them at
//! construction, so the domain core never touches hardware directly and
//! every timeout can be driven deterministically from tests.

use crate::drivers::servo::ServoAxis;
use crate::error::{LaserError, ServoError};

// ───────────────────────────────────────────────────────────────
// Time port
// ───────────────────────────────────────────────────────────────

/// Monotonic millisecond clock.
///
/// Watchdog feed, lost-target timeout, undo window, debounce and sweep
/// phase are all measured against this, never against the system clock.
pub trait Clock: Send + Sync {
    /// Milliseconds since an arbitrary fixed origin.  Never decreases.
    fn now_ms(&self) -> u64;
}

// ───────────────────────────────────────────────────────────────
// Servo port (domain → hardware)
// ───────────────────────────────────────────────────────────────

/// Pulse-width output for one pan/tilt servo pair.
pub trait ServoPort: Send {
    /// Command `axis` to the given pulse width in microseconds.
    /// The caller guarantees the pulse lies within the axis limits.
    fn set_pulse_width(&mut self, axis: ServoAxis, pulse_us: u32) -> Result<(), ServoError>;
}

// ───────────────────────────────────────────────────────────────
// Laser port (domain → hardware)
// ───────────────────────────────────────────────────────────────

/// Laser emitter gate (MOSFET driver).
///
/// Only [`LaserController`](crate::drivers::laser::LaserController) holds
/// this port, and only the safety layer turns the controller on.
pub trait LaserPort: Send {
    fn set_emitter(&mut self, on: bool) -> Result<(), LaserError>;
}

// ───────────────────────────────────────────────────────────────
// Button / buzzer ports
// ───────────────────────────────────────────────────────────────

/// Raw (undebounced) level of the arming button.
pub trait ButtonPort {
    /// `true` while the button is physically held down.
    fn is_pressed(&mut self) -> bool;
}

/// Optional audible feedback on arming changes.
pub trait BuzzerPort: Send {
    /// Start a tone; must not block for the tone's duration.
    fn tone(&mut self, freq_hz: u32, duration_ms: u32);
}
