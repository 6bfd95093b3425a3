//! Hardware adapters: embedded-hal 1.0 peripherals behind the domain
//! port traits.
//!
//! | Adapter      | Implements   | Peripheral                         |
//! |--------------|--------------|------------------------------------|
//! | `PwmServo`   | ServoPort    | two 50 Hz PWM channels (pan, tilt) |
//! | `GpioLaser`  | LaserPort    | MOSFET gate output pin             |
//! | `GpioButton` | ButtonPort   | active-low input with pull-up      |
//!
//! These are the only types in the crate that touch pins.

use embedded_hal::digital::{InputPin, OutputPin};
use embedded_hal::pwm::SetDutyCycle;
use log::{error, warn};

use crate::app::ports::{ButtonPort, LaserPort, ServoPort};
use crate::drivers::servo::{SERVO_PERIOD_US, ServoAxis};
use crate::error::{LaserError, ServoError};

// ── Servo ─────────────────────────────────────────────────────

/// Pan and tilt servos on two PWM channels running at 50 Hz.
pub struct PwmServo<P> {
    pan: P,
    tilt: P,
}

impl<P: SetDutyCycle> PwmServo<P> {
    pub fn new(pan: P, tilt: P) -> Self {
        Self { pan, tilt }
    }

    pub fn release(self) -> (P, P) {
        (self.pan, self.tilt)
    }
}

/// Duty fraction for `pulse_us` within one servo period.
fn pulse_fraction(pulse_us: u32) -> (u16, u16) {
    let pulse = pulse_us.min(SERVO_PERIOD_US);
    (pulse as u16, SERVO_PERIOD_US as u16)
}

impl<P: SetDutyCycle + Send> ServoPort for PwmServo<P> {
    fn set_pulse_width(&mut self, axis: ServoAxis, pulse_us: u32) -> Result<(), ServoError> {
        let channel = match axis {
            ServoAxis::Pan => &mut self.pan,
            ServoAxis::Tilt => &mut self.tilt,
        };
        let (num, denom) = pulse_fraction(pulse_us);
        channel.set_duty_cycle_fraction(num, denom).map_err(|e| {
            warn!("PWM write for {} failed: {e:?}", axis.name());
            ServoError::Hardware
        })
    }
}

// ── Laser ─────────────────────────────────────────────────────

/// Laser MOSFET gate; high energises the emitter.
pub struct GpioLaser<P> {
    pin: P,
}

impl<P: OutputPin> GpioLaser<P> {
    /// Takes the pin and drives it low before returning.
    pub fn new(mut pin: P) -> Result<Self, LaserError> {
        pin.set_low().map_err(|e| {
            error!("Laser gate init failed: {e:?}");
            LaserError::Hardware
        })?;
        Ok(Self { pin })
    }
}

impl<P: OutputPin + Send> LaserPort for GpioLaser<P> {
    fn set_emitter(&mut self, on: bool) -> Result<(), LaserError> {
        let result = if on { self.pin.set_high() } else { self.pin.set_low() };
        result.map_err(|e| {
            error!("Laser gate write failed: {e:?}");
            LaserError::Hardware
        })
    }
}

// ── Button ────────────────────────────────────────────────────

/// Arming button wired to ground with a pull-up; low means pressed.
pub struct GpioButton<P> {
    pin: P,
}

impl<P: InputPin> GpioButton<P> {
    pub fn new(pin: P) -> Self {
        Self { pin }
    }
}

impl<P: InputPin> ButtonPort for GpioButton<P> {
    /// A read error reports released.
    fn is_pressed(&mut self) -> bool {
        match self.pin.is_low() {
            Ok(pressed) => pressed,
            Err(e) => {
                warn!("Button read failed: {e:?}");
                false
            }
        }
    }
}
