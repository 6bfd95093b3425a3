//! Actuator and input drivers: servo pair, laser emitter, arming button.

pub mod button;
pub mod laser;
pub mod servo;
