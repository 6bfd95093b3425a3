//! Adapters: concrete implementations of the hexagonal port traits.
//!
//! | Adapter    | Implements                       | Connects to             |
//! |------------|----------------------------------|-------------------------|
//! | `hardware` | ServoPort, LaserPort, ButtonPort | embedded-hal PWM / GPIO |
//! | `sim`      | ServoPort, LaserPort             | in-memory recorders     |
//! | `time`     | Clock                            | `Instant` / manual      |

pub mod hardware;
pub mod sim;
pub mod time;
