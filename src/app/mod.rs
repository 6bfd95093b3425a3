//! Application core: targeting orchestration and the turret assembly.
//!
//! All interaction with hardware happens through the **port traits** in
//! [`ports`], so this layer runs unchanged on the host against the
//! simulated adapters.

pub mod events;
pub mod ports;
pub mod service;
pub mod targeting;
