//! APIS turret control core.
//!
//! Turns camera motion into calibrated pan/tilt aim and a laser that is
//! only ever energised inside the safety envelope.  Everything here is
//! pure logic behind port traits; the simulation binary and the tests
//! drive it with in-memory hardware.

#![deny(unused_must_use)]

pub mod adapters;
pub mod app;
pub mod config;
pub mod control;
pub mod drivers;
pub mod error;
pub mod fsm;
pub mod safety;
pub mod vision;

pub(crate) mod sync;
