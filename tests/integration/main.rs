//! Integration test driver for the `tests/integration/` submodules.
//!
//! Each `mod` below maps to a file that exercises one slice of the turret
//! against mock adapters.  All tests run on the host with no real
//! hardware required.

mod calibration_tests;
mod concurrency_tests;
mod hardware_adapter_tests;
mod mock_hw;
mod safety_tests;
mod targeting_tests;
mod tracker_scenario;
