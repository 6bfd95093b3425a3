//! Fuzz target: `TurretConfig::from_json_str`
//!
//! Any document that parses must come back sanitized:
//! - Camera geometry validates
//! - Watchdog warning precedes the timeout
//! - Auto-off never exceeds the continuous on-time limit
//!
//! cargo fuzz run fuzz_config_json

#![no_main]

use apis_turret::config::TurretConfig;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(config) = TurretConfig::from_json_str(text) else {
        return;
    };
    assert!(config.camera.validate().is_ok());
    let s = config.safety;
    assert!(s.watchdog_warning_ms < s.watchdog_timeout_ms);
    assert!(s.auto_off_ms <= s.max_continuous_on_ms);
    assert!(s.voltage_warning_mv >= s.voltage_min_mv);
    assert!(config.targeting.sweep_frequency_hz.is_finite());
});
