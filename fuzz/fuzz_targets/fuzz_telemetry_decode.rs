//! Fuzz target: `TelemetrySnapshot::decode`
//!
//! Arbitrary bytes must never panic the postcard decoder, and anything
//! that decodes must re-encode to a snapshot that decodes equal.
//!
//! cargo fuzz run fuzz_telemetry_decode

#![no_main]

use apis_turret::app::events::TelemetrySnapshot;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(snap) = TelemetrySnapshot::decode(data) else {
        return;
    };
    let bytes = snap.encode().expect("decoded snapshot re-encodes");
    let again = TelemetrySnapshot::decode(&bytes).expect("re-encoded snapshot decodes");
    // NaN fields make PartialEq fail, so compare the encodings instead.
    assert_eq!(again.encode().expect("encode"), bytes);
});
