//! Fuzz target: `MotionDetector::detect`
//!
//! Treats the input as a sequence of 32×24 grayscale frames and checks:
//! - No panics, including on a short trailing frame
//! - Every detection box lies inside the frame
//! - Detection count never exceeds `MAX_DETECTIONS`
//!
//! cargo fuzz run fuzz_motion_frame

#![no_main]

use std::sync::Arc;

use apis_turret::adapters::time::ManualClock;
use apis_turret::config::{CameraParams, MotionConfig};
use apis_turret::vision::MAX_DETECTIONS;
use apis_turret::vision::motion::{DetectionResult, Frame, MotionDetector};
use libfuzzer_sys::fuzz_target;

const W: u32 = 32;
const H: u32 = 24;

fuzz_target!(|data: &[u8]| {
    let camera = CameraParams {
        width: W,
        height: H,
        ..CameraParams::default()
    };
    let config = MotionConfig {
        min_area: 1,
        motion_pixel_min: 0,
        ..MotionConfig::default()
    };
    let mut detector = MotionDetector::new(camera, config, Arc::new(ManualClock::new(0)));
    let mut out = DetectionResult::default();

    for chunk in data.chunks((W * H) as usize) {
        let frame = Frame::gray(chunk, W, H);
        match detector.detect(&frame, &mut out) {
            Ok(n) => {
                assert_eq!(n, out.detections.len());
                assert!(n <= MAX_DETECTIONS);
                for d in &out.detections {
                    assert!(d.x + d.width <= W && d.y + d.height <= H, "box outside frame: {d:?}");
                    assert!(d.centroid_x < W && d.centroid_y < H);
                }
            }
            // Only the trailing partial chunk may be rejected.
            Err(_) => assert!(chunk.len() < (W * H) as usize),
        }
    }
});
