//! Frame-to-target perception: motion segmentation, centroid tracking and
//! hornet classification.
//!
//! ```text
//!   Frame ──► MotionDetector ──► [Detection; ≤32] ──► CentroidTracker ──► [TrackedDetection]
//!                                                                            │
//!                                                   HornetClassifier ◄───────┘ (+ history)
//! ```

pub mod classifier;
pub mod motion;
pub mod tracker;

use serde::{Deserialize, Serialize};

/// Upper bound on detections produced per frame and accepted per tracker update.
pub const MAX_DETECTIONS: usize = 32;

/// A moving region found in one frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    /// Foreground pixels inside the box.
    pub area: u32,
    pub centroid_x: u32,
    pub centroid_y: u32,
    /// Fill ratio in 0.0..=1.0.
    pub confidence: f32,
}

impl Detection {
    /// Solid box: area is the box area and the centroid its center.
    pub fn from_box(x: u32, y: u32, width: u32, height: u32, confidence: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
            area: width.saturating_mul(height),
            centroid_x: x.saturating_add(width / 2),
            centroid_y: y.saturating_add(height / 2),
            confidence: confidence.clamp(0.0, 1.0),
        }
    }

    pub fn aspect_ratio(&self) -> f32 {
        if self.height == 0 {
            return 0.0;
        }
        self.width as f32 / self.height as f32
    }
}
