//! Hornet classifier: grades tracked detections by size and hovering.
//!
//! ## Size
//!
//! The larger box dimension decides the size class:
//!
//! | Size (px)                    | Class      |
//! |------------------------------|------------|
//! | `< min_size`                 | TooSmall   |
//! | `> max_size`                 | TooLarge   |
//! | `hornet_min ..= hornet_max`  | Hornet     |
//! | anything else                | Unknown    |
//!
//! ## Hovering
//!
//! Hornets hawk in front of the hive entrance while bees fly straight
//! through.  A hornet-sized track hovers when the x and y spread of its
//! history both stay within `hover_radius` and the history spans at least
//! `hover_time_ms`.  The spread is the Chebyshev extent of the bounding
//! box, so the diagonal tolerance is about 1.4x the radius.
//!
//! | Class  | Hovering | Confidence |
//! |--------|----------|------------|
//! | Hornet | yes      | High       |
//! | Hornet | no       | Medium     |
//! | other  | -        | Low        |

use core::fmt;

use heapless::Vec as HVec;
use log::debug;
use serde::{Deserialize, Serialize};

use super::tracker::{CentroidTracker, TrackPosition, TrackResults, TrackedDetection};
use super::{Detection, MAX_DETECTIONS};
use crate::config::ClassifierConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum HornetConfidence {
    #[default]
    Low,
    Medium,
    High,
}

impl fmt::Display for HornetConfidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SizeClass {
    TooSmall,
    TooLarge,
    Unknown,
    Hornet,
}

impl fmt::Display for SizeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::TooSmall => "TOO_SMALL",
            Self::TooLarge => "TOO_LARGE",
            Self::Unknown => "UNKNOWN",
            Self::Hornet => "HORNET",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassifiedDetection {
    pub track_id: u32,
    pub detection: Detection,
    pub class: SizeClass,
    pub confidence: HornetConfidence,
    pub is_hovering: bool,
    /// Equal to `track_age_ms` while hovering, else 0.
    pub hover_duration_ms: u64,
    /// Span of the track history.
    pub track_age_ms: u64,
}

pub type ClassifyResults = HVec<ClassifiedDetection, MAX_DETECTIONS>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClassifierStats {
    pub classified: u64,
    pub high: u64,
    pub medium: u64,
    pub low: u64,
}

pub struct HornetClassifier {
    config: ClassifierConfig,
    stats: ClassifierStats,
}

impl HornetClassifier {
    pub fn new(config: ClassifierConfig) -> Self {
        let config = config.sanitized();
        debug!(
            "Classifier ready (hornet {}-{} px, hover {} px / {} ms)",
            config.hornet_min_px, config.hornet_max_px, config.hover_radius_px, config.hover_time_ms
        );
        Self {
            config,
            stats: ClassifierStats::default(),
        }
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    pub fn size_class(&self, det: &Detection) -> SizeClass {
        let c = &self.config;
        let size = det.width.max(det.height);
        if size < c.min_size_px {
            SizeClass::TooSmall
        } else if size > c.max_size_px {
            SizeClass::TooLarge
        } else if (c.hornet_min_px..=c.hornet_max_px).contains(&size) {
            SizeClass::Hornet
        } else {
            SizeClass::Unknown
        }
    }

    /// Grade one tracked detection against its position history.
    pub fn classify(&mut self, tracked: &TrackedDetection, history: &[TrackPosition]) -> ClassifiedDetection {
        let class = self.size_class(&tracked.detection);
        let track_age_ms = history_span_ms(history);
        let is_hovering = class == SizeClass::Hornet
            && history.len() >= 2
            && history_extent_px(history) <= self.config.hover_radius_px
            && track_age_ms >= self.config.hover_time_ms;

        let confidence = match (class, is_hovering) {
            (SizeClass::Hornet, true) => HornetConfidence::High,
            (SizeClass::Hornet, false) => HornetConfidence::Medium,
            _ => HornetConfidence::Low,
        };

        self.stats.classified += 1;
        match confidence {
            HornetConfidence::High => self.stats.high += 1,
            HornetConfidence::Medium => self.stats.medium += 1,
            HornetConfidence::Low => self.stats.low += 1,
        }

        ClassifiedDetection {
            track_id: tracked.track_id,
            detection: tracked.detection,
            class,
            confidence,
            is_hovering,
            hover_duration_ms: if is_hovering { track_age_ms } else { 0 },
            track_age_ms,
        }
    }

    /// Grade every result of the latest tracker update.
    pub fn classify_all(&mut self, tracked: &TrackResults, tracker: &CentroidTracker) -> ClassifyResults {
        let mut out = ClassifyResults::new();
        for td in tracked {
            let history = tracker.history(td.track_id).unwrap_or_default();
            // Same capacity as the input.
            let _ = out.push(self.classify(td, &history));
        }
        out
    }

    pub fn stats(&self) -> ClassifierStats {
        self.stats
    }
}

fn history_span_ms(history: &[TrackPosition]) -> u64 {
    match (history.first(), history.last()) {
        (Some(oldest), Some(newest)) => newest.timestamp_ms.saturating_sub(oldest.timestamp_ms),
        _ => 0,
    }
}

/// Larger of the x and y ranges covered by the history.
fn history_extent_px(history: &[TrackPosition]) -> u32 {
    let Some(first) = history.first() else {
        return 0;
    };
    let (mut min_x, mut max_x, mut min_y, mut max_y) = (first.x, first.x, first.y, first.y);
    for p in &history[1..] {
        min_x = min_x.min(p.x);
        max_x = max_x.max(p.x);
        min_y = min_y.min(p.y);
        max_y = max_y.max(p.y);
    }
    max_x.abs_diff(min_x).max(max_y.abs_diff(min_y))
}
