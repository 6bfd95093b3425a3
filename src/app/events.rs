//! Outbound application events and telemetry.
//!
//! [`TargetingEvent`]s are queued inside the targeting critical section
//! and delivered to listeners after the lock is released.
//! [`TelemetrySnapshot`] gathers every subsystem's stats into one
//! serde value for publishing, encoded with postcard.

use serde::{Deserialize, Serialize};

use crate::control::coordinate::CoordStats;
use crate::drivers::button::{ButtonStats, SystemMode};
use crate::drivers::laser::{LaserState, LaserStats};
use crate::drivers::servo::{ServoPosition, ServoStats};
use crate::error::{Error, Result};
use crate::fsm::TargetState;
use crate::safety::{SafetyState, SafetyStats};
use crate::vision::Detection;
use crate::vision::classifier::{ClassifierStats, HornetConfidence};
use crate::vision::motion::MotionStats;
use crate::vision::tracker::TrackerStats;

/// Snapshot of the engaged track.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TargetInfo {
    pub track_id: u32,
    pub centroid_x: u32,
    pub centroid_y: u32,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub area: u32,
    pub confidence: f32,
    /// Servo angle the centroid maps to.
    pub angle: ServoPosition,
    pub first_seen_ms: u64,
    pub last_seen_ms: u64,
    pub hits: u32,
    pub hornet: HornetConfidence,
}

impl TargetInfo {
    pub fn from_detection(
        track_id: u32,
        det: &Detection,
        angle: ServoPosition,
        first_seen_ms: u64,
        last_seen_ms: u64,
        hits: u32,
    ) -> Self {
        Self {
            track_id,
            centroid_x: det.centroid_x,
            centroid_y: det.centroid_y,
            x: det.x,
            y: det.y,
            width: det.width,
            height: det.height,
            area: det.area,
            confidence: det.confidence,
            angle,
            first_seen_ms,
            last_seen_ms,
            hits,
            hornet: HornetConfidence::Low,
        }
    }
}

/// Delivered once per lost event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LostTarget {
    pub track_id: u32,
    /// First to last sighting.
    pub tracked_for_ms: u64,
    pub last_seen_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TargetingEvent {
    StateChanged { from: TargetState, to: TargetState },
    Acquired(TargetInfo),
    Lost(LostTarget),
}

// ── Telemetry ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TargetingStats {
    pub state: TargetState,
    pub target_count: u32,
    pub lost_count: u32,
    pub reacquired_count: u32,
    /// Frames with more than one qualifying candidate.
    pub multi_target_count: u32,
    pub sweep_cycles: u64,
    pub total_track_time_ms: u64,
    pub frames_processed: u64,
    pub laser_requests: u64,
    pub laser_denials: u64,
    pub unmapped_candidates: u64,
    pub uptime_ms: u64,
}

/// Point-in-time view of the whole turret.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub timestamp_ms: u64,
    pub mode: SystemMode,
    pub safety_state: SafetyState,
    pub target_state: TargetState,
    pub laser_state: LaserState,
    pub target: Option<TargetInfo>,
    pub targeting: TargetingStats,
    pub motion: MotionStats,
    pub tracker: TrackerStats,
    pub classifier: ClassifierStats,
    pub safety: SafetyStats,
    pub laser: LaserStats,
    pub servo: ServoStats,
    pub coord: CoordStats,
    pub button: ButtonStats,
}

impl TelemetrySnapshot {
    pub fn encode(&self) -> Result<Vec<u8>> {
        postcard::to_allocvec(self).map_err(|_| Error::Telemetry("postcard encode failed"))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        postcard::from_bytes(bytes).map_err(|_| Error::Telemetry("postcard decode failed"))
    }
}
