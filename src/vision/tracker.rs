//! Centroid tracker: assigns persistent ids to detections across frames.
//!
//! ## Matching
//!
//! Every update pairs existing tracks with new detections greedily in
//! order of increasing squared centroid distance.  A pair only counts when
//! its distance is strictly below `max_distance`; each track and each
//! detection is used at most once.  Ties go to the lower track slot, then
//! the lower detection index, so the assignment is deterministic.
//!
//! | Outcome              | Effect                                            |
//! |----------------------|---------------------------------------------------|
//! | Matched              | Track moves, history grows, `disappeared` = 0     |
//! | Unmatched detection  | New track if a slot is free, else dropped         |
//! | Unmatched track      | `disappeared` += 1, removed once it exceeds limit |
//!
//! Ids start at 1, increase monotonically and never take the value 0.

use std::sync::Arc;

use heapless::Vec as HVec;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use super::{Detection, MAX_DETECTIONS};
use crate::app::ports::Clock;
use crate::config::TrackerConfig;

pub const MAX_TRACKED_OBJECTS: usize = 20;
pub const MAX_TRACK_HISTORY: usize = 30;
pub const MAX_DISAPPEARED: u32 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TrackPosition {
    pub x: i32,
    pub y: i32,
    pub timestamp_ms: u64,
}

// ── History ring ──────────────────────────────────────────────

/// Fixed ring of the most recent positions; the oldest is overwritten.
#[derive(Debug, Clone, Copy)]
pub struct TrackHistory {
    buf: [TrackPosition; MAX_TRACK_HISTORY],
    /// Index of the newest entry.
    head: usize,
    count: usize,
}

impl Default for TrackHistory {
    fn default() -> Self {
        Self {
            buf: [TrackPosition::default(); MAX_TRACK_HISTORY],
            head: 0,
            count: 0,
        }
    }
}

impl TrackHistory {
    /// Append `pos`.  A timestamp not newer than the current newest entry
    /// replaces that entry, keeping timestamps strictly increasing.
    pub fn push(&mut self, pos: TrackPosition) {
        if let Some(newest) = self.newest() {
            if pos.timestamp_ms <= newest.timestamp_ms {
                self.buf[self.head] = TrackPosition {
                    timestamp_ms: newest.timestamp_ms,
                    ..pos
                };
                return;
            }
        }
        if self.count == 0 {
            self.head = 0;
        } else {
            self.head = (self.head + 1) % MAX_TRACK_HISTORY;
        }
        self.buf[self.head] = pos;
        self.count = (self.count + 1).min(MAX_TRACK_HISTORY);
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn newest(&self) -> Option<TrackPosition> {
        (self.count > 0).then(|| self.buf[self.head])
    }

    /// Positions oldest first.
    pub fn iter(&self) -> impl Iterator<Item = TrackPosition> + '_ {
        let start = (self.head + MAX_TRACK_HISTORY + 1 - self.count) % MAX_TRACK_HISTORY;
        (0..self.count).map(move |i| self.buf[(start + i) % MAX_TRACK_HISTORY])
    }
}

// ── Tracks ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct Track {
    pub id: u32,
    pub centroid_x: i32,
    pub centroid_y: i32,
    pub last_detection: Detection,
    pub history: TrackHistory,
    /// Consecutive updates without a match.
    pub disappeared: u32,
    pub first_seen_ms: u64,
    pub last_seen_ms: u64,
    /// Number of matched updates, including the one that created the track.
    pub hits: u32,
}

impl Track {
    fn new(id: u32, det: &Detection, now_ms: u64) -> Self {
        let mut history = TrackHistory::default();
        let (cx, cy) = centroid(det);
        history.push(TrackPosition {
            x: cx,
            y: cy,
            timestamp_ms: now_ms,
        });
        Self {
            id,
            centroid_x: cx,
            centroid_y: cy,
            last_detection: *det,
            history,
            disappeared: 0,
            first_seen_ms: now_ms,
            last_seen_ms: now_ms,
            hits: 1,
        }
    }

    fn observe(&mut self, det: &Detection, now_ms: u64) {
        let (cx, cy) = centroid(det);
        self.centroid_x = cx;
        self.centroid_y = cy;
        self.last_detection = *det;
        self.disappeared = 0;
        self.last_seen_ms = now_ms;
        self.hits = self.hits.saturating_add(1);
        self.history.push(TrackPosition {
            x: cx,
            y: cy,
            timestamp_ms: now_ms,
        });
    }
}

fn centroid(det: &Detection) -> (i32, i32) {
    (det.centroid_x as i32, det.centroid_y as i32)
}

fn distance_squared(track: &Track, det: &Detection) -> u64 {
    let (cx, cy) = centroid(det);
    let dx = i64::from(cx) - i64::from(track.centroid_x);
    let dy = i64::from(cy) - i64::from(track.centroid_y);
    (dx * dx + dy * dy) as u64
}

/// A detection tagged with the track it was assigned to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackedDetection {
    pub track_id: u32,
    pub detection: Detection,
    /// This update created the track.
    pub is_new: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TrackerStats {
    pub updates: u64,
    pub tracks_created: u64,
    pub tracks_expired: u64,
    /// Detections beyond the per-update cap.
    pub detections_truncated: u64,
    /// Unmatched detections dropped because every slot was taken.
    pub detections_dropped: u64,
    pub active_tracks: u32,
    pub uptime_ms: u64,
}

pub type TrackResults = HVec<TrackedDetection, MAX_DETECTIONS>;

pub struct CentroidTracker {
    config: TrackerConfig,
    tracks: HVec<Track, MAX_TRACKED_OBJECTS>,
    next_id: u32,
    stats: TrackerStats,
    clock: Arc<dyn Clock>,
    started_ms: u64,
}

impl CentroidTracker {
    pub fn new(config: TrackerConfig, clock: Arc<dyn Clock>) -> Self {
        let config = config.sanitized();
        info!(
            "Tracker initialized (max_distance={}, max_disappeared={})",
            config.max_distance, config.max_disappeared
        );
        let started_ms = clock.now_ms();
        Self {
            config,
            tracks: HVec::new(),
            next_id: 1,
            stats: TrackerStats::default(),
            clock,
            started_ms,
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Associate `detections` with tracks.  Matched detections come first
    /// in the result, newly created tracks after.
    pub fn update(&mut self, detections: &[Detection], now_ms: u64) -> TrackResults {
        self.stats.updates += 1;
        let mut results = TrackResults::new();

        let detections = if detections.len() > MAX_DETECTIONS {
            let extra = detections.len() - MAX_DETECTIONS;
            self.stats.detections_truncated += extra as u64;
            warn!("Tracker input truncated by {extra} detections");
            &detections[..MAX_DETECTIONS]
        } else {
            detections
        };

        let mut track_used = [false; MAX_TRACKED_OBJECTS];
        let mut det_used = [false; MAX_DETECTIONS];
        let max_sq = u64::from(self.config.max_distance).pow(2);

        // Global greedy: take the closest remaining pair each round.
        loop {
            let mut best: Option<(u64, usize, usize)> = None;
            for (t, track) in self.tracks.iter().enumerate() {
                if track_used[t] {
                    continue;
                }
                for (d, det) in detections.iter().enumerate() {
                    if det_used[d] {
                        continue;
                    }
                    let dist = distance_squared(track, det);
                    if dist >= max_sq {
                        continue;
                    }
                    if best.is_none_or(|(b, _, _)| dist < b) {
                        best = Some((dist, t, d));
                    }
                }
            }
            let Some((_, t, d)) = best else { break };
            track_used[t] = true;
            det_used[d] = true;
            let track = &mut self.tracks[t];
            track.observe(&detections[d], now_ms);
            let _ = results.push(TrackedDetection {
                track_id: track.id,
                detection: detections[d],
                is_new: false,
            });
        }

        // Age unmatched tracks; flags are indexed by position before removal.
        let mut t = 0;
        let mut flag = 0;
        while t < self.tracks.len() {
            let matched = track_used[flag];
            flag += 1;
            if matched {
                t += 1;
                continue;
            }
            let track = &mut self.tracks[t];
            track.disappeared += 1;
            if track.disappeared > self.config.max_disappeared {
                debug!(
                    "Track {} expired after {} missed updates",
                    track.id, track.disappeared
                );
                self.tracks.remove(t);
                self.stats.tracks_expired += 1;
            } else {
                t += 1;
            }
        }

        for (d, det) in detections.iter().enumerate() {
            if det_used[d] {
                continue;
            }
            if self.tracks.is_full() {
                self.stats.detections_dropped += 1;
                warn!("Tracker full ({MAX_TRACKED_OBJECTS} tracks), detection dropped");
                continue;
            }
            let id = self.allocate_id();
            let _ = self.tracks.push(Track::new(id, det, now_ms));
            self.stats.tracks_created += 1;
            debug!("New track {id} at ({}, {})", det.centroid_x, det.centroid_y);
            let _ = results.push(TrackedDetection {
                track_id: id,
                detection: *det,
                is_new: true,
            });
        }

        results
    }

    pub fn track(&self, id: u32) -> Option<Track> {
        self.tracks.iter().find(|t| t.id == id).copied()
    }

    /// The last `history_length` positions of track `id`, oldest first.
    pub fn history(&self, id: u32) -> Option<HVec<TrackPosition, MAX_TRACK_HISTORY>> {
        let track = self.tracks.iter().find(|t| t.id == id)?;
        let skip = track.history.len().saturating_sub(self.config.history_length);
        Some(track.history.iter().skip(skip).collect())
    }

    pub fn tracks(&self) -> impl Iterator<Item = &Track> {
        self.tracks.iter()
    }

    pub fn active_count(&self) -> usize {
        self.tracks.len()
    }

    /// Drop every track and restart ids at 1.
    pub fn reset(&mut self) {
        self.tracks.clear();
        self.next_id = 1;
        info!("Tracker reset");
    }

    pub fn stats(&self) -> TrackerStats {
        let mut stats = self.stats;
        stats.active_tracks = self.tracks.len() as u32;
        stats.uptime_ms = self.clock.now_ms().saturating_sub(self.started_ms);
        stats
    }

    fn allocate_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        if self.next_id == 0 {
            self.next_id = 1;
        }
        id
    }
}
