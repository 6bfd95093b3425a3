//! Concrete state handler functions and table builder.
//!
//! ```text
//!  IDLE ──[candidate]──▶ ACQUIRING ──[hits ≥ confirm_frames]──▶ TRACKING
//!   ▲                      │   ▲                                  │
//!   │                 [timeout] └──────[other candidate]──┐  [timeout]
//!   │                      ▼                              │       ▼
//!   └──────[timeout]────── LOST ◀─────────────────────────┴───────┘
//!                           │
//!                           └──[same track]──▶ TRACKING
//! ```
//!
//! The laser is only ever requested from TRACKING.  Leaving TRACKING,
//! whatever the reason, requests it off.

use super::context::{LaserRequest, TargetingContext, Trigger};
use super::{StateDescriptor, TargetState};
use crate::app::events::{LostTarget, TargetingEvent};
use crate::drivers::servo::ServoPosition;
use log::{debug, info, warn};

// ═══════════════════════════════════════════════════════════════════════════
//  Table builder
// ═══════════════════════════════════════════════════════════════════════════

pub fn build_state_table() -> [StateDescriptor; TargetState::COUNT] {
    [
        StateDescriptor {
            id: TargetState::Idle,
            name: "Idle",
            on_enter: Some(idle_enter),
            on_exit: None,
            on_update: idle_update,
        },
        StateDescriptor {
            id: TargetState::Acquiring,
            name: "Acquiring",
            on_enter: Some(acquiring_enter),
            on_exit: None,
            on_update: acquiring_update,
        },
        StateDescriptor {
            id: TargetState::Tracking,
            name: "Tracking",
            on_enter: Some(tracking_enter),
            on_exit: Some(tracking_exit),
            on_update: tracking_update,
        },
        StateDescriptor {
            id: TargetState::Lost,
            name: "Lost",
            on_enter: Some(lost_enter),
            on_exit: None,
            on_update: lost_update,
        },
    ]
}

// ═══════════════════════════════════════════════════════════════════════════
//  IDLE state: sweeping, no target
// ═══════════════════════════════════════════════════════════════════════════

fn idle_enter(ctx: &mut TargetingContext) {
    ctx.target = None;
    ctx.sweep_cycle = 0;
    ctx.commands.laser = LaserRequest::Off;
    info!("IDLE: no target, sweeping");
}

fn idle_update(ctx: &mut TargetingContext) -> Option<TargetState> {
    if ctx.trigger == Trigger::Detections && ctx.candidate.is_some() {
        return Some(TargetState::Acquiring);
    }
    None
}

// ═══════════════════════════════════════════════════════════════════════════
//  ACQUIRING state: candidate chosen, waiting for confirmation
// ═══════════════════════════════════════════════════════════════════════════

fn acquiring_enter(ctx: &mut TargetingContext) {
    let Some(candidate) = ctx.candidate else {
        return;
    };
    ctx.target = Some(candidate);
    ctx.commands.aim = Some(candidate.angle);
    ctx.counters.target_count = ctx.counters.target_count.saturating_add(1);
    ctx.push_event(TargetingEvent::Acquired(candidate));
    info!(
        "ACQUIRING: track {} at ({}, {}) area={}",
        candidate.track_id, candidate.centroid_x, candidate.centroid_y, candidate.area
    );
}

fn acquiring_update(ctx: &mut TargetingContext) -> Option<TargetState> {
    if ctx.target.is_none() {
        return Some(TargetState::Idle);
    }
    if let Some(candidate) = ctx.matched_candidate() {
        ctx.target = Some(candidate);
        ctx.commands.aim = Some(candidate.angle);
        if candidate.hits >= ctx.config.confirm_frames {
            return Some(TargetState::Tracking);
        }
        return None;
    }
    if ctx.target_timed_out() {
        return Some(TargetState::Lost);
    }
    None
}

// ═══════════════════════════════════════════════════════════════════════════
//  TRACKING state: aiming at a confirmed target, laser requested
// ═══════════════════════════════════════════════════════════════════════════

fn tracking_enter(ctx: &mut TargetingContext) {
    ctx.tracking_since_ms = ctx.now_ms;
    ctx.commands.laser = LaserRequest::On;
    if let Some(target) = ctx.target {
        ctx.commands.aim = Some(target.angle);
        info!(
            "TRACKING: track {} confirmed after {} hits",
            target.track_id, target.hits
        );
    }
}

fn tracking_exit(ctx: &mut TargetingContext) {
    ctx.commands.laser = LaserRequest::Off;
    let tracked_ms = ctx.now_ms.saturating_sub(ctx.tracking_since_ms);
    ctx.counters.total_track_time_ms = ctx.counters.total_track_time_ms.saturating_add(tracked_ms);
    debug!("TRACKING: engagement ended after {tracked_ms} ms");
}

fn tracking_update(ctx: &mut TargetingContext) -> Option<TargetState> {
    if ctx.target.is_none() {
        return Some(TargetState::Idle);
    }
    if let Some(candidate) = ctx.matched_candidate() {
        ctx.target = Some(candidate);
        ctx.commands.aim = Some(candidate.angle);
        ctx.commands.laser = LaserRequest::On;
        return None;
    }
    if ctx.target_timed_out() {
        return Some(TargetState::Lost);
    }
    None
}

// ═══════════════════════════════════════════════════════════════════════════
//  LOST state: target vanished, holding position
// ═══════════════════════════════════════════════════════════════════════════

fn lost_enter(ctx: &mut TargetingContext) {
    ctx.lost_at_ms = ctx.now_ms;
    ctx.commands.laser = LaserRequest::Off;
    ctx.commands.aim = Some(ServoPosition::HOME);
    ctx.counters.lost_count = ctx.counters.lost_count.saturating_add(1);
    if let Some(target) = ctx.target {
        let lost = LostTarget {
            track_id: target.track_id,
            tracked_for_ms: target.last_seen_ms.saturating_sub(target.first_seen_ms),
            last_seen_ms: target.last_seen_ms,
        };
        ctx.push_event(TargetingEvent::Lost(lost));
        warn!(
            "LOST: track {} unseen for {} ms",
            target.track_id,
            ctx.now_ms.saturating_sub(target.last_seen_ms)
        );
    }
}

fn lost_update(ctx: &mut TargetingContext) -> Option<TargetState> {
    if let Some(candidate) = ctx.candidate {
        if ctx.target.is_some_and(|t| t.track_id == candidate.track_id) {
            ctx.target = Some(candidate);
            ctx.counters.reacquired_count = ctx.counters.reacquired_count.saturating_add(1);
            info!("LOST: track {} reacquired", candidate.track_id);
            return Some(TargetState::Tracking);
        }
        return Some(TargetState::Acquiring);
    }
    if ctx.now_ms.saturating_sub(ctx.lost_at_ms) > ctx.config.lost_timeout_ms {
        return Some(TargetState::Idle);
    }
    None
}
