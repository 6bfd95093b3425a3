//! Shared mutable context threaded through every targeting handler.
//!
//! The targeting service fills in the trigger, the clock reading and the
//! selected candidate before each settle loop, then drains `commands` and
//! `events` afterwards.  Handlers only read and write this struct.

use heapless::Vec as HVec;
use log::warn;

use crate::app::events::TargetingEvent;
use crate::app::events::TargetInfo;
use crate::config::TargetingConfig;
use crate::drivers::servo::ServoPosition;

/// Upper bound on events produced by one settle loop.
pub const MAX_PENDING_EVENTS: usize = 8;

/// What woke the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// A processed frame; `candidate` is meaningful.
    Detections,
    /// The periodic update path.
    Tick,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LaserRequest {
    #[default]
    Keep,
    On,
    Off,
}

// ---------------------------------------------------------------------------
// Commands (written by handlers; applied by the targeting service)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct TargetCommands {
    /// Point the turret here.
    pub aim: Option<ServoPosition>,
    pub laser: LaserRequest,
}

/// Counters owned by the handlers.
#[derive(Debug, Clone, Copy, Default)]
pub struct TargetCounters {
    pub target_count: u32,
    pub lost_count: u32,
    pub reacquired_count: u32,
    pub total_track_time_ms: u64,
}

// ---------------------------------------------------------------------------
// TargetingContext
// ---------------------------------------------------------------------------

pub struct TargetingContext {
    // -- Timing --
    pub now_ms: u64,
    /// Set by the engine on every transition.
    pub state_entered_ms: u64,
    /// When the current Lost episode began.
    pub lost_at_ms: u64,
    /// When the current Tracking episode began.
    pub tracking_since_ms: u64,
    /// Completed sweep cycles since Idle was entered.
    pub sweep_cycle: u64,

    // -- Inputs --
    pub trigger: Trigger,
    pub candidate: Option<TargetInfo>,

    // -- Engagement --
    /// The track being engaged (also retained while Lost).
    pub target: Option<TargetInfo>,

    // -- Outputs --
    pub commands: TargetCommands,
    pub events: HVec<TargetingEvent, MAX_PENDING_EVENTS>,
    pub counters: TargetCounters,

    pub config: TargetingConfig,
}

impl TargetingContext {
    pub fn new(config: TargetingConfig) -> Self {
        Self {
            now_ms: 0,
            state_entered_ms: 0,
            lost_at_ms: 0,
            tracking_since_ms: 0,
            sweep_cycle: 0,
            trigger: Trigger::Tick,
            candidate: None,
            target: None,
            commands: TargetCommands::default(),
            events: HVec::new(),
            counters: TargetCounters::default(),
            config: config.sanitized(),
        }
    }

    /// Prepare for a settle loop.  Clears commands and pending events.
    pub fn begin(&mut self, trigger: Trigger, now_ms: u64, candidate: Option<TargetInfo>) {
        self.trigger = trigger;
        self.now_ms = now_ms;
        self.candidate = match trigger {
            Trigger::Detections => candidate,
            Trigger::Tick => None,
        };
        self.commands = TargetCommands::default();
        self.events.clear();
    }

    pub fn push_event(&mut self, event: TargetingEvent) {
        if self.events.push(event).is_err() {
            warn!("Targeting event queue full, dropping {event:?}");
        }
    }

    /// The candidate, if it belongs to the engaged track.
    pub fn matched_candidate(&self) -> Option<TargetInfo> {
        let target = self.target?;
        self.candidate.filter(|c| c.track_id == target.track_id)
    }

    /// The engaged track has gone unmatched for longer than the lost timeout.
    pub fn target_timed_out(&self) -> bool {
        self.target.is_some_and(|t| {
            self.now_ms.saturating_sub(t.last_seen_ms) > self.config.lost_timeout_ms
        })
    }

    pub fn ms_in_state(&self) -> u64 {
        self.now_ms.saturating_sub(self.state_entered_ms)
    }
}
