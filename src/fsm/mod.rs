//! Function-pointer finite state machine engine for target engagement.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  StateTable                                                  │
//! │  ┌───────────┬───────────┬──────────┬───────────────────┐    │
//! │  │ State     │ on_enter  │ on_exit  │ on_update         │    │
//! │  ├───────────┼───────────┼──────────┼───────────────────┤    │
//! │  │ Idle      │ fn(ctx)   │    -     │ fn(ctx)->Option<> │    │
//! │  │ Acquiring │ fn(ctx)   │    -     │ fn(ctx)->Option<> │    │
//! │  │ Tracking  │ fn(ctx)   │ fn(ctx)  │ fn(ctx)->Option<> │    │
//! │  │ Lost      │ fn(ctx)   │    -     │ fn(ctx)->Option<> │    │
//! │  └───────────┴───────────┴──────────┴───────────────────┘    │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each tick the engine calls `on_update` for the current state.  If it
//! returns `Some(next)`, the engine runs `on_exit` for the current state,
//! records a [`TargetingEvent::StateChanged`] in the context, then runs
//! `on_enter` for the next.  Handlers never touch hardware: they write
//! commands into the [`TargetingContext`] and the targeting service
//! applies them.

pub mod context;
pub mod states;

use context::TargetingContext;
use log::info;
use serde::{Deserialize, Serialize};

use crate::app::events::TargetingEvent;

// ---------------------------------------------------------------------------
// State identity
// ---------------------------------------------------------------------------

/// Engagement state.  Must stay in sync with [`states::build_state_table`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum TargetState {
    #[default]
    Idle = 0,
    Acquiring = 1,
    Tracking = 2,
    Lost = 3,
}

impl TargetState {
    pub const COUNT: usize = 4;

    /// Out-of-range indices map to `Idle` (laser off) in release builds.
    pub fn from_index(idx: usize) -> Self {
        match idx {
            0 => Self::Idle,
            1 => Self::Acquiring,
            2 => Self::Tracking,
            3 => Self::Lost,
            _ => {
                debug_assert!(false, "invalid state index: {idx}");
                Self::Idle
            }
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Acquiring => "ACQUIRING",
            Self::Tracking => "TRACKING",
            Self::Lost => "LOST",
        }
    }
}

impl core::fmt::Display for TargetState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// Function-pointer type aliases
// ---------------------------------------------------------------------------

/// Signature for `on_enter` and `on_exit` actions.
pub type StateActionFn = fn(&mut TargetingContext);

/// Returns `Some(next)` to trigger a transition, or `None` to stay.
pub type StateUpdateFn = fn(&mut TargetingContext) -> Option<TargetState>;

// ---------------------------------------------------------------------------
// State descriptor (one row in the table)
// ---------------------------------------------------------------------------

pub struct StateDescriptor {
    pub id: TargetState,
    pub name: &'static str,
    pub on_enter: Option<StateActionFn>,
    pub on_exit: Option<StateActionFn>,
    pub on_update: StateUpdateFn,
}

// ---------------------------------------------------------------------------
// FSM engine
// ---------------------------------------------------------------------------

pub struct Fsm {
    /// Fixed-size table indexed by `TargetState as usize`.
    table: [StateDescriptor; TargetState::COUNT],
    current: usize,
    transition_count: u64,
}

impl Fsm {
    pub fn new(table: [StateDescriptor; TargetState::COUNT], initial: TargetState) -> Self {
        Self {
            table,
            current: initial as usize,
            transition_count: 0,
        }
    }

    /// Run the initial `on_enter` for the starting state.
    pub fn start(&mut self, ctx: &mut TargetingContext) {
        info!("Targeting FSM starting in state: {}", self.table[self.current].name);
        ctx.state_entered_ms = ctx.now_ms;
        if let Some(enter) = self.table[self.current].on_enter {
            enter(ctx);
        }
    }

    /// Run one `on_update` pass.  Returns `true` if it caused a transition.
    pub fn tick(&mut self, ctx: &mut TargetingContext) -> bool {
        match (self.table[self.current].on_update)(ctx) {
            Some(next) => {
                self.transition(next, ctx);
                true
            }
            None => false,
        }
    }

    /// Jump to `next` regardless of what the handlers would decide.  A
    /// no-op when already there.
    pub fn force_transition(&mut self, next: TargetState, ctx: &mut TargetingContext) {
        if next as usize != self.current {
            self.transition(next, ctx);
        }
    }

    pub fn current_state(&self) -> TargetState {
        TargetState::from_index(self.current)
    }

    pub fn transition_count(&self) -> u64 {
        self.transition_count
    }

    // -----------------------------------------------------------------------
    // Internal
    // -----------------------------------------------------------------------

    fn transition(&mut self, next: TargetState, ctx: &mut TargetingContext) {
        let from = self.current_state();
        let next_idx = next as usize;

        info!(
            "FSM transition: {} -> {}",
            self.table[self.current].name, self.table[next_idx].name
        );

        if let Some(exit) = self.table[self.current].on_exit {
            exit(ctx);
        }

        self.current = next_idx;
        self.transition_count += 1;
        ctx.state_entered_ms = ctx.now_ms;
        ctx.push_event(TargetingEvent::StateChanged { from, to: next });

        if let Some(enter) = self.table[self.current].on_enter {
            enter(ctx);
        }
    }
}
