//! Targeting service: detections in, servo aim and gated laser out.
//!
//! ```text
//!  [Detection] ──▶ CentroidTracker ──▶ HornetClassifier ──▶ candidate ──▶ CoordinateMapper
//!                                                                              │
//!                                                                              ▼
//!                                                                    Fsm (≤4 passes) ──▶ commands
//!                                                                                          │
//!                                          ServoController ◀── aim (not in SafeMode) ──────┤
//!                                          SafetyLayer     ◀── tilt/laser ─────────────────┘
//! ```
//!
//! One mutex guards the FSM, its context, the owned tracker and the
//! classifier.  The service holds it while calling down into the mapper,
//! servo and safety layer (lock order Targeting → {Mapper, Servo, Safety}).
//! Listener callbacks receive copies and run after the lock is released, so
//! they may call back into any accessor.

use std::sync::{Arc, Mutex};

use heapless::Vec as HVec;
use log::{debug, info, warn};

use crate::app::events::{LostTarget, TargetInfo, TargetingEvent, TargetingStats};
use crate::app::ports::Clock;
use crate::config::{
    ClassifierConfig, TargetingConfig, TrackerConfig, clamp_sweep_amplitude, clamp_sweep_frequency,
};
use crate::control::coordinate::{CoordinateMapper, PixelCoord};
use crate::drivers::servo::{ServoController, ServoPosition};
use crate::error::SafetyError;
use crate::fsm::context::{LaserRequest, MAX_PENDING_EVENTS, TargetCommands, TargetingContext, Trigger};
use crate::fsm::states::build_state_table;
use crate::fsm::{Fsm, TargetState};
use crate::safety::SafetyLayer;
use crate::sync::lock;
use crate::vision::Detection;
use crate::vision::classifier::{ClassifiedDetection, ClassifierStats, ClassifyResults, HornetClassifier};
use crate::vision::tracker::{CentroidTracker, MAX_TRACK_HISTORY, Track, TrackPosition, TrackResults, TrackerStats};

/// Handler passes per call; enough for Idle → Acquiring → Tracking.
const MAX_SETTLE_PASSES: usize = 4;

pub type StateListener = Arc<dyn Fn(TargetState, TargetState) + Send + Sync>;
pub type AcquiredListener = Arc<dyn Fn(TargetInfo) + Send + Sync>;
pub type LostListener = Arc<dyn Fn(LostTarget) + Send + Sync>;

/// Outcome of one [`Targeting::process_detections`] call.
#[derive(Debug, Clone)]
pub struct ProcessReport {
    pub state: TargetState,
    pub tracked: TrackResults,
    /// Hornet grade of every tracked detection, in the same order.
    pub classified: ClassifyResults,
    pub target: Option<TargetInfo>,
    /// Result of the laser request made this frame, if any.
    pub laser: Option<Result<(), SafetyError>>,
}

struct Notices {
    events: HVec<TargetingEvent, MAX_PENDING_EVENTS>,
    on_state: Option<StateListener>,
    on_acquired: Option<AcquiredListener>,
    on_lost: Option<LostListener>,
}

struct TargetingInner {
    fsm: Fsm,
    ctx: TargetingContext,
    tracker: CentroidTracker,
    classifier: HornetClassifier,
    sweep_amplitude_deg: f32,
    sweep_frequency_hz: f32,
    sweep_cycles: u64,
    multi_target_count: u32,
    frames_processed: u64,
    laser_requests: u64,
    laser_denials: u64,
    unmapped_candidates: u64,
    on_state: Option<StateListener>,
    on_acquired: Option<AcquiredListener>,
    on_lost: Option<LostListener>,
}

impl TargetingInner {
    fn settle(&mut self) {
        for _ in 0..MAX_SETTLE_PASSES {
            if !self.fsm.tick(&mut self.ctx) {
                break;
            }
        }
    }

    fn take_notices(&mut self) -> Notices {
        Notices {
            events: core::mem::take(&mut self.ctx.events),
            on_state: self.on_state.clone(),
            on_acquired: self.on_acquired.clone(),
            on_lost: self.on_lost.clone(),
        }
    }

    fn qualifies(&self, graded: &ClassifiedDetection) -> bool {
        let det: &Detection = &graded.detection;
        let config = &self.ctx.config;
        det.area >= config.min_target_area
            && det.confidence >= config.min_confidence
            && graded.confidence >= config.min_hornet_confidence
    }
}

pub struct Targeting {
    inner: Mutex<TargetingInner>,
    safety: Arc<SafetyLayer>,
    servo: Arc<ServoController>,
    mapper: Arc<CoordinateMapper>,
    clock: Arc<dyn Clock>,
    started_ms: u64,
}

impl Targeting {
    pub fn new(
        config: TargetingConfig,
        tracker_config: TrackerConfig,
        safety: Arc<SafetyLayer>,
        servo: Arc<ServoController>,
        mapper: Arc<CoordinateMapper>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let config = config.sanitized();
        let now = clock.now_ms();
        let mut ctx = TargetingContext::new(config);
        ctx.now_ms = now;
        let mut fsm = Fsm::new(build_state_table(), TargetState::Idle);
        fsm.start(&mut ctx);
        ctx.commands = TargetCommands::default();
        ctx.events.clear();

        info!(
            "Targeting initialized (sweep {:.1} deg @ {:.1} Hz, lost timeout {} ms)",
            config.sweep_amplitude_deg, config.sweep_frequency_hz, config.lost_timeout_ms
        );

        Self {
            inner: Mutex::new(TargetingInner {
                fsm,
                ctx,
                tracker: CentroidTracker::new(tracker_config, Arc::clone(&clock)),
                classifier: HornetClassifier::new(ClassifierConfig::default()),
                sweep_amplitude_deg: config.sweep_amplitude_deg,
                sweep_frequency_hz: config.sweep_frequency_hz,
                sweep_cycles: 0,
                multi_target_count: 0,
                frames_processed: 0,
                laser_requests: 0,
                laser_denials: 0,
                unmapped_candidates: 0,
                on_state: None,
                on_acquired: None,
                on_lost: None,
            }),
            safety,
            servo,
            mapper,
            clock,
            started_ms: now,
        }
    }

    /// Replace the default hornet classifier bands.
    #[must_use]
    pub fn with_classifier(self, config: ClassifierConfig) -> Self {
        lock(&self.inner).classifier = HornetClassifier::new(config);
        self
    }

    // ── Frame path ────────────────────────────────────────────

    /// Track `detections`, step the state machine, aim, and request the
    /// laser while Tracking.
    pub fn process_detections(&self, detections: &[Detection]) -> ProcessReport {
        let now = self.clock.now_ms();
        let (report, notices) = {
            let mut guard = lock(&self.inner);
            let inner = &mut *guard;
            inner.frames_processed += 1;

            let tracked = inner.tracker.update(detections, now);
            let classified = inner.classifier.classify_all(&tracked, &inner.tracker);
            let candidate = self.select_candidate(inner, &classified);
            inner.ctx.begin(Trigger::Detections, now, candidate);
            inner.settle();
            let laser = self.apply_commands(inner);

            let report = ProcessReport {
                state: inner.fsm.current_state(),
                tracked,
                classified,
                target: inner.ctx.target,
                laser,
            };
            (report, inner.take_notices())
        };
        notify(notices);
        report
    }

    // ── Periodic path ─────────────────────────────────────────

    /// Sweep while Idle and detect lost targets by timeout.
    pub fn update(&self) -> TargetState {
        let now = self.clock.now_ms();
        let (state, notices) = {
            let mut guard = lock(&self.inner);
            let inner = &mut *guard;
            inner.ctx.begin(Trigger::Tick, now, None);
            inner.settle();
            if inner.fsm.current_state() == TargetState::Idle {
                let aim = sweep_position(inner);
                inner.ctx.commands.aim = Some(aim);
            }
            self.apply_commands(inner);
            (inner.fsm.current_state(), inner.take_notices())
        };
        notify(notices);
        state
    }

    /// Laser off, detection cleared, servo home, tracker reset, Idle.
    pub fn cleanup(&self) {
        let now = self.clock.now_ms();
        let notices = {
            let mut guard = lock(&self.inner);
            let inner = &mut *guard;
            let _ = self.safety.laser_off();
            self.safety.set_detection_active(false);
            if let Err(e) = self.servo.move_immediate(ServoPosition::HOME) {
                warn!("Targeting cleanup: servo home failed: {e}");
            }
            inner.tracker.reset();
            inner.ctx.begin(Trigger::Tick, now, None);
            inner.fsm.force_transition(TargetState::Idle, &mut inner.ctx);
            inner.ctx.target = None;
            inner.ctx.commands = TargetCommands::default();
            info!("Targeting cleaned up");
            inner.take_notices()
        };
        notify(notices);
    }

    // ── Sweep parameters ──────────────────────────────────────

    pub fn set_sweep_amplitude(&self, deg: f32) {
        lock(&self.inner).sweep_amplitude_deg = clamp_sweep_amplitude(deg);
    }

    pub fn sweep_amplitude(&self) -> f32 {
        lock(&self.inner).sweep_amplitude_deg
    }

    pub fn set_sweep_frequency(&self, hz: f32) {
        lock(&self.inner).sweep_frequency_hz = clamp_sweep_frequency(hz);
    }

    pub fn sweep_frequency(&self) -> f32 {
        lock(&self.inner).sweep_frequency_hz
    }

    // ── Queries ───────────────────────────────────────────────

    pub fn state(&self) -> TargetState {
        lock(&self.inner).fsm.current_state()
    }

    pub fn current_target(&self) -> Option<TargetInfo> {
        lock(&self.inner).ctx.target
    }

    pub fn track(&self, id: u32) -> Option<Track> {
        lock(&self.inner).tracker.track(id)
    }

    pub fn track_history(&self, id: u32) -> Option<HVec<TrackPosition, MAX_TRACK_HISTORY>> {
        lock(&self.inner).tracker.history(id)
    }

    pub fn tracker_stats(&self) -> TrackerStats {
        lock(&self.inner).tracker.stats()
    }

    pub fn classifier_stats(&self) -> ClassifierStats {
        lock(&self.inner).classifier.stats()
    }

    pub fn stats(&self) -> TargetingStats {
        let inner = lock(&self.inner);
        let counters = inner.ctx.counters;
        TargetingStats {
            state: inner.fsm.current_state(),
            target_count: counters.target_count,
            lost_count: counters.lost_count,
            reacquired_count: counters.reacquired_count,
            multi_target_count: inner.multi_target_count,
            sweep_cycles: inner.sweep_cycles,
            total_track_time_ms: counters.total_track_time_ms,
            frames_processed: inner.frames_processed,
            laser_requests: inner.laser_requests,
            laser_denials: inner.laser_denials,
            unmapped_candidates: inner.unmapped_candidates,
            uptime_ms: self.clock.now_ms().saturating_sub(self.started_ms),
        }
    }

    // ── Listeners ─────────────────────────────────────────────

    pub fn on_state_change(&self, f: impl Fn(TargetState, TargetState) + Send + Sync + 'static) {
        lock(&self.inner).on_state = Some(Arc::new(f));
    }

    pub fn on_target_acquired(&self, f: impl Fn(TargetInfo) + Send + Sync + 'static) {
        lock(&self.inner).on_acquired = Some(Arc::new(f));
    }

    pub fn on_target_lost(&self, f: impl Fn(LostTarget) + Send + Sync + 'static) {
        lock(&self.inner).on_lost = Some(Arc::new(f));
    }

    pub fn clear_listeners(&self) {
        let mut inner = lock(&self.inner);
        inner.on_state = None;
        inner.on_acquired = None;
        inner.on_lost = None;
    }

    // ── Internal ──────────────────────────────────────────────

    /// The engaged track when present, otherwise the best qualifying
    /// detection: highest hornet grade, then largest area, then lower id.
    fn select_candidate(&self, inner: &mut TargetingInner, graded: &ClassifyResults) -> Option<TargetInfo> {
        let engaged = inner.ctx.target.map(|t| t.track_id);
        let mut preferred = None;
        let mut best: Option<&ClassifiedDetection> = None;
        let mut qualifying = 0u32;

        for g in graded {
            if Some(g.track_id) == engaged {
                preferred = Some(g);
            }
            if !inner.qualifies(g) {
                continue;
            }
            qualifying += 1;
            let better = best.is_none_or(|b| {
                (g.confidence, g.detection.area) > (b.confidence, b.detection.area)
                    || ((g.confidence, g.detection.area) == (b.confidence, b.detection.area)
                        && g.track_id < b.track_id)
            });
            if better {
                best = Some(g);
            }
        }
        if qualifying > 1 {
            inner.multi_target_count = inner.multi_target_count.saturating_add(1);
        }

        let chosen = preferred.or(best)?;
        let track = inner.tracker.track(chosen.track_id)?;
        let det = chosen.detection;
        let pixel = PixelCoord::new(det.centroid_x as i32, det.centroid_y as i32);
        let angle = match self.mapper.pixel_to_angle(pixel) {
            Ok(angle) => angle,
            Err(e) => {
                inner.unmapped_candidates += 1;
                debug!("Track {} not mappable: {e}", chosen.track_id);
                return None;
            }
        };
        let mut info = TargetInfo::from_detection(
            chosen.track_id,
            &det,
            angle,
            track.first_seen_ms,
            track.last_seen_ms,
            track.hits,
        );
        info.hornet = chosen.confidence;
        Some(info)
    }

    fn apply_commands(&self, inner: &mut TargetingInner) -> Option<Result<(), SafetyError>> {
        let cmds = core::mem::take(&mut inner.ctx.commands);

        // Safe mode owns the servo; it stays parked.
        if let Some(aim) = cmds.aim.filter(|_| !self.safety.is_safe_mode()) {
            match self.servo.move_to(aim) {
                Ok(mv) => {
                    if let Err(e) = self.safety.validate_tilt(mv.position.tilt_deg) {
                        warn!("Commanded tilt rejected: {e}");
                    }
                }
                Err(e) => warn!("Servo move failed: {e}"),
            }
        }

        match cmds.laser {
            LaserRequest::Keep => None,
            LaserRequest::On => {
                self.safety.set_detection_active(true);
                inner.laser_requests += 1;
                let result = self.safety.laser_on();
                if let Err(e) = result {
                    inner.laser_denials += 1;
                    debug!("Laser request denied: {e}");
                }
                Some(result)
            }
            LaserRequest::Off => {
                self.safety.set_detection_active(false);
                Some(self.safety.laser_off())
            }
        }
    }
}

/// Pan offset `amplitude × sin(2π f t)` around home, counting whole cycles.
fn sweep_position(inner: &mut TargetingInner) -> ServoPosition {
    let elapsed_s = inner.ctx.ms_in_state() as f32 / 1000.0;
    let freq = inner.sweep_frequency_hz;
    let cycles = (elapsed_s * freq) as u64;
    if cycles > inner.ctx.sweep_cycle {
        inner.sweep_cycles += cycles - inner.ctx.sweep_cycle;
        inner.ctx.sweep_cycle = cycles;
    }
    let phase = 2.0 * core::f32::consts::PI * freq * elapsed_s;
    let offset = inner.sweep_amplitude_deg * phase.sin();
    ServoPosition::new(ServoPosition::HOME.pan_deg + offset, ServoPosition::HOME.tilt_deg)
}

fn notify(notices: Notices) {
    for event in notices.events {
        match event {
            TargetingEvent::StateChanged { from, to } => {
                if let Some(f) = &notices.on_state {
                    f(from, to);
                }
            }
            TargetingEvent::Acquired(target) => {
                if let Some(f) = &notices.on_acquired {
                    f(target);
                }
            }
            TargetingEvent::Lost(lost) => {
                if let Some(f) = &notices.on_lost {
                    f(lost);
                }
            }
        }
    }
}
