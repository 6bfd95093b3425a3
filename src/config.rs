//! Turret configuration parameters
//!
//! All tunable parameters for the turret control core, grouped per
//! subsystem.  Every group has a `sanitized()` pass that corrects invalid
//! values to safe defaults instead of failing initialisation.  Servo axis
//! limits are deliberately absent: they are hard-coded in
//! [`crate::drivers::servo`].

use std::path::Path;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::vision::classifier::HornetConfidence;

// --- Valid ranges enforced on write ---

pub const SWEEP_AMPLITUDE_MIN_DEG: f32 = 0.0;
pub const SWEEP_AMPLITUDE_MAX_DEG: f32 = 45.0;
pub const SWEEP_FREQUENCY_MIN_HZ: f32 = 0.5;
pub const SWEEP_FREQUENCY_MAX_HZ: f32 = 5.0;

/// Clamp a requested sweep amplitude into its valid range (NaN → default).
pub fn clamp_sweep_amplitude(deg: f32) -> f32 {
    if deg.is_nan() {
        return TargetingConfig::default().sweep_amplitude_deg;
    }
    deg.clamp(SWEEP_AMPLITUDE_MIN_DEG, SWEEP_AMPLITUDE_MAX_DEG)
}

/// Clamp a requested sweep frequency into its valid range (NaN → default).
pub fn clamp_sweep_frequency(hz: f32) -> f32 {
    if hz.is_nan() {
        return TargetingConfig::default().sweep_frequency_hz;
    }
    hz.clamp(SWEEP_FREQUENCY_MIN_HZ, SWEEP_FREQUENCY_MAX_HZ)
}

// ---------------------------------------------------------------------------
// Camera
// ---------------------------------------------------------------------------

/// Camera geometry used by the coordinate mapper and the motion detector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraParams {
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Horizontal field of view in degrees
    pub fov_h_deg: f32,
    /// Vertical field of view in degrees
    pub fov_v_deg: f32,
}

impl Default for CameraParams {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            fov_h_deg: 60.0,
            fov_v_deg: 45.0,
        }
    }
}

impl CameraParams {
    /// Check the geometry without correcting it.
    pub fn validate(&self) -> core::result::Result<(), &'static str> {
        if self.width == 0 || self.height == 0 {
            return Err("camera dimensions must be non-zero");
        }
        let fov_ok = |fov: f32| fov > 0.0 && fov < 180.0;
        if !fov_ok(self.fov_h_deg) || !fov_ok(self.fov_v_deg) {
            return Err("camera FOV must lie in (0, 180) degrees");
        }
        Ok(())
    }

    pub fn sanitized(self) -> Self {
        if let Err(why) = self.validate() {
            warn!("Camera params rejected ({why}), using defaults");
            return Self::default();
        }
        self
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

// ---------------------------------------------------------------------------
// Motion detector
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionConfig {
    /// Steady-state background learning rate (0, 1]
    pub learning_rate: f32,
    /// Fast learning rate used while the background stabilises
    pub warmup_learning_rate: f32,
    /// Frames processed with the warm-up learning rate
    pub warmup_frames: u32,
    /// Per-pixel deviation that counts as foreground (1-254)
    pub threshold: u32,
    /// Minimum blob area in pixels
    pub min_area: u32,
    /// Maximum blob area in pixels
    pub max_area: u32,
    /// Minimum width/height ratio
    pub min_aspect: f32,
    /// Maximum width/height ratio
    pub max_aspect: f32,
    /// Foreground pixel count above which the frame is flagged as moving
    pub motion_pixel_min: u32,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.001,
            warmup_learning_rate: 0.05,
            warmup_frames: 100,
            threshold: 25,
            min_area: 100,
            max_area: 50_000,
            min_aspect: 0.3,
            max_aspect: 3.0,
            motion_pixel_min: 50,
        }
    }
}

impl MotionConfig {
    pub fn sanitized(mut self) -> Self {
        let defaults = Self::default();
        if !(self.learning_rate > 0.0 && self.learning_rate <= 1.0) {
            warn!("Invalid learning rate {}, using {}", self.learning_rate, defaults.learning_rate);
            self.learning_rate = defaults.learning_rate;
        }
        if !(self.warmup_learning_rate > 0.0 && self.warmup_learning_rate <= 1.0) {
            self.warmup_learning_rate = defaults.warmup_learning_rate;
        }
        if !(1..=254).contains(&self.threshold) {
            warn!("Invalid motion threshold {}, using {}", self.threshold, defaults.threshold);
            self.threshold = defaults.threshold;
        }
        if self.min_area > self.max_area {
            core::mem::swap(&mut self.min_area, &mut self.max_area);
        }
        if !(self.min_aspect > 0.0 && self.max_aspect > 0.0) {
            self.min_aspect = defaults.min_aspect;
            self.max_aspect = defaults.max_aspect;
        } else if self.min_aspect > self.max_aspect {
            core::mem::swap(&mut self.min_aspect, &mut self.max_aspect);
        }
        self
    }
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Maximum centroid distance (pixels) for a detection to match a track
    pub max_distance: u32,
    /// Consecutive unmatched updates tolerated before a track is dropped
    pub max_disappeared: u32,
    /// Positions reported by `history()` (1..=MAX_TRACK_HISTORY)
    pub history_length: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_distance: 100,
            max_disappeared: 30,
            history_length: crate::vision::tracker::MAX_TRACK_HISTORY,
        }
    }
}

impl TrackerConfig {
    pub fn sanitized(mut self) -> Self {
        if self.max_distance == 0 {
            self.max_distance = Self::default().max_distance;
        }
        self.history_length = self
            .history_length
            .clamp(1, crate::vision::tracker::MAX_TRACK_HISTORY);
        self
    }
}

// ---------------------------------------------------------------------------
// Classifier
// ---------------------------------------------------------------------------

/// Size bands use the larger box dimension, in pixels at 640x480.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Below this the object is too small to consider (likely a bee)
    pub min_size_px: u32,
    /// Above this the object is too large to be an insect
    pub max_size_px: u32,
    pub hornet_min_px: u32,
    pub hornet_max_px: u32,
    /// Largest x or y spread of the track history that still counts as hovering
    pub hover_radius_px: u32,
    /// Track age required before a hover is confirmed
    pub hover_time_ms: u64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            min_size_px: 18,
            max_size_px: 100,
            hornet_min_px: 18,
            hornet_max_px: 50,
            hover_radius_px: 50,
            hover_time_ms: 1000,
        }
    }
}

impl ClassifierConfig {
    pub fn sanitized(mut self) -> Self {
        if self.min_size_px > self.max_size_px {
            warn!("Classifier min_size > max_size, swapping");
            core::mem::swap(&mut self.min_size_px, &mut self.max_size_px);
        }
        if self.hornet_min_px > self.hornet_max_px {
            warn!("Classifier hornet_min > hornet_max, swapping");
            core::mem::swap(&mut self.hornet_min_px, &mut self.hornet_max_px);
        }
        if self.hover_time_ms == 0 {
            warn!("Classifier hover_time_ms is 0, using default");
            self.hover_time_ms = Self::default().hover_time_ms;
        }
        self
    }
}

// ---------------------------------------------------------------------------
// Targeting
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetingConfig {
    /// Pan sweep amplitude around home (degrees, 0-45)
    pub sweep_amplitude_deg: f32,
    /// Sweep frequency (Hz, 0.5-5)
    pub sweep_frequency_hz: f32,
    /// Time without a matching detection before the target is lost
    pub lost_timeout_ms: u64,
    /// Minimum detection area to qualify as a target
    pub min_target_area: u32,
    /// Minimum detection confidence to qualify as a target
    pub min_confidence: f32,
    /// Track hits required before Acquiring promotes to Tracking
    pub confirm_frames: u32,
    /// Lowest hornet grade a new candidate may have
    pub min_hornet_confidence: HornetConfidence,
}

impl Default for TargetingConfig {
    fn default() -> Self {
        Self {
            sweep_amplitude_deg: 10.0,
            sweep_frequency_hz: 2.0,
            lost_timeout_ms: 500,
            min_target_area: 100,
            min_confidence: 0.0,
            confirm_frames: 2,
            min_hornet_confidence: HornetConfidence::Medium,
        }
    }
}

impl TargetingConfig {
    pub fn sanitized(mut self) -> Self {
        self.sweep_amplitude_deg = clamp_sweep_amplitude(self.sweep_amplitude_deg);
        self.sweep_frequency_hz = clamp_sweep_frequency(self.sweep_frequency_hz);
        if self.lost_timeout_ms == 0 {
            self.lost_timeout_ms = Self::default().lost_timeout_ms;
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            self.min_confidence = 0.0;
        }
        self.confirm_frames = self.confirm_frames.max(1);
        self
    }
}

// ---------------------------------------------------------------------------
// Servo
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServoConfig {
    /// Duration of an interpolated move (0 = jump straight to the target)
    pub move_time_ms: u64,
    /// Interval between interpolation steps
    pub step_ms: u64,
    /// Consecutive stalled checks before the servo is declared failed
    pub max_consecutive_stalls: u32,
}

impl Default for ServoConfig {
    fn default() -> Self {
        Self {
            move_time_ms: 45,
            step_ms: 5,
            max_consecutive_stalls: 3,
        }
    }
}

impl ServoConfig {
    pub fn sanitized(mut self) -> Self {
        if self.step_ms == 0 {
            self.step_ms = Self::default().step_ms;
        }
        if self.move_time_ms > 0 && self.step_ms > self.move_time_ms {
            warn!("Servo step {} ms longer than move time, clamping", self.step_ms);
            self.step_ms = self.move_time_ms;
        }
        self.max_consecutive_stalls = self.max_consecutive_stalls.max(1);
        self
    }

    /// Interpolation steps per move, at least one.
    pub fn steps(&self) -> u32 {
        (self.move_time_ms / self.step_ms.max(1)).max(1) as u32
    }
}

// ---------------------------------------------------------------------------
// Safety
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    /// Watchdog expiry: no feed for this long enters safe mode
    pub watchdog_timeout_ms: u64,
    /// Watchdog warning threshold (below the timeout)
    pub watchdog_warning_ms: u64,
    /// Brownout threshold in millivolts
    pub voltage_min_mv: u32,
    /// Low-voltage warning threshold in millivolts (above brownout)
    pub voltage_warning_mv: u32,
    /// Continuous laser on-time that fails the TIME check
    pub max_continuous_on_ms: u64,
    /// Continuous laser on-time at which `update()` forces the laser off
    pub auto_off_ms: u64,
    /// Upper bound for a single `laser_activate` pulse
    pub max_activation_ms: u64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            watchdog_timeout_ms: 30_000,
            watchdog_warning_ms: 25_000,
            voltage_min_mv: 4500,
            voltage_warning_mv: 4750,
            max_continuous_on_ms: 10_000,
            auto_off_ms: 9500,
            max_activation_ms: 10_000,
        }
    }
}

impl SafetyConfig {
    pub fn sanitized(mut self) -> Self {
        let defaults = Self::default();
        if self.watchdog_timeout_ms == 0 {
            self.watchdog_timeout_ms = defaults.watchdog_timeout_ms;
        }
        if self.watchdog_warning_ms >= self.watchdog_timeout_ms {
            warn!("Watchdog warning must precede timeout, using 5/6 of timeout");
            self.watchdog_warning_ms = self.watchdog_timeout_ms * 5 / 6;
        }
        if self.voltage_warning_mv < self.voltage_min_mv {
            self.voltage_warning_mv = self.voltage_min_mv;
        }
        if self.max_continuous_on_ms == 0 {
            self.max_continuous_on_ms = defaults.max_continuous_on_ms;
        }
        if self.auto_off_ms == 0 || self.auto_off_ms > self.max_continuous_on_ms {
            self.auto_off_ms = self.max_continuous_on_ms;
        }
        self.max_activation_ms = self.max_activation_ms.clamp(1, self.max_continuous_on_ms);
        self
    }
}

// ---------------------------------------------------------------------------
// Laser
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaserConfig {
    /// Maximum continuous on-time enforced by the controller itself
    pub max_on_time_ms: u64,
    /// Re-activation lockout after the laser turns off
    pub cooldown_ms: u64,
}

impl Default for LaserConfig {
    fn default() -> Self {
        Self {
            max_on_time_ms: 10_000,
            cooldown_ms: 5000,
        }
    }
}

impl LaserConfig {
    pub fn sanitized(mut self) -> Self {
        if self.max_on_time_ms == 0 {
            self.max_on_time_ms = Self::default().max_on_time_ms;
        }
        self
    }
}

// ---------------------------------------------------------------------------
// Button
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ButtonConfig {
    /// Minimum time between accepted raw level changes
    pub debounce_ms: u64,
    /// Releases shorter than this are short presses
    pub short_press_max_ms: u64,
    /// Holding at least this long is a long press (emergency stop)
    pub long_press_ms: u64,
    /// A second short press inside this window undoes the first
    pub undo_window_ms: u64,
    /// Play buzzer tones on mode changes when a buzzer is attached
    pub buzzer_enabled: bool,
}

impl Default for ButtonConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 50,
            short_press_max_ms: 1000,
            long_press_ms: 3000,
            undo_window_ms: 2000,
            buzzer_enabled: true,
        }
    }
}

impl ButtonConfig {
    pub fn sanitized(self) -> Self {
        if self.short_press_max_ms <= self.debounce_ms || self.long_press_ms < self.short_press_max_ms {
            warn!("Inconsistent button timings, using defaults");
            return Self {
                buzzer_enabled: self.buzzer_enabled,
                ..Self::default()
            };
        }
        self
    }
}

// ---------------------------------------------------------------------------
// Aggregate
// ---------------------------------------------------------------------------

/// Core turret configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TurretConfig {
    pub camera: CameraParams,
    pub motion: MotionConfig,
    pub tracker: TrackerConfig,
    pub classifier: ClassifierConfig,
    pub targeting: TargetingConfig,
    pub servo: ServoConfig,
    pub safety: SafetyConfig,
    pub laser: LaserConfig,
    pub button: ButtonConfig,
    /// Where the coordinate mapper persists its calibration
    pub calibration_path: String,
}

impl Default for TurretConfig {
    fn default() -> Self {
        Self {
            camera: CameraParams::default(),
            motion: MotionConfig::default(),
            tracker: TrackerConfig::default(),
            classifier: ClassifierConfig::default(),
            targeting: TargetingConfig::default(),
            servo: ServoConfig::default(),
            safety: SafetyConfig::default(),
            laser: LaserConfig::default(),
            button: ButtonConfig::default(),
            calibration_path: "/data/apis/calibration.json".into(),
        }
    }
}

impl TurretConfig {
    /// Correct every group to safe values.
    pub fn sanitized(self) -> Self {
        Self {
            camera: self.camera.sanitized(),
            motion: self.motion.sanitized(),
            tracker: self.tracker.sanitized(),
            classifier: self.classifier.sanitized(),
            targeting: self.targeting.sanitized(),
            servo: self.servo.sanitized(),
            safety: self.safety.sanitized(),
            laser: self.laser.sanitized(),
            button: self.button.sanitized(),
            calibration_path: self.calibration_path,
        }
    }

    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|_| Error::Config("malformed JSON"))?;
        Ok(config.sanitized())
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text =
            std::fs::read_to_string(path).map_err(|_| Error::Config("config file unreadable"))?;
        Self::from_json_str(&text)
    }
}
