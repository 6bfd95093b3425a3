//! Pixel ⇄ servo-angle mapping with a per-axis linear calibration.
//!
//! ```text
//!   raw pan  =  (x / w − 0.5) · fov_h
//!   raw tilt = −(y / h − 0.5) · fov_v
//!   angle    =  clamp(raw · scale + offset)
//! ```
//!
//! Calibration is fitted from up to [`MAX_CALIBRATION_POINTS`] pixel/angle
//! pairs and persisted as JSON.  Saves go through a temporary file and a
//! rename so a partially written calibration is never loaded.

use std::io::ErrorKind;
use std::path::Path;
use std::sync::{Arc, Mutex};

use heapless::Vec as HVec;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::app::ports::Clock;
use crate::config::CameraParams;
use crate::drivers::servo::ServoPosition;
use crate::error::CoordError;
use crate::sync::lock;

pub const MAX_CALIBRATION_POINTS: usize = 4;

/// Scales outside this range are treated as corrupt.
pub const SCALE_MIN: f32 = 0.1;
pub const SCALE_MAX: f32 = 10.0;

/// Below this raw-angle spread a fitted scale is meaningless.
const MIN_FIT_SPREAD_DEG: f32 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PixelCoord {
    pub x: i32,
    pub y: i32,
}

impl PixelCoord {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationPoint {
    pub pixel: PixelCoord,
    /// Angle at which the beam actually hit `pixel`.
    pub angle: ServoPosition,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationData {
    #[serde(default)]
    pub offset_pan_deg: f32,
    #[serde(default)]
    pub offset_tilt_deg: f32,
    #[serde(default = "unit_scale")]
    pub scale_pan: f32,
    #[serde(default = "unit_scale")]
    pub scale_tilt: f32,
    /// Clock time of the last fit or save.
    #[serde(default)]
    pub timestamp: u64,
    #[serde(default)]
    pub camera: CameraParams,
    #[serde(default)]
    pub points: HVec<CalibrationPoint, MAX_CALIBRATION_POINTS>,
    #[serde(default)]
    pub calibrated: bool,
}

fn unit_scale() -> f32 {
    1.0
}

impl CalibrationData {
    fn identity(camera: CameraParams) -> Self {
        Self {
            offset_pan_deg: 0.0,
            offset_tilt_deg: 0.0,
            scale_pan: 1.0,
            scale_tilt: 1.0,
            timestamp: 0,
            camera,
            points: HVec::new(),
            calibrated: false,
        }
    }

    /// Replace non-finite offsets with 0 and insane scales with 1.
    fn sanitize(&mut self) {
        if !self.offset_pan_deg.is_finite() {
            self.offset_pan_deg = 0.0;
        }
        if !self.offset_tilt_deg.is_finite() {
            self.offset_tilt_deg = 0.0;
        }
        self.scale_pan = sane_scale(self.scale_pan);
        self.scale_tilt = sane_scale(self.scale_tilt);
    }
}

fn scale_is_sane(scale: f32) -> bool {
    (SCALE_MIN..=SCALE_MAX).contains(&scale)
}

fn sane_scale(scale: f32) -> f32 {
    if scale_is_sane(scale) {
        scale
    } else {
        warn!("Calibration scale {scale} rejected, using 1.0");
        1.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CoordStats {
    pub map_count: u32,
    pub out_of_bounds_count: u32,
    pub calibrated: bool,
    pub point_count: u8,
    pub uptime_ms: u64,
}

struct MapperInner {
    camera: CameraParams,
    calibration: CalibrationData,
    map_count: u32,
    out_of_bounds_count: u32,
}

impl MapperInner {
    fn in_frame(&self, p: PixelCoord) -> bool {
        p.x >= 0
            && p.y >= 0
            && (p.x as u32) < self.camera.width
            && (p.y as u32) < self.camera.height
    }

    fn raw_angle(&self, p: PixelCoord) -> ServoPosition {
        let nx = p.x as f32 / self.camera.width as f32 - 0.5;
        let ny = p.y as f32 / self.camera.height as f32 - 0.5;
        ServoPosition::new(nx * self.camera.fov_h_deg, -ny * self.camera.fov_v_deg)
    }
}

pub struct CoordinateMapper {
    inner: Mutex<MapperInner>,
    clock: Arc<dyn Clock>,
    started_ms: u64,
}

impl CoordinateMapper {
    pub fn new(camera: CameraParams, clock: Arc<dyn Clock>) -> Self {
        let camera = camera.sanitized();
        info!(
            "Coordinate mapper {}x{}, FOV {:.1}x{:.1} deg",
            camera.width, camera.height, camera.fov_h_deg, camera.fov_v_deg
        );
        let started_ms = clock.now_ms();
        Self {
            inner: Mutex::new(MapperInner {
                camera,
                calibration: CalibrationData::identity(camera),
                map_count: 0,
                out_of_bounds_count: 0,
            }),
            clock,
            started_ms,
        }
    }

    // ── Mapping ───────────────────────────────────────────────

    /// Calibrated, clamped servo angle aiming at `pixel`.
    pub fn pixel_to_angle(&self, pixel: PixelCoord) -> Result<ServoPosition, CoordError> {
        let mut inner = lock(&self.inner);
        if !inner.in_frame(pixel) {
            inner.out_of_bounds_count = inner.out_of_bounds_count.saturating_add(1);
            return Err(CoordError::OutOfBounds);
        }
        let raw = inner.raw_angle(pixel);
        let cal = &inner.calibration;
        let (angle, _) = ServoPosition::new(
            raw.pan_deg * cal.scale_pan + cal.offset_pan_deg,
            raw.tilt_deg * cal.scale_tilt + cal.offset_tilt_deg,
        )
        .clamped();
        inner.map_count = inner.map_count.saturating_add(1);
        Ok(angle)
    }

    /// Approximate inverse of [`pixel_to_angle`](Self::pixel_to_angle),
    /// clamped to the frame.
    pub fn angle_to_pixel(&self, angle: ServoPosition) -> PixelCoord {
        let inner = lock(&self.inner);
        let cal = &inner.calibration;
        let cam = &inner.camera;
        let pan = (angle.pan_deg - cal.offset_pan_deg) / cal.scale_pan;
        let tilt = (angle.tilt_deg - cal.offset_tilt_deg) / cal.scale_tilt;
        let x = (pan / cam.fov_h_deg + 0.5) * cam.width as f32;
        let y = (-tilt / cam.fov_v_deg + 0.5) * cam.height as f32;
        let max_x = cam.width.saturating_sub(1) as f32;
        let max_y = cam.height.saturating_sub(1) as f32;
        // NaN saturates to 0 in the cast.
        PixelCoord::new(x.clamp(0.0, max_x) as i32, y.clamp(0.0, max_y) as i32)
    }

    // ── Calibration ───────────────────────────────────────────

    pub fn set_offsets(&self, pan_deg: f32, tilt_deg: f32) {
        let mut inner = lock(&self.inner);
        let cal = &mut inner.calibration;
        cal.offset_pan_deg = if pan_deg.is_finite() { pan_deg } else { 0.0 };
        cal.offset_tilt_deg = if tilt_deg.is_finite() { tilt_deg } else { 0.0 };
        debug!("Calibration offsets set: pan={pan_deg:.2}, tilt={tilt_deg:.2}");
    }

    pub fn offsets(&self) -> (f32, f32) {
        let inner = lock(&self.inner);
        (inner.calibration.offset_pan_deg, inner.calibration.offset_tilt_deg)
    }

    /// Scales outside [`SCALE_MIN`]..=[`SCALE_MAX`] are reset to 1.0.
    pub fn set_scales(&self, pan: f32, tilt: f32) {
        let mut inner = lock(&self.inner);
        inner.calibration.scale_pan = sane_scale(pan);
        inner.calibration.scale_tilt = sane_scale(tilt);
    }

    pub fn scales(&self) -> (f32, f32) {
        let inner = lock(&self.inner);
        (inner.calibration.scale_pan, inner.calibration.scale_tilt)
    }

    pub fn add_point(&self, pixel: PixelCoord, angle: ServoPosition) -> Result<usize, CoordError> {
        let mut inner = lock(&self.inner);
        if !inner.in_frame(pixel) {
            inner.out_of_bounds_count = inner.out_of_bounds_count.saturating_add(1);
            return Err(CoordError::OutOfBounds);
        }
        if !angle.pan_deg.is_finite() || !angle.tilt_deg.is_finite() {
            return Err(CoordError::InvalidParam("calibration angle must be finite"));
        }
        inner
            .calibration
            .points
            .push(CalibrationPoint { pixel, angle })
            .map_err(|_| CoordError::PointCapReached)?;
        Ok(inner.calibration.points.len())
    }

    pub fn clear_points(&self) {
        lock(&self.inner).calibration.points.clear();
    }

    pub fn point_count(&self) -> usize {
        lock(&self.inner).calibration.points.len()
    }

    /// Fit offsets and scales from the recorded points.
    pub fn compute_calibration(&self) -> Result<CalibrationData, CoordError> {
        let now = self.clock.now_ms();
        let mut inner = lock(&self.inner);
        let n = inner.calibration.points.len();
        if n == 0 {
            return Err(CoordError::NotEnoughPoints);
        }

        let mut raw_pan: HVec<f32, MAX_CALIBRATION_POINTS> = HVec::new();
        let mut raw_tilt: HVec<f32, MAX_CALIBRATION_POINTS> = HVec::new();
        let mut act_pan: HVec<f32, MAX_CALIBRATION_POINTS> = HVec::new();
        let mut act_tilt: HVec<f32, MAX_CALIBRATION_POINTS> = HVec::new();
        for p in &inner.calibration.points {
            let raw = inner.raw_angle(p.pixel);
            let _ = raw_pan.push(raw.pan_deg);
            let _ = raw_tilt.push(raw.tilt_deg);
            let _ = act_pan.push(p.angle.pan_deg);
            let _ = act_tilt.push(p.angle.tilt_deg);
        }

        let (scale_pan, offset_pan) = fit_axis(&raw_pan, &act_pan);
        let (scale_tilt, offset_tilt) = fit_axis(&raw_tilt, &act_tilt);
        let camera = inner.camera;
        let cal = &mut inner.calibration;
        cal.scale_pan = scale_pan;
        cal.offset_pan_deg = offset_pan;
        cal.scale_tilt = scale_tilt;
        cal.offset_tilt_deg = offset_tilt;
        cal.camera = camera;
        cal.timestamp = now;
        cal.calibrated = true;
        info!(
            "Calibration from {n} points: offset=({offset_pan:.2}, {offset_tilt:.2}) scale=({scale_pan:.3}, {scale_tilt:.3})"
        );
        Ok(cal.clone())
    }

    /// Back to identity; recorded points are kept.
    pub fn reset_calibration(&self) {
        let mut inner = lock(&self.inner);
        let points = core::mem::take(&mut inner.calibration.points);
        inner.calibration = CalibrationData {
            points,
            ..CalibrationData::identity(inner.camera)
        };
        info!("Calibration reset");
    }

    pub fn is_calibrated(&self) -> bool {
        lock(&self.inner).calibration.calibrated
    }

    pub fn calibration(&self) -> CalibrationData {
        lock(&self.inner).calibration.clone()
    }

    // ── Camera ────────────────────────────────────────────────

    pub fn camera_params(&self) -> CameraParams {
        lock(&self.inner).camera
    }

    pub fn set_camera_params(&self, camera: CameraParams) -> Result<(), CoordError> {
        camera.validate().map_err(CoordError::InvalidParam)?;
        let mut inner = lock(&self.inner);
        inner.camera = camera;
        inner.calibration.camera = camera;
        info!(
            "Camera params updated: {}x{}, FOV {:.1}x{:.1}",
            camera.width, camera.height, camera.fov_h_deg, camera.fov_v_deg
        );
        Ok(())
    }

    // ── Persistence ───────────────────────────────────────────

    pub fn save(&self, path: &Path) -> Result<(), CoordError> {
        let mut data = self.calibration();
        data.timestamp = self.clock.now_ms();
        let json = serde_json::to_string_pretty(&data).map_err(|_| CoordError::Io)?;

        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|e| {
            warn!("Calibration write to {} failed: {e}", tmp.display());
            CoordError::Io
        })?;
        std::fs::rename(&tmp, path).map_err(|e| {
            warn!("Calibration rename to {} failed: {e}", path.display());
            let _ = std::fs::remove_file(&tmp);
            CoordError::Io
        })?;
        info!("Saved calibration to {}", path.display());
        Ok(())
    }

    pub fn load(&self, path: &Path) -> Result<CalibrationData, CoordError> {
        let text = std::fs::read_to_string(path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => {
                warn!("Calibration file not found: {}", path.display());
                CoordError::FileNotFound
            }
            ErrorKind::InvalidData => CoordError::FileInvalid,
            _ => CoordError::Io,
        })?;
        let mut data: CalibrationData = serde_json::from_str(&text).map_err(|e| {
            warn!("Calibration file {} malformed: {e}", path.display());
            CoordError::FileInvalid
        })?;
        data.sanitize();

        let mut inner = lock(&self.inner);
        if data.camera != inner.camera {
            warn!(
                "Calibration was made for {}x{}, camera is {}x{}",
                data.camera.width, data.camera.height, inner.camera.width, inner.camera.height
            );
        }
        inner.calibration = data.clone();
        info!(
            "Loaded calibration: offset=({:.2}, {:.2}) scale=({:.2}, {:.2})",
            data.offset_pan_deg, data.offset_tilt_deg, data.scale_pan, data.scale_tilt
        );
        Ok(data)
    }

    pub fn stats(&self) -> CoordStats {
        let inner = lock(&self.inner);
        CoordStats {
            map_count: inner.map_count,
            out_of_bounds_count: inner.out_of_bounds_count,
            calibrated: inner.calibration.calibrated,
            point_count: inner.calibration.points.len() as u8,
            uptime_ms: self.clock.now_ms().saturating_sub(self.started_ms),
        }
    }
}

/// Least-squares line `actual = scale · raw + offset`.  Single points,
/// degenerate spreads and insane scales fall back to a pure offset.
fn fit_axis(raw: &[f32], actual: &[f32]) -> (f32, f32) {
    let n = raw.len() as f32;
    let mean_raw = raw.iter().sum::<f32>() / n;
    let mean_act = actual.iter().sum::<f32>() / n;
    let offset_only = (1.0, mean_act - mean_raw);

    if raw.len() < 2 {
        return offset_only;
    }
    let (lo, hi) = raw
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &r| (lo.min(r), hi.max(r)));
    if hi - lo < MIN_FIT_SPREAD_DEG {
        return offset_only;
    }

    let (mut cov, mut var) = (0.0f32, 0.0f32);
    for (&r, &a) in raw.iter().zip(actual) {
        cov += (r - mean_raw) * (a - mean_act);
        var += (r - mean_raw) * (r - mean_raw);
    }
    let scale = cov / var;
    if !scale_is_sane(scale) {
        debug!("Fitted scale {scale} out of range, using offset only");
        return offset_only;
    }
    (scale, mean_act - scale * mean_raw)
}
