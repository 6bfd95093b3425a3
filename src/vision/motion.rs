//! Background-subtraction motion detector.
//!
//! ## Pipeline
//!
//! ```text
//!   BGR/Gray ─► gray ─► EMA background ─► |frame−bg| > thr ─► open ─► close ─► flood fill ─► filter
//! ```
//!
//! * The first frame after construction or [`MotionDetector::reset_background`]
//!   only seeds the background.
//! * The background learns with `warmup_learning_rate` for the first
//!   `warmup_frames` frames, then with `learning_rate`.
//! * The 1-pixel frame border is never foreground.
//! * Opening and closing use a 3×3 cross kernel.
//! * Components are 4-connected and found with a bounded explicit stack; a
//!   component that would overflow it is discarded rather than reported with
//!   partial bounds.
//!
//! All buffers are allocated once at construction for the configured
//! camera geometry; `detect` never allocates.

use std::sync::Arc;

use heapless::Vec as HVec;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use super::{Detection, MAX_DETECTIONS};
use crate::app::ports::Clock;
use crate::config::{CameraParams, MotionConfig};
use crate::error::MotionError;

/// Pixel pairs the flood-fill stack can hold.
pub const FLOOD_STACK_CAPACITY: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Gray8,
    /// Interleaved blue, green, red.
    Bgr24,
}

impl PixelFormat {
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Gray8 => 1,
            Self::Bgr24 => 3,
        }
    }
}

/// Borrowed camera frame.
#[derive(Debug, Clone, Copy)]
pub struct Frame<'a> {
    pub data: &'a [u8],
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl<'a> Frame<'a> {
    pub const fn gray(data: &'a [u8], width: u32, height: u32) -> Self {
        Self {
            data,
            width,
            height,
            format: PixelFormat::Gray8,
        }
    }

    pub const fn bgr(data: &'a [u8], width: u32, height: u32) -> Self {
        Self {
            data,
            width,
            height,
            format: PixelFormat::Bgr24,
        }
    }
}

/// Output of one [`MotionDetector::detect`] call.
#[derive(Debug, Clone, Default)]
pub struct DetectionResult {
    pub detections: HVec<Detection, MAX_DETECTIONS>,
    /// Foreground pixel count exceeded `motion_pixel_min` before morphology.
    pub has_motion: bool,
    pub motion_pixels: u32,
    /// 1-based index of the processed frame since the last background reset.
    pub frame_index: u32,
}

impl DetectionResult {
    pub fn clear(&mut self) {
        self.detections.clear();
        self.has_motion = false;
        self.motion_pixels = 0;
        self.frame_index = 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MotionStats {
    pub frames_processed: u64,
    pub frames_with_motion: u64,
    pub detections_emitted: u64,
    /// Components rejected by the area or aspect filter.
    pub filtered_components: u64,
    /// Components discarded because the flood fill ran out of stack.
    pub truncated_components: u64,
    pub rejected_frames: u64,
    pub uptime_ms: u64,
}

pub struct MotionDetector {
    config: MotionConfig,
    width: usize,
    height: usize,
    background: Vec<f32>,
    gray: Vec<u8>,
    mask: Vec<u8>,
    scratch: Vec<u8>,
    stack: Vec<(u32, u32)>,
    seeded: bool,
    frame_count: u32,
    stats: MotionStats,
    clock: Arc<dyn Clock>,
    started_ms: u64,
    stack_warned: bool,
}

impl MotionDetector {
    pub fn new(camera: CameraParams, config: MotionConfig, clock: Arc<dyn Clock>) -> Self {
        let camera = camera.sanitized();
        let config = config.sanitized();
        let pixels = camera.pixel_count();
        info!(
            "Motion detector {}x{} (threshold={}, area {}..={})",
            camera.width, camera.height, config.threshold, config.min_area, config.max_area
        );
        let started_ms = clock.now_ms();
        Self {
            config,
            width: camera.width as usize,
            height: camera.height as usize,
            background: vec![0.0; pixels],
            gray: vec![0; pixels],
            mask: vec![0; pixels],
            scratch: vec![0; pixels],
            stack: Vec::with_capacity(FLOOD_STACK_CAPACITY),
            seeded: false,
            frame_count: 0,
            stats: MotionStats::default(),
            clock,
            started_ms,
            stack_warned: false,
        }
    }

    pub fn config(&self) -> &MotionConfig {
        &self.config
    }

    /// Segment `frame` into moving regions.  Returns the number of
    /// detections written to `out`.
    pub fn detect(&mut self, frame: &Frame<'_>, out: &mut DetectionResult) -> Result<usize, MotionError> {
        out.clear();
        if let Err(e) = self.validate(frame) {
            self.stats.rejected_frames += 1;
            warn!("Motion frame rejected: {e}");
            return Err(e);
        }

        self.to_gray(frame);
        self.update_background();
        self.frame_count = self.frame_count.saturating_add(1);
        self.stats.frames_processed += 1;
        out.frame_index = self.frame_count;

        if self.frame_count <= 1 {
            debug!("Background seeded from first frame");
            return Ok(0);
        }

        let motion_pixels = self.foreground_mask();
        out.motion_pixels = motion_pixels;
        out.has_motion = motion_pixels > self.config.motion_pixel_min;
        if out.has_motion {
            self.stats.frames_with_motion += 1;
        }

        // Opening then closing.
        self.erode();
        self.dilate();
        self.dilate();
        self.erode();

        self.components(&mut out.detections);
        self.stats.detections_emitted += out.detections.len() as u64;
        Ok(out.detections.len())
    }

    /// Forget the background; the next frame re-seeds it.
    pub fn reset_background(&mut self) {
        self.seeded = false;
        self.frame_count = 0;
        self.background.fill(0.0);
        info!("Background model reset");
    }

    pub fn stats(&self) -> MotionStats {
        let mut stats = self.stats;
        stats.uptime_ms = self.clock.now_ms().saturating_sub(self.started_ms);
        stats
    }

    // ── Stages ────────────────────────────────────────────────

    fn validate(&self, frame: &Frame<'_>) -> Result<(), MotionError> {
        if frame.width as usize != self.width || frame.height as usize != self.height {
            return Err(MotionError::FrameSizeMismatch {
                width: frame.width,
                height: frame.height,
            });
        }
        let expected = self.width * self.height * frame.format.bytes_per_pixel();
        if frame.data.len() < expected {
            return Err(MotionError::BufferTooShort {
                expected,
                actual: frame.data.len(),
            });
        }
        Ok(())
    }

    fn to_gray(&mut self, frame: &Frame<'_>) {
        let n = self.gray.len();
        match frame.format {
            PixelFormat::Gray8 => self.gray.copy_from_slice(&frame.data[..n]),
            PixelFormat::Bgr24 => {
                for (g, px) in self.gray.iter_mut().zip(frame.data.chunks_exact(3)) {
                    let (b, gr, r) = (u32::from(px[0]), u32::from(px[1]), u32::from(px[2]));
                    *g = ((77 * r + 150 * gr + 29 * b) >> 8) as u8;
                }
            }
        }
    }

    fn update_background(&mut self) {
        if !self.seeded {
            for (bg, &g) in self.background.iter_mut().zip(&self.gray) {
                *bg = f32::from(g);
            }
            self.seeded = true;
            return;
        }
        let alpha = if self.frame_count < self.config.warmup_frames {
            self.config.warmup_learning_rate
        } else {
            self.config.learning_rate
        };
        let keep = 1.0 - alpha;
        for (bg, &g) in self.background.iter_mut().zip(&self.gray) {
            *bg = alpha * f32::from(g) + keep * *bg;
        }
    }

    /// Threshold against the rounded background; returns the foreground count.
    fn foreground_mask(&mut self) -> u32 {
        let thr = self.config.threshold as i32;
        let (w, h) = (self.width, self.height);
        let mut count = 0u32;
        for (i, m) in self.mask.iter_mut().enumerate() {
            let (x, y) = (i % w, i / w);
            let border = x == 0 || y == 0 || x + 1 == w || y + 1 == h;
            let bg = (self.background[i] + 0.5) as i32;
            let diff = (i32::from(self.gray[i]) - bg).abs();
            *m = if !border && diff > thr {
                count += 1;
                255
            } else {
                0
            };
        }
        count
    }

    fn erode(&mut self) {
        self.morph(|neighbourhood| neighbourhood.iter().all(|&v| v != 0), 0);
    }

    fn dilate(&mut self) {
        self.morph(|neighbourhood| neighbourhood.iter().any(|&v| v != 0), 255);
    }

    /// Apply a cross-kernel operator to interior pixels: where `pred` does
    /// not hold for erosion (or holds for dilation) the pixel becomes `set`.
    fn morph(&mut self, pred: impl Fn(&[u8; 5]) -> bool, set: u8) {
        let w = self.width;
        if w < 3 || self.height < 3 {
            return;
        }
        self.scratch.copy_from_slice(&self.mask);
        for y in 1..self.height - 1 {
            for x in 1..w - 1 {
                let i = y * w + x;
                let n = [
                    self.scratch[i - w],
                    self.scratch[i - 1],
                    self.scratch[i],
                    self.scratch[i + 1],
                    self.scratch[i + w],
                ];
                let hit = pred(&n);
                if (set == 0 && !hit) || (set != 0 && hit) {
                    self.mask[i] = set;
                }
            }
        }
    }

    fn components(&mut self, out: &mut HVec<Detection, MAX_DETECTIONS>) {
        let (w, h) = (self.width, self.height);
        // `scratch` doubles as the visited map.
        self.scratch.fill(0);

        for start in 0..w * h {
            if out.is_full() {
                break;
            }
            if self.mask[start] == 0 || self.scratch[start] != 0 {
                continue;
            }

            let (sx, sy) = ((start % w) as u32, (start / w) as u32);
            let (mut min_x, mut max_x, mut min_y, mut max_y) = (sx, sx, sy, sy);
            let mut area = 0u32;
            let (mut sum_x, mut sum_y) = (0u64, 0u64);
            let mut truncated = false;

            self.stack.clear();
            self.scratch[start] = 1;
            self.stack.push((sx, sy));

            while let Some((x, y)) = self.stack.pop() {
                area += 1;
                sum_x += u64::from(x);
                sum_y += u64::from(y);
                min_x = min_x.min(x);
                max_x = max_x.max(x);
                min_y = min_y.min(y);
                max_y = max_y.max(y);

                let neighbours = [
                    (x.checked_add(1), Some(y)),
                    (x.checked_sub(1), Some(y)),
                    (Some(x), y.checked_add(1)),
                    (Some(x), y.checked_sub(1)),
                ];
                for (nx, ny) in neighbours {
                    let (Some(nx), Some(ny)) = (nx, ny) else { continue };
                    if nx as usize >= w || ny as usize >= h {
                        continue;
                    }
                    let ni = ny as usize * w + nx as usize;
                    if self.mask[ni] == 0 || self.scratch[ni] != 0 {
                        continue;
                    }
                    if self.stack.len() >= FLOOD_STACK_CAPACITY {
                        if !self.stack_warned {
                            warn!("Flood fill stack full; oversized region discarded");
                            self.stack_warned = true;
                        }
                        truncated = true;
                        continue;
                    }
                    self.scratch[ni] = 1;
                    self.stack.push((nx, ny));
                }
            }

            if truncated {
                self.stats.truncated_components += 1;
                debug!("Discarding truncated component at ({sx},{sy}), partial area {area}");
                continue;
            }

            let bw = max_x - min_x + 1;
            let bh = max_y - min_y + 1;
            let aspect = bw as f32 / bh as f32;
            if area < self.config.min_area
                || area > self.config.max_area
                || aspect < self.config.min_aspect
                || aspect > self.config.max_aspect
            {
                self.stats.filtered_components += 1;
                continue;
            }

            let detection = Detection {
                x: min_x,
                y: min_y,
                width: bw,
                height: bh,
                area,
                centroid_x: (sum_x / u64::from(area)) as u32,
                centroid_y: (sum_y / u64::from(area)) as u32,
                confidence: area as f32 / (bw * bh) as f32,
            };
            // Capacity checked at the top of the loop.
            let _ = out.push(detection);
        }
    }
}
