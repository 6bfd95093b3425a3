//! APIS turret host simulation.
//!
//! Drives the full control core against simulated hardware: a synthetic
//! hornet crosses a static scene, the operator arms the turret with a
//! short button press, and the frame and periodic loops run on a manual
//! clock at 30 fps.
//!
//! ```text
//!  synthetic frames ──▶ Turret::process_frame ──▶ SimServo
//!  ManualClock ──────▶ Turret::tick ───────────▶ SimLaser
//!  scripted button ──▶ Turret::poll_button
//! ```
//!
//! Usage: `apis-turret [config.json]`

use std::sync::Arc;

use anyhow::{Context, Result};
use log::{debug, info, warn};

use apis_turret::adapters::sim::{SimLaser, SimServo};
use apis_turret::adapters::time::ManualClock;
use apis_turret::app::events::TelemetrySnapshot;
use apis_turret::app::ports::ButtonPort;
use apis_turret::app::service::{Turret, TurretPorts};
use apis_turret::config::{CameraParams, TurretConfig};
use apis_turret::drivers::servo::ServoAxis;
use apis_turret::vision::motion::Frame;

const FRAME_INTERVAL_MS: u64 = 33;
const FRAME_COUNT: u32 = 240;
const BACKGROUND_LEVEL: u8 = 40;
const HORNET_LEVEL: u8 = 220;
const HORNET_SIZE: u32 = 24;
/// The hornet is in view for frames in this range.
const HORNET_FRAMES: core::ops::Range<u32> = 30..150;
const SUPPLY_MV: u32 = 5000;

/// Button held for the first few frames of the run, then released.
struct ScriptedButton {
    frame: u32,
}

impl ButtonPort for ScriptedButton {
    fn is_pressed(&mut self) -> bool {
        (5..11).contains(&self.frame)
    }
}

/// Gray scene with one bright square at `pos`.
fn render(camera: &CameraParams, buf: &mut [u8], pos: Option<(u32, u32)>) {
    buf.fill(BACKGROUND_LEVEL);
    let Some((x0, y0)) = pos else {
        return;
    };
    let w = camera.width as usize;
    for y in y0..(y0 + HORNET_SIZE).min(camera.height) {
        for x in x0..(x0 + HORNET_SIZE).min(camera.width) {
            buf[y as usize * w + x as usize] = HORNET_LEVEL;
        }
    }
}

fn hornet_position(frame: u32) -> Option<(u32, u32)> {
    if !HORNET_FRAMES.contains(&frame) {
        return None;
    }
    let step = frame - HORNET_FRAMES.start;
    Some((120 + step * 3, 300 + (step % 20)))
}

fn log_telemetry(snap: &TelemetrySnapshot) -> Result<()> {
    let bytes = snap.encode().context("encoding telemetry")?;
    info!(
        "t={}ms mode={} safety={} target={} laser={:?} tracks={} ({} bytes)",
        snap.timestamp_ms,
        snap.mode.name(),
        snap.safety_state,
        snap.target_state,
        snap.laser_state,
        snap.tracker.active_tracks,
        bytes.len()
    );
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("╔══════════════════════════════════════╗");
    info!("║  APIS turret simulation v{:<11} ║", env!("CARGO_PKG_VERSION"));
    info!("╚══════════════════════════════════════╝");

    // ── 1. Configuration ──────────────────────────────────────
    let config = match std::env::args().nth(1) {
        Some(path) => TurretConfig::from_json_file(path.as_ref())
            .with_context(|| format!("loading config from {path}"))?,
        None => TurretConfig {
            calibration_path: String::new(),
            ..TurretConfig::default()
        },
    };
    let camera = config.camera;

    // ── 2. Simulated hardware ─────────────────────────────────
    let clock = Arc::new(ManualClock::new(0));
    let servo = SimServo::new();
    let laser = SimLaser::new();
    let ports = TurretPorts {
        servo: Box::new(servo.clone()),
        laser: Box::new(laser.clone()),
        buzzer: None,
    };
    let turret = Turret::new(config, ports, clock.clone()).context("assembling turret")?;
    turret.set_voltage(SUPPLY_MV);

    turret.targeting().on_target_acquired(|t| {
        info!("Target acquired: track {} area {}", t.track_id, t.area);
    });
    turret.targeting().on_target_lost(|t| {
        info!("Target lost: track {} after {} ms", t.track_id, t.tracked_for_ms);
    });
    turret.safety().set_failure_listener(|e| debug!("Safety refused: {e}"));

    // ── 3. Frame loop ─────────────────────────────────────────
    let mut button = ScriptedButton { frame: 0 };
    let mut buf = vec![0u8; camera.pixel_count()];

    for frame_no in 0..FRAME_COUNT {
        clock.advance(FRAME_INTERVAL_MS);
        button.frame = frame_no;
        if let Some(event) = turret.poll_button(&mut button) {
            info!("Button: {event:?}");
        }

        render(&camera, &mut buf, hornet_position(frame_no));
        let frame = Frame::gray(&buf, camera.width, camera.height);
        match turret.process_frame(&frame) {
            Ok(report) => {
                if let Err(e) = report.targeting.laser.unwrap_or(Ok(())) {
                    debug!("Frame {frame_no}: laser denied ({e})");
                }
            }
            Err(e) => warn!("Frame {frame_no} rejected: {e}"),
        }
        turret.tick();

        if frame_no % 30 == 0 {
            log_telemetry(&turret.telemetry())?;
        }
    }

    // ── 4. Wind down ──────────────────────────────────────────
    turret.shutdown();
    let snap = turret.telemetry();
    log_telemetry(&snap)?;
    info!(
        "Done: {} targets, {} lost, {} laser activations, servo pan pulse {:?} us, emitter {}",
        snap.targeting.target_count,
        snap.targeting.lost_count,
        laser.switch_ons(),
        servo.pulse(ServoAxis::Pan),
        if laser.is_emitting() { "ON" } else { "off" }
    );
    Ok(())
}
