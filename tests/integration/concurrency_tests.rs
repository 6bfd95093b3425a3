//! Frame, periodic and reader threads against one subsystem set.
//!
//! Every subsystem guards its state with its own mutex and fires
//! listeners after unlocking, so these runs must complete without
//! deadlock and without ever commanding an upward tilt.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

use apis_turret::config::TargetingConfig;
use apis_turret::fsm::TargetState;
use apis_turret::vision::motion::Frame;

use crate::mock_hw::{Rig, hornet, turret};

const ROUNDS: u32 = 200;

#[test]
fn frame_update_readers_and_cleanup_interleave() {
    let r = Rig::new(TargetingConfig::default());
    r.button.arm();
    r.safety.set_voltage(5000);
    let done = AtomicBool::new(false);

    thread::scope(|s| {
        s.spawn(|| {
            for i in 0..ROUNDS {
                let cx = 100 + (i * 2) % 400;
                let cy = if i % 3 == 0 { 30 } else { 400 };
                r.frame(10, &[hornet(cx, cy)]);
            }
            done.store(true, Ordering::SeqCst);
        });
        s.spawn(|| {
            while !done.load(Ordering::SeqCst) {
                r.targeting.update();
                r.laser.update();
                r.safety.update();
                thread::yield_now();
            }
        });
        s.spawn(|| {
            while !done.load(Ordering::SeqCst) {
                let stats = r.targeting.stats();
                assert!(stats.laser_denials <= stats.laser_requests);
                let _ = r.targeting.current_target();
                let _ = r.targeting.tracker_stats();
                let check = r.safety.check_all();
                if let Some(tilt) = check.tilt_deg {
                    assert!(tilt <= 0.0);
                }
                let _ = r.laser.state();
                thread::yield_now();
            }
        });
        s.spawn(|| {
            for _ in 0..10 {
                if done.load(Ordering::SeqCst) {
                    break;
                }
                r.targeting.cleanup();
                r.button.disarm();
                r.button.arm();
                thread::yield_now();
            }
        });
    });

    let tilts = r.log.tilt_angles();
    assert!(!tilts.is_empty());
    assert!(tilts.iter().all(|&t| t <= 0.0), "upward tilt commanded");
    assert_eq!(r.targeting.stats().frames_processed, u64::from(ROUNDS));

    r.targeting.cleanup();
    assert_eq!(r.targeting.state(), TargetState::Idle);
    assert!(!r.laser.is_active());
    assert!(!r.log.emitter_on());
}

#[test]
fn listeners_may_call_back_into_the_service() {
    let r = Arc::new(Rig::new(TargetingConfig::default()));
    r.button.arm();
    let weak: Weak<Rig> = Arc::downgrade(&r);
    let in_callback = Arc::new(AtomicBool::new(false));
    let transitions = Arc::new(AtomicU32::new(0));

    {
        let (weak, flag, count) = (weak.clone(), in_callback.clone(), transitions.clone());
        r.targeting.on_state_change(move |_from, to| {
            assert!(!flag.swap(true, Ordering::SeqCst), "listeners must not nest");
            if let Some(r) = weak.upgrade() {
                // Locks the targeting mutex again; fine only if it was released.
                assert_eq!(r.targeting.state(), to);
                let _ = r.targeting.stats();
                let _ = r.safety.check_all();
            }
            count.fetch_add(1, Ordering::SeqCst);
            flag.store(false, Ordering::SeqCst);
        });
    }
    {
        let weak = weak.clone();
        r.targeting.on_target_acquired(move |t| {
            if let Some(r) = weak.upgrade() {
                assert!(r.targeting.track(t.track_id).is_some());
                r.targeting.set_sweep_amplitude(5.0);
            }
        });
    }
    {
        let weak = weak.clone();
        r.safety.set_failure_listener(move |_| {
            if let Some(r) = weak.upgrade() {
                let _ = r.safety.state();
                let _ = r.laser.is_active();
            }
        });
    }

    r.frame(33, &[hornet(320, 360)]);
    r.frame(33, &[hornet(322, 361)]);
    r.clock.advance(600);
    r.targeting.update();
    r.targeting.cleanup();

    // Idle → Acquiring → Tracking → Lost → Idle
    assert_eq!(transitions.load(Ordering::SeqCst), 4);
    assert_eq!(r.targeting.sweep_amplitude(), 5.0);
}

#[test]
fn turret_loops_run_on_separate_threads() {
    let (t, clock, log) = turret();
    t.button().arm();
    t.set_voltage(5000);
    let cam = t.config().camera;
    let w = cam.width as usize;
    let done = AtomicBool::new(false);

    thread::scope(|s| {
        s.spawn(|| {
            let mut buf = vec![40u8; cam.pixel_count()];
            for i in 0..60usize {
                buf.fill(40);
                let x0 = 200 + i * 2;
                for y in 340..360 {
                    buf[y * w + x0..y * w + x0 + 20].fill(220);
                }
                clock.advance(33);
                t.process_frame(&Frame::gray(&buf, cam.width, cam.height)).expect("frame");
            }
            done.store(true, Ordering::SeqCst);
        });
        s.spawn(|| {
            while !done.load(Ordering::SeqCst) {
                t.tick();
                thread::yield_now();
            }
        });
        s.spawn(|| {
            while !done.load(Ordering::SeqCst) {
                let snap = t.telemetry();
                assert!(snap.encode().is_ok());
                thread::yield_now();
            }
        });
    });

    assert!(t.targeting().stats().target_count >= 1);
    assert!(log.tilt_angles().iter().all(|&a| a <= 0.0));
    t.shutdown();
    assert!(!t.laser().is_active());
    assert!(!t.button().is_armed());
}
