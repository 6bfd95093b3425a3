//! Tracker identity assignment across a short frame sequence.

use std::sync::Arc;

use apis_turret::adapters::time::ManualClock;
use apis_turret::config::TrackerConfig;
use apis_turret::vision::Detection;
use apis_turret::vision::tracker::CentroidTracker;

fn tracker() -> CentroidTracker {
    CentroidTracker::new(TrackerConfig::default(), Arc::new(ManualClock::new(0)))
}

#[test]
fn match_move_and_spawn() {
    let mut t = tracker();

    let first = t.update(&[Detection::from_box(100, 100, 50, 50, 0.9)], 0);
    assert_eq!(first.len(), 1);
    assert!(first[0].is_new);
    let id = first[0].track_id;
    assert_eq!(id, 1);

    let second = t.update(&[Detection::from_box(110, 105, 50, 50, 0.9)], 33);
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].track_id, id);
    assert!(!second[0].is_new);

    let third = t.update(&[Detection::from_box(500, 500, 50, 50, 0.9)], 66);
    assert_eq!(third.len(), 1);
    assert!(third[0].is_new);
    assert_ne!(third[0].track_id, id);
    assert_eq!(t.track(id).map(|tr| tr.disappeared), Some(1));
    assert_eq!(t.active_count(), 2);
}

#[test]
fn history_is_oldest_first_and_bounded() {
    let mut t = tracker();
    for i in 0..40u32 {
        t.update(&[Detection::from_box(100 + i, 100, 20, 20, 1.0)], u64::from(i) * 10);
    }
    let history = t.history(1).expect("track 1");
    assert_eq!(history.len(), 30);
    assert!(history.windows(2).all(|w| w[0].timestamp_ms < w[1].timestamp_ms));
    assert_eq!(history.last().map(|p| p.timestamp_ms), Some(390));
}

#[test]
fn unmatched_track_expires_after_max_disappeared() {
    let config = TrackerConfig {
        max_disappeared: 3,
        ..TrackerConfig::default()
    };
    let mut t = CentroidTracker::new(config, Arc::new(ManualClock::new(0)));
    t.update(&[Detection::from_box(10, 10, 20, 20, 1.0)], 0);
    for frame in 1..=3 {
        t.update(&[], frame * 33);
        assert_eq!(t.active_count(), 1);
    }
    t.update(&[], 4 * 33);
    assert_eq!(t.active_count(), 0);
    assert_eq!(t.stats().tracks_expired, 1);
}
