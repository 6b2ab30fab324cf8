//! End-to-end RAM playback through the controller: gapless sequencing,
//! end-of-disc behavior, and event ordering.

mod helpers;

use helpers::{record_events, test_controller, wait_until};
use ramcd::events::{PlayerEvent, StatusReason};
use ramcd::transport::PlayerState;
use std::sync::atomic::Ordering;
use std::time::Duration;

/// Scaled rendition of the three-track gapless run: the whole disc plays
/// through with one track_change per boundary, a disc_end at the end,
/// and no error/stop status in between.
#[test]
fn gapless_sequence_plays_whole_disc() {
    let (controller, bytes_written) = test_controller(&[0.10, 0.05, 0.07], true);
    let events = record_events(&controller);

    controller.load(Some(1)).unwrap();

    assert!(wait_until(Duration::from_secs(10), || {
        events.lock().unwrap().iter().any(|event| {
            matches!(
                event,
                PlayerEvent::StatusChanged {
                    reason: StatusReason::DiscEnd
                }
            )
        })
    }));

    // every byte of all three tracks reached the sink
    let expected: usize = [0.10, 0.05, 0.07]
        .iter()
        .map(|s| (s * 176_400.0) as usize / 4 * 4)
        .sum();
    assert_eq!(bytes_written.load(Ordering::SeqCst), expected);

    let log = events.lock().unwrap();
    let interesting: Vec<String> = log
        .iter()
        .filter_map(|event| match event {
            PlayerEvent::TrackChanged { number, total } => {
                Some(format!("track:{}/{}", number, total))
            }
            PlayerEvent::StatusChanged { reason } => Some(format!("status:{}", reason)),
            _ => None,
        })
        .collect();
    assert_eq!(
        interesting,
        vec!["track:2/3", "track:3/3", "status:disc_end"]
    );

    assert_eq!(controller.state(), PlayerState::Stopped);
    controller.cleanup();
}

/// Repeat-track keeps replaying the same track at natural end, and the
/// very first boundary already restarts track 1: cycling repeat must
/// refresh the preload slot, or the swap would hand off into track 2.
#[test]
fn repeat_track_replays_current() {
    let (controller, _) = test_controller(&[0.05, 0.05, 0.05], false);
    let events = record_events(&controller);

    controller.load(Some(1)).unwrap();
    controller.repeat(); // track
    controller.play();

    assert!(wait_until(Duration::from_secs(5), || {
        events
            .lock()
            .unwrap()
            .iter()
            .filter(|event| matches!(event, PlayerEvent::TrackChanged { number: 1, .. }))
            .count()
            >= 2
    }));

    // every boundary stayed on track 1
    let log = events.lock().unwrap();
    assert!(log.iter().all(|event| match event {
        PlayerEvent::TrackChanged { number, .. } => *number == 1,
        _ => true,
    }));
    drop(log);
    assert_eq!(controller.current_track_number(), 1);

    controller.cleanup();
}

/// Repeat-all wraps the last track back to the first.
#[test]
fn repeat_all_wraps_disc() {
    let (controller, _) = test_controller(&[0.05, 0.05], true);
    let events = record_events(&controller);

    controller.load(Some(1)).unwrap();
    controller.repeat();
    controller.repeat(); // all

    assert!(wait_until(Duration::from_secs(5), || {
        let log = events.lock().unwrap();
        let changes: Vec<usize> = log
            .iter()
            .filter_map(|event| match event {
                PlayerEvent::TrackChanged { number, .. } => Some(*number),
                _ => None,
            })
            .collect();
        // 1 -> 2 -> 1 again proves the wrap
        changes.windows(2).any(|w| w == [2, 1])
    }));

    let log = events.lock().unwrap();
    assert!(!log.iter().any(|event| {
        matches!(
            event,
            PlayerEvent::StatusChanged {
                reason: StatusReason::DiscEnd
            }
        )
    }));
    drop(log);

    controller.cleanup();
}

/// A paused player resumes where it left off.
#[test]
fn pause_play_round_trip_preserves_position() {
    let (controller, _) = test_controller(&[4.0], true);
    controller.load(Some(1)).unwrap();

    assert!(wait_until(Duration::from_secs(2), || {
        controller.position() > 0.0
    }));
    controller.pause();
    std::thread::sleep(Duration::from_millis(50));
    let paused_at = controller.position();
    assert_eq!(controller.state(), PlayerState::Paused);

    controller.play();
    assert_eq!(controller.state(), PlayerState::Playing);
    assert!(controller.position() >= paused_at);

    controller.cleanup();
}

/// 100 redundant pauses leave state and position untouched.
#[test]
fn pause_is_idempotent_under_contention() {
    let (controller, _) = test_controller(&[4.0], true);
    controller.load(Some(1)).unwrap();

    assert!(wait_until(Duration::from_secs(2), || {
        controller.position() > 0.0
    }));
    controller.pause();
    std::thread::sleep(Duration::from_millis(50));
    let position = controller.position();

    for _ in 0..100 {
        controller.pause();
    }
    assert_eq!(controller.state(), PlayerState::Paused);
    assert_eq!(controller.position(), position);

    controller.cleanup();
}
