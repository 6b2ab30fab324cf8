//! Controller command semantics: navigation, preconditions, shuffle and
//! repeat surfaces, eject/cleanup, and the head status snapshot.

mod helpers;

use helpers::{record_events, test_controller, wait_until, FakeSource};
use ramcd::config::Config;
use ramcd::controller::Controller;
use ramcd::events::{PlayerEvent, StatusReason};
use ramcd::mcub::StatusData;
use ramcd::transport::PlayerState;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

/// Five 4-second tracks, armed but not playing.
fn loaded_controller() -> Controller {
    let (controller, _) = test_controller(&[4.0, 4.0, 4.0, 4.0, 4.0], false);
    controller.load(Some(1)).unwrap();
    controller
}

#[test]
fn load_arms_first_track_without_autoplay() {
    let controller = loaded_controller();
    assert!(controller.is_loaded());
    assert_eq!(controller.state(), PlayerState::Stopped);
    assert_eq!(controller.current_track_number(), 1);
    assert_eq!(controller.total_tracks(), 5);
    assert_eq!(controller.position(), 0.0);
    controller.cleanup();
}

#[test]
fn goto_and_bounds() {
    let controller = loaded_controller();
    controller.goto(4);
    assert_eq!(controller.current_track_number(), 4);

    // out of range: state untouched
    controller.goto(0);
    controller.goto(6);
    assert_eq!(controller.current_track_number(), 4);
    controller.cleanup();
}

/// prev early in a track steps back; past two seconds it restarts.
#[test]
fn prev_threshold_semantics() {
    let controller = loaded_controller();

    controller.goto(4);
    controller.seek(1.3);
    controller.prev();
    assert_eq!(controller.current_track_number(), 3);
    assert_eq!(controller.position(), 0.0);

    controller.goto(4);
    controller.seek(3.0);
    controller.prev();
    assert_eq!(controller.current_track_number(), 4);
    assert_eq!(controller.position(), 0.0);
    controller.cleanup();
}

#[test]
fn seek_round_trip_and_rejection() {
    let controller = loaded_controller();
    controller.seek(2.5);
    assert!((controller.position() - 2.5).abs() < 0.001);

    // past the end of a 4 s track: rejected, position unchanged
    controller.seek(9.0);
    assert!((controller.position() - 2.5).abs() < 0.001);
    controller.seek(-1.0);
    assert!((controller.position() - 2.5).abs() < 0.001);
    controller.cleanup();
}

#[test]
fn next_wraps_at_disc_end() {
    let controller = loaded_controller();
    controller.goto(5);
    controller.next();
    assert_eq!(controller.current_track_number(), 1);
    controller.cleanup();
}

#[test]
fn shuffle_toggle_round_trip() {
    let controller = loaded_controller();
    controller.goto(3);

    assert_eq!(controller.shuffle(), Some(true));
    assert!(controller.shuffle_on());
    assert_eq!(controller.current_track_number(), 3);

    assert_eq!(controller.shuffle(), Some(false));
    assert_eq!(controller.current_track_number(), 3);
    controller.cleanup();
}

#[test]
fn commands_without_disc_are_noops() {
    let (controller, _) = test_controller(&[1.0], false);
    // nothing loaded: every command is a safe no-op
    controller.play();
    controller.pause();
    controller.stop();
    controller.next();
    controller.prev();
    controller.seek(1.0);
    controller.goto(1);
    assert_eq!(controller.shuffle(), None);
    assert_eq!(controller.state(), PlayerState::Stopped);
    assert!(!controller.is_loaded());
}

#[test]
fn eject_unbinds_and_opens_tray() {
    let source = Arc::new(FakeSource::new(&[1.0, 1.0]));
    let ejected = Arc::clone(&source.ejected);
    let controller = Controller::new(
        Config::default(),
        source,
        Box::new(|_| {
            Ok(Box::new(helpers::PacedSink {
                bytes_written: Arc::new(std::sync::atomic::AtomicUsize::new(0)),
            }) as Box<dyn ramcd::audio::AudioSink>)
        }),
    );

    controller.load(Some(1)).unwrap();
    assert!(controller.is_loaded());

    controller.eject();
    assert!(!controller.is_loaded());
    assert_eq!(controller.total_tracks(), 0);
    assert_eq!(ejected.load(Ordering::SeqCst), 1);

    // commands after eject stay safe
    controller.play();
    assert_eq!(controller.state(), PlayerState::Stopped);
}

#[test]
fn cleanup_twice_is_safe() {
    let controller = loaded_controller();
    controller.cleanup();
    controller.cleanup();
    assert!(!controller.is_loaded());
}

#[test]
fn scan_without_load_lists_tracks() {
    let (controller, _) = test_controller(&[1.0, 2.0, 3.0], false);
    let disc = controller.scan().unwrap();
    assert_eq!(disc.track_count(), 3);
    assert!(!controller.is_loaded());
}

/// Head status snapshot carries the MCUB repeat/single mapping.
#[test]
fn status_snapshot_repeat_mapping() {
    let controller = loaded_controller();

    let status = StatusData::from_controller(&controller);
    assert_eq!((status.repeat.as_str(), status.single.as_str()), ("0", "0"));
    assert_eq!(status.state, "S");
    assert_eq!(status.playlist_length, "5");
    assert_eq!(status.track_number, "1");
    assert_eq!(status.title, "Track 01");
    assert_eq!(status.album, "Test Disc");

    controller.repeat(); // track
    let status = StatusData::from_controller(&controller);
    assert_eq!((status.repeat.as_str(), status.single.as_str()), ("1", "1"));

    controller.repeat(); // all
    let status = StatusData::from_controller(&controller);
    assert_eq!((status.repeat.as_str(), status.single.as_str()), ("1", "0"));

    controller.repeat(); // off again
    let status = StatusData::from_controller(&controller);
    assert_eq!((status.repeat.as_str(), status.single.as_str()), ("0", "0"));

    controller.shuffle();
    let status = StatusData::from_controller(&controller);
    assert_eq!(status.random, "1");
    controller.cleanup();
}

/// Navigation while playing keeps audio flowing and re-preloads.
#[test]
fn navigation_during_playback() {
    let (controller, bytes_written) = test_controller(&[2.0, 2.0, 2.0], true);
    let events = record_events(&controller);
    controller.load(Some(1)).unwrap();
    assert_eq!(controller.state(), PlayerState::Playing);

    assert!(wait_until(Duration::from_secs(2), || {
        bytes_written.load(Ordering::SeqCst) > 0
    }));

    controller.next();
    assert_eq!(controller.current_track_number(), 2);
    assert_eq!(controller.state(), PlayerState::Playing);

    assert!(wait_until(Duration::from_secs(2), || {
        events
            .lock()
            .unwrap()
            .iter()
            .any(|event| matches!(event, PlayerEvent::TrackChanged { number: 2, .. }))
    }));

    let log = events.lock().unwrap();
    assert!(!log.iter().any(|event| {
        matches!(
            event,
            PlayerEvent::StatusChanged {
                reason: StatusReason::Error
            }
        )
    }));
    drop(log);
    controller.cleanup();
}
