//! Audio transport abstraction
//!
//! A single polymorphic contract over the two playback backends: the
//! in-RAM bit-perfect player and the streaming engine driver. The
//! controller holds exactly one `Box<dyn AudioTransport>` at a time and
//! never branches on which backend is behind it.

mod ram;
mod stream;

pub use ram::RamPlayer;
pub use stream::StreamPlayer;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Unified playback state across all transports.
///
/// Legal transitions: Stopped ↔ Playing, Playing ↔ Paused,
/// Paused → Stopped. Only the owning transport mutates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    Stopped,
    Playing,
    Paused,
}

impl std::fmt::Display for PlayerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlayerState::Stopped => write!(f, "stopped"),
            PlayerState::Playing => write!(f, "playing"),
            PlayerState::Paused => write!(f, "paused"),
        }
    }
}

/// Payload delivered to end-of-track subscribers.
#[derive(Debug, Clone, Copy)]
pub struct TrackEnd {
    /// False for a natural end, true when playback died (sink write
    /// failure, engine exit) and the controller must not auto-advance.
    pub aborted: bool,
}

impl TrackEnd {
    pub fn natural() -> Self {
        Self { aborted: false }
    }

    pub fn aborted() -> Self {
        Self { aborted: true }
    }
}

/// Handle returned by [`TrackEndHooks::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookId(u64);

type Hook = Arc<dyn Fn(TrackEnd) + Send + Sync>;

/// Multi-subscriber end-of-track registry.
///
/// Backends fire it from a short-lived helper thread so the monitor or
/// playback thread never re-enters the controller, and never while
/// holding the mutex that serialises transport operations.
#[derive(Default)]
pub struct TrackEndHooks {
    hooks: Mutex<Vec<(HookId, Hook)>>,
    next_id: AtomicU64,
}

impl TrackEndHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, hook: F) -> HookId
    where
        F: Fn(TrackEnd) + Send + Sync + 'static,
    {
        let id = HookId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.hooks.lock().unwrap().push((id, Arc::new(hook)));
        id
    }

    pub fn unsubscribe(&self, id: HookId) {
        self.hooks.lock().unwrap().retain(|(hook_id, _)| *hook_id != id);
    }

    /// Detach every subscriber. Called by the controller before it drops
    /// a transport so no callback can land in a torn-down object.
    pub fn clear(&self) {
        self.hooks.lock().unwrap().clear();
    }

    /// Invoke all subscribers from a fresh thread.
    pub fn fire_detached(self: &Arc<Self>, info: TrackEnd) {
        let snapshot: Vec<Hook> = self
            .hooks
            .lock()
            .unwrap()
            .iter()
            .map(|(_, hook)| Arc::clone(hook))
            .collect();
        if snapshot.is_empty() {
            return;
        }
        std::thread::Builder::new()
            .name("track-end".to_string())
            .spawn(move || {
                for hook in snapshot {
                    hook(info);
                }
            })
            .ok();
    }
}

/// Capability set every playback backend exposes to the controller.
///
/// Track indices are 0-based. Implementations serialise their shared
/// state behind one mutex per instance and never invoke end-of-track
/// hooks under it.
pub trait AudioTransport: Send + Sync {
    /// Start or resume playback. Resumes from the saved offset when
    /// paused, starts the armed track from 0 when stopped, and is a
    /// no-op when already playing.
    fn play(&self);

    /// Playing → Paused, preserving position. Idempotent when paused,
    /// no-op when stopped.
    fn pause(&self);

    /// Transition to Stopped and discard the in-flight position. When
    /// this returns, the backend is no longer producing audio.
    fn stop(&self);

    /// Move the playhead within the current track. Out-of-range targets
    /// are rejected as a logged no-op.
    fn seek(&self, seconds: f64);

    /// Bind `index` as the current track; start playing it when
    /// `auto_play`, otherwise just arm it. Returns false when the index
    /// is out of range.
    fn navigate_to(&self, index: usize, auto_play: bool) -> bool;

    /// Hint that `index` is likely to play next. The RAM backend loads
    /// it into the idle buffer; the streaming backend ignores it.
    /// `None` clears any pending preload.
    fn prepare_next(&self, index: Option<usize>);

    /// Position within the current track, seconds. Returns 0.0 while a
    /// track change is in flight but audio has not been confirmed.
    fn position(&self) -> f64;

    /// Duration of the current track, seconds.
    fn duration(&self) -> f64;

    fn state(&self) -> PlayerState;

    fn current_track_index(&self) -> usize;

    fn track_count(&self) -> usize;

    /// The end-of-track registry this backend fires into.
    fn end_hooks(&self) -> Arc<TrackEndHooks>;

    /// Release OS resources: audio device, background threads, sockets,
    /// scratch directories. Safe to call more than once.
    fn cleanup(&self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_hooks_fire_all_subscribers_off_thread() {
        let hooks = Arc::new(TrackEndHooks::new());
        let hits = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let hits = Arc::clone(&hits);
            hooks.subscribe(move |info| {
                assert!(!info.aborted);
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }

        hooks.fire_detached(TrackEnd::natural());
        let deadline = std::time::Instant::now() + Duration::from_secs(1);
        while hits.load(Ordering::SeqCst) < 3 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_unsubscribe_and_clear() {
        let hooks = Arc::new(TrackEndHooks::new());
        let hits = Arc::new(AtomicUsize::new(0));

        let hits_a = Arc::clone(&hits);
        let id = hooks.subscribe(move |_| {
            hits_a.fetch_add(1, Ordering::SeqCst);
        });
        hooks.unsubscribe(id);
        hooks.fire_detached(TrackEnd::natural());
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        let hits_b = Arc::clone(&hits);
        hooks.subscribe(move |_| {
            hits_b.fetch_add(1, Ordering::SeqCst);
        });
        hooks.clear();
        hooks.fire_detached(TrackEnd::aborted());
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
