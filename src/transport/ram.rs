//! Bit-perfect gapless RAM playback
//!
//! Streams an extracted PCM image to the audio sink. Two slots hold PCM:
//! `current` is being drained by the playback thread, `next` is preloaded
//! for the upcoming track. At a natural track end the slots swap without
//! the sink ever closing, which is the gapless guarantee.
//!
//! The playback thread is the only writer of audio. It takes the state
//! mutex for short snapshots and releases it across every blocking sink
//! write; end-of-track hooks fire on a helper thread, never under the
//! mutex, so a hook that re-enters the transport cannot deadlock.

use super::{AudioTransport, PlayerState, TrackEnd, TrackEndHooks};
use crate::audio::AudioSink;
use crate::disc::{PcmChunk, PcmProvider, BYTES_PER_FRAME, BYTES_PER_SECOND};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// One PCM slot: a track's bytes plus the index it was loaded for.
struct Slot {
    index: usize,
    pcm: PcmChunk,
}

struct Shared {
    state: PlayerState,
    current: Option<Slot>,
    next: Option<Slot>,
    /// Byte cursor within `current`.
    cursor: usize,
    stop_requested: bool,
    /// Set after a fatal sink failure; cleared by the next navigation.
    failed: bool,
}

type SharedState = Arc<(Mutex<Shared>, Condvar)>;

/// In-RAM bit-perfect player.
pub struct RamPlayer {
    shared: SharedState,
    hooks: Arc<TrackEndHooks>,
    provider: Arc<dyn PcmProvider>,
    sink: Arc<Mutex<Option<Box<dyn AudioSink>>>>,
    play_thread: Mutex<Option<JoinHandle<()>>>,
    chunk_bytes: usize,
}

impl RamPlayer {
    /// Create a player over an opened sink and a PCM provider.
    ///
    /// The provider decouples the player from however the image was
    /// extracted; the sink is opened once and owned for the session.
    pub fn new(
        sink: Box<dyn AudioSink>,
        provider: Arc<dyn PcmProvider>,
        chunk_bytes: usize,
    ) -> Self {
        debug!(
            "ram player created: {} tracks, chunk {} bytes",
            provider.track_count(),
            chunk_bytes
        );
        Self {
            shared: Arc::new((
                Mutex::new(Shared {
                    state: PlayerState::Stopped,
                    current: None,
                    next: None,
                    cursor: 0,
                    stop_requested: false,
                    failed: false,
                }),
                Condvar::new(),
            )),
            hooks: Arc::new(TrackEndHooks::new()),
            provider,
            sink: Arc::new(Mutex::new(Some(sink))),
            play_thread: Mutex::new(None),
            chunk_bytes,
        }
    }

    fn spawn_playback_thread(&self) {
        let mut handle = self.play_thread.lock().unwrap();
        if let Some(old) = handle.take() {
            // Previous session's thread has exited (or is exiting); reap it.
            let _ = old.join();
        }

        let shared = Arc::clone(&self.shared);
        let hooks = Arc::clone(&self.hooks);
        let sink = Arc::clone(&self.sink);
        let chunk_bytes = self.chunk_bytes;

        match std::thread::Builder::new()
            .name("pcm-playback".to_string())
            .spawn(move || playback_loop(shared, hooks, sink, chunk_bytes))
        {
            Ok(new_handle) => *handle = Some(new_handle),
            Err(e) => {
                error!("failed to spawn playback thread: {}", e);
                self.shared.0.lock().unwrap().state = PlayerState::Stopped;
            }
        }
    }

    /// Join the playback thread with a bounded wait.
    fn reap_playback_thread(&self) {
        let mut handle = self.play_thread.lock().unwrap();
        if let Some(thread) = handle.take() {
            for _ in 0..50 {
                if thread.is_finished() {
                    break;
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            if thread.is_finished() {
                let _ = thread.join();
            } else {
                warn!("playback thread did not stop gracefully");
                *handle = Some(thread);
            }
        }
    }
}

impl AudioTransport for RamPlayer {
    fn play(&self) {
        let (lock, cvar) = &*self.shared;
        let mut s = lock.lock().unwrap();
        match s.state {
            PlayerState::Playing => {
                debug!("already playing, ignoring play()");
            }
            PlayerState::Paused => {
                s.state = PlayerState::Playing;
                cvar.notify_all();
                info!("resumed from pause");
            }
            PlayerState::Stopped => {
                if s.current.is_none() {
                    warn!("play() called but no track armed");
                    return;
                }
                if s.failed {
                    warn!("restarting playback after a sink failure");
                }
                s.stop_requested = false;
                s.failed = false;
                s.state = PlayerState::Playing;
                let position = s.cursor as f64 / BYTES_PER_SECOND as f64;
                drop(s);
                self.spawn_playback_thread();
                info!("playback started at {:.1}s", position);
            }
        }
    }

    fn pause(&self) {
        let (lock, _) = &*self.shared;
        let mut s = lock.lock().unwrap();
        if s.state == PlayerState::Playing {
            s.state = PlayerState::Paused;
            info!("paused at {:.1}s", s.cursor as f64 / BYTES_PER_SECOND as f64);
        }
    }

    fn stop(&self) {
        {
            let (lock, cvar) = &*self.shared;
            let mut s = lock.lock().unwrap();
            if s.state == PlayerState::Stopped && s.cursor == 0 {
                return;
            }
            s.state = PlayerState::Stopped;
            s.stop_requested = true;
            s.cursor = 0;
            cvar.notify_all();
        }
        self.reap_playback_thread();
        self.shared.0.lock().unwrap().stop_requested = false;
        info!("stopped");
    }

    fn seek(&self, seconds: f64) {
        let (lock, _) = &*self.shared;
        let mut s = lock.lock().unwrap();
        let Some(current) = s.current.as_ref() else {
            warn!("seek with no track armed");
            return;
        };
        let duration = current.pcm.duration_seconds();
        if !(0.0..=duration).contains(&seconds) {
            warn!("seek to {:.1}s rejected (track is {:.1}s)", seconds, duration);
            return;
        }
        let byte = (seconds * BYTES_PER_SECOND as f64) as usize;
        s.cursor = byte / BYTES_PER_FRAME * BYTES_PER_FRAME;
        info!("seek to {:.1}s", seconds);
    }

    fn navigate_to(&self, index: usize, auto_play: bool) -> bool {
        if index >= self.provider.track_count() {
            warn!(
                "navigate to track {} rejected ({} tracks)",
                index + 1,
                self.provider.track_count()
            );
            return false;
        }
        let Some(pcm) = self.provider.track_pcm(index) else {
            warn!("track {} has no PCM data", index + 1);
            return false;
        };

        let was_playing;
        {
            let (lock, cvar) = &*self.shared;
            let mut s = lock.lock().unwrap();
            was_playing = s.state == PlayerState::Playing;
            s.current = Some(Slot { index, pcm });
            s.next = None;
            s.cursor = 0;
            s.failed = false;
            if !auto_play {
                // Arm only: a live thread winds down, a paused one stops.
                if s.state != PlayerState::Stopped {
                    s.state = PlayerState::Stopped;
                    s.stop_requested = true;
                    cvar.notify_all();
                }
            }
        }

        if auto_play {
            if !was_playing {
                self.play();
            }
        } else {
            self.reap_playback_thread();
            self.shared.0.lock().unwrap().stop_requested = false;
        }
        debug!("navigated to track {} (auto_play={})", index + 1, auto_play);
        true
    }

    fn prepare_next(&self, index: Option<usize>) {
        let (lock, _) = &*self.shared;
        match index {
            Some(index) if index < self.provider.track_count() => {
                match self.provider.track_pcm(index) {
                    Some(pcm) => {
                        lock.lock().unwrap().next = Some(Slot { index, pcm });
                        debug!("preloaded track {} for gapless", index + 1);
                    }
                    None => {
                        // Not ready is not fatal; the end-of-track path
                        // will fall back to a plain stop.
                        lock.lock().unwrap().next = None;
                        debug!("track {} not ready for preload", index + 1);
                    }
                }
            }
            Some(index) => {
                warn!("preload index {} out of range", index);
                lock.lock().unwrap().next = None;
            }
            None => {
                lock.lock().unwrap().next = None;
                debug!("preload slot cleared");
            }
        }
    }

    fn position(&self) -> f64 {
        let s = self.shared.0.lock().unwrap();
        if s.current.is_none() {
            return 0.0;
        }
        s.cursor as f64 / BYTES_PER_SECOND as f64
    }

    fn duration(&self) -> f64 {
        let s = self.shared.0.lock().unwrap();
        s.current
            .as_ref()
            .map(|slot| slot.pcm.duration_seconds())
            .unwrap_or(0.0)
    }

    fn state(&self) -> PlayerState {
        self.shared.0.lock().unwrap().state
    }

    fn current_track_index(&self) -> usize {
        let s = self.shared.0.lock().unwrap();
        s.current.as_ref().map(|slot| slot.index).unwrap_or(0)
    }

    fn track_count(&self) -> usize {
        self.provider.track_count()
    }

    fn end_hooks(&self) -> Arc<TrackEndHooks> {
        Arc::clone(&self.hooks)
    }

    fn cleanup(&self) {
        debug!("ram player cleanup");
        self.stop();
        self.sink.lock().unwrap().take();
        info!("ram player cleanup complete");
    }
}

/// The playback loop. Snapshots state under the lock, writes outside it.
fn playback_loop(
    shared: SharedState,
    hooks: Arc<TrackEndHooks>,
    sink: Arc<Mutex<Option<Box<dyn AudioSink>>>>,
    chunk_bytes: usize,
) {
    debug!("playback loop started");
    let (lock, cvar) = &*shared;

    loop {
        // Snapshot phase: decide what to write next.
        let (pcm, start, end) = {
            let mut s = lock.lock().unwrap();
            loop {
                if s.stop_requested || s.state == PlayerState::Stopped {
                    debug!("playback loop ended (stop)");
                    return;
                }
                if s.state == PlayerState::Paused {
                    let (guard, _timeout) =
                        cvar.wait_timeout(s, Duration::from_millis(100)).unwrap();
                    s = guard;
                    continue;
                }
                break;
            }

            let Some(current) = s.current.as_ref() else {
                s.state = PlayerState::Stopped;
                debug!("playback loop ended (nothing armed)");
                return;
            };
            let pcm = current.pcm.clone();
            let track_len = pcm.len();

            if s.cursor >= track_len {
                // Natural end of the current track.
                if let Some(next) = s.next.take() {
                    info!("gapless transition to track {}", next.index + 1);
                    s.current = Some(next);
                    s.cursor = 0;
                    drop(s);
                    hooks.fire_detached(TrackEnd::natural());
                    continue;
                }
                s.state = PlayerState::Stopped;
                s.cursor = 0;
                drop(s);
                info!("end of track, no next buffered");
                hooks.fire_detached(TrackEnd::natural());
                return;
            }

            let start = s.cursor;
            let end = (start + chunk_bytes).min(track_len);
            s.cursor = end;
            (pcm, start, end)
        };

        // Write phase: the state lock is not held across the block.
        let result = {
            let mut sink_guard = sink.lock().unwrap();
            match sink_guard.as_mut() {
                Some(sink) => sink.write(&pcm.bytes()[start..end]),
                None => Err(crate::error::Error::AudioOutput("sink closed".to_string())),
            }
        };

        if let Err(e) = result {
            error!("sink write failed: {}", e);
            let mut s = lock.lock().unwrap();
            s.state = PlayerState::Stopped;
            s.failed = true;
            drop(s);
            hooks.fire_detached(TrackEnd::aborted());
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disc::PcmImage;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Sink that counts bytes and can be told to fail.
    struct CountingSink {
        bytes: Arc<AtomicUsize>,
        fail: bool,
    }

    impl AudioSink for CountingSink {
        fn write(&mut self, pcm: &[u8]) -> crate::error::Result<()> {
            if self.fail {
                return Err(crate::error::Error::AudioOutput("boom".to_string()));
            }
            self.bytes.fetch_add(pcm.len(), Ordering::SeqCst);
            // Pace roughly like a device so state transitions are observable.
            std::thread::sleep(Duration::from_micros(200));
            Ok(())
        }
    }

    fn image(track_bytes: &[usize]) -> Arc<PcmImage> {
        Arc::new(PcmImage::from_tracks(
            track_bytes.iter().map(|&n| vec![0u8; n]).collect(),
        ))
    }

    fn player(track_bytes: &[usize]) -> (RamPlayer, Arc<AtomicUsize>) {
        let bytes = Arc::new(AtomicUsize::new(0));
        let sink = Box::new(CountingSink {
            bytes: Arc::clone(&bytes),
            fail: false,
        });
        (RamPlayer::new(sink, image(track_bytes), 1024), bytes)
    }

    fn wait_for_stop(player: &RamPlayer) {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while player.state() != PlayerState::Stopped {
            assert!(std::time::Instant::now() < deadline, "player never stopped");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_navigate_out_of_range() {
        let (player, _) = player(&[4096, 4096]);
        assert!(!player.navigate_to(2, false));
        assert!(player.navigate_to(1, false));
        assert_eq!(player.current_track_index(), 1);
        assert_eq!(player.state(), PlayerState::Stopped);
    }

    #[test]
    fn test_play_writes_every_byte() {
        let (player, bytes) = player(&[10_000]);
        assert!(player.navigate_to(0, true));
        wait_for_stop(&player);
        assert_eq!(bytes.load(Ordering::SeqCst), 10_000);
        player.cleanup();
    }

    #[test]
    fn test_gapless_swap_drains_both_tracks() {
        let (player, bytes) = player(&[8_192, 4_096]);
        let swaps = Arc::new(AtomicUsize::new(0));
        let swaps_hook = Arc::clone(&swaps);
        player.end_hooks().subscribe(move |info| {
            assert!(!info.aborted);
            swaps_hook.fetch_add(1, Ordering::SeqCst);
        });

        assert!(player.navigate_to(0, false));
        player.prepare_next(Some(1));
        player.play();
        wait_for_stop(&player);

        assert_eq!(bytes.load(Ordering::SeqCst), 8_192 + 4_096);
        assert_eq!(player.current_track_index(), 1);
        // one hook per track end: the swap and the final stop
        let deadline = std::time::Instant::now() + Duration::from_secs(1);
        while swaps.load(Ordering::SeqCst) < 2 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(swaps.load(Ordering::SeqCst), 2);
        player.cleanup();
    }

    #[test]
    fn test_sink_failure_reports_aborted() {
        let bytes = Arc::new(AtomicUsize::new(0));
        let sink = Box::new(CountingSink {
            bytes: Arc::clone(&bytes),
            fail: true,
        });
        let player = RamPlayer::new(sink, image(&[4096]), 1024);

        let aborted = Arc::new(AtomicUsize::new(0));
        let aborted_hook = Arc::clone(&aborted);
        player.end_hooks().subscribe(move |info| {
            if info.aborted {
                aborted_hook.fetch_add(1, Ordering::SeqCst);
            }
        });

        assert!(player.navigate_to(0, true));
        wait_for_stop(&player);
        let deadline = std::time::Instant::now() + Duration::from_secs(1);
        while aborted.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(aborted.load(Ordering::SeqCst), 1);
        assert_eq!(bytes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_seek_rejects_out_of_range() {
        let (player, _) = player(&[BYTES_PER_SECOND * 2]);
        assert!(player.navigate_to(0, false));
        player.seek(1.0);
        assert!((player.position() - 1.0).abs() < 0.01);
        player.seek(5.0); // past end: rejected
        assert!((player.position() - 1.0).abs() < 0.01);
        player.seek(-1.0);
        assert!((player.position() - 1.0).abs() < 0.01);
    }

    #[test]
    fn test_cleanup_twice_is_safe() {
        let (player, _) = player(&[4096]);
        player.cleanup();
        player.cleanup();
        assert_eq!(player.state(), PlayerState::Stopped);
    }
}
