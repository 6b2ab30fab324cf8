//! Playback controller
//!
//! The glue between the track sequencer, exactly one audio transport,
//! and the listener bus. Every command looks the same regardless of
//! which backend is bound; the transport contract absorbs the
//! difference, so nothing here branches on backend identity.
//!
//! The transport's end-of-track hook holds only a weak reference back to
//! the controller, and `eject`/`cleanup` detach the hook before the
//! transport is dropped, so no callback can land in a torn-down object.

use crate::audio::AudioSink;
use crate::config::Config;
use crate::disc::Disc;
use crate::error::{Error, Result};
use crate::events::{EventKind, ListenerBus, PlayerEvent, StatusReason, SubscriptionId};
use crate::sequencer::{RepeatMode, TrackSequencer};
use crate::source::DiscSource;
use crate::transport::{
    AudioTransport, HookId, PlayerState, RamPlayer, StreamPlayer, TrackEnd,
};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Builds the audio sink for a RAM-mode load. Injected so tests can
/// substitute an in-memory sink for the cpal device.
pub type SinkFactory = Box<dyn Fn(&Config) -> Result<Box<dyn AudioSink>> + Send + Sync>;

/// User-facing playback controller.
#[derive(Clone)]
pub struct Controller {
    inner: Arc<Inner>,
}

struct Inner {
    config: Config,
    source: Arc<dyn DiscSource>,
    sink_factory: SinkFactory,
    bus: ListenerBus,
    sequencer: Mutex<TrackSequencer>,
    transport: Mutex<Option<Arc<dyn AudioTransport>>>,
    disc: Mutex<Option<Arc<Disc>>>,
    hook_id: Mutex<Option<HookId>>,
}

/// `prev` within this many seconds steps back a track; later than this
/// it restarts the current one.
const PREV_RESTART_THRESHOLD: f64 = 2.0;

impl Controller {
    pub fn new(config: Config, source: Arc<dyn DiscSource>, sink_factory: SinkFactory) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                source,
                sink_factory,
                bus: ListenerBus::new(),
                sequencer: Mutex::new(TrackSequencer::new()),
                transport: Mutex::new(None),
                disc: Mutex::new(None),
                hook_id: Mutex::new(None),
            }),
        }
    }

    /// Controller wired to the cpal sink.
    pub fn with_default_sink(config: Config, source: Arc<dyn DiscSource>) -> Self {
        Self::new(
            config,
            source,
            Box::new(|config: &Config| {
                Ok(Box::new(crate::audio::CpalSink::open(
                    config.alsa_device.as_deref(),
                    config.period_frames,
                    config.audio_buffer_frames,
                )?) as Box<dyn AudioSink>)
            }),
        )
    }

    pub fn subscribe<F>(&self, kind: EventKind, listener: F) -> SubscriptionId
    where
        F: Fn(&PlayerEvent) + Send + Sync + 'static,
    {
        self.inner.bus.subscribe(kind, listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.inner.bus.unsubscribe(id);
    }

    // === Loading ===

    /// Quick TOC read without binding a transport.
    pub fn scan(&self) -> Result<Arc<Disc>> {
        info!("scanning disc");
        match self.inner.source.read_toc() {
            Ok(disc) => {
                let disc = Arc::new(disc);
                *self.inner.disc.lock().unwrap() = Some(Arc::clone(&disc));
                Ok(disc)
            }
            Err(e) => {
                info!("scan found no disc: {}", e);
                self.inner.emit(PlayerEvent::StatusChanged {
                    reason: StatusReason::NoDisc,
                });
                Err(e)
            }
        }
    }

    /// Load the disc at the given extraction level (0 streams, 1..=3
    /// extract to RAM) and bind the matching transport.
    pub fn load(&self, level: Option<u8>) -> Result<()> {
        let level = Config::check_extraction_level(
            level.unwrap_or(self.inner.config.default_extraction_level),
        )?;
        info!("loading disc at level {}", level);

        // A new disc replaces any bound transport.
        self.inner.unbind_transport();

        self.inner.progress(0, 0, "detecting");
        if !self.inner.source.detect() {
            self.inner.emit(PlayerEvent::StatusChanged {
                reason: StatusReason::NoDisc,
            });
            return Err(Error::NoDisc);
        }

        self.inner.progress(0, 0, "reading_toc");
        let mut disc = match self.inner.source.read_toc() {
            Ok(disc) if disc.track_count() > 0 => disc,
            Ok(_) | Err(_) => {
                // A zero-track TOC is treated the same as no disc.
                self.inner.emit(PlayerEvent::StatusChanged {
                    reason: StatusReason::NoDisc,
                });
                return Err(Error::NoDisc);
            }
        };
        let track_count = disc.track_count();

        let transport: Arc<dyn AudioTransport>;
        let disc = if level == 0 {
            info!("streaming mode: {} tracks", track_count);
            let disc = Arc::new(disc);
            transport = Arc::new(StreamPlayer::new(
                &self.inner.config.cd_device,
                self.inner.config.alsa_device.as_deref(),
                Duration::from_secs(self.inner.config.stream_startup_timeout_secs),
                Arc::clone(&disc),
            ));
            disc
        } else {
            let inner = &self.inner;
            let image = inner.source.extract(level, &|current, total, stage| {
                inner.progress(current, total, stage);
            })?;
            for (i, track) in disc.tracks.iter_mut().enumerate() {
                track.byte_offset = image.track_offset(i).unwrap_or(0);
            }
            let sink = (self.inner.sink_factory)(&self.inner.config).map_err(|e| {
                error!("audio sink unavailable: {}", e);
                self.inner.emit(PlayerEvent::StatusChanged {
                    reason: StatusReason::NoDisc,
                });
                e
            })?;
            transport = Arc::new(RamPlayer::new(
                sink,
                Arc::new(image),
                self.inner.config.chunk_bytes(),
            ));
            Arc::new(disc)
        };

        self.inner.bind_transport(Arc::clone(&transport), Arc::clone(&disc));

        let autoplay = self.inner.config.should_autoplay(level);
        transport.navigate_to(0, autoplay);
        if autoplay {
            let preload = self.inner.sequencer.lock().unwrap().get_next_for_preload();
            self.inner.request_preload(&transport, preload);
        }

        self.inner.progress(track_count, track_count, "complete");
        self.inner.emit(PlayerEvent::CdLoaded { track_count });
        info!("disc loaded and ready ({} tracks)", track_count);
        Ok(())
    }

    // === Transport commands ===

    pub fn play(&self) {
        match self.inner.transport() {
            Some(transport) => transport.play(),
            None => warn!("play: no disc loaded"),
        }
    }

    pub fn pause(&self) {
        match self.inner.transport() {
            Some(transport) => transport.pause(),
            None => warn!("pause: no disc loaded"),
        }
    }

    pub fn stop(&self) {
        match self.inner.transport() {
            Some(transport) => transport.stop(),
            None => warn!("stop: no disc loaded"),
        }
    }

    pub fn seek(&self, seconds: f64) {
        match self.inner.transport() {
            Some(transport) => transport.seek(seconds),
            None => warn!("seek: no disc loaded"),
        }
    }

    pub fn next(&self) {
        self.inner.navigate(|sequencer| sequencer.next_track());
    }

    pub fn prev(&self) {
        let Some(transport) = self.inner.transport() else {
            warn!("prev: no disc loaded");
            return;
        };
        if transport.position() > PREV_RESTART_THRESHOLD {
            info!("prev: restarting current track");
            let current = self.inner.sequencer.lock().unwrap().current_index();
            self.inner.relocate(&transport, current);
        } else {
            self.inner.navigate(|sequencer| sequencer.prev_track());
        }
    }

    /// Jump to a 1-based track number.
    pub fn goto(&self, number: usize) {
        let total = self.total_tracks();
        if number == 0 || number > total {
            warn!("goto: track {} invalid (1-{})", number, total);
            return;
        }
        self.inner.navigate(move |sequencer| {
            sequencer.set_current_index(number - 1);
            Some(number - 1)
        });
    }

    /// Toggle shuffle. Returns the new state, or `None` with no disc.
    pub fn shuffle(&self) -> Option<bool> {
        let Some(transport) = self.inner.transport() else {
            warn!("shuffle: no disc loaded");
            return None;
        };
        let (on, preload) = {
            let mut sequencer = self.inner.sequencer.lock().unwrap();
            let on = sequencer.toggle_shuffle();
            (on, sequencer.get_next_for_preload())
        };
        // A mode change redefines what plays next; the idle slot must
        // follow or the next gapless swap hands off into a stale track.
        self.inner.request_preload(&transport, preload);
        Some(on)
    }

    /// Cycle the repeat mode. Returns the new mode.
    pub fn repeat(&self) -> RepeatMode {
        let (mode, preload) = {
            let mut sequencer = self.inner.sequencer.lock().unwrap();
            let mode = sequencer.cycle_repeat();
            (mode, sequencer.get_next_for_preload())
        };
        if let Some(transport) = self.inner.transport() {
            self.inner.request_preload(&transport, preload);
        }
        mode
    }

    pub fn eject(&self) {
        info!("ejecting disc");
        self.inner.unbind_transport();
        *self.inner.disc.lock().unwrap() = None;
        self.inner.sequencer.lock().unwrap().set_total_tracks(0);
        self.inner.source.eject();
    }

    /// Detach and release everything. Safe to call twice.
    pub fn cleanup(&self) {
        self.inner.unbind_transport();
        info!("controller cleanup complete");
    }

    // === Observers ===

    pub fn is_loaded(&self) -> bool {
        self.inner.transport().is_some()
    }

    pub fn state(&self) -> PlayerState {
        self.inner
            .transport()
            .map(|t| t.state())
            .unwrap_or(PlayerState::Stopped)
    }

    pub fn position(&self) -> f64 {
        self.inner.transport().map(|t| t.position()).unwrap_or(0.0)
    }

    pub fn duration(&self) -> f64 {
        self.inner.transport().map(|t| t.duration()).unwrap_or(0.0)
    }

    /// Current track number for display (1-based).
    pub fn current_track_number(&self) -> usize {
        match self.inner.transport() {
            Some(transport) => transport.current_track_index() + 1,
            None => self.inner.sequencer.lock().unwrap().current_index() + 1,
        }
    }

    pub fn total_tracks(&self) -> usize {
        self.inner.sequencer.lock().unwrap().total_tracks()
    }

    pub fn repeat_mode(&self) -> RepeatMode {
        self.inner.sequencer.lock().unwrap().repeat_mode()
    }

    pub fn shuffle_on(&self) -> bool {
        self.inner.sequencer.lock().unwrap().shuffle_on()
    }

    pub fn disc(&self) -> Option<Arc<Disc>> {
        self.inner.disc.lock().unwrap().clone()
    }

    pub fn disc_title(&self) -> Option<String> {
        self.disc().and_then(|disc| disc.title.clone())
    }

    pub fn disc_artist(&self) -> Option<String> {
        self.disc().and_then(|disc| disc.artist.clone())
    }

    pub fn current_track_title(&self) -> Option<String> {
        let disc = self.disc()?;
        disc.track(self.current_track_number().saturating_sub(1))?
            .title
            .clone()
    }

    pub fn current_track_artist(&self) -> Option<String> {
        let disc = self.disc()?;
        disc.track(self.current_track_number().saturating_sub(1))?
            .artist
            .clone()
    }

    pub fn total_duration(&self) -> f64 {
        self.disc()
            .map(|disc| disc.total_duration_seconds())
            .unwrap_or(0.0)
    }

    /// Checks that the resolved output path can be byte-exact.
    pub fn verify_bit_perfect(&self) -> Vec<(&'static str, bool)> {
        let direct = self
            .inner
            .config
            .alsa_device
            .as_deref()
            .map(crate::audio::CpalSink::is_direct_hardware)
            .unwrap_or(false);
        if !direct {
            warn!("output device is not direct hardware; bit-perfect not guaranteed");
        }
        vec![
            ("alsa_device", direct),
            ("sample_rate", true),
            ("volume", true),
        ]
    }
}

impl Inner {
    fn transport(&self) -> Option<Arc<dyn AudioTransport>> {
        self.transport.lock().unwrap().clone()
    }

    fn emit(&self, event: PlayerEvent) {
        self.bus.emit(&event);
    }

    fn progress(&self, current: usize, total: usize, stage: &str) {
        self.emit(PlayerEvent::LoadingProgress {
            current,
            total,
            stage: stage.to_string(),
        });
    }

    /// Forward a preload hint unless preloading is configured off.
    fn request_preload(&self, transport: &Arc<dyn AudioTransport>, preload: Option<usize>) {
        if self.config.preload_ahead > 0 {
            transport.prepare_next(preload);
        }
    }

    /// Bind a freshly built transport: sequencer sized, end hook
    /// attached through a weak reference.
    fn bind_transport(self: &Arc<Self>, transport: Arc<dyn AudioTransport>, disc: Arc<Disc>) {
        let track_count = disc.track_count();
        self.sequencer.lock().unwrap().set_total_tracks(track_count);

        let weak: Weak<Inner> = Arc::downgrade(self);
        let hook_id = transport.end_hooks().subscribe(move |info| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_track_end(info);
            }
        });

        *self.hook_id.lock().unwrap() = Some(hook_id);
        *self.transport.lock().unwrap() = Some(transport);
        *self.disc.lock().unwrap() = Some(disc);
    }

    /// Detach the end hook, then tear the transport down.
    fn unbind_transport(&self) {
        let transport = self.transport.lock().unwrap().take();
        if let Some(transport) = transport {
            if let Some(id) = self.hook_id.lock().unwrap().take() {
                transport.end_hooks().unsubscribe(id);
            }
            transport.end_hooks().clear();
            transport.cleanup();
            debug!("transport unbound");
        }
    }

    /// Shared navigation recipe: ask the sequencer, remember whether we
    /// were playing, re-arm the transport, preload what follows.
    fn navigate(&self, pick: impl FnOnce(&mut TrackSequencer) -> Option<usize>) {
        let Some(transport) = self.transport() else {
            warn!("navigation with no disc loaded");
            return;
        };
        let Some(new_index) = pick(&mut self.sequencer.lock().unwrap()) else {
            return;
        };
        self.relocate(&transport, new_index);
    }

    fn relocate(&self, transport: &Arc<dyn AudioTransport>, index: usize) {
        let was_playing = transport.state() == PlayerState::Playing;
        if !transport.navigate_to(index, was_playing) {
            return;
        }
        if was_playing {
            let preload = self.sequencer.lock().unwrap().get_next_for_preload();
            self.request_preload(transport, preload);
        }
        let total = self.sequencer.lock().unwrap().total_tracks();
        self.emit(PlayerEvent::TrackChanged {
            number: index + 1,
            total,
        });
        info!("now at track {}", index + 1);
    }

    /// Unified end-of-track handler, one path for both backends.
    ///
    /// Runs on the callback thread. If the backend's reported index
    /// already equals what the sequencer expected next and audio is
    /// still flowing, a gapless hand-off happened inside the backend and
    /// only the bookkeeping advances. Anything else (shuffle drew a
    /// different track, repeat-track restart, end of source) goes
    /// through an explicit navigation.
    fn handle_track_end(&self, info: TrackEnd) {
        let Some(transport) = self.transport() else {
            return;
        };

        if info.aborted {
            error!("playback aborted by backend");
            transport.stop();
            self.emit(PlayerEvent::StatusChanged {
                reason: StatusReason::Error,
            });
            return;
        }

        let expected = self.sequencer.lock().unwrap().get_next_for_preload();
        let observed = transport.current_track_index();

        if expected == Some(observed) && transport.state() == PlayerState::Playing {
            // Gapless hand-off already done in the backend.
            let (number, total, preload) = {
                let mut sequencer = self.sequencer.lock().unwrap();
                sequencer.advance();
                (
                    sequencer.current_index() + 1,
                    sequencer.total_tracks(),
                    sequencer.get_next_for_preload(),
                )
            };
            info!("track ended; gapless continuation into {}", number);
            self.emit(PlayerEvent::TrackChanged { number, total });
            self.request_preload(&transport, preload);
            return;
        }

        let next = self.sequencer.lock().unwrap().advance();
        match next {
            Some(next) => {
                info!("track ended; moving to {}", next + 1);
                transport.navigate_to(next, true);
                let (total, preload) = {
                    let sequencer = self.sequencer.lock().unwrap();
                    (sequencer.total_tracks(), sequencer.get_next_for_preload())
                };
                self.emit(PlayerEvent::TrackChanged {
                    number: next + 1,
                    total,
                });
                self.request_preload(&transport, preload);
            }
            None => {
                info!("end of disc");
                transport.stop();
                self.emit(PlayerEvent::StatusChanged {
                    reason: StatusReason::DiscEnd,
                });
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Direct teardown: by now no hook can upgrade its weak reference.
        if let Some(transport) = self.transport.lock().unwrap().take() {
            transport.end_hooks().clear();
            transport.cleanup();
        }
    }
}
