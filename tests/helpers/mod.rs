//! Shared test fixtures: an in-memory disc source and a paced sink that
//! plays much faster than real time.

use ramcd::audio::AudioSink;
use ramcd::config::{Autoplay, Config};
use ramcd::controller::Controller;
use ramcd::disc::{Disc, PcmImage, Track, BYTES_PER_SECOND};
use ramcd::error::Result;
use ramcd::events::{EventKind, PlayerEvent};
use ramcd::source::{DiscSource, Progress};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Sink that consumes PCM at roughly one chunk per millisecond.
pub struct PacedSink {
    pub bytes_written: Arc<AtomicUsize>,
}

impl AudioSink for PacedSink {
    fn write(&mut self, pcm: &[u8]) -> Result<()> {
        self.bytes_written.fetch_add(pcm.len(), Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(1));
        Ok(())
    }
}

/// In-memory disc: every track is silence of the given duration.
pub struct FakeSource {
    disc: Disc,
    pcm: Vec<Vec<u8>>,
    pub ejected: Arc<AtomicUsize>,
}

impl FakeSource {
    /// Durations are in *scaled* seconds of PCM (still 176,400 bytes per
    /// second, so positions and seeks stay exact).
    pub fn new(track_seconds: &[f64]) -> Self {
        let tracks = track_seconds
            .iter()
            .enumerate()
            .map(|(i, &seconds)| Track {
                number: i as u32 + 1,
                duration_frames: (seconds * 75.0) as u32,
                byte_offset: 0,
                title: None,
                artist: None,
                album: None,
            })
            .collect();
        let pcm = track_seconds
            .iter()
            .map(|&seconds| {
                let bytes = (seconds * BYTES_PER_SECOND as f64) as usize;
                vec![0u8; bytes / 4 * 4]
            })
            .collect();
        Self {
            disc: Disc {
                tracks,
                title: Some("Test Disc".to_string()),
                artist: None,
                has_cd_text: false,
            },
            pcm,
            ejected: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl DiscSource for FakeSource {
    fn detect(&self) -> bool {
        true
    }

    fn read_toc(&self) -> Result<Disc> {
        Ok(self.disc.clone())
    }

    fn extract(&self, _level: u8, progress: Progress) -> Result<PcmImage> {
        let total = self.pcm.len();
        for i in 0..total {
            progress(i + 1, total, "extracting");
        }
        progress(total, total, "complete");
        Ok(PcmImage::from_tracks(self.pcm.clone()))
    }

    fn eject(&self) {
        self.ejected.fetch_add(1, Ordering::SeqCst);
    }
}

/// Controller over a fake source and paced sink.
pub fn test_controller(track_seconds: &[f64], autoplay: bool) -> (Controller, Arc<AtomicUsize>) {
    let mut config = Config::default();
    config.autoplay_on_load = Autoplay::All(autoplay);
    // keep write chunks small so short test tracks take many writes
    config.period_frames = 256;

    let bytes_written = Arc::new(AtomicUsize::new(0));
    let sink_bytes = Arc::clone(&bytes_written);
    let source = Arc::new(FakeSource::new(track_seconds));

    let controller = Controller::new(
        config,
        source,
        Box::new(move |_config: &Config| {
            Ok(Box::new(PacedSink {
                bytes_written: Arc::clone(&sink_bytes),
            }) as Box<dyn AudioSink>)
        }),
    );
    (controller, bytes_written)
}

/// Record every event the controller emits, in order.
pub fn record_events(controller: &Controller) -> Arc<Mutex<Vec<PlayerEvent>>> {
    let log = Arc::new(Mutex::new(Vec::new()));
    for kind in [
        EventKind::TrackChanged,
        EventKind::CdLoaded,
        EventKind::StatusChanged,
        EventKind::LoadingProgress,
    ] {
        let log = Arc::clone(&log);
        controller.subscribe(kind, move |event| {
            log.lock().unwrap().push(event.clone());
        });
    }
    log
}

/// Wait until the predicate holds or the timeout passes.
pub fn wait_until(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    predicate()
}
