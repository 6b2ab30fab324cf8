//! Disc, track, and PCM image data model
//!
//! Everything here is plain data: the transports and the controller share
//! these types, the disc source produces them. All PCM is interleaved
//! 16-bit signed little-endian stereo at 44.1 kHz (CD audio).

use std::ops::Range;
use std::sync::Arc;

/// CD frames (sectors) per second.
pub const FRAMES_PER_SECOND: u32 = 75;

/// Audio sample rate of CD audio, in Hz.
pub const SAMPLE_RATE: u32 = 44_100;

/// Output channel count.
pub const CHANNELS: u16 = 2;

/// Bytes of PCM per second of CD audio (44100 Hz * 2 ch * 2 bytes).
pub const BYTES_PER_SECOND: usize = 176_400;

/// Bytes in one audio frame (one sample per channel).
pub const BYTES_PER_FRAME: usize = 4;

/// One audio track on the disc.
#[derive(Debug, Clone, PartialEq)]
pub struct Track {
    /// Track number as printed on the sleeve (1-based).
    pub number: u32,
    /// Length in CD frames (1 frame = 1/75 s).
    pub duration_frames: u32,
    /// Byte offset of this track within the RAM image. Zero until an
    /// image is assembled; meaningless in streaming mode.
    pub byte_offset: usize,
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
}

impl Track {
    pub fn duration_seconds(&self) -> f64 {
        self.duration_frames as f64 / FRAMES_PER_SECOND as f64
    }

    /// Exact PCM byte length of this track.
    pub fn byte_len(&self) -> usize {
        // 588 audio frames per CD frame * 4 bytes
        self.duration_frames as usize * 2352
    }
}

/// A scanned disc: ordered tracks plus disc-level metadata.
///
/// Created when a disc is scanned or loaded, dropped on eject or when a
/// new disc replaces it.
#[derive(Debug, Clone, Default)]
pub struct Disc {
    pub tracks: Vec<Track>,
    pub title: Option<String>,
    pub artist: Option<String>,
    /// Whether CD-Text was found on the disc.
    pub has_cd_text: bool,
}

impl Disc {
    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    pub fn total_duration_seconds(&self) -> f64 {
        self.tracks.iter().map(Track::duration_seconds).sum()
    }

    /// Absolute start time of a 0-based track within the disc, in seconds.
    ///
    /// This is the chapter-start table used to convert between engine
    /// absolute time and intra-track position in streaming mode.
    pub fn chapter_start_seconds(&self, index: usize) -> f64 {
        self.tracks[..index.min(self.tracks.len())]
            .iter()
            .map(Track::duration_seconds)
            .sum()
    }

    pub fn track(&self, index: usize) -> Option<&Track> {
        self.tracks.get(index)
    }
}

/// The whole disc's PCM, extracted to memory.
///
/// The blob is immutable after construction and shared read-only between
/// the provider and the playback thread via `Arc`.
#[derive(Debug)]
pub struct PcmImage {
    blob: Arc<Vec<u8>>,
    /// Byte range of each 0-based track within the blob.
    ranges: Vec<Range<usize>>,
}

impl PcmImage {
    /// Assemble an image from per-track PCM buffers.
    pub fn from_tracks(tracks: Vec<Vec<u8>>) -> Self {
        let total: usize = tracks.iter().map(Vec::len).sum();
        let mut blob = Vec::with_capacity(total);
        let mut ranges = Vec::with_capacity(tracks.len());
        for pcm in tracks {
            let start = blob.len();
            blob.extend_from_slice(&pcm);
            ranges.push(start..blob.len());
        }
        Self {
            blob: Arc::new(blob),
            ranges,
        }
    }

    pub fn track_count(&self) -> usize {
        self.ranges.len()
    }

    pub fn total_bytes(&self) -> usize {
        self.blob.len()
    }

    /// Byte offset of a 0-based track within the blob.
    pub fn track_offset(&self, index: usize) -> Option<usize> {
        self.ranges.get(index).map(|range| range.start)
    }
}

/// A borrowed-by-Arc view of one track's PCM inside an image.
#[derive(Debug, Clone)]
pub struct PcmChunk {
    blob: Arc<Vec<u8>>,
    range: Range<usize>,
}

impl PcmChunk {
    pub fn bytes(&self) -> &[u8] {
        &self.blob[self.range.clone()]
    }

    pub fn len(&self) -> usize {
        self.range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    pub fn duration_seconds(&self) -> f64 {
        self.len() as f64 / BYTES_PER_SECOND as f64
    }
}

/// Source of per-track PCM for the RAM player.
///
/// The player does not know how PCM arrives; the provider hands it a
/// track's bytes on demand. `None` means "not available" (a failed or
/// still-extracting track), which the player treats as "next not ready",
/// never as a fatal error.
pub trait PcmProvider: Send + Sync {
    fn track_pcm(&self, index: usize) -> Option<PcmChunk>;
    fn track_count(&self) -> usize;
}

impl PcmProvider for PcmImage {
    fn track_pcm(&self, index: usize) -> Option<PcmChunk> {
        let range = self.ranges.get(index)?.clone();
        Some(PcmChunk {
            blob: Arc::clone(&self.blob),
            range,
        })
    }

    fn track_count(&self) -> usize {
        self.ranges.len()
    }
}
