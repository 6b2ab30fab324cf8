//! Disc source seam
//!
//! The core never talks to the drive directly: a [`DiscSource`] hands it
//! a scanned [`Disc`] and, for RAM mode, an extracted [`PcmImage`]. The
//! shipped implementation wraps the cdparanoia binary; tests substitute
//! an in-memory source.

use crate::config::Config;
use crate::disc::{Disc, PcmImage, Track, FRAMES_PER_SECOND};
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Progress callback: (tracks done or current track, total tracks, stage).
pub type Progress<'a> = &'a (dyn Fn(usize, usize, &str) + Sync);

/// Where track data comes from.
pub trait DiscSource: Send + Sync {
    /// Quick presence check for a disc in the drive.
    fn detect(&self) -> bool;

    /// Read the table of contents.
    fn read_toc(&self) -> Result<Disc>;

    /// Extract the whole disc to an in-memory PCM image at the given
    /// error-correction level (1..=3). Each track is retried up to 2
    /// times before the extraction is abandoned.
    fn extract(&self, level: u8, progress: Progress) -> Result<PcmImage>;

    /// Open the tray.
    fn eject(&self);
}

/// Per-level cdparanoia invocation profile.
struct LevelProfile {
    name: &'static str,
    flags: &'static [&'static str],
    timeout: Duration,
}

fn level_profile(level: u8) -> LevelProfile {
    match level {
        2 => LevelProfile {
            name: "precise",
            flags: &[],
            timeout: Duration::from_secs(300),
        },
        3 => LevelProfile {
            name: "rescue",
            flags: &["-z", "100"],
            timeout: Duration::from_secs(600),
        },
        _ => LevelProfile {
            name: "standard",
            flags: &["-Y"],
            timeout: Duration::from_secs(240),
        },
    }
}

/// cdparanoia-backed drive wrapper.
pub struct CdDrive {
    device: String,
    ram_path: PathBuf,
    cdparanoia: String,
    read_offset: i32,
}

impl CdDrive {
    pub fn new(config: &Config) -> Self {
        debug!(
            "cd drive source: device={}, ram_path={}",
            config.cd_device,
            config.ram_path.display()
        );
        Self {
            device: config.cd_device.clone(),
            ram_path: config.ram_path.clone(),
            cdparanoia: config.cdparanoia_path.clone(),
            read_offset: config.cd_read_offset,
        }
    }

    fn query_drive(&self, timeout: Duration) -> Result<String> {
        run_with_timeout(
            Command::new(&self.cdparanoia)
                .arg("-d")
                .arg(&self.device)
                .arg("-Q"),
            timeout,
        )
    }

    fn rip_track(&self, number: u32, output: &Path, profile: &LevelProfile) -> Result<()> {
        let mut cmd = Command::new(&self.cdparanoia);
        cmd.arg("-d").arg(&self.device);
        cmd.args(profile.flags);
        if self.read_offset != 0 {
            cmd.arg("-O").arg(self.read_offset.to_string());
        }
        cmd.arg(number.to_string()).arg(output);
        run_with_timeout(&mut cmd, profile.timeout).map(|_| ())
    }
}

impl DiscSource for CdDrive {
    fn detect(&self) -> bool {
        for attempt in 0..2 {
            match self.query_drive(Duration::from_secs(5)) {
                Ok(output) if output.contains("TOTAL") => {
                    debug!("disc detected on {}", self.device);
                    return true;
                }
                Ok(_) => debug!("no disc found (attempt {})", attempt + 1),
                Err(e) => debug!("detect error (attempt {}): {}", attempt + 1, e),
            }
            if attempt == 0 {
                std::thread::sleep(Duration::from_millis(500));
            }
        }
        warn!("no disc detected on {}", self.device);
        false
    }

    fn read_toc(&self) -> Result<Disc> {
        let started = Instant::now();
        let output = self.query_drive(Duration::from_secs(10))?;
        let tracks = parse_toc(&output);
        if tracks.is_empty() {
            return Err(Error::Source("no tracks in TOC".to_string()));
        }
        let disc = Disc {
            tracks,
            title: None,
            artist: None,
            has_cd_text: false,
        };
        info!(
            "TOC read in {}ms: {} tracks, {:.0}s total",
            started.elapsed().as_millis(),
            disc.track_count(),
            disc.total_duration_seconds()
        );
        Ok(disc)
    }

    fn extract(&self, level: u8, progress: Progress) -> Result<PcmImage> {
        let disc = self.read_toc()?;
        let profile = level_profile(level);
        let total = disc.track_count();
        info!(
            "extracting {} tracks at level {} ({})",
            total, level, profile.name
        );

        std::fs::create_dir_all(&self.ram_path)?;
        // Unique scratch dir under the RAM mount, created atomically.
        let scratch = tempfile::Builder::new()
            .prefix("rip-")
            .tempdir_in(&self.ram_path)
            .map_err(|e| Error::Source(format!("scratch dir: {}", e)))?;

        let extraction_start = Instant::now();
        let mut pcm_tracks = Vec::with_capacity(total);

        for (i, track) in disc.tracks.iter().enumerate() {
            let output = scratch.path().join(format!("track{:02}.wav", track.number));
            let mut ripped = false;

            for attempt in 0..2 {
                let stage = if attempt == 0 { "extracting" } else { "retry" };
                progress(i + 1, total, stage);

                let track_start = Instant::now();
                match self.rip_track(track.number, &output, &profile) {
                    Ok(()) if output.exists() => {
                        debug!(
                            "track {:02} extracted in {:.1}s",
                            track.number,
                            track_start.elapsed().as_secs_f64()
                        );
                        ripped = true;
                        break;
                    }
                    Ok(()) => warn!(
                        "track {} attempt {} produced no file",
                        track.number,
                        attempt + 1
                    ),
                    Err(e) => warn!("track {} attempt {} failed: {}", track.number, attempt + 1, e),
                }
                std::thread::sleep(Duration::from_millis(500));
            }

            if !ripped {
                error!("track {} failed after 2 attempts", track.number);
                return Err(Error::Source(format!(
                    "track {} extraction failed",
                    track.number
                )));
            }

            let wav = std::fs::read(&output)?;
            pcm_tracks.push(strip_wav_header(&wav)?);
            // Keep the scratch footprint at one track.
            let _ = std::fs::remove_file(&output);
        }

        progress(total, total, "complete");
        info!(
            "extraction complete in {:.1}s",
            extraction_start.elapsed().as_secs_f64()
        );
        Ok(PcmImage::from_tracks(pcm_tracks))
    }

    fn eject(&self) {
        info!("ejecting {}", self.device);
        let result = Command::new("eject")
            .arg(&self.device)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        if result.is_err() {
            warn!("could not eject automatically");
        }
    }
}

/// Run a subprocess with a deadline, killing it on overrun. Returns
/// combined stdout+stderr (cdparanoia reports on stderr).
fn run_with_timeout(cmd: &mut Command, timeout: Duration) -> Result<String> {
    let mut child = cmd
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::Source(format!("{:?}: {}", cmd.get_program(), e)))?;

    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                let output = child
                    .wait_with_output()
                    .map_err(|e| Error::Source(e.to_string()))?;
                let mut text = String::from_utf8_lossy(&output.stderr).into_owned();
                text.push_str(&String::from_utf8_lossy(&output.stdout));
                if status.success() {
                    return Ok(text);
                }
                return Err(Error::Source(format!(
                    "exit {}: {}",
                    status.code().unwrap_or(-1),
                    text.lines().next().unwrap_or("")
                )));
            }
            Ok(None) => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(Error::Source("timed out".to_string()));
                }
                std::thread::sleep(Duration::from_millis(100));
            }
            Err(e) => return Err(Error::Source(e.to_string())),
        }
    }
}

/// Parse cdparanoia's `-Q` TOC listing.
///
/// Track lines look like:
/// `  1.    13234 [02:56.34]        0 [00:00.00]    no   no  2`
fn parse_toc(output: &str) -> Vec<Track> {
    let mut tracks = Vec::new();
    for line in output.lines() {
        let mut fields = line.split_whitespace();
        let Some(first) = fields.next() else { continue };
        let Some(number) = first
            .strip_suffix('.')
            .and_then(|n| n.parse::<u32>().ok())
        else {
            continue;
        };
        // length in sectors, then the same length as [mm:ss.ff]
        let Some(_sectors) = fields.next().and_then(|f| f.parse::<u64>().ok()) else {
            continue;
        };
        let Some(duration_frames) = fields.next().and_then(parse_msf) else {
            continue;
        };
        tracks.push(Track {
            number,
            duration_frames,
            byte_offset: 0,
            title: None,
            artist: None,
            album: None,
        });
    }
    tracks
}

/// `[mm:ss.ff]` → CD frames.
fn parse_msf(field: &str) -> Option<u32> {
    let inner = field.strip_prefix('[')?.strip_suffix(']')?;
    let (minutes, rest) = inner.split_once(':')?;
    let (seconds, frames) = rest.split_once('.')?;
    let minutes: u32 = minutes.parse().ok()?;
    let seconds: u32 = seconds.parse().ok()?;
    let frames: u32 = frames.parse().ok()?;
    Some((minutes * 60 + seconds) * FRAMES_PER_SECOND + frames)
}

/// Pull the raw PCM out of a RIFF/WAVE file by walking its chunks.
fn strip_wav_header(wav: &[u8]) -> Result<Vec<u8>> {
    if wav.len() < 12 || &wav[0..4] != b"RIFF" || &wav[8..12] != b"WAVE" {
        return Err(Error::Source("extracted file is not a WAV".to_string()));
    }
    let mut pos = 12;
    while pos + 8 <= wav.len() {
        let id = &wav[pos..pos + 4];
        let size = u32::from_le_bytes([wav[pos + 4], wav[pos + 5], wav[pos + 6], wav[pos + 7]])
            as usize;
        pos += 8;
        if id == b"data" {
            let end = (pos + size).min(wav.len());
            return Ok(wav[pos..end].to_vec());
        }
        pos += size + (size & 1);
    }
    Err(Error::Source("WAV has no data chunk".to_string()))
}
