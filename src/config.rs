//! Configuration for ramcd
//!
//! A typed record with built-in defaults, optionally overridden by a JSON
//! settings file. The rest of the crate takes the resolved record by value;
//! there is no global mutable configuration state. Unknown keys in the
//! settings file are ignored.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Autoplay-after-load policy: one flag for every extraction level, or a
/// per-level map. JSON map keys are strings ("0".."3").
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Autoplay {
    All(bool),
    PerLevel(HashMap<String, bool>),
}

impl Default for Autoplay {
    fn default() -> Self {
        // Only streaming (level 0) autoplays out of the box.
        let mut map = HashMap::new();
        map.insert("0".to_string(), true);
        Autoplay::PerLevel(map)
    }
}

/// Resolved configuration record consumed by the core.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Audio output device name. `None` selects the default output device.
    pub alsa_device: Option<String>,
    /// CD drive block device.
    pub cd_device: String,
    /// Scratch mount the extractor rips into.
    pub ram_path: PathBuf,
    /// Autoplay policy applied after a successful load.
    pub autoplay_on_load: Autoplay,
    /// Frames per write chunk handed to the audio sink.
    pub period_frames: u32,
    /// Capacity of the sink's ring buffer, in frames.
    pub audio_buffer_frames: u32,
    /// Hard cap on the streaming backend's startup wait.
    pub stream_startup_timeout_secs: u64,
    /// How many tracks ahead the RAM backend preloads.
    pub preload_ahead: u8,
    /// Extraction level used when `load` is given no argument.
    pub default_extraction_level: u8,
    /// cdparanoia binary used by the disc source.
    pub cdparanoia_path: String,
    /// Drive read offset in samples, forwarded to the extractor.
    pub cd_read_offset: i32,
    pub log_file: Option<PathBuf>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            alsa_device: None,
            cd_device: "/dev/sr0".to_string(),
            ram_path: PathBuf::from("/mnt/cdram"),
            autoplay_on_load: Autoplay::default(),
            period_frames: 4096,
            audio_buffer_frames: 16384,
            stream_startup_timeout_secs: 20,
            preload_ahead: 1,
            default_extraction_level: 1,
            cdparanoia_path: "cdparanoia".to_string(),
            cd_read_offset: 6,
            log_file: None,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load defaults merged with JSON overrides from `path`.
    ///
    /// A missing file yields plain defaults; a malformed file is an error.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => {
                let config: Config = serde_json::from_str(&text)
                    .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
                debug!("config loaded from {}", path.display());
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("no settings file at {}, using defaults", path.display());
                Ok(Config::default())
            }
            Err(e) => Err(Error::Config(format!("{}: {}", path.display(), e))),
        }
    }

    /// Whether a load at `level` should start playback immediately.
    pub fn should_autoplay(&self, level: u8) -> bool {
        match &self.autoplay_on_load {
            Autoplay::All(flag) => *flag,
            Autoplay::PerLevel(map) => map.get(&level.to_string()).copied().unwrap_or(false),
        }
    }

    /// Validate an extraction level from user input.
    pub fn check_extraction_level(level: u8) -> Result<u8> {
        if level <= 3 {
            Ok(level)
        } else {
            warn!("invalid extraction level {}", level);
            Err(Error::Config(format!("extraction level {} not in 0..=3", level)))
        }
    }

    /// Bytes per write chunk handed to the audio sink.
    pub fn chunk_bytes(&self) -> usize {
        self.period_frames as usize * crate::disc::BYTES_PER_FRAME
    }
}
