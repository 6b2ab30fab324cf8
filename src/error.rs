//! Error types for ramcd
//!
//! Module-specific error types using thiserror for clear error propagation.

use thiserror::Error;

/// Main error type for ramcd
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration file loading errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Audio output device errors
    #[error("Audio output error: {0}")]
    AudioOutput(String),

    /// Playback engine errors
    #[error("Playback error: {0}")]
    Playback(String),

    /// Media engine (mpv) process or IPC errors
    #[error("Media engine error: {0}")]
    Engine(String),

    /// CD drive / extraction errors
    #[error("Disc source error: {0}")]
    Source(String),

    /// No disc loaded for the requested operation
    #[error("No disc loaded")]
    NoDisc,

    /// Track index outside the disc's range
    #[error("Track {index} out of range (disc has {total} tracks)")]
    TrackOutOfRange { index: usize, total: usize },

    /// File I/O errors
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience Result type using ramcd Error
pub type Result<T> = std::result::Result<T, Error>;
