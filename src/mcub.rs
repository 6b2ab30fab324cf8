//! MCUB v2.0.0 protocol surface
//!
//! Line-delimited JSON spoken with the external hardware readout over a
//! 115200-baud serial link. The link itself lives outside the core; this
//! module owns the message shapes, the status snapshot builder, and the
//! mode-flag mapping, so the serial carrier stays a dumb pipe.
//!
//! Envelope: `{"t": <type>, "d": <data>}` for data messages,
//! `{"t": <type>, "c": <command>}` for commands. Status messages
//! (`"t":"m"`) are emitted at ~500 ms cadence by the head loop.

use crate::controller::Controller;
use crate::sequencer::RepeatMode;
use crate::transport::PlayerState;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

pub const PROTOCOL_VERSION: &str = "2.0.0";
pub const BAUD_RATE: u32 = 115_200;

/// Wire envelope. Exactly one of `d` / `c` is populated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub t: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub d: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub c: Option<Value>,
}

/// A device-to-host command extracted from a `"cmd"` envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct HeadCommand {
    pub action: String,
    pub parameters: Value,
}

/// Parse one incoming line. Returns `None` for non-command messages and
/// anything malformed.
///
/// Both command shapes are accepted: the current
/// `{"action": ..., "parameters": {...}}` object and the legacy bare
/// string carrying just the action name.
pub fn parse_command(line: &str) -> Option<HeadCommand> {
    let envelope: Envelope = match serde_json::from_str(line.trim()) {
        Ok(envelope) => envelope,
        Err(_) => {
            warn!("head: invalid JSON line");
            return None;
        }
    };
    if envelope.t != "cmd" {
        return None;
    }

    match envelope.c? {
        Value::Object(map) => {
            let action = map.get("action")?.as_str()?.to_string();
            let parameters = map
                .get("parameters")
                .cloned()
                .unwrap_or(Value::Object(Default::default()));
            Some(HeadCommand { action, parameters })
        }
        Value::String(action) => Some(HeadCommand {
            action,
            parameters: Value::Object(Default::default()),
        }),
        _ => None,
    }
}

/// The identify handshake line sent to probe a device.
pub fn identify_line() -> String {
    serde_json::json!({"t": "id", "c": "identify"}).to_string()
}

/// Status payload of an `"m"` message. All values ride as strings, the
/// head firmware's native format.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusData {
    pub elapsed: String,
    pub total: String,
    /// "P" playing, "U" paused, "S" stopped.
    pub state: String,
    pub song_id: String,
    pub track_number: String,
    pub artist: String,
    pub title: String,
    pub album: String,
    pub genre: String,
    pub year: String,
    pub file_type: String,
    pub repeat: String,
    pub random: String,
    pub single: String,
    pub consume: String,
    pub volume: String,
    pub playlist_length: String,
    pub playlist_total_time: String,
    pub playlist_position: String,
}

/// MM:SS for intra-track times.
pub fn format_time(seconds: f64) -> String {
    let total = seconds.max(0.0) as u64;
    format!("{:02}:{:02}", total / 60, total % 60)
}

/// HH:MM:SS for whole-playlist times.
pub fn format_playlist_time(seconds: f64) -> String {
    let total = seconds.max(0.0) as u64;
    format!("{:02}:{:02}:{:02}", total / 3600, (total / 60) % 60, total % 60)
}

/// Map the core repeat mode onto the head's (repeat, single) flags.
pub fn repeat_flags(mode: RepeatMode) -> (&'static str, &'static str) {
    match mode {
        RepeatMode::Off => ("0", "0"),
        RepeatMode::Track => ("1", "1"),
        RepeatMode::All => ("1", "0"),
    }
}

fn state_code(state: PlayerState) -> &'static str {
    match state {
        PlayerState::Playing => "P",
        PlayerState::Paused => "U",
        PlayerState::Stopped => "S",
    }
}

impl StatusData {
    /// Snapshot the controller into one status payload.
    pub fn from_controller(controller: &Controller) -> Self {
        let track_number = controller.current_track_number();
        let (repeat, single) = repeat_flags(controller.repeat_mode());

        let title = controller
            .current_track_title()
            .unwrap_or_else(|| format!("Track {:02}", track_number));
        let artist = controller
            .current_track_artist()
            .or_else(|| controller.disc_artist())
            .unwrap_or_else(|| "Audio CD".to_string());
        let album = controller.disc_title().unwrap_or_else(|| "Disc".to_string());

        Self {
            elapsed: format_time(controller.position()),
            total: format_time(controller.duration()),
            state: state_code(controller.state()).to_string(),
            song_id: track_number.to_string(),
            track_number: track_number.to_string(),
            artist,
            title,
            album,
            genre: String::new(),
            year: String::new(),
            file_type: "PCM".to_string(),
            repeat: repeat.to_string(),
            random: if controller.shuffle_on() { "1" } else { "0" }.to_string(),
            single: single.to_string(),
            consume: "0".to_string(),
            volume: "100".to_string(),
            playlist_length: controller.total_tracks().to_string(),
            playlist_total_time: format_playlist_time(controller.total_duration()),
            playlist_position: track_number.to_string(),
        }
    }

    /// Serialize into one `"m"` status line, newline included.
    pub fn to_line(&self) -> String {
        let envelope = Envelope {
            t: "m".to_string(),
            d: Some(serde_json::to_value(self).expect("status serializes")),
            c: None,
        };
        let mut line = serde_json::to_string(&envelope).expect("envelope serializes");
        line.push('\n');
        line
    }
}
