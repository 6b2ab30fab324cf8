//! Streaming playback through an external media engine (mpv)
//!
//! One long-lived engine process per session, launched idle with
//! bit-perfect output flags and controlled over a line-delimited JSON
//! Unix socket. The engine sees the disc as a single `cdda://` source
//! whose chapters are the CD tracks: track N (1-based) is chapter N-1.
//!
//! A monitor thread runs a two-phase state machine: a startup wait that
//! hides the engine's spin-up (position reads 0 until audio is
//! confirmed), then end detection over the `chapter` and `eof-reached`
//! properties. Both phases pace themselves with a bounded-wait stop
//! event, so cleanup never stalls on a sleeping thread.

use super::{AudioTransport, PlayerState, TrackEnd, TrackEndHooks};
use crate::disc::Disc;
use crate::error::{Error, Result};
use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tracing::{debug, error, info, trace, warn};

/// Poll cadence while waiting for audio to start.
const STARTUP_POLL: Duration = Duration::from_millis(100);
/// Poll cadence while watching for track end.
const WATCH_POLL: Duration = Duration::from_millis(300);
/// Consecutive IPC failures in watch phase before the engine is
/// declared dead.
const DEAD_ENGINE_POLLS: u32 = 10;

/// Settable flag with a bounded wait, shared with the monitor thread.
#[derive(Default)]
struct StopEvent {
    flag: Mutex<bool>,
    cvar: Condvar,
}

impl StopEvent {
    fn set(&self) {
        *self.flag.lock().unwrap() = true;
        self.cvar.notify_all();
    }

    fn clear(&self) {
        *self.flag.lock().unwrap() = false;
    }

    /// Sleep up to `timeout`; returns true if the event was set.
    fn wait_for(&self, timeout: Duration) -> bool {
        let guard = self.flag.lock().unwrap();
        let (flag, _) = self
            .cvar
            .wait_timeout_while(guard, timeout, |set| !*set)
            .unwrap();
        *flag
    }
}

/// JSON-over-Unix-socket client for the engine.
///
/// Keeps one persistent connection; any failure tears it down and the
/// command is retried once over a fresh single-use connection.
struct EngineIpc {
    socket_path: PathBuf,
    conn: Mutex<Option<BufReader<UnixStream>>>,
}

impl EngineIpc {
    fn new(socket_path: PathBuf) -> Self {
        Self {
            socket_path,
            conn: Mutex::new(None),
        }
    }

    fn connect(&self) -> std::io::Result<BufReader<UnixStream>> {
        let stream = UnixStream::connect(&self.socket_path)?;
        stream.set_read_timeout(Some(Duration::from_millis(300)))?;
        stream.set_write_timeout(Some(Duration::from_millis(300)))?;
        Ok(BufReader::new(stream))
    }

    fn command(&self, cmd: &[Value]) -> Result<Value> {
        let mut guard = self.conn.lock().unwrap();
        if guard.is_none() {
            *guard = Some(
                self.connect()
                    .map_err(|e| Error::Engine(format!("connect: {}", e)))?,
            );
        }

        match Self::roundtrip(guard.as_mut().unwrap(), cmd) {
            Ok(response) => Ok(response),
            Err(e) => {
                trace!("persistent IPC connection failed ({}), retrying fresh", e);
                *guard = None;
                let mut fresh = self
                    .connect()
                    .map_err(|e| Error::Engine(format!("reconnect: {}", e)))?;
                let response = Self::roundtrip(&mut fresh, cmd)?;
                *guard = Some(fresh);
                Ok(response)
            }
        }
    }

    fn roundtrip(conn: &mut BufReader<UnixStream>, cmd: &[Value]) -> Result<Value> {
        let msg = serde_json::to_string(&json!({ "command": cmd }))? + "\n";
        conn.get_mut()
            .write_all(msg.as_bytes())
            .map_err(|e| Error::Engine(format!("send: {}", e)))?;

        // The engine interleaves async event lines with responses;
        // responses are the ones carrying an "error" field.
        for _ in 0..32 {
            let mut line = String::new();
            conn.read_line(&mut line)
                .map_err(|e| Error::Engine(format!("recv: {}", e)))?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let value: Value = serde_json::from_str(line)?;
            if value.get("error").is_some() {
                return Ok(value);
            }
        }
        Err(Error::Engine("no response on IPC socket".to_string()))
    }

    fn command_ok(&self, cmd: &[Value]) -> bool {
        matches!(
            self.command(cmd),
            Ok(response) if response.get("error").and_then(Value::as_str) == Some("success")
        )
    }

    fn get_property(&self, name: &str) -> Option<Value> {
        let response = self.command(&[json!("get_property"), json!(name)]).ok()?;
        if response.get("error")?.as_str()? != "success" {
            return None;
        }
        response.get("data").cloned()
    }

    fn get_f64(&self, name: &str) -> Option<f64> {
        self.get_property(name)?.as_f64()
    }

    fn get_i64(&self, name: &str) -> Option<i64> {
        self.get_property(name)?.as_i64()
    }

    fn get_bool(&self, name: &str) -> Option<bool> {
        self.get_property(name)?.as_bool()
    }

    fn get_string(&self, name: &str) -> Option<String> {
        self.get_property(name)?.as_str().map(str::to_string)
    }

    fn set_property(&self, name: &str, value: Value) -> bool {
        self.command_ok(&[json!("set_property"), json!(name), value])
    }
}

/// The engine process and the scratch directory holding its socket.
struct Engine {
    child: Child,
    _socket_dir: TempDir,
}

struct StreamShared {
    state: PlayerState,
    /// Current track, 0-based (== engine chapter while loaded).
    current: usize,
    /// True once the monitor confirmed audio flow for this track.
    playback_started: bool,
    pause_position: f64,
    cached_position: f64,
    cached_at: Option<Instant>,
}

/// Streaming transport over the external engine.
pub struct StreamPlayer {
    cd_device: String,
    alsa_device: Option<String>,
    startup_timeout: Duration,
    disc: Arc<Disc>,
    shared: Arc<Mutex<StreamShared>>,
    engine: Mutex<Option<Engine>>,
    ipc: Mutex<Option<Arc<EngineIpc>>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    monitor_stop: Arc<StopEvent>,
    hooks: Arc<TrackEndHooks>,
}

impl StreamPlayer {
    pub fn new(
        cd_device: &str,
        alsa_device: Option<&str>,
        startup_timeout: Duration,
        disc: Arc<Disc>,
    ) -> Self {
        debug!(
            "stream player created: cd={}, {} tracks",
            cd_device,
            disc.track_count()
        );
        Self {
            cd_device: cd_device.to_string(),
            alsa_device: alsa_device.map(str::to_string),
            startup_timeout,
            disc,
            shared: Arc::new(Mutex::new(StreamShared {
                state: PlayerState::Stopped,
                current: 0,
                playback_started: false,
                pause_position: 0.0,
                cached_position: 0.0,
                cached_at: None,
            })),
            engine: Mutex::new(None),
            ipc: Mutex::new(None),
            monitor: Mutex::new(None),
            monitor_stop: Arc::new(StopEvent::default()),
            hooks: Arc::new(TrackEndHooks::new()),
        }
    }

    fn disc_uri(&self) -> String {
        format!("cdda://{}", self.cd_device)
    }

    /// Spawn the engine if it is not already running.
    fn ensure_engine(&self) -> bool {
        let mut engine = self.engine.lock().unwrap();
        if let Some(running) = engine.as_mut() {
            if matches!(running.child.try_wait(), Ok(None)) {
                return true;
            }
            warn!("engine process exited, respawning");
        }

        match self.spawn_engine() {
            Ok((new_engine, ipc)) => {
                *engine = Some(new_engine);
                *self.ipc.lock().unwrap() = Some(Arc::new(ipc));
                true
            }
            Err(e) => {
                error!("failed to start media engine: {}", e);
                false
            }
        }
    }

    fn spawn_engine(&self) -> Result<(Engine, EngineIpc)> {
        // Atomic unique scratch dir; the socket lives inside it.
        let socket_dir = tempfile::Builder::new()
            .prefix("ramcd-engine-")
            .tempdir()
            .map_err(|e| Error::Engine(format!("temp dir: {}", e)))?;
        let socket_path = socket_dir.path().join("ipc.sock");

        let mut cmd = Command::new("mpv");
        cmd.arg("--idle=yes")
            .arg("--no-video")
            .arg("--ao=alsa")
            .arg("--audio-pitch-correction=no")
            .arg("--audio-normalize-downmix=no")
            .arg("--replaygain=no")
            .arg("--volume=100")
            .arg("--volume-max=100")
            .arg("--af=")
            .arg("--audio-swresample-o=")
            .arg("--gapless-audio=yes")
            .arg("--audio-buffer=0.2")
            .arg("--no-terminal")
            .arg("--really-quiet")
            .arg(format!("--input-ipc-server={}", socket_path.display()))
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Some(device) = &self.alsa_device {
            cmd.arg(format!("--audio-device=alsa/{}", device));
        }

        debug!("starting media engine");
        let child = cmd
            .spawn()
            .map_err(|e| Error::Engine(format!("mpv launch failed: {}", e)))?;

        // Wait for the IPC socket to appear.
        let mut ready = false;
        for i in 0..30 {
            if socket_path.exists() {
                std::thread::sleep(Duration::from_millis(100));
                debug!("engine IPC ready after {:.1}s", (i + 1) as f64 * 0.1);
                ready = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(100));
        }
        if !ready {
            warn!("engine IPC socket not ready after 3s");
        }

        Ok((
            Engine {
                child,
                _socket_dir: socket_dir,
            },
            EngineIpc::new(socket_path),
        ))
    }

    fn current_ipc(&self) -> Option<Arc<EngineIpc>> {
        self.ipc.lock().unwrap().clone()
    }

    fn stop_monitor(&self) {
        self.monitor_stop.set();
        let mut monitor = self.monitor.lock().unwrap();
        if let Some(thread) = monitor.take() {
            for _ in 0..50 {
                if thread.is_finished() {
                    break;
                }
                std::thread::sleep(Duration::from_millis(20));
            }
            if thread.is_finished() {
                let _ = thread.join();
            } else {
                warn!("monitor thread did not stop gracefully");
            }
        }
    }

    fn spawn_monitor(&self) {
        let Some(ipc) = self.current_ipc() else {
            return;
        };
        self.monitor_stop.clear();

        let shared = Arc::clone(&self.shared);
        let disc = Arc::clone(&self.disc);
        let stop = Arc::clone(&self.monitor_stop);
        let hooks = Arc::clone(&self.hooks);
        let startup_timeout = self.startup_timeout;

        let handle = std::thread::Builder::new()
            .name("engine-monitor".to_string())
            .spawn(move || monitor_loop(shared, ipc, disc, stop, hooks, startup_timeout));
        match handle {
            Ok(handle) => *self.monitor.lock().unwrap() = Some(handle),
            Err(e) => error!("failed to spawn monitor thread: {}", e),
        }
    }

    /// Load or chapter-seek the engine to `index` and start the monitor.
    fn start_track(&self, index: usize) -> bool {
        self.stop_monitor();
        if !self.ensure_engine() {
            return false;
        }
        let Some(ipc) = self.current_ipc() else {
            return false;
        };

        {
            let mut s = self.shared.lock().unwrap();
            s.current = index;
            s.state = PlayerState::Playing;
            s.playback_started = false;
            s.pause_position = 0.0;
            s.cached_position = 0.0;
            s.cached_at = None;
        }

        let uri = self.disc_uri();
        let idle = ipc.get_bool("core-idle");
        let path = ipc.get_string("path");

        if path.as_deref() == Some(uri.as_str()) && idle != Some(true) {
            debug!("seeking to chapter {}", index);
            ipc.set_property("chapter", json!(index as i64));
        } else {
            if !ipc.command_ok(&[json!("loadfile"), json!(uri), json!("replace")]) {
                error!("engine loadfile failed");
                self.shared.lock().unwrap().state = PlayerState::Stopped;
                return false;
            }
            if index > 0 {
                // Let the source open before the first chapter seek.
                std::thread::sleep(Duration::from_millis(500));
                ipc.set_property("chapter", json!(index as i64));
            }
        }

        // The engine unpauses on loadfile, but an earlier pause may stick.
        ipc.set_property("pause", json!(false));

        info!("streaming track {}", index + 1);
        self.spawn_monitor();
        true
    }
}

impl AudioTransport for StreamPlayer {
    fn play(&self) {
        let state = self.shared.lock().unwrap().state;
        match state {
            PlayerState::Playing => {
                debug!("already playing, ignoring play()");
            }
            PlayerState::Paused => {
                if let Some(ipc) = self.current_ipc() {
                    ipc.set_property("pause", json!(false));
                }
                self.shared.lock().unwrap().state = PlayerState::Playing;
                info!("resumed");
            }
            PlayerState::Stopped => {
                let index = self.shared.lock().unwrap().current;
                self.start_track(index);
            }
        }
    }

    fn pause(&self) {
        let state = self.shared.lock().unwrap().state;
        if state != PlayerState::Playing {
            return;
        }
        let position = self.position();
        if let Some(ipc) = self.current_ipc() {
            ipc.set_property("pause", json!(true));
        }
        let mut s = self.shared.lock().unwrap();
        s.state = PlayerState::Paused;
        s.pause_position = position;
        info!("paused at {:.1}s", position);
    }

    fn stop(&self) {
        self.stop_monitor();
        if let Some(ipc) = self.current_ipc() {
            ipc.command_ok(&[json!("stop")]);
        }
        let mut s = self.shared.lock().unwrap();
        s.state = PlayerState::Stopped;
        s.playback_started = false;
        s.pause_position = 0.0;
        s.cached_at = None;
        info!("stopped");
    }

    fn seek(&self, seconds: f64) {
        let (state, current) = {
            let s = self.shared.lock().unwrap();
            (s.state, s.current)
        };
        if state == PlayerState::Stopped {
            warn!("seek while stopped is a no-op");
            return;
        }
        let duration = self
            .disc
            .track(current)
            .map(|t| t.duration_seconds())
            .unwrap_or(0.0);
        if !(0.0..=duration).contains(&seconds) {
            warn!("seek to {:.1}s rejected (track is {:.1}s)", seconds, duration);
            return;
        }

        let absolute = self.disc.chapter_start_seconds(current) + seconds;
        if let Some(ipc) = self.current_ipc() {
            if ipc.set_property("time-pos", json!(absolute)) {
                let mut s = self.shared.lock().unwrap();
                s.cached_position = seconds;
                s.cached_at = Some(Instant::now());
                if s.state == PlayerState::Paused {
                    s.pause_position = seconds;
                }
                info!("seek to {:.1}s", seconds);
            }
        }
    }

    fn navigate_to(&self, index: usize, auto_play: bool) -> bool {
        if index >= self.disc.track_count() {
            warn!(
                "navigate to track {} rejected ({} tracks)",
                index + 1,
                self.disc.track_count()
            );
            return false;
        }
        if auto_play {
            return self.start_track(index);
        }

        self.stop_monitor();
        let mut s = self.shared.lock().unwrap();
        s.current = index;
        s.state = PlayerState::Stopped;
        s.playback_started = false;
        s.pause_position = 0.0;
        debug!("armed track {} (not playing)", index + 1);
        true
    }

    fn prepare_next(&self, _index: Option<usize>) {
        // The engine reads ahead on its own; nothing to preload here.
        trace!("prepare_next ignored by streaming backend");
    }

    fn position(&self) -> f64 {
        let (state, current, started, pause_position, cached, cached_at) = {
            let s = self.shared.lock().unwrap();
            (
                s.state,
                s.current,
                s.playback_started,
                s.pause_position,
                s.cached_position,
                s.cached_at,
            )
        };

        match state {
            PlayerState::Stopped => 0.0,
            PlayerState::Paused => pause_position,
            PlayerState::Playing => {
                if !started {
                    // Track change in flight: hide the engine's spin-up.
                    return 0.0;
                }
                if let Some(at) = cached_at {
                    if at.elapsed() < Duration::from_millis(200) {
                        return cached;
                    }
                }
                let Some(ipc) = self.current_ipc() else {
                    return cached;
                };
                match ipc.get_f64("time-pos") {
                    Some(absolute) => {
                        let track_pos = absolute - self.disc.chapter_start_seconds(current);
                        if track_pos >= 0.0 {
                            let mut s = self.shared.lock().unwrap();
                            s.cached_position = track_pos;
                            s.cached_at = Some(Instant::now());
                            track_pos
                        } else {
                            cached
                        }
                    }
                    None => cached,
                }
            }
        }
    }

    fn duration(&self) -> f64 {
        let current = self.shared.lock().unwrap().current;
        self.disc
            .track(current)
            .map(|t| t.duration_seconds())
            .unwrap_or(0.0)
    }

    fn state(&self) -> PlayerState {
        self.shared.lock().unwrap().state
    }

    fn current_track_index(&self) -> usize {
        self.shared.lock().unwrap().current
    }

    fn track_count(&self) -> usize {
        self.disc.track_count()
    }

    fn end_hooks(&self) -> Arc<TrackEndHooks> {
        Arc::clone(&self.hooks)
    }

    fn cleanup(&self) {
        debug!("stream player cleanup");
        self.stop_monitor();

        let mut engine = self.engine.lock().unwrap();
        if let Some(mut running) = engine.take() {
            if let Some(ipc) = self.current_ipc() {
                ipc.command_ok(&[json!("quit")]);
            }
            let deadline = Instant::now() + Duration::from_secs(2);
            let exited = loop {
                match running.child.try_wait() {
                    Ok(Some(_)) => break true,
                    Ok(None) if Instant::now() < deadline => {
                        std::thread::sleep(Duration::from_millis(50))
                    }
                    _ => break false,
                }
            };
            if !exited {
                warn!("engine not responding, killing");
                let _ = running.child.kill();
                let _ = running.child.wait();
            }
            // Dropping the Engine removes the socket's temp dir.
        }
        *self.ipc.lock().unwrap() = None;
        self.shared.lock().unwrap().state = PlayerState::Stopped;
        info!("stream player cleanup complete");
    }
}

#[derive(Clone, Copy)]
enum MonitorPhase {
    /// Waiting for the engine to actually produce audio.
    StartupWait { deadline: Instant },
    /// Watching for chapter change or end of the source.
    EndWatch { ipc_failures: u32 },
}

/// Two-phase poll loop. All sleeps go through the stop event so a
/// cleanup can interrupt either phase within one poll interval.
fn monitor_loop(
    shared: Arc<Mutex<StreamShared>>,
    ipc: Arc<EngineIpc>,
    disc: Arc<Disc>,
    stop: Arc<StopEvent>,
    hooks: Arc<TrackEndHooks>,
    startup_timeout: Duration,
) {
    debug!("monitor thread started");
    let mut phase = MonitorPhase::StartupWait {
        deadline: Instant::now() + startup_timeout,
    };

    loop {
        let poll = match phase {
            MonitorPhase::StartupWait { .. } => STARTUP_POLL,
            MonitorPhase::EndWatch { .. } => WATCH_POLL,
        };
        if stop.wait_for(poll) {
            break;
        }

        match phase {
            MonitorPhase::StartupWait { deadline } => {
                let current = shared.lock().unwrap().current;
                let chapter_start = disc.chapter_start_seconds(current);

                if let Some(absolute) = ipc.get_f64("time-pos") {
                    let track_pos = absolute - chapter_start;
                    if track_pos > 0.1 {
                        info!(
                            "audio started for track {} (pos={:.1}s)",
                            current + 1,
                            track_pos
                        );
                        shared.lock().unwrap().playback_started = true;
                        phase = MonitorPhase::EndWatch { ipc_failures: 0 };
                        continue;
                    }
                }
                if Instant::now() >= deadline {
                    warn!("timeout waiting for audio, assuming started");
                    shared.lock().unwrap().playback_started = true;
                    phase = MonitorPhase::EndWatch { ipc_failures: 0 };
                }
            }

            MonitorPhase::EndWatch { ipc_failures } => {
                let (state, expected) = {
                    let s = shared.lock().unwrap();
                    (s.state, s.current as i64)
                };
                if state != PlayerState::Playing {
                    continue;
                }

                let chapter = ipc.get_i64("chapter");
                let eof = ipc.get_bool("eof-reached");

                if chapter.is_none() && eof.is_none() {
                    let failures = ipc_failures + 1;
                    if failures >= DEAD_ENGINE_POLLS {
                        error!("engine stopped responding, aborting playback");
                        let mut s = shared.lock().unwrap();
                        s.state = PlayerState::Stopped;
                        s.playback_started = false;
                        drop(s);
                        hooks.fire_detached(TrackEnd::aborted());
                        break;
                    }
                    phase = MonitorPhase::EndWatch { ipc_failures: failures };
                    continue;
                }
                phase = MonitorPhase::EndWatch { ipc_failures: 0 };

                if let Some(chapter) = chapter {
                    if chapter >= 0 && chapter != expected {
                        // The engine rolled into the next chapter on its
                        // own: this is the streaming gapless transition.
                        info!("track {} ended (chapter -> {})", expected + 1, chapter + 1);
                        shared.lock().unwrap().current = chapter as usize;
                        hooks.fire_detached(TrackEnd::natural());
                        continue;
                    }
                }

                if eof == Some(true) {
                    info!("track {} ended (EOF)", expected + 1);
                    let mut s = shared.lock().unwrap();
                    s.state = PlayerState::Stopped;
                    s.playback_started = false;
                    drop(s);
                    hooks.fire_detached(TrackEnd::natural());
                    break;
                }
            }
        }
    }
    debug!("monitor thread stopped");
}
