//! Blocking audio sink over cpal
//!
//! CD audio is interleaved S16LE stereo at 44.1 kHz and must reach the
//! device untouched, so the stream is opened as i16 and samples pass
//! through without conversion. The cpal callback drains a ring buffer;
//! `write` pushes into it and blocks while it is full, which gives the
//! playback thread the blocking-write pacing it is built around.
//!
//! cpal streams are not `Send`, so the stream lives on a small host
//! thread owned by the sink; the write half (producer + condvar + error
//! flag) crosses threads freely.

use crate::disc::{CHANNELS, SAMPLE_RATE};
use crate::error::{Error, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, StreamConfig};
use ringbuf::{traits::*, HeapProd, HeapRb};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Blocking PCM sink.
///
/// `write` accepts interleaved S16LE stereo bytes and returns once they
/// are queued for the device, blocking while the device buffer is full.
pub trait AudioSink: Send {
    fn write(&mut self, pcm: &[u8]) -> Result<()>;
}

/// cpal-backed sink: 44.1 kHz / S16LE / 2ch, exclusive stream, opened
/// once and kept running for the whole session.
pub struct CpalSink {
    producer: HeapProd<i16>,
    space: Arc<(Mutex<()>, Condvar)>,
    error_flag: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    host_thread: Option<JoinHandle<()>>,
    device_name: String,
}

impl CpalSink {
    /// List available output device names.
    pub fn list_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices: Vec<String> = host
            .output_devices()
            .map_err(|e| Error::AudioOutput(format!("Failed to enumerate devices: {}", e)))?
            .filter_map(|device| device.name().ok())
            .collect();
        debug!("found {} output devices", devices.len());
        Ok(devices)
    }

    /// Open the sink.
    ///
    /// `device_name` of `None` selects the default output device; a named
    /// device that cannot be found falls back to the default with a
    /// warning. `period_frames` is the requested device buffer size,
    /// `buffer_frames` the ring-buffer capacity `write` blocks against.
    pub fn open(
        device_name: Option<&str>,
        period_frames: u32,
        buffer_frames: u32,
    ) -> Result<Self> {
        let device = Self::pick_device(device_name)?;
        let resolved_name = device.name().unwrap_or_else(|_| "unknown".to_string());
        let config = Self::s16_config(&device, period_frames)?;

        let ring = HeapRb::<i16>::new(buffer_frames as usize * CHANNELS as usize);
        let (producer, mut consumer) = ring.split();

        let space = Arc::new((Mutex::new(()), Condvar::new()));
        let error_flag = Arc::new(AtomicBool::new(false));
        let shutdown = Arc::new(AtomicBool::new(false));

        let space_cb = Arc::clone(&space);
        let error_cb = Arc::clone(&error_flag);
        let error_host = Arc::clone(&error_flag);
        let shutdown_host = Arc::clone(&shutdown);

        // The stream is built and kept alive on its own thread; open()
        // waits for the build result before returning.
        let (ready_tx, ready_rx) = mpsc::channel::<std::result::Result<(), String>>();
        let host_thread = std::thread::Builder::new()
            .name("audio-sink".to_string())
            .spawn(move || {
                let stream = device.build_output_stream(
                    &config,
                    move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                        let popped = consumer.pop_slice(data);
                        data[popped..].fill(0);
                        let (_lock, cvar) = &*space_cb;
                        cvar.notify_one();
                    },
                    move |err| {
                        error!("audio stream error: {}", err);
                        error_cb.store(true, Ordering::SeqCst);
                    },
                    None,
                );

                let stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(format!("Failed to build stream: {}", e)));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(format!("Failed to start stream: {}", e)));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                while !shutdown_host.load(Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(50));
                }
                drop(stream);
                if error_host.load(Ordering::SeqCst) {
                    debug!("audio sink host thread exiting after stream error");
                }
            })
            .map_err(|e| Error::AudioOutput(format!("Failed to spawn sink thread: {}", e)))?;

        match ready_rx.recv_timeout(Duration::from_secs(5)) {
            Ok(Ok(())) => {}
            Ok(Err(msg)) => {
                let _ = host_thread.join();
                return Err(Error::AudioOutput(msg));
            }
            Err(_) => {
                shutdown.store(true, Ordering::SeqCst);
                return Err(Error::AudioOutput("Audio stream startup timed out".into()));
            }
        }

        info!(
            "audio sink opened: {} @ {}Hz/16bit/{}ch, period {} frames",
            resolved_name, SAMPLE_RATE, CHANNELS, period_frames
        );

        Ok(Self {
            producer,
            space,
            error_flag,
            shutdown,
            host_thread: Some(host_thread),
            device_name: resolved_name,
        })
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// Whether the resolved device is a direct hardware device, the
    /// requirement for byte-exact output.
    pub fn is_direct_hardware(name: &str) -> bool {
        name.starts_with("hw:")
    }

    fn pick_device(device_name: Option<&str>) -> Result<Device> {
        let host = cpal::default_host();

        if let Some(name) = device_name {
            let mut devices = host
                .output_devices()
                .map_err(|e| Error::AudioOutput(format!("Failed to enumerate devices: {}", e)))?;
            match devices.find(|d| d.name().ok().as_deref() == Some(name)) {
                Some(device) => {
                    info!("using requested audio device: {}", name);
                    return Ok(device);
                }
                None => {
                    warn!("audio device '{}' not found, falling back to default", name);
                }
            }
        }

        host.default_output_device().ok_or_else(|| {
            Error::AudioOutput("No audio output device available".to_string())
        })
    }

    /// Find a 44.1 kHz stereo i16 configuration. There is no conversion
    /// fallback: a device that cannot take S16LE cannot be bit-perfect.
    fn s16_config(device: &Device, period_frames: u32) -> Result<StreamConfig> {
        let supported = device
            .supported_output_configs()
            .map_err(|e| Error::AudioOutput(format!("Failed to get device configs: {}", e)))?
            .find(|config| {
                config.channels() == CHANNELS
                    && config.sample_format() == SampleFormat::I16
                    && config.min_sample_rate().0 <= SAMPLE_RATE
                    && config.max_sample_rate().0 >= SAMPLE_RATE
            })
            .ok_or_else(|| {
                Error::AudioOutput(format!(
                    "Device does not support {}Hz S16LE {}ch output",
                    SAMPLE_RATE, CHANNELS
                ))
            })?;

        let mut config = supported
            .with_sample_rate(cpal::SampleRate(SAMPLE_RATE))
            .config();
        config.buffer_size = cpal::BufferSize::Fixed(period_frames);
        Ok(config)
    }
}

impl AudioSink for CpalSink {
    fn write(&mut self, pcm: &[u8]) -> Result<()> {
        let samples: Vec<i16> = pcm
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect();

        let mut written = 0;
        while written < samples.len() {
            if self.error_flag.load(Ordering::SeqCst) {
                return Err(Error::AudioOutput("audio stream error".to_string()));
            }
            if self.shutdown.load(Ordering::SeqCst) {
                return Err(Error::AudioOutput("audio sink closed".to_string()));
            }

            written += self.producer.push_slice(&samples[written..]);
            if written < samples.len() {
                // Ring full: wait for the device callback to drain.
                let (lock, cvar) = &*self.space;
                let guard = lock.lock().unwrap();
                let _unused = cvar.wait_timeout(guard, Duration::from_millis(100)).unwrap();
            }
        }
        Ok(())
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.host_thread.take() {
            let _ = handle.join();
        }
        debug!("audio sink closed ({})", self.device_name);
    }
}
