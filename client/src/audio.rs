//! Audio output device handling.
//!
//! [`SinkHandle`] owns at most one live output device at a time, keyed to the
//! current [`AudioFormat`]. Devices cannot be reconfigured in place, so a new
//! format always means release-then-open. The production backend is cpal;
//! tests plug in their own [`OutputBackend`].

use anyhow::{bail, Context, Result};
use audiopirate_common::AudioFormat;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Stream, StreamConfig};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::f64::consts::PI;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Calibration tone frequency in Hz (A4).
pub const TONE_FREQUENCY_HZ: f64 = 440.0;

/// Calibration tone duration in milliseconds.
pub const TONE_DURATION_MS: u32 = 200;

/// Calibration tone peak amplitude.
pub const TONE_AMPLITUDE: f64 = 16384.0;

/// Chunks the device queue holds before writes start being dropped.
///
/// Well above what the device consumes per callback, so short stalls on
/// the network side never starve it.
pub const PLAYBACK_QUEUE_CHUNKS: usize = 64;

/// A live output device.
///
/// Dropping the device releases it.
pub trait OutputDevice: Send {
    /// Begins pulling queued samples.
    fn start(&mut self) -> Result<()>;

    /// Queues interleaved 16-bit samples for playback.
    fn write(&mut self, samples: &[i16]) -> Result<()>;
}

/// Opens output devices for a given format.
pub trait OutputBackend: Send {
    fn open(&mut self, format: &AudioFormat) -> Result<Box<dyn OutputDevice>>;
}

/// Lifecycle tag of a [`SinkHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkPhase {
    Uninitialized,
    Active,
    Released,
}

enum SinkState {
    Uninitialized,
    Active {
        device: Box<dyn OutputDevice>,
        format: AudioFormat,
        playing: bool,
    },
    Released,
}

/// Exclusively owned playback device with explicit acquire/release.
pub struct SinkHandle<B: OutputBackend> {
    // ---
    backend: B,
    state: SinkState,
}

impl<B: OutputBackend> SinkHandle<B> {
    // ---
    pub fn new(backend: B) -> Self {
        // ---
        Self {
            backend,
            state: SinkState::Uninitialized,
        }
    }

    /// Opens a device for `format`, releasing any device already held.
    ///
    /// # Errors
    ///
    /// Returns error if the backend cannot open a device. The handle is left
    /// released in that case.
    pub fn acquire(&mut self, format: &AudioFormat) -> Result<()> {
        // ---
        self.release();

        let device = self
            .backend
            .open(format)
            .with_context(|| format!("failed to open output for {format}"))?;

        info!("Playback device ready: {}", format);
        self.state = SinkState::Active {
            device,
            format: *format,
            playing: false,
        };
        Ok(())
    }

    /// Starts playback on the active device. Starting twice is a no-op.
    pub fn start(&mut self) -> Result<()> {
        // ---
        match &mut self.state {
            SinkState::Active {
                device, playing, ..
            } => {
                if !*playing {
                    device.start().context("failed to start playback")?;
                    *playing = true;
                    debug!("Playback started");
                }
                Ok(())
            }
            _ => bail!("playback sink is not active"),
        }
    }

    pub fn write(&mut self, samples: &[i16]) -> Result<()> {
        // ---
        match &mut self.state {
            SinkState::Active { device, .. } => device.write(samples),
            _ => bail!("playback sink is not active"),
        }
    }

    /// Releases the device if one is held. Safe to call in any phase.
    pub fn release(&mut self) {
        // ---
        if let SinkState::Active { format, .. } = &self.state {
            debug!("Releasing playback device ({})", format);
            self.state = SinkState::Released;
        }
    }

    pub fn phase(&self) -> SinkPhase {
        // ---
        match self.state {
            SinkState::Uninitialized => SinkPhase::Uninitialized,
            SinkState::Active { .. } => SinkPhase::Active,
            SinkState::Released => SinkPhase::Released,
        }
    }

    pub fn format(&self) -> Option<AudioFormat> {
        // ---
        match &self.state {
            SinkState::Active { format, .. } => Some(*format),
            _ => None,
        }
    }

    pub fn is_playing(&self) -> bool {
        // ---
        matches!(self.state, SinkState::Active { playing: true, .. })
    }
}

/// Generates the interleaved calibration tone for `format`.
///
/// Every channel carries the same sine wave.
pub fn calibration_tone(format: &AudioFormat) -> Vec<i16> {
    // ---
    let channels = format.channels.max(1) as usize;
    let frames = (format.sample_rate as u64 * TONE_DURATION_MS as u64 / 1000) as usize;
    let rate = format.sample_rate as f64;

    let mut tone = Vec::with_capacity(frames * channels);
    for i in 0..frames {
        let phase = 2.0 * PI * TONE_FREQUENCY_HZ * i as f64 / rate;
        let sample = (phase.sin() * TONE_AMPLITUDE) as i16;
        tone.extend(std::iter::repeat(sample).take(channels));
    }
    tone
}

/// cpal backend using the system's default output device.
#[derive(Debug, Default)]
pub struct CpalBackend;

impl OutputBackend for CpalBackend {
    fn open(&mut self, format: &AudioFormat) -> Result<Box<dyn OutputDevice>> {
        // ---
        Ok(Box::new(CpalDevice::open(format)?))
    }
}

enum DeviceControl {
    Play,
    Shutdown,
}

/// cpal output stream running on its own thread.
///
/// cpal streams are not `Send`, so the stream is created, driven and dropped
/// on a dedicated `playback` thread. Samples reach the audio callback through
/// a bounded channel; the callback plays silence when it runs dry.
pub struct CpalDevice {
    // ---
    sample_tx: SyncSender<Vec<i16>>,
    control_tx: mpsc::Sender<DeviceControl>,
    thread: Option<JoinHandle<()>>,
}

impl CpalDevice {
    // ---
    /// Opens the default output device for `format`, initially paused.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - No audio output device is available
    /// - The device rejects the stream configuration
    pub fn open(format: &AudioFormat) -> Result<Self> {
        // ---
        let (sample_tx, sample_rx) = mpsc::sync_channel(PLAYBACK_QUEUE_CHUNKS);
        let (control_tx, control_rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<()>>();
        let format = *format;

        let thread = thread::Builder::new()
            .name("playback".into())
            .spawn(move || {
                let stream = match Self::build_stream(&format, sample_rx) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));

                for control in control_rx {
                    match control {
                        DeviceControl::Play => {
                            if let Err(e) = stream.play() {
                                warn!("Failed to start audio stream: {}", e);
                            }
                        }
                        DeviceControl::Shutdown => break,
                    }
                }

                drop(stream);
                debug!("Audio stream closed");
            })
            .context("failed to spawn playback thread")?;

        ready_rx
            .recv()
            .context("playback thread exited during setup")??;

        Ok(Self {
            sample_tx,
            control_tx,
            thread: Some(thread),
        })
    }

    fn build_stream(format: &AudioFormat, sample_rx: Receiver<Vec<i16>>) -> Result<Stream> {
        // ---
        let host = cpal::default_host();
        let device: Device = host
            .default_output_device()
            .context("no output device available")?;

        info!("Using audio device: {}", device.name()?);

        let config = StreamConfig {
            channels: format.channels,
            sample_rate: cpal::SampleRate(format.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        debug!("Stream config: {:?}", config);

        let mut pending: VecDeque<i16> = VecDeque::new();
        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                    for sample in data.iter_mut() {
                        if pending.is_empty() {
                            if let Ok(chunk) = sample_rx.try_recv() {
                                pending.extend(chunk);
                            }
                        }
                        *sample = pending.pop_front().unwrap_or(0);
                    }
                },
                |err| {
                    warn!("Audio stream error: {}", err);
                },
                None,
            )
            .context("failed to build output stream")?;

        // Some hosts start streams as soon as they are built
        let _ = stream.pause();

        Ok(stream)
    }
}

impl OutputDevice for CpalDevice {
    fn start(&mut self) -> Result<()> {
        // ---
        self.control_tx
            .send(DeviceControl::Play)
            .context("playback thread is gone")
    }

    fn write(&mut self, samples: &[i16]) -> Result<()> {
        // ---
        match self.sample_tx.try_send(samples.to_vec()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!("Playback queue full, dropping {} samples", samples.len());
                Ok(())
            }
            Err(TrySendError::Disconnected(_)) => bail!("playback thread is gone"),
        }
    }
}

impl Drop for CpalDevice {
    fn drop(&mut self) {
        // ---
        let _ = self.control_tx.send(DeviceControl::Shutdown);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Playback thread panicked");
            }
        }
    }
}

/// Something that happened to a [`MemoryBackend`] device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    Opened(AudioFormat),
    Started,
    Wrote(Vec<i16>),
    Released,
}

#[derive(Debug, Default)]
struct MemoryState {
    events: Vec<SinkEvent>,
    live_devices: usize,
    samples_written: u64,
}

/// Output backend that keeps everything in memory.
///
/// Used for headless runs (no sound card, recording only) and by tests to
/// observe exactly what reached the device. Clones share state.
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    // ---
    shared: Arc<Mutex<MemoryState>>,
    keep_samples: bool,
}

impl MemoryBackend {
    // ---
    /// Backend that records every write.
    pub fn new() -> Self {
        // ---
        Self {
            shared: Arc::default(),
            keep_samples: true,
        }
    }

    /// Backend that only counts written samples.
    pub fn discarding() -> Self {
        // ---
        Self {
            shared: Arc::default(),
            keep_samples: false,
        }
    }

    pub fn events(&self) -> Vec<SinkEvent> {
        // ---
        self.shared.lock().events.clone()
    }

    /// Sample blocks written, in order.
    pub fn writes(&self) -> Vec<Vec<i16>> {
        // ---
        self.shared
            .lock()
            .events
            .iter()
            .filter_map(|e| match e {
                SinkEvent::Wrote(samples) => Some(samples.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn clear_events(&self) {
        // ---
        self.shared.lock().events.clear();
    }

    /// Devices opened and not yet released.
    pub fn live_devices(&self) -> usize {
        // ---
        self.shared.lock().live_devices
    }

    pub fn samples_written(&self) -> u64 {
        // ---
        self.shared.lock().samples_written
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputBackend for MemoryBackend {
    fn open(&mut self, format: &AudioFormat) -> Result<Box<dyn OutputDevice>> {
        // ---
        let mut state = self.shared.lock();
        state.live_devices += 1;
        state.events.push(SinkEvent::Opened(*format));

        Ok(Box::new(MemoryDevice {
            shared: self.shared.clone(),
            keep_samples: self.keep_samples,
        }))
    }
}

struct MemoryDevice {
    shared: Arc<Mutex<MemoryState>>,
    keep_samples: bool,
}

impl OutputDevice for MemoryDevice {
    fn start(&mut self) -> Result<()> {
        self.shared.lock().events.push(SinkEvent::Started);
        Ok(())
    }

    fn write(&mut self, samples: &[i16]) -> Result<()> {
        let mut state = self.shared.lock();
        state.samples_written += samples.len() as u64;
        if self.keep_samples {
            state.events.push(SinkEvent::Wrote(samples.to_vec()));
        }
        Ok(())
    }
}

impl Drop for MemoryDevice {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        state.live_devices -= 1;
        state.events.push(SinkEvent::Released);
    }
}
