//! Playback path: declick/gain, jitter buffering, and the output device.

use anyhow::Result;
use audiopirate_common::AudioFormat;
use tracing::info;

use crate::audio::{calibration_tone, OutputBackend, SinkHandle};
use crate::declick::{Declicker, DEFAULT_FADE_LEN};
use crate::jitter_buffer::{JitterBuffer, JitterBufferConfig, JitterBufferStatus};

/// Playback tuning.
#[derive(Debug, Clone)]
pub struct PlaybackConfig {
    // ---
    pub jitter: JitterBufferConfig,

    /// Cross-fade length in samples
    pub fade_len: usize,

    /// Play a short tone the first time output starts in a session
    pub calibration_tone: bool,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        // ---
        Self {
            jitter: JitterBufferConfig::default(),
            fade_len: DEFAULT_FADE_LEN,
            calibration_tone: true,
        }
    }
}

/// Everything between converted samples and the output device.
///
/// Only the engine task touches this; callers influence it through gain
/// requests and format announcements, never directly.
pub struct PlaybackPipeline<B: OutputBackend> {
    // ---
    declicker: Declicker,
    jitter: JitterBuffer,
    sink: SinkHandle<B>,
    calibration_tone: bool,

    /// Set once the tone has played; only a session reset clears it
    tone_played: bool,
}

impl<B: OutputBackend> PlaybackPipeline<B> {
    // ---
    pub fn new(backend: B, config: PlaybackConfig) -> Self {
        // ---
        Self {
            declicker: Declicker::new(config.fade_len),
            jitter: JitterBuffer::new(config.jitter),
            sink: SinkHandle::new(backend),
            calibration_tone: config.calibration_tone,
            tone_played: false,
        }
    }

    /// Rebuilds the device for a newly announced format.
    ///
    /// Buffered packets and the cross-fade tail belong to the old format and
    /// are discarded; playback primes again from scratch.
    pub fn configure(&mut self, format: &AudioFormat) -> Result<()> {
        // ---
        self.declicker.reset();
        self.jitter.reset();
        self.sink.acquire(format)
    }

    /// Pushes one converted packet through gain, cross-fade and the jitter
    /// buffer, writing whatever is ready to the device.
    pub fn process(&mut self, samples: Vec<i16>, gain: f32) -> Result<()> {
        // ---
        let smoothed = self.declicker.process(samples, gain);
        self.jitter.push(smoothed);

        while let Some(packet) = self.jitter.get_next() {
            if !self.sink.is_playing() {
                self.begin_playout()?;
            }
            self.sink.write(&packet)?;
        }

        Ok(())
    }

    fn begin_playout(&mut self) -> Result<()> {
        // ---
        self.sink.start()?;

        if self.calibration_tone && !self.tone_played {
            if let Some(format) = self.sink.format() {
                self.sink.write(&calibration_tone(&format))?;
                info!("Calibration tone played");
            }
            self.tone_played = true;
        }

        Ok(())
    }

    /// Releases the device and forgets all per-session state.
    pub fn reset_session(&mut self) {
        // ---
        self.sink.release();
        self.declicker.reset();
        self.jitter.reset();
        self.tone_played = false;
    }

    pub fn jitter_status(&self) -> JitterBufferStatus {
        // ---
        self.jitter.status()
    }

    pub fn sink(&self) -> &SinkHandle<B> {
        // ---
        &self.sink
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::audio::{MemoryBackend, SinkEvent, SinkPhase};

    const FORMAT: AudioFormat = AudioFormat {
        sample_rate: 48000,
        channels: 2,
        bits_per_sample: 32,
    };

    fn pipeline(threshold: usize, tone: bool) -> (PlaybackPipeline<MemoryBackend>, MemoryBackend) {
        let backend = MemoryBackend::new();
        let config = PlaybackConfig {
            jitter: JitterBufferConfig {
                threshold_packets: threshold,
                max_packets: 64,
            },
            fade_len: 0,
            calibration_tone: tone,
        };
        (PlaybackPipeline::new(backend.clone(), config), backend)
    }

    #[test]
    fn test_threshold_release_order() {
        // ---
        let (mut playback, backend) = pipeline(3, false);
        playback.configure(&FORMAT).unwrap();

        playback.process(vec![1; 8], 1.0).unwrap();
        playback.process(vec![2; 8], 1.0).unwrap();
        assert!(backend.writes().is_empty());

        playback.process(vec![3; 8], 1.0).unwrap();
        assert_eq!(backend.writes(), vec![vec![1; 8], vec![2; 8], vec![3; 8]]);

        playback.process(vec![4; 8], 1.0).unwrap();
        assert_eq!(backend.writes().len(), 4);
        assert_eq!(backend.writes()[3], vec![4; 8]);
    }

    #[test]
    fn test_tone_once_per_session() {
        // ---
        let (mut playback, backend) = pipeline(1, true);
        playback.configure(&FORMAT).unwrap();
        playback.process(vec![5; 8], 1.0).unwrap();

        let events = backend.events();
        assert_eq!(events[1], SinkEvent::Started);
        assert_eq!(events[2], SinkEvent::Wrote(calibration_tone(&FORMAT)));
        assert_eq!(events[3], SinkEvent::Wrote(vec![5; 8]));

        // A format change restarts the device but not the tone
        backend.clear_events();
        playback.configure(&FORMAT).unwrap();
        playback.process(vec![6; 8], 1.0).unwrap();
        assert_eq!(backend.writes(), vec![vec![6; 8]]);

        // A new session re-arms it
        playback.reset_session();
        backend.clear_events();
        playback.configure(&FORMAT).unwrap();
        playback.process(vec![7; 8], 1.0).unwrap();
        assert_eq!(backend.writes().len(), 2);
    }

    #[test]
    fn test_format_change_reprimes() {
        // ---
        let (mut playback, backend) = pipeline(2, false);
        playback.configure(&FORMAT).unwrap();
        playback.process(vec![1; 4], 1.0).unwrap();

        playback.configure(&AudioFormat::new(16000, 1, 32)).unwrap();
        assert_eq!(playback.jitter_status().buffered_packets, 0);

        playback.process(vec![2; 4], 1.0).unwrap();
        assert!(backend.writes().is_empty());
        playback.process(vec![3; 4], 1.0).unwrap();
        assert_eq!(backend.writes(), vec![vec![2; 4], vec![3; 4]]);
    }

    #[test]
    fn test_gain_applies_to_next_packet() {
        // ---
        let (mut playback, backend) = pipeline(1, false);
        playback.configure(&FORMAT).unwrap();

        playback.process(vec![100; 4], 2.0).unwrap();
        playback.process(vec![100; 4], 0.5).unwrap();
        assert_eq!(backend.writes(), vec![vec![200; 4], vec![50; 4]]);
    }

    #[test]
    fn test_reset_releases_device() {
        // ---
        let (mut playback, backend) = pipeline(1, false);
        playback.configure(&FORMAT).unwrap();
        assert_eq!(backend.live_devices(), 1);

        playback.reset_session();
        playback.reset_session();
        assert_eq!(backend.live_devices(), 0);
        assert_eq!(playback.sink().phase(), SinkPhase::Released);
    }
}
