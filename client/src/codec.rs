//! Opus encoding for recordings.
//!
//! The encoder is driven through [`AudioEncoder`], a small queue-style
//! interface: callers feed input up to the advertised capacity, then poll for
//! output. The output format is only reported once the encoder has produced
//! its first packet, so a muxer must not be started before then.
//!
//! Opus runs at 8, 12, 16, 24 or 48kHz. Streams at any other rate are
//! resampled to 48kHz before encoding.

use audiopirate_common::AudioFormat;
use opus::{Application, Bitrate, Channels, Encoder};
use std::collections::VecDeque;

use crate::error::RecordingError;
use crate::resample::LinearResampler;

/// Target bitrate in bits per second
pub const BITRATE: i32 = 128_000;

/// Frame duration in milliseconds
pub const FRAME_DURATION_MS: u32 = 20;

/// Encoder lookahead at 48kHz, written to the container as pre-skip
pub const PRE_SKIP_48K: u16 = 312;

/// Sample rates the Opus encoder runs at natively
pub const SUPPORTED_SAMPLE_RATES: [u32; 5] = [8000, 12000, 16000, 24000, 48000];

/// Rate other inputs are converted to
pub const RESAMPLE_TARGET_RATE: u32 = 48_000;

/// Largest Opus packet we ask the encoder to produce.
const MAX_PACKET_BYTES: usize = 4000;

/// Output track parameters, known once the encoder has started producing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackFormat {
    /// Rate the packets were encoded at
    pub sample_rate: u32,

    /// Rate of the audio before encoding
    pub input_sample_rate: u32,

    pub channels: u16,

    /// Samples at 48kHz a decoder should discard at stream start
    pub pre_skip: u16,
}

/// One compressed packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedPacket {
    pub data: Vec<u8>,

    /// Presentation timestamp of the first frame, in microseconds
    pub pts_us: u64,

    /// Real (non-padding) frames per channel this packet carries, at the
    /// track's encoding rate
    pub frames: u32,
}

/// Result of polling an encoder for output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncoderOutput {
    /// The output format is final; reported exactly once, before any packet
    FormatChanged(TrackFormat),
    Packet(EncodedPacket),
    /// Nothing available right now
    TryAgain,
    /// All input up to end-of-input has been emitted
    EndOfStream,
}

/// Queue-style audio encoder.
pub trait AudioEncoder: Send {
    /// Interleaved samples `queue_input` will accept right now.
    fn input_capacity(&self) -> usize;

    /// Queues at most `input_capacity()` interleaved samples stamped `pts_us`.
    fn queue_input(&mut self, samples: &[i16], pts_us: u64) -> Result<(), RecordingError>;

    /// Marks end of input; pending samples are flushed.
    fn signal_end_of_input(&mut self) -> Result<(), RecordingError>;

    /// Takes the next available output without blocking.
    fn poll_output(&mut self) -> Result<EncoderOutput, RecordingError>;
}

/// Opus encoder producing 20ms packets.
///
/// Input is staged until a full frame is available. On end of input a
/// trailing partial frame is zero-padded, but the packet reports only the
/// frames that were really submitted.
pub struct OpusEncoder {
    // ---
    encoder: Encoder,
    format: AudioFormat,
    encode_rate: u32,

    /// Present when `format.sample_rate` is not an Opus rate
    resampler: Option<LinearResampler>,

    /// Interleaved samples per 20ms frame at the encoding rate
    frame_len: usize,

    /// Interleaved input samples per 20ms at the source rate
    input_frame_len: usize,

    staging: Vec<i16>,
    staging_pts: Option<u64>,

    output: VecDeque<EncoderOutput>,
    format_reported: bool,
    end_of_input: bool,
}

impl OpusEncoder {
    // ---
    /// Creates an encoder for `format` at [`BITRATE`].
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - The sample rate is zero
    /// - The channel count is not 1 or 2
    /// - Opus encoder initialization fails
    pub fn new(format: &AudioFormat) -> Result<Self, RecordingError> {
        // ---
        if format.sample_rate == 0 {
            return Err(RecordingError::UnsupportedFormat("0 Hz audio".into()));
        }

        let channels = match format.channels {
            1 => Channels::Mono,
            2 => Channels::Stereo,
            n => {
                return Err(RecordingError::UnsupportedFormat(format!(
                    "{n}-channel audio"
                )))
            }
        };

        let (encode_rate, resampler) = if SUPPORTED_SAMPLE_RATES.contains(&format.sample_rate) {
            (format.sample_rate, None)
        } else {
            let resampler =
                LinearResampler::new(format.sample_rate, RESAMPLE_TARGET_RATE, format.channels);
            (resampler.output_rate(), Some(resampler))
        };

        let mut encoder = Encoder::new(encode_rate, channels, Application::Audio)?;
        encoder.set_bitrate(Bitrate::Bits(BITRATE))?;

        let per_frame = |rate: u32| {
            ((rate * FRAME_DURATION_MS / 1000) as usize).max(1) * format.channels as usize
        };
        let frame_len = per_frame(encode_rate);

        Ok(Self {
            encoder,
            format: *format,
            encode_rate,
            resampler,
            frame_len,
            input_frame_len: per_frame(format.sample_rate),
            staging: Vec::with_capacity(frame_len * 2),
            staging_pts: None,
            output: VecDeque::new(),
            format_reported: false,
            end_of_input: false,
        })
    }

    /// Encodes the first frame in staging, zero-padding a short one.
    fn encode_frame(&mut self) -> Result<(), RecordingError> {
        // ---
        let channels = self.format.channels as usize;
        let take = self.staging.len().min(self.frame_len);
        let real_frames = (take / channels) as u32;

        let mut pcm: Vec<i16> = self.staging.drain(..take).collect();
        pcm.resize(self.frame_len, 0);

        let mut data = vec![0u8; MAX_PACKET_BYTES];
        let len = self.encoder.encode(&pcm, &mut data)?;
        data.truncate(len);

        if !self.format_reported {
            self.output.push_back(EncoderOutput::FormatChanged(TrackFormat {
                sample_rate: self.encode_rate,
                input_sample_rate: self.format.sample_rate,
                channels: self.format.channels,
                pre_skip: PRE_SKIP_48K,
            }));
            self.format_reported = true;
        }

        let pts_us = self.staging_pts.take().unwrap_or(0);
        if !self.staging.is_empty() {
            self.staging_pts = Some(pts_us + FRAME_DURATION_MS as u64 * 1000);
        }
        self.output.push_back(EncoderOutput::Packet(EncodedPacket {
            data,
            pts_us,
            frames: real_frames,
        }));

        Ok(())
    }

    fn encode_full_frames(&mut self) -> Result<(), RecordingError> {
        // ---
        while self.staging.len() >= self.frame_len {
            self.encode_frame()?;
        }
        Ok(())
    }
}

impl AudioEncoder for OpusEncoder {
    fn input_capacity(&self) -> usize {
        // ---
        if self.end_of_input {
            0
        } else if self.resampler.is_some() {
            // Staging may overshoot one frame; it is encoded in the same call
            self.input_frame_len
        } else {
            self.frame_len - self.staging.len()
        }
    }

    fn queue_input(&mut self, samples: &[i16], pts_us: u64) -> Result<(), RecordingError> {
        // ---
        if self.end_of_input {
            return Err(RecordingError::Encoder("input after end of stream".into()));
        }
        if samples.len() > self.input_capacity() {
            return Err(RecordingError::Encoder(format!(
                "queued {} samples with only {} free",
                samples.len(),
                self.input_capacity()
            )));
        }

        if self.staging.is_empty() {
            self.staging_pts = Some(pts_us);
        }
        match self.resampler.as_mut() {
            Some(resampler) => resampler.process(samples, &mut self.staging),
            None => self.staging.extend_from_slice(samples),
        }

        self.encode_full_frames()
    }

    fn signal_end_of_input(&mut self) -> Result<(), RecordingError> {
        // ---
        if self.end_of_input {
            return Ok(());
        }
        if let Some(resampler) = self.resampler.as_mut() {
            resampler.flush(&mut self.staging);
        }
        self.encode_full_frames()?;
        if !self.staging.is_empty() {
            self.encode_frame()?;
        }
        self.end_of_input = true;
        self.output.push_back(EncoderOutput::EndOfStream);
        Ok(())
    }

    fn poll_output(&mut self) -> Result<EncoderOutput, RecordingError> {
        // ---
        Ok(match self.output.pop_front() {
            Some(output) => output,
            None if self.end_of_input => EncoderOutput::EndOfStream,
            None => EncoderOutput::TryAgain,
        })
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn stereo_48k() -> AudioFormat {
        AudioFormat::new(48000, 2, 32)
    }

    #[test]
    fn test_encoder_creation() {
        // ---
        let encoder = OpusEncoder::new(&stereo_48k()).expect("encoder creation failed");
        assert_eq!(encoder.input_capacity(), 960 * 2);
        assert!(encoder.resampler.is_none());
    }

    #[test]
    fn test_unencodable_formats_rejected() {
        // ---
        for format in [AudioFormat::new(0, 2, 32), AudioFormat::new(48000, 3, 32)] {
            let result = OpusEncoder::new(&format);
            assert!(matches!(result, Err(RecordingError::UnsupportedFormat(_))));
        }
    }

    #[test]
    fn test_cd_rate_is_resampled_to_48k() {
        // ---
        let mut encoder = OpusEncoder::new(&AudioFormat::new(44100, 2, 32)).unwrap();
        // 20ms of 44.1kHz stereo
        assert_eq!(encoder.input_capacity(), 882 * 2);

        // 40ms in, the second 20ms frame is still waiting on the next input frame
        encoder.queue_input(&vec![500i16; 1764], 0).unwrap();
        encoder.queue_input(&vec![500i16; 1764], 20_000).unwrap();
        assert_eq!(
            encoder.poll_output().unwrap(),
            EncoderOutput::FormatChanged(TrackFormat {
                sample_rate: 48000,
                input_sample_rate: 44100,
                channels: 2,
                pre_skip: PRE_SKIP_48K,
            })
        );
        assert!(matches!(encoder.poll_output().unwrap(), EncoderOutput::Packet(_)));
        assert_eq!(encoder.poll_output().unwrap(), EncoderOutput::TryAgain);

        encoder.signal_end_of_input().unwrap();
        let mut frames = 960;
        while let EncoderOutput::Packet(packet) = encoder.poll_output().unwrap() {
            frames += packet.frames;
        }
        // 3528 samples = 1764 frames at 44.1kHz = 1920 frames at 48kHz
        assert_eq!(frames, 1920);
    }

    #[test]
    fn test_format_reported_before_first_packet() {
        // ---
        let mut encoder = OpusEncoder::new(&stereo_48k()).unwrap();
        assert_eq!(encoder.poll_output().unwrap(), EncoderOutput::TryAgain);

        encoder.queue_input(&vec![0i16; 1000], 0).unwrap();
        assert_eq!(encoder.input_capacity(), 920);
        assert_eq!(encoder.poll_output().unwrap(), EncoderOutput::TryAgain);

        encoder.queue_input(&vec![0i16; 920], 10_416).unwrap();
        assert_eq!(
            encoder.poll_output().unwrap(),
            EncoderOutput::FormatChanged(TrackFormat {
                sample_rate: 48000,
                input_sample_rate: 48000,
                channels: 2,
                pre_skip: PRE_SKIP_48K,
            })
        );
        match encoder.poll_output().unwrap() {
            EncoderOutput::Packet(packet) => {
                assert_eq!(packet.pts_us, 0);
                assert_eq!(packet.frames, 960);
                assert!(!packet.data.is_empty());
            }
            other => panic!("expected packet, got {other:?}"),
        }
        assert_eq!(encoder.poll_output().unwrap(), EncoderOutput::TryAgain);
    }

    #[test]
    fn test_partial_frame_flushed_at_end() {
        // ---
        let mut encoder = OpusEncoder::new(&AudioFormat::new(16000, 1, 32)).unwrap();
        encoder.queue_input(&vec![100i16; 120], 0).unwrap();
        encoder.signal_end_of_input().unwrap();

        assert!(matches!(
            encoder.poll_output().unwrap(),
            EncoderOutput::FormatChanged(_)
        ));
        match encoder.poll_output().unwrap() {
            EncoderOutput::Packet(packet) => assert_eq!(packet.frames, 120),
            other => panic!("expected packet, got {other:?}"),
        }
        assert_eq!(encoder.poll_output().unwrap(), EncoderOutput::EndOfStream);
        assert_eq!(encoder.input_capacity(), 0);
        assert!(encoder.queue_input(&[0], 0).is_err());
    }

    #[test]
    fn test_oversized_input_rejected() {
        // ---
        let mut encoder = OpusEncoder::new(&AudioFormat::new(8000, 1, 32)).unwrap();
        assert!(encoder.queue_input(&vec![0i16; 161], 0).is_err());
    }
}
