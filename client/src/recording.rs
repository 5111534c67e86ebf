//! Recording: encode converted PCM and mux it into a file.
//!
//! A [`RecordingSession`] owns one encoder and one muxer and is driven
//! synchronously. The [`Recorder`] runs a session on its own thread behind a
//! bounded queue so that encoding never holds up the ingest path.

use audiopirate_common::{AudioFormat, MetricsContext};
use chrono::{DateTime, Local};
use prometheus::Histogram;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::codec::{AudioEncoder, EncoderOutput, OpusEncoder};
use crate::error::RecordingError;
use crate::mux::{ContainerMuxer, OggOpusMuxer};

/// Interval between output polls while draining at stop.
pub const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// File extension for recordings.
pub const RECORDING_EXTENSION: &str = "opus";

/// Recording configuration.
#[derive(Debug, Clone)]
pub struct RecordingConfig {
    // ---
    /// Where recordings go when no explicit path is given
    pub recordings_dir: PathBuf,

    /// Upper bound on draining the encoder at stop
    pub drain_timeout: Duration,

    /// PCM chunks the recorder queue holds before dropping
    pub queue_depth: usize,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        // ---
        Self {
            recordings_dir: PathBuf::from("recordings"),
            drain_timeout: Duration::from_secs(2),
            queue_depth: 64,
        }
    }
}

/// What a finished recording contains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingSummary {
    pub path: PathBuf,
    pub frames_encoded: u64,
    pub packets_written: u64,
    pub duration: Duration,
}

/// `<dir>/recording_<YYYY-mm-dd_HH-MM-SS>.opus`
pub fn default_recording_path(dir: &Path, now: DateTime<Local>) -> PathBuf {
    // ---
    dir.join(format!(
        "recording_{}.{}",
        now.format("%Y-%m-%d_%H-%M-%S"),
        RECORDING_EXTENSION
    ))
}

/// Path for the `index`-th continuation of `base`: `name-partN.ext`.
pub fn segment_path(base: &Path, index: u32) -> PathBuf {
    // ---
    let stem = base
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "recording".to_string());
    let name = match base.extension() {
        Some(ext) => format!("{stem}-part{index}.{}", ext.to_string_lossy()),
        None => format!("{stem}-part{index}"),
    };
    base.with_file_name(name)
}

/// One encoder/muxer pair writing one file.
pub struct RecordingSession<E: AudioEncoder, M: ContainerMuxer> {
    // ---
    path: PathBuf,
    format: AudioFormat,
    encoder: E,
    muxer: M,
    track_index: Option<usize>,
    started: bool,
    total_frames_encoded: u64,
    packets_written: u64,
}

impl<E: AudioEncoder, M: ContainerMuxer> RecordingSession<E, M> {
    // ---
    pub fn new(path: PathBuf, format: AudioFormat, encoder: E, muxer: M) -> Self {
        // ---
        Self {
            path,
            format,
            encoder,
            muxer,
            track_index: None,
            started: false,
            total_frames_encoded: 0,
            packets_written: 0,
        }
    }

    /// Feeds interleaved samples to the encoder and muxes whatever comes out.
    ///
    /// Each chunk is stamped with the frames submitted before it, so the
    /// first chunk is at 0us.
    pub fn encode(&mut self, samples: &[i16]) -> Result<(), RecordingError> {
        // ---
        let channels = self.format.channels.max(1) as usize;
        let mut remaining = samples;

        while !remaining.is_empty() {
            let capacity = self.encoder.input_capacity();
            if capacity == 0 {
                self.drain_output()?;
                if self.encoder.input_capacity() == 0 {
                    return Err(RecordingError::Encoder("encoder input is stalled".into()));
                }
                continue;
            }

            let (chunk, rest) = remaining.split_at(remaining.len().min(capacity));
            let pts_us = self.total_frames_encoded * 1_000_000 / self.format.sample_rate as u64;
            self.encoder.queue_input(chunk, pts_us)?;
            self.total_frames_encoded += (chunk.len() / channels) as u64;
            remaining = rest;
        }

        self.drain_output()?;
        Ok(())
    }

    /// Moves all available encoder output into the muxer.
    ///
    /// Returns `true` once the encoder reports end of stream.
    fn drain_output(&mut self) -> Result<bool, RecordingError> {
        // ---
        loop {
            match self.encoder.poll_output()? {
                EncoderOutput::FormatChanged(format) => {
                    if self.track_index.is_some() {
                        return Err(RecordingError::Muxer(
                            "encoder changed format mid-stream".into(),
                        ));
                    }
                    let track = self.muxer.add_track(&format)?;
                    self.muxer.start()?;
                    self.track_index = Some(track);
                    self.started = true;
                    debug!(
                        "Muxer started with track {} ({} Hz, {} ch)",
                        track, format.sample_rate, format.channels
                    );
                }
                EncoderOutput::Packet(packet) => match self.track_index {
                    Some(track) if self.started => {
                        self.muxer.write_sample(track, &packet)?;
                        self.packets_written += 1;
                    }
                    _ => warn!("Dropping encoded packet produced before the output format"),
                },
                EncoderOutput::TryAgain => return Ok(false),
                EncoderOutput::EndOfStream => return Ok(true),
            }
        }
    }

    /// Signals end of input, drains within `drain_timeout`, and closes the file.
    ///
    /// The muxer is finished even when draining fails, so no handle leaks.
    pub fn finish(mut self, drain_timeout: Duration) -> Result<RecordingSummary, RecordingError> {
        // ---
        let drained = self.drain_to_end(drain_timeout);
        let finished = self.muxer.finish();
        drained?;
        finished?;

        let summary = RecordingSummary {
            duration: Duration::from_micros(
                self.total_frames_encoded * 1_000_000 / self.format.sample_rate as u64,
            ),
            path: self.path,
            frames_encoded: self.total_frames_encoded,
            packets_written: self.packets_written,
        };
        Ok(summary)
    }

    /// Closes the output after a failure, keeping whatever was already muxed.
    pub fn abort(mut self) {
        // ---
        if let Err(e) = self.muxer.finish() {
            debug!("Muxer finish after failure: {}", e);
        }
    }

    fn drain_to_end(&mut self, drain_timeout: Duration) -> Result<(), RecordingError> {
        // ---
        self.encoder.signal_end_of_input()?;

        let deadline = Instant::now() + drain_timeout;
        loop {
            if self.drain_output()? {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(RecordingError::DrainTimeout(drain_timeout));
            }
            thread::sleep(DRAIN_POLL_INTERVAL);
        }
    }
}

/// Opens the recorder for each new recording file.
///
/// The engine calls this at `start_recording` and again for every segment
/// after a format change.
pub trait RecorderFactory: Send + Sync {
    fn start(
        &self,
        path: PathBuf,
        format: &AudioFormat,
        config: &RecordingConfig,
        metrics: MetricsContext,
    ) -> Result<Recorder, RecordingError>;
}

/// Ogg Opus files through [`Recorder::start`].
#[derive(Debug, Clone, Copy, Default)]
pub struct OggOpusRecorder;

impl RecorderFactory for OggOpusRecorder {
    fn start(
        &self,
        path: PathBuf,
        format: &AudioFormat,
        config: &RecordingConfig,
        metrics: MetricsContext,
    ) -> Result<Recorder, RecordingError> {
        // ---
        Recorder::start(path, format, config, metrics)
    }
}

enum RecorderCommand {
    Samples(Vec<i16>),
    Finish,
}

/// A recording session running on the `recorder` thread.
///
/// The engine owns the recorder exclusively. Once [`Recorder::stop`] is
/// called the recorder is consumed, so no chunk can follow the stop request.
pub struct Recorder {
    // ---
    path: PathBuf,
    tx: SyncSender<RecorderCommand>,
    worker: JoinHandle<Result<RecordingSummary, RecordingError>>,
    metrics: MetricsContext,
}

impl Recorder {
    // ---
    /// Starts an Opus/Ogg recording of `format` into `path`.
    ///
    /// # Errors
    ///
    /// Returns error if the format cannot be encoded or the file cannot be
    /// created.
    pub fn start(
        path: PathBuf,
        format: &AudioFormat,
        config: &RecordingConfig,
        metrics: MetricsContext,
    ) -> Result<Self, RecordingError> {
        // ---
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let encoder = OpusEncoder::new(format)?;
        let muxer = OggOpusMuxer::create(&path)?;
        info!("Recording {} to {}", format, path.display());

        Self::spawn(
            RecordingSession::new(path, *format, encoder, muxer),
            config,
            metrics,
        )
    }

    /// Runs an already-built session on a new recorder thread.
    pub fn spawn<E, M>(
        session: RecordingSession<E, M>,
        config: &RecordingConfig,
        metrics: MetricsContext,
    ) -> Result<Self, RecordingError>
    where
        E: AudioEncoder + 'static,
        M: ContainerMuxer + 'static,
    {
        // ---
        let path = session.path.clone();
        let (tx, rx) = mpsc::sync_channel(config.queue_depth.max(1));
        let drain_timeout = config.drain_timeout;
        let encode_seconds = metrics.encode_seconds.clone();

        let worker = thread::Builder::new()
            .name("recorder".into())
            .spawn(move || run_worker(session, rx, drain_timeout, encode_seconds))?;

        Ok(Self {
            path,
            tx,
            worker,
            metrics,
        })
    }

    /// Hands a chunk to the recorder without blocking.
    ///
    /// A full queue drops the chunk. An error means the worker has exited
    /// and the recording must be stopped.
    pub fn submit(&self, samples: Vec<i16>) -> Result<(), RecordingError> {
        // ---
        match self.tx.try_send(RecorderCommand::Samples(samples)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!("Recorder queue full, dropping chunk");
                self.metrics.recording_chunks_dropped_total.inc();
                Ok(())
            }
            Err(TrySendError::Disconnected(_)) => Err(RecordingError::WorkerGone),
        }
    }

    /// Whether the worker exited on its own, which only happens on failure.
    pub fn has_failed(&self) -> bool {
        // ---
        self.worker.is_finished()
    }

    pub fn path(&self) -> &Path {
        // ---
        &self.path
    }

    /// Drains, finalizes and joins. Blocks for at most the drain timeout
    /// plus the time to encode what is still queued.
    pub fn stop(self) -> Result<RecordingSummary, RecordingError> {
        // ---
        let Recorder { tx, worker, .. } = self;

        // Fails only if the worker already exited; join reports why
        let _ = tx.send(RecorderCommand::Finish);
        drop(tx);

        match worker.join() {
            Ok(result) => result,
            Err(_) => Err(RecordingError::WorkerGone),
        }
    }
}

fn run_worker<E: AudioEncoder, M: ContainerMuxer>(
    mut session: RecordingSession<E, M>,
    rx: Receiver<RecorderCommand>,
    drain_timeout: Duration,
    encode_seconds: Histogram,
) -> Result<RecordingSummary, RecordingError> {
    // ---
    for command in rx.iter() {
        match command {
            RecorderCommand::Samples(samples) => {
                let _timer = encode_seconds.start_timer();
                if let Err(e) = session.encode(&samples) {
                    error!("Recording failed: {}", e);
                    session.abort();
                    return Err(e);
                }
            }
            RecorderCommand::Finish => break,
        }
    }

    let summary = session.finish(drain_timeout)?;
    info!(
        "Recording saved: {} ({} packets, {:.1}s)",
        summary.path.display(),
        summary.packets_written,
        summary.duration.as_secs_f64()
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::codec::{EncodedPacket, TrackFormat};
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::Arc;

    /// Emits one packet per `frame_len` samples, echoing the chunk's pts.
    struct FakeEncoder {
        frame_len: usize,
        staged: usize,
        staged_pts: u64,
        out: VecDeque<EncoderOutput>,
        reported: bool,
        eos: bool,
        /// When set, end of input never completes
        hang_at_eos: bool,
        queued_pts: Arc<Mutex<Vec<u64>>>,
    }

    impl FakeEncoder {
        fn new(frame_len: usize) -> Self {
            Self {
                frame_len,
                staged: 0,
                staged_pts: 0,
                out: VecDeque::new(),
                reported: false,
                eos: false,
                hang_at_eos: false,
                queued_pts: Arc::default(),
            }
        }

        fn emit(&mut self) {
            if !self.reported {
                self.out.push_back(EncoderOutput::FormatChanged(TrackFormat {
                    sample_rate: 48000,
                    input_sample_rate: 48000,
                    channels: 2,
                    pre_skip: 312,
                }));
                self.reported = true;
            }
            self.out.push_back(EncoderOutput::Packet(EncodedPacket {
                data: vec![0xAB; 3],
                pts_us: self.staged_pts,
                frames: (self.staged / 2) as u32,
            }));
            self.staged = 0;
        }
    }

    impl AudioEncoder for FakeEncoder {
        fn input_capacity(&self) -> usize {
            if self.eos {
                0
            } else {
                self.frame_len - self.staged
            }
        }

        fn queue_input(&mut self, samples: &[i16], pts_us: u64) -> Result<(), RecordingError> {
            self.queued_pts.lock().push(pts_us);
            if self.staged == 0 {
                self.staged_pts = pts_us;
            }
            self.staged += samples.len();
            if self.staged == self.frame_len {
                self.emit();
            }
            Ok(())
        }

        fn signal_end_of_input(&mut self) -> Result<(), RecordingError> {
            if self.staged > 0 {
                self.emit();
            }
            self.eos = true;
            if !self.hang_at_eos {
                self.out.push_back(EncoderOutput::EndOfStream);
            }
            Ok(())
        }

        fn poll_output(&mut self) -> Result<EncoderOutput, RecordingError> {
            Ok(self.out.pop_front().unwrap_or(EncoderOutput::TryAgain))
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    enum MuxCall {
        AddTrack,
        Start,
        Write(u64),
        Finish,
    }

    #[derive(Clone, Default)]
    struct FakeMuxer {
        calls: Arc<Mutex<Vec<MuxCall>>>,
        fail_writes: bool,
    }

    impl ContainerMuxer for FakeMuxer {
        fn add_track(&mut self, _format: &TrackFormat) -> Result<usize, RecordingError> {
            self.calls.lock().push(MuxCall::AddTrack);
            Ok(0)
        }

        fn start(&mut self) -> Result<(), RecordingError> {
            self.calls.lock().push(MuxCall::Start);
            Ok(())
        }

        fn write_sample(
            &mut self,
            _track: usize,
            packet: &EncodedPacket,
        ) -> Result<(), RecordingError> {
            if self.fail_writes {
                return Err(RecordingError::Muxer("disk full".into()));
            }
            self.calls.lock().push(MuxCall::Write(packet.pts_us));
            Ok(())
        }

        fn finish(&mut self) -> Result<(), RecordingError> {
            let mut calls = self.calls.lock();
            let started = calls.contains(&MuxCall::Start);
            calls.push(MuxCall::Finish);
            if started {
                Ok(())
            } else {
                Err(RecordingError::NothingRecorded)
            }
        }
    }

    fn stereo_48k() -> AudioFormat {
        AudioFormat::new(48000, 2, 32)
    }

    #[test]
    fn test_pts_counts_frames_already_submitted() {
        // ---
        let encoder = FakeEncoder::new(1920);
        let queued = encoder.queued_pts.clone();
        let mut session =
            RecordingSession::new("x.opus".into(), stereo_48k(), encoder, FakeMuxer::default());

        // 800 samples = 400 stereo frames per chunk
        for _ in 0..3 {
            session.encode(&[0i16; 800]).unwrap();
        }

        // Chunk boundaries follow the encoder's capacity: 800, 800, 320 | 480
        assert_eq!(*queued.lock(), vec![0, 8333, 16666, 20000]);
        let summary = session.finish(Duration::from_millis(100)).unwrap();
        assert_eq!(summary.frames_encoded, 1200);
        assert_eq!(summary.duration, Duration::from_millis(25));
    }

    #[test]
    fn test_no_write_before_track_added() {
        // ---
        let muxer = FakeMuxer::default();
        let calls = muxer.calls.clone();
        let mut session =
            RecordingSession::new("x.opus".into(), stereo_48k(), FakeEncoder::new(4), muxer);

        session.encode(&[0i16; 2]).unwrap();
        assert!(calls.lock().is_empty());

        session.encode(&[0i16; 10]).unwrap();
        let summary = session.finish(Duration::from_millis(100)).unwrap();

        let calls = calls.lock().clone();
        assert_eq!(&calls[..2], &[MuxCall::AddTrack, MuxCall::Start]);
        assert_eq!(calls.last(), Some(&MuxCall::Finish));
        assert_eq!(summary.packets_written, 3);
        assert_eq!(summary.frames_encoded, 6);
    }

    #[test]
    fn test_stop_without_audio_reports_error() {
        // ---
        let muxer = FakeMuxer::default();
        let calls = muxer.calls.clone();
        let session =
            RecordingSession::new("x.opus".into(), stereo_48k(), FakeEncoder::new(4), muxer);

        let result = session.finish(Duration::from_millis(50));
        assert!(matches!(result, Err(RecordingError::NothingRecorded)));
        assert_eq!(*calls.lock(), vec![MuxCall::Finish]);
    }

    #[test]
    fn test_drain_timeout_still_releases_muxer() {
        // ---
        let mut encoder = FakeEncoder::new(4);
        encoder.hang_at_eos = true;
        let muxer = FakeMuxer::default();
        let calls = muxer.calls.clone();
        let mut session = RecordingSession::new("x.opus".into(), stereo_48k(), encoder, muxer);
        session.encode(&[0i16; 4]).unwrap();

        let result = session.finish(Duration::from_millis(30));
        assert!(matches!(result, Err(RecordingError::DrainTimeout(_))));
        assert_eq!(calls.lock().last(), Some(&MuxCall::Finish));
    }

    #[test]
    fn test_recorder_thread_round_trip() {
        // ---
        let muxer = FakeMuxer::default();
        let calls = muxer.calls.clone();
        let session =
            RecordingSession::new("x.opus".into(), stereo_48k(), FakeEncoder::new(8), muxer);
        let metrics = MetricsContext::new("test").unwrap();
        let recorder = Recorder::spawn(session, &RecordingConfig::default(), metrics).unwrap();

        for _ in 0..4 {
            recorder.submit(vec![1i16; 8]).unwrap();
        }
        let summary = recorder.stop().unwrap();

        assert_eq!(summary.packets_written, 4);
        assert_eq!(summary.frames_encoded, 16);
        assert_eq!(calls.lock().iter().filter(|c| matches!(c, MuxCall::Write(_))).count(), 4);
    }

    #[test]
    fn test_recorder_failure_is_reported() {
        // ---
        let muxer = FakeMuxer {
            fail_writes: true,
            ..FakeMuxer::default()
        };
        let session =
            RecordingSession::new("x.opus".into(), stereo_48k(), FakeEncoder::new(4), muxer);
        let metrics = MetricsContext::new("test").unwrap();
        let recorder = Recorder::spawn(session, &RecordingConfig::default(), metrics).unwrap();

        recorder.submit(vec![0i16; 4]).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !recorder.has_failed() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(recorder.has_failed());
        assert!(matches!(recorder.submit(vec![0i16; 4]), Err(RecordingError::WorkerGone)));
        assert!(matches!(recorder.stop(), Err(RecordingError::Muxer(_))));
    }

    #[test]
    fn test_paths() {
        // ---
        let now = chrono::TimeZone::with_ymd_and_hms(&Local, 2024, 3, 9, 7, 5, 1).unwrap();
        assert_eq!(
            default_recording_path(Path::new("rec"), now),
            PathBuf::from("rec/recording_2024-03-09_07-05-01.opus")
        );
        assert_eq!(
            segment_path(Path::new("rec/take.opus"), 2),
            PathBuf::from("rec/take-part2.opus")
        );
    }
}
