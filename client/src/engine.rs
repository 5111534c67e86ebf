//! The streaming engine.
//!
//! One task owns the socket, the playback pipeline and the recorder, and
//! processes every input in arrival order from a single `select!` loop:
//! caller commands, socket frames, the handshake deadline and the stats
//! tick. Callers talk to it through a cloneable [`EngineHandle`] and observe
//! it through a `watch` channel of [`EngineStatus`] snapshots.

use audiopirate_common::{AudioFormat, ClientMessage, MetricsContext, ServerMessage};
use chrono::Local;
use std::fmt;
use std::future;
use std::path::PathBuf;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::audio::OutputBackend;
use crate::config::EngineConfig;
use crate::convert::{check_frame_alignment, s32le_to_s16};
use crate::error::{EngineError, RecordingError};
use crate::network::{Frame, WsTransport};
use crate::playback::PlaybackPipeline;
use crate::recording::{
    default_recording_path, segment_path, OggOpusRecorder, Recorder, RecorderFactory,
    RecordingSummary,
};
use crate::telemetry::Telemetry;

/// Connection lifecycle as observers see it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected { format: AudioFormat },
    Error { message: String },
}

impl ConnectionState {
    // ---
    /// One-line status, e.g. `Connected: 48000Hz 2ch 32bit`.
    pub fn summary(&self) -> String {
        // ---
        match self {
            ConnectionState::Disconnected => "Disconnected".to_string(),
            ConnectionState::Connecting => "Connecting".to_string(),
            ConnectionState::Connected { format } => format!("Connected: {}", format.summary()),
            ConnectionState::Error { message } => format!("Error: {message}"),
        }
    }

    pub fn is_connected(&self) -> bool {
        // ---
        matches!(self, ConnectionState::Connected { .. })
    }

    pub fn format(&self) -> Option<AudioFormat> {
        // ---
        match self {
            ConnectionState::Connected { format } => Some(*format),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.summary())
    }
}

/// Everything an observer can see, published as one snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineStatus {
    pub connection: ConnectionState,
    pub telemetry: Telemetry,
    pub is_recording: bool,
    pub recording_path: Option<PathBuf>,
}

impl Default for EngineStatus {
    fn default() -> Self {
        // ---
        Self {
            connection: ConnectionState::Disconnected,
            telemetry: Telemetry::default(),
            is_recording: false,
            recording_path: None,
        }
    }
}

enum Command {
    Connect {
        url: String,
        password: String,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    SetGain {
        gain: f32,
        reply: oneshot::Sender<f32>,
    },
    StartRecording {
        path: Option<PathBuf>,
        reply: oneshot::Sender<Result<PathBuf, EngineError>>,
    },
    StopRecording {
        reply: oneshot::Sender<Result<Option<RecordingSummary>, EngineError>>,
    },
    SendMessage {
        text: String,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable front door to a running [`Engine`].
#[derive(Clone)]
pub struct EngineHandle {
    // ---
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<EngineStatus>,
}

impl EngineHandle {
    // ---
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, EngineError> {
        // ---
        let (reply, response) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| EngineError::EngineClosed)?;
        response.await.map_err(|_| EngineError::EngineClosed)
    }

    /// Starts a new connection attempt.
    ///
    /// Returns once the attempt is under way; progress is reported through
    /// [`EngineHandle::subscribe`].
    ///
    /// # Errors
    ///
    /// Returns `AlreadyConnected` while connecting or connected.
    pub async fn connect(
        &self,
        url: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<(), EngineError> {
        // ---
        let url = url.into();
        let password = password.into();
        self.request(|reply| Command::Connect {
            url,
            password,
            reply,
        })
        .await?
    }

    /// Tears the session down. Returns after the recording is finalized,
    /// the device is released and the socket is closed.
    pub async fn disconnect(&self) -> Result<(), EngineError> {
        // ---
        self.request(|reply| Command::Disconnect { reply }).await
    }

    /// Sets playback gain for subsequent packets. Returns the clamped value.
    pub async fn set_gain(&self, gain: f32) -> Result<f32, EngineError> {
        // ---
        self.request(|reply| Command::SetGain { gain, reply }).await
    }

    /// Starts recording the stream, to `path` or a timestamped default.
    ///
    /// # Errors
    ///
    /// Returns error if not connected, already recording, or the recording
    /// cannot be created.
    pub async fn start_recording(&self, path: Option<PathBuf>) -> Result<PathBuf, EngineError> {
        // ---
        self.request(|reply| Command::StartRecording { path, reply })
            .await?
    }

    /// Stops the recording. `None` when nothing was being recorded.
    pub async fn stop_recording(&self) -> Result<Option<RecordingSummary>, EngineError> {
        // ---
        self.request(|reply| Command::StopRecording { reply }).await?
    }

    /// Sends a raw text frame to the server.
    pub async fn send_message(&self, text: impl Into<String>) -> Result<(), EngineError> {
        // ---
        let text = text.into();
        self.request(|reply| Command::SendMessage { text, reply })
            .await?
    }

    /// Disconnects and stops the engine task.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        // ---
        self.request(|reply| Command::Shutdown { reply }).await
    }

    /// Latest published snapshot.
    pub fn status(&self) -> EngineStatus {
        // ---
        self.status.borrow().clone()
    }

    /// A receiver notified on every status change.
    pub fn subscribe(&self) -> watch::Receiver<EngineStatus> {
        // ---
        self.status.clone()
    }

    /// Waits until a published snapshot satisfies `predicate`.
    pub async fn wait_for(
        &self,
        mut predicate: impl FnMut(&EngineStatus) -> bool,
    ) -> Result<EngineStatus, EngineError> {
        // ---
        let mut status = self.status.clone();
        let snapshot = status
            .wait_for(|s| predicate(s))
            .await
            .map_err(|_| EngineError::EngineClosed)?;
        Ok(snapshot.clone())
    }
}

/// Per-attempt state that only exists between connect and teardown.
struct Session {
    password: String,
    token: Option<String>,
    format: Option<AudioFormat>,
}

/// Recording bookkeeping across format-change segments.
struct ActiveRecording {
    recorder: Recorder,
    base_path: PathBuf,
    segment: u32,
}

enum Event {
    Command(Option<Command>),
    Opened(Result<WsTransport, EngineError>),
    Frame(Result<Frame, EngineError>),
    HandshakeExpired,
    StatsTick,
}

/// The engine task. Build with [`Engine::new`] and drive with [`Engine::run`].
pub struct Engine<B: OutputBackend> {
    // ---
    config: EngineConfig,
    metrics: MetricsContext,
    commands: mpsc::Receiver<Command>,
    status_tx: watch::Sender<EngineStatus>,

    playback: PlaybackPipeline<B>,
    recorders: Box<dyn RecorderFactory>,
    transport: Option<WsTransport>,
    pending_open: Option<JoinHandle<Result<WsTransport, EngineError>>>,
    handshake_deadline: Option<Instant>,
    session: Option<Session>,
    recording: Option<ActiveRecording>,

    connection: ConnectionState,
    telemetry: Telemetry,
}

impl<B: OutputBackend + 'static> Engine<B> {
    // ---
    pub fn new(config: EngineConfig, backend: B, metrics: MetricsContext) -> (Self, EngineHandle) {
        // ---
        let (commands_tx, commands) = mpsc::channel(config.command_queue.max(1));
        let (status_tx, status) = watch::channel(EngineStatus::default());

        let engine = Self {
            playback: PlaybackPipeline::new(backend, config.playback.clone()),
            recorders: Box::new(OggOpusRecorder),
            config,
            metrics,
            commands,
            status_tx,
            transport: None,
            pending_open: None,
            handshake_deadline: None,
            session: None,
            recording: None,
            connection: ConnectionState::Disconnected,
            telemetry: Telemetry::default(),
        };
        let handle = EngineHandle {
            commands: commands_tx,
            status,
        };

        (engine, handle)
    }

    /// Replaces how recording files are opened (Ogg Opus by default).
    pub fn with_recorder(mut self, factory: impl RecorderFactory + 'static) -> Self {
        // ---
        self.recorders = Box::new(factory);
        self
    }

    /// Builds an engine and runs it on the current tokio runtime.
    pub fn spawn(
        config: EngineConfig,
        backend: B,
        metrics: MetricsContext,
    ) -> (EngineHandle, JoinHandle<()>) {
        // ---
        let (engine, handle) = Self::new(config, backend, metrics);
        (handle, tokio::spawn(engine.run()))
    }

    /// Processes events until shutdown or until every handle is dropped.
    pub async fn run(mut self) {
        // ---
        let mut ticker = time::interval(self.config.stats_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            match self.next_event(&mut ticker).await {
                Event::Command(Some(command)) => {
                    if !self.handle_command(command).await {
                        break;
                    }
                }
                Event::Command(None) => {
                    debug!("All engine handles dropped");
                    self.teardown().await;
                    break;
                }
                Event::Opened(result) => {
                    self.pending_open = None;
                    self.handle_opened(result).await;
                }
                Event::Frame(Ok(frame)) => self.handle_frame(frame).await,
                Event::Frame(Err(e)) => self.fail_session(e).await,
                Event::HandshakeExpired => {
                    let limit = self.config.handshake_timeout.unwrap_or_default();
                    self.fail_session(EngineError::Timeout(limit)).await;
                }
                Event::StatsTick => self.log_stats(),
            }
            self.publish();
        }

        info!("Engine stopped");
    }

    async fn next_event(&mut self, ticker: &mut Interval) -> Event {
        // ---
        let deadline = self.handshake_deadline;

        tokio::select! {
            command = self.commands.recv() => Event::Command(command),
            opened = wait_open(&mut self.pending_open), if self.pending_open.is_some() => {
                Event::Opened(opened)
            }
            frame = next_frame(&mut self.transport), if self.transport.is_some() => {
                Event::Frame(frame)
            }
            _ = wait_deadline(deadline), if deadline.is_some() => Event::HandshakeExpired,
            _ = ticker.tick() => Event::StatsTick,
        }
    }

    /// Returns `false` when the engine should stop.
    async fn handle_command(&mut self, command: Command) -> bool {
        // ---
        match command {
            Command::Connect {
                url,
                password,
                reply,
            } => {
                let result = self.start_connect(url, password);
                self.publish();
                let _ = reply.send(result);
            }
            Command::Disconnect { reply } => {
                self.disconnect().await;
                self.publish();
                let _ = reply.send(());
            }
            Command::SetGain { gain, reply } => {
                let applied = self.telemetry.set_gain(gain);
                debug!("Gain set to {:.2}", applied);
                self.publish();
                let _ = reply.send(applied);
            }
            Command::StartRecording { path, reply } => {
                let result = self.start_recording(path);
                if let Err(e) = &result {
                    warn!("Cannot start recording: {}", e);
                    self.telemetry.record_error(format!("{e:?}"));
                }
                self.publish();
                let _ = reply.send(result);
            }
            Command::StopRecording { reply } => {
                let result = self.stop_recording().await;
                self.publish();
                let _ = reply.send(result);
            }
            Command::SendMessage { text, reply } => {
                let result = match self.transport.as_mut() {
                    Some(transport) => transport.send_text(text).await,
                    None => Err(EngineError::NotConnected),
                };
                let _ = reply.send(result);
            }
            Command::Shutdown { reply } => {
                self.disconnect().await;
                self.publish();
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    fn start_connect(&mut self, url: String, password: String) -> Result<(), EngineError> {
        // ---
        if matches!(
            self.connection,
            ConnectionState::Connecting | ConnectionState::Connected { .. }
        ) {
            return Err(EngineError::AlreadyConnected);
        }

        info!("Connecting to {}", url);
        self.telemetry.reset_counters();
        self.metrics.connection_attempts_total.inc();
        self.session = Some(Session {
            password,
            token: None,
            format: None,
        });

        let connect_timeout = self.config.connect_timeout;
        self.pending_open = Some(tokio::spawn(async move {
            WsTransport::connect(&url, connect_timeout).await
        }));
        self.connection = ConnectionState::Connecting;
        Ok(())
    }

    async fn handle_opened(&mut self, result: Result<WsTransport, EngineError>) {
        // ---
        let transport = match result {
            Ok(transport) => transport,
            Err(e) => return self.fail_session(e).await,
        };
        let password = match &self.session {
            Some(session) => session.password.clone(),
            None => return transport.close().await,
        };

        self.transport = Some(transport);
        self.handshake_deadline = self.config.handshake_timeout.map(|t| Instant::now() + t);

        if let Err(e) = self.send_control(ClientMessage::Authenticate { password }).await {
            self.fail_session(e).await;
        }
    }

    async fn send_control(&mut self, message: ClientMessage) -> Result<(), EngineError> {
        // ---
        match self.transport.as_mut() {
            Some(transport) => transport.send(&message).await,
            None => Err(EngineError::NotConnected),
        }
    }

    async fn handle_frame(&mut self, frame: Frame) {
        // ---
        match frame {
            Frame::Text(text) => {
                self.telemetry.record_text_frame();
                self.metrics.messages_received_total.inc();
                self.handle_control(&text).await;
            }
            Frame::Binary(data) => self.handle_binary(data).await,
            Frame::Closed(reason) => {
                let reason = if reason.is_empty() {
                    "server closed the connection".to_string()
                } else {
                    reason
                };
                self.fail_session(EngineError::Closed(reason)).await;
            }
        }
    }

    async fn handle_control(&mut self, text: &str) {
        // ---
        let message = match ServerMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("Ignoring control message: {}", e);
                self.metrics.control_messages_ignored_total.inc();
                return;
            }
        };

        match message {
            ServerMessage::AuthSuccess { token } => self.handle_auth_success(token).await,
            ServerMessage::AuthFailed { message } => {
                self.fail_session(EngineError::Authentication(message)).await
            }
            ServerMessage::Error { message } => {
                self.fail_session(EngineError::Server(message)).await
            }
            ServerMessage::AudioConfig(format) => self.handle_audio_config(format).await,
            ServerMessage::Unrecognized { kind } => {
                debug!("Ignoring message of type {:?}", kind);
                self.metrics.control_messages_ignored_total.inc();
            }
        }
    }

    async fn handle_auth_success(&mut self, token: String) {
        // ---
        let session = match self.session.as_mut() {
            Some(session) if self.connection == ConnectionState::Connecting => session,
            _ => {
                warn!("Ignoring auth_success outside of a handshake");
                return;
            }
        };
        if session.token.is_some() {
            warn!("Ignoring repeated auth_success");
            return;
        }

        info!("Authenticated, requesting stream");
        session.token = Some(token.clone());
        let format = session.format;

        if let Err(e) = self.send_control(ClientMessage::StartStream { token }).await {
            return self.fail_session(e).await;
        }
        if let Some(format) = format {
            self.enter_connected(format);
        }
    }

    async fn handle_audio_config(&mut self, format: AudioFormat) {
        // ---
        if let Err(e) = format.validate() {
            warn!("Ignoring audio_config: {}", e);
            self.metrics.control_messages_ignored_total.inc();
            self.telemetry.record_error(e.to_string());
            return;
        }
        if format.bits_per_sample != 32 {
            warn!(
                "Server announced {} bits per sample; decoding as 32-bit",
                format.bits_per_sample
            );
        }

        let (previous, authenticated) = match self.session.as_mut() {
            Some(session) => (session.format.replace(format), session.token.is_some()),
            None => return,
        };

        if previous == Some(format) {
            debug!("Audio format unchanged: {}", format);
            self.status_tx.send_replace(self.snapshot());
            return;
        }

        info!("Audio format: {}", format);
        if let Err(e) = self.playback.configure(&format) {
            return self
                .fail_session(EngineError::Playback(format!("{e:#}")))
                .await;
        }
        self.metrics.jitter_buffer_occupancy_packets.set(0);

        if previous.is_some() {
            self.rotate_recording(&format).await;
        }
        if authenticated {
            self.enter_connected(format);
        }
    }

    fn enter_connected(&mut self, format: AudioFormat) {
        // ---
        self.handshake_deadline = None;
        if !self.connection.is_connected() {
            info!("Connected: {}", format.summary());
        }
        self.connection = ConnectionState::Connected { format };
    }

    async fn handle_binary(&mut self, data: Vec<u8>) {
        // ---
        let _timer = self.metrics.ingest_pipeline_seconds.start_timer();
        self.telemetry.record_binary_frame(data.len());
        self.metrics.messages_received_total.inc();
        self.metrics.binary_frames_received_total.inc();
        self.metrics.bytes_received_total.inc_by(data.len() as u64);

        let format = match self.connection.format() {
            Some(format) => format,
            None => {
                debug!(
                    "Dropping {}-byte frame received before the stream was configured",
                    data.len()
                );
                return;
            }
        };

        let samples = match check_frame_alignment(data.len(), &format)
            .and_then(|()| s32le_to_s16(&data))
        {
            Ok(samples) => samples,
            Err(e) => {
                warn!("Dropping frame: {}", e);
                self.metrics.malformed_frames_total.inc();
                self.telemetry.record_error(e.to_string());
                return;
            }
        };

        self.feed_recorder(&samples).await;

        if let Err(e) = self.playback.process(samples, self.telemetry.gain) {
            return self
                .fail_session(EngineError::Playback(format!("{e:#}")))
                .await;
        }
        self.metrics
            .jitter_buffer_occupancy_packets
            .set(self.playback.jitter_status().buffered_packets as i64);
    }

    async fn feed_recorder(&mut self, samples: &[i16]) {
        // ---
        let submitted = match &self.recording {
            Some(active) if !active.recorder.has_failed() => {
                active.recorder.submit(samples.to_vec())
            }
            Some(_) => Err(RecordingError::WorkerGone),
            None => return,
        };

        if submitted.is_err() {
            // The worker's own error is more useful than the channel's
            let outcome = match self.recording.take() {
                Some(active) => stop_recorder(active.recorder).await,
                None => return,
            };
            let e = match outcome {
                Err(e) => e,
                Ok(_) => RecordingError::WorkerGone,
            };
            error!("Recording aborted: {}", e);
            self.telemetry.record_error(format!("{:?}", EngineError::from(e)));
        }
    }

    fn start_recording(&mut self, path: Option<PathBuf>) -> Result<PathBuf, EngineError> {
        // ---
        let format = self
            .connection
            .format()
            .ok_or(RecordingError::NotConnected)?;
        if self.recording.is_some() {
            return Err(RecordingError::AlreadyRecording.into());
        }

        let path = path.unwrap_or_else(|| {
            default_recording_path(&self.config.recording.recordings_dir, Local::now())
        });
        let recorder = self.recorders.start(
            path.clone(),
            &format,
            &self.config.recording,
            self.metrics.clone(),
        )?;

        self.recording = Some(ActiveRecording {
            recorder,
            base_path: path.clone(),
            segment: 0,
        });
        Ok(path)
    }

    async fn stop_recording(&mut self) -> Result<Option<RecordingSummary>, EngineError> {
        // ---
        let active = match self.recording.take() {
            Some(active) => active,
            None => return Ok(None),
        };

        match stop_recorder(active.recorder).await {
            Ok(summary) => Ok(Some(summary)),
            Err(e) => {
                warn!("Recording did not finish cleanly: {}", e);
                let e = EngineError::from(e);
                self.telemetry.record_error(format!("{e:?}"));
                Err(e)
            }
        }
    }

    /// Closes the current file and continues into a new segment in `format`.
    async fn rotate_recording(&mut self, format: &AudioFormat) {
        // ---
        let active = match self.recording.take() {
            Some(active) => active,
            None => return,
        };

        if let Err(e) = stop_recorder(active.recorder).await {
            warn!("Closing segment before format change: {}", e);
            self.telemetry.record_error(format!("{:?}", EngineError::from(e)));
        }

        let segment = active.segment + 1;
        let path = segment_path(&active.base_path, segment);
        match self.recorders.start(
            path.clone(),
            format,
            &self.config.recording,
            self.metrics.clone(),
        ) {
            Ok(recorder) => {
                info!("Recording continues in {}", path.display());
                self.recording = Some(ActiveRecording {
                    recorder,
                    base_path: active.base_path,
                    segment,
                });
            }
            Err(e) => {
                error!("Cannot continue recording after format change: {}", e);
                self.telemetry.record_error(format!("{:?}", EngineError::from(e)));
            }
        }
    }

    /// Ends the session with `err`, keeping counters for inspection.
    async fn fail_session(&mut self, err: EngineError) {
        // ---
        error!("Session failed ({:?}): {}", err.kind(), err);
        self.teardown().await;
        self.telemetry.record_error(format!("{err:?}"));
        self.connection = ConnectionState::Error {
            message: err.to_string(),
        };
    }

    async fn disconnect(&mut self) {
        // ---
        if self.connection != ConnectionState::Disconnected {
            info!("Disconnecting");
        }
        self.teardown().await;
        self.telemetry.reset_counters();
        self.connection = ConnectionState::Disconnected;
    }

    /// Releases everything the session holds: recorder, device, socket.
    async fn teardown(&mut self) {
        // ---
        if let Some(pending) = self.pending_open.take() {
            pending.abort();
        }
        self.handshake_deadline = None;
        self.session = None;

        if let Some(active) = self.recording.take() {
            match stop_recorder(active.recorder).await {
                Ok(summary) => debug!("Recording closed at teardown: {}", summary.path.display()),
                Err(e) => warn!("Recording closed at teardown: {}", e),
            }
        }

        self.playback.reset_session();
        self.metrics.jitter_buffer_occupancy_packets.set(0);

        if let Some(transport) = self.transport.take() {
            transport.close().await;
        }
    }

    fn log_stats(&self) {
        // ---
        if !self.connection.is_connected() {
            return;
        }
        self.telemetry.log();
        let jitter = self.playback.jitter_status();
        debug!(
            "Jitter buffer: {} packets, primed={}",
            jitter.buffered_packets, jitter.is_primed
        );
    }

    fn snapshot(&self) -> EngineStatus {
        // ---
        EngineStatus {
            connection: self.connection.clone(),
            telemetry: self.telemetry.clone(),
            is_recording: self.recording.is_some(),
            recording_path: self
                .recording
                .as_ref()
                .map(|active| active.recorder.path().to_path_buf()),
        }
    }

    /// Publishes a snapshot if anything changed.
    fn publish(&self) {
        // ---
        let snapshot = self.snapshot();
        self.status_tx.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }
}

async fn stop_recorder(recorder: Recorder) -> Result<RecordingSummary, RecordingError> {
    // ---
    match tokio::task::spawn_blocking(move || recorder.stop()).await {
        Ok(result) => result,
        Err(_) => Err(RecordingError::WorkerGone),
    }
}

async fn wait_open(
    pending: &mut Option<JoinHandle<Result<WsTransport, EngineError>>>,
) -> Result<WsTransport, EngineError> {
    // ---
    match pending {
        Some(handle) => match handle.await {
            Ok(result) => result,
            Err(e) => Err(EngineError::Closed(format!("connect task ended: {e}"))),
        },
        None => future::pending().await,
    }
}

async fn next_frame(transport: &mut Option<WsTransport>) -> Result<Frame, EngineError> {
    // ---
    match transport {
        Some(transport) => transport.next_frame().await,
        None => future::pending().await,
    }
}

async fn wait_deadline(deadline: Option<Instant>) {
    // ---
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_state_summaries() {
        // ---
        assert_eq!(ConnectionState::Disconnected.summary(), "Disconnected");
        assert_eq!(
            ConnectionState::Connected {
                format: AudioFormat::new(48000, 2, 32)
            }
            .to_string(),
            "Connected: 48000Hz 2ch 32bit"
        );
        assert_eq!(
            ConnectionState::Error {
                message: "Invalid password".into()
            }
            .summary(),
            "Error: Invalid password"
        );
    }

    #[tokio::test]
    async fn test_handle_reports_closed_engine() {
        // ---
        let metrics = MetricsContext::new("test").unwrap();
        let (engine, handle) = Engine::new(
            EngineConfig::default(),
            crate::audio::MemoryBackend::new(),
            metrics,
        );
        drop(engine);

        assert!(matches!(handle.set_gain(1.0).await, Err(EngineError::EngineClosed)));
    }

    #[tokio::test]
    async fn test_recording_requires_connection() {
        // ---
        let metrics = MetricsContext::new("test").unwrap();
        let (handle, task) = Engine::spawn(
            EngineConfig::default(),
            crate::audio::MemoryBackend::new(),
            metrics,
        );

        let result = handle.start_recording(None).await;
        assert!(matches!(
            result,
            Err(EngineError::Recording(RecordingError::NotConnected))
        ));
        assert!(!handle.status().is_recording);
        assert!(handle.status().telemetry.last_error_detail.is_some());

        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_gain_is_clamped_and_published() {
        // ---
        let metrics = MetricsContext::new("test").unwrap();
        let (handle, task) = Engine::spawn(
            EngineConfig::default(),
            crate::audio::MemoryBackend::new(),
            metrics,
        );

        assert_eq!(handle.set_gain(5.0).await.unwrap(), 3.0);
        assert_eq!(handle.status().telemetry.gain, 3.0);

        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }
}
