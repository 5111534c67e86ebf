//! Audiopirate streaming client - CLI binary.
//!
//! Connects to a server, plays the stream, and accepts line commands on
//! stdin (`rec`, `stop`, `gain <g>`, `send <text>`, `status`, `connect`,
//! `disconnect`, `quit`). Ctrl-C disconnects cleanly.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use audiopirate_common::{init_tracing, ColorWhen, MetricsContext, MetricsServerConfig};
use client::{
    ConnectionState, CpalBackend, Engine, EngineConfig, EngineError, EngineHandle, EngineStatus,
    JitterBufferConfig, MemoryBackend, OutputBackend, PlaybackConfig, RecordingConfig,
};

#[derive(clap::ValueEnum, Debug, Clone, Copy)]
enum ColorArg {
    Auto,
    Always,
    Never,
}

impl From<ColorArg> for ColorWhen {
    fn from(v: ColorArg) -> Self {
        match v {
            ColorArg::Auto => ColorWhen::Auto,
            ColorArg::Always => ColorWhen::Always,
            ColorArg::Never => ColorWhen::Never,
        }
    }
}

/// Audiopirate client - play and record a PCM stream
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    // ---
    /// Server URL, e.g. ws://192.168.1.20:8080
    #[arg(short, long)]
    url: String,

    /// Server password
    #[arg(short, long, default_value = "audiopirate")]
    password: String,

    /// Playback gain (0.0 to 3.0)
    #[arg(short, long, default_value = "1.0")]
    gain: f32,

    /// Packets buffered before playback starts
    #[arg(short = 'b', long, default_value = "5")]
    buffer_packets: usize,

    /// Cross-fade length between packets, in samples
    #[arg(long, default_value = "512")]
    fade_samples: usize,

    /// Skip the calibration tone at playback start
    #[arg(long)]
    no_tone: bool,

    /// Do not open an audio device; the stream is only counted and recorded
    #[arg(long)]
    no_audio: bool,

    /// Start recording as soon as the stream is connected
    #[arg(short, long)]
    record: bool,

    /// Directory for recordings
    #[arg(long, default_value = "recordings")]
    recordings_dir: PathBuf,

    /// Seconds allowed from socket open to stream start (0 waits forever)
    #[arg(long, default_value = "10")]
    handshake_timeout_secs: u64,

    /// Prometheus metrics bind address (serves `GET /metrics`)
    #[arg(long)]
    metrics_bind: Option<String>,

    /// Coloring
    #[arg(long, value_enum, default_value = "auto")]
    color: ColorArg,
}

impl Args {
    // ---
    fn engine_config(&self) -> EngineConfig {
        // ---
        EngineConfig {
            playback: PlaybackConfig {
                jitter: JitterBufferConfig {
                    threshold_packets: self.buffer_packets,
                    ..JitterBufferConfig::default()
                },
                fade_len: self.fade_samples,
                calibration_tone: !self.no_tone,
            },
            recording: RecordingConfig {
                recordings_dir: self.recordings_dir.clone(),
                ..RecordingConfig::default()
            },
            handshake_timeout: (self.handshake_timeout_secs > 0)
                .then(|| Duration::from_secs(self.handshake_timeout_secs)),
            ..EngineConfig::default()
        }
    }
}

/// Capture version number from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

const COMMANDS: &str =
    "rec [path], stop, gain <g>, send <text>, status, connect, disconnect, quit";

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    let args = Args::parse();
    init_tracing(args.color.into())?;
    info!("Starting audiopirate client v{VERSION}");
    info!("Server: {}", args.url);
    info!("Jitter buffer: {} packets", args.buffer_packets);

    let metrics = MetricsContext::new("client")?;
    let _metrics_task = match &args.metrics_bind {
        Some(bind) => {
            let addr = bind.parse().context("invalid metrics bind")?;
            info!("Metrics bind: {}", bind);
            Some(metrics.spawn_metrics_server(MetricsServerConfig::new(addr)))
        }
        None => None,
    };

    let config = args.engine_config();
    if args.no_audio {
        info!("Audio output disabled");
        let backend = MemoryBackend::discarding();
        run(args, config, backend.clone(), metrics).await?;
        info!("Discarded {} samples of playback", backend.samples_written());
        Ok(())
    } else {
        run(args, config, CpalBackend, metrics).await
    }
}

async fn run<B: OutputBackend + 'static>(
    args: Args,
    config: EngineConfig,
    backend: B,
    metrics: MetricsContext,
) -> Result<()> {
    // ---
    let (handle, engine_task) = Engine::spawn(config, backend, metrics);
    let status_task = tokio::spawn(log_status_changes(handle.subscribe()));

    handle.set_gain(args.gain).await?;
    handle
        .connect(args.url.clone(), args.password.clone())
        .await
        .context("failed to start connection")?;

    if args.record {
        tokio::spawn(record_when_connected(handle.clone()));
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            line = lines.next_line(), if stdin_open => {
                match line.context("failed to read stdin")? {
                    Some(line) => {
                        if !handle_line(&handle, &args, line.trim()).await {
                            break;
                        }
                    }
                    None => {
                        debug!("stdin closed; waiting for Ctrl-C");
                        stdin_open = false;
                    }
                }
            }
        }
    }

    handle.shutdown().await?;
    engine_task.await.context("engine task failed")?;
    status_task.abort();
    Ok(())
}

/// Runs one stdin command. Returns `false` to quit.
async fn handle_line(handle: &EngineHandle, args: &Args, line: &str) -> bool {
    // ---
    let (command, rest) = match line.split_once(' ') {
        Some((command, rest)) => (command, rest.trim()),
        None => (line, ""),
    };

    let result = match command {
        "" => Ok(()),
        "rec" => {
            let path = (!rest.is_empty()).then(|| PathBuf::from(rest));
            handle
                .start_recording(path)
                .await
                .map(|path| info!("Recording to {}", path.display()))
        }
        "stop" => handle.stop_recording().await.map(|summary| match summary {
            Some(s) => info!(
                "Saved {} ({:.1}s, {} packets)",
                s.path.display(),
                s.duration.as_secs_f64(),
                s.packets_written
            ),
            None => info!("Not recording"),
        }),
        "gain" => match rest.parse::<f32>() {
            Ok(gain) => handle
                .set_gain(gain)
                .await
                .map(|applied| info!("Gain {:.2}", applied)),
            Err(_) => {
                warn!("Usage: gain <0.0-3.0>");
                Ok(())
            }
        },
        "send" => handle.send_message(rest).await,
        "status" => {
            print_status(&handle.status());
            Ok(())
        }
        "connect" => handle.connect(args.url.clone(), args.password.clone()).await,
        "disconnect" => handle.disconnect().await,
        "quit" | "exit" => return false,
        other => {
            warn!("Unknown command {:?} ({})", other, COMMANDS);
            Ok(())
        }
    };

    match result {
        Ok(()) => true,
        Err(EngineError::EngineClosed) => false,
        Err(e) => {
            warn!("{}: {}", command, e);
            true
        }
    }
}

fn print_status(status: &EngineStatus) {
    // ---
    info!("Status: {}", status.connection);
    status.telemetry.log();
    match &status.recording_path {
        Some(path) => info!("Recording: {}", path.display()),
        None => info!("Recording: off"),
    }
    if let Some(detail) = &status.telemetry.last_error_detail {
        info!("Last error: {}", detail);
    }
}

/// Logs connection and recording changes, not every counter update.
async fn log_status_changes(mut rx: watch::Receiver<EngineStatus>) {
    // ---
    let mut last: Option<(ConnectionState, bool)> = None;

    while rx.changed().await.is_ok() {
        let status = rx.borrow_and_update().clone();
        let key = (status.connection.clone(), status.is_recording);
        if last.as_ref() == Some(&key) {
            continue;
        }

        info!(
            "Status: {}{}",
            status.connection,
            if status.is_recording { " [REC]" } else { "" }
        );
        if let ConnectionState::Error { .. } = status.connection {
            if let Some(detail) = &status.telemetry.last_error_detail {
                debug!("Error detail: {}", detail);
            }
        }
        last = Some(key);
    }
}

async fn record_when_connected(handle: EngineHandle) {
    // ---
    let status = match handle
        .wait_for(|s| {
            s.connection.is_connected() || matches!(s.connection, ConnectionState::Error { .. })
        })
        .await
    {
        Ok(status) => status,
        Err(_) => return,
    };

    if status.connection.is_connected() {
        if let Err(e) = handle.start_recording(None).await {
            warn!("Cannot start recording: {}", e);
        }
    }
}
