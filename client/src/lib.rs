//! Audiopirate streaming client library.
//!
//! Connects to an audiopirate server over WebSocket, authenticates, and
//! plays the raw PCM stream it sends while optionally recording it to an
//! Ogg Opus file. The [`Engine`] owns every resource; hosts drive it through
//! an [`EngineHandle`] and watch [`EngineStatus`] snapshots.
//!
//! Binary frames flow through [`convert`] into the [`playback`] pipeline
//! (declick, jitter buffer, output device) and, when recording, into the
//! [`recording`] worker (Opus encoder, Ogg muxer).

pub mod audio;
pub mod codec;
pub mod config;
pub mod convert;
pub mod declick;
pub mod engine;
pub mod error;
pub mod jitter_buffer;
pub mod mux;
pub mod network;
pub mod playback;
pub mod recording;
pub mod resample;
pub mod telemetry;

pub use audio::{CpalBackend, MemoryBackend, OutputBackend, OutputDevice, SinkEvent};
pub use config::EngineConfig;
pub use engine::{ConnectionState, Engine, EngineHandle, EngineStatus};
pub use error::{EngineError, ErrorKind, FormatError, RecordingError};
pub use jitter_buffer::{JitterBuffer, JitterBufferConfig};
pub use playback::PlaybackConfig;
pub use recording::{RecordingConfig, RecordingSummary};
pub use telemetry::Telemetry;

pub use audiopirate_common::AudioFormat;
