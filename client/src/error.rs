//! Error taxonomy for the streaming engine.
//!
//! Transport, authentication and server failures end the session; protocol
//! and format problems only drop the offending frame; recording failures only
//! end the recording.

use audiopirate_common::ProtocolError;
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Broad class of an [`EngineError`], used for logging and by observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    Protocol,
    Authentication,
    Format,
    Playback,
    Recording,
    Usage,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("transport error: {0}")]
    Transport(#[from] tungstenite::Error),

    #[error("connection closed: {0}")]
    Closed(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Authentication(String),

    #[error("{0}")]
    Server(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Format(#[from] FormatError),

    #[error("playback error: {0}")]
    Playback(String),

    #[error(transparent)]
    Recording(#[from] RecordingError),

    #[error("already connected or connecting")]
    AlreadyConnected,

    #[error("not connected")]
    NotConnected,

    #[error("engine has shut down")]
    EngineClosed,
}

impl EngineError {
    // ---
    pub fn kind(&self) -> ErrorKind {
        // ---
        match self {
            EngineError::Transport(_) | EngineError::Closed(_) | EngineError::Timeout(_) => {
                ErrorKind::Transport
            }
            EngineError::Authentication(_) => ErrorKind::Authentication,
            EngineError::Server(_) | EngineError::Protocol(_) => ErrorKind::Protocol,
            EngineError::Format(_) => ErrorKind::Format,
            EngineError::Playback(_) => ErrorKind::Playback,
            EngineError::Recording(_) => ErrorKind::Recording,
            EngineError::AlreadyConnected
            | EngineError::NotConnected
            | EngineError::EngineClosed => ErrorKind::Usage,
        }
    }
}

/// A binary frame whose length does not describe whole samples or frames.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    #[error("frame of {len} bytes is not a multiple of 4")]
    Misaligned { len: usize },

    #[error("frame of {len} bytes is not a multiple of the {frame_bytes}-byte frame size")]
    PartialFrame { len: usize, frame_bytes: usize },
}

#[derive(Debug, Error)]
pub enum RecordingError {
    #[error("cannot record {0}")]
    UnsupportedFormat(String),

    #[error("encoder error: {0}")]
    Encoder(String),

    #[error("muxer error: {0}")]
    Muxer(String),

    #[error("recording I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("recording stopped before any audio was encoded")]
    NothingRecorded,

    #[error("encoder did not finish draining within {0:?}")]
    DrainTimeout(Duration),

    #[error("a recording is already in progress")]
    AlreadyRecording,

    #[error("recording requires an active stream")]
    NotConnected,

    #[error("recorder thread exited unexpectedly")]
    WorkerGone,
}

impl From<opus::Error> for RecordingError {
    fn from(e: opus::Error) -> Self {
        RecordingError::Encoder(e.to_string())
    }
}
