//! Control-message protocol.
//!
//! Text frames exchanged with the streaming server are JSON objects tagged
//! by a `type` field. Outbound messages are a closed enum serialized with
//! serde; inbound messages are parsed once at the boundary into
//! [`ServerMessage`], with unknown tags kept as an explicit variant.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Bytes per sample on the wire (S32_LE).
pub const WIRE_BYTES_PER_SAMPLE: usize = 4;

/// Highest sample rate accepted in `audio_config`.
pub const MAX_SAMPLE_RATE: u32 = 384_000;

/// Errors raised while decoding a control frame.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed control message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("control message has no `type` field")]
    MissingType,

    #[error("invalid audio format: {0}")]
    InvalidFormat(String),
}

/// Audio format announced by the server in `audio_config`.
///
/// Replaced wholesale whenever the server sends a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    // ---
    #[serde(rename = "sampleRate")]
    pub sample_rate: u32,

    pub channels: u16,

    #[serde(rename = "bitsPerSample")]
    pub bits_per_sample: u16,
}

impl AudioFormat {
    // ---
    pub fn new(sample_rate: u32, channels: u16, bits_per_sample: u16) -> Self {
        // ---
        Self {
            sample_rate,
            channels,
            bits_per_sample,
        }
    }

    /// Size in bytes of one interleaved wire frame (one sample per channel).
    pub fn wire_frame_bytes(&self) -> usize {
        // ---
        WIRE_BYTES_PER_SAMPLE * self.channels as usize
    }

    /// Short human-readable form, e.g. `48000Hz 2ch 32bit`.
    pub fn summary(&self) -> String {
        // ---
        format!(
            "{}Hz {}ch {}bit",
            self.sample_rate, self.channels, self.bits_per_sample
        )
    }

    /// Rejects descriptors the playback path cannot represent.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        // ---
        if self.sample_rate == 0 {
            return Err(ProtocolError::InvalidFormat("sample rate is zero".into()));
        }
        if self.sample_rate > MAX_SAMPLE_RATE {
            return Err(ProtocolError::InvalidFormat(format!(
                "sample rate {} Hz is above {} Hz",
                self.sample_rate, MAX_SAMPLE_RATE
            )));
        }
        if !(1..=2).contains(&self.channels) {
            return Err(ProtocolError::InvalidFormat(format!(
                "unsupported channel count {}",
                self.channels
            )));
        }
        Ok(())
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.summary())
    }
}

/// Messages the client sends to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Authenticate { password: String },
    StartStream { token: String },
}

impl ClientMessage {
    // ---
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        // ---
        Ok(serde_json::to_string(self)?)
    }
}

/// Messages the server sends to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    AuthSuccess { token: String },
    AuthFailed { message: String },
    AudioConfig(AudioFormat),
    Error { message: String },
    /// A well-formed frame whose `type` this client does not handle.
    Unrecognized { kind: String },
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum KnownMessage {
    AuthSuccess {
        token: String,
    },
    AuthFailed {
        #[serde(default = "default_auth_failed")]
        message: String,
    },
    AudioConfig(AudioFormat),
    Error {
        #[serde(default = "default_server_error")]
        message: String,
    },
}

fn default_auth_failed() -> String {
    "Authentication failed".to_string()
}

fn default_server_error() -> String {
    "Server error".to_string()
}

impl ServerMessage {
    // ---
    /// Parses a text frame.
    ///
    /// Unknown `type` values yield [`ServerMessage::Unrecognized`] instead of
    /// an error; missing or mistyped fields on a known type are errors.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        // ---
        let value: Value = serde_json::from_str(text)?;

        let kind = match value.get("type").and_then(Value::as_str) {
            Some(kind) => kind.to_string(),
            None => return Err(ProtocolError::MissingType),
        };

        if !matches!(
            kind.as_str(),
            "auth_success" | "auth_failed" | "audio_config" | "error"
        ) {
            return Ok(ServerMessage::Unrecognized { kind });
        }

        let message = match serde_json::from_value::<KnownMessage>(value)? {
            KnownMessage::AuthSuccess { token } => ServerMessage::AuthSuccess { token },
            KnownMessage::AuthFailed { message } => ServerMessage::AuthFailed { message },
            KnownMessage::AudioConfig(format) => ServerMessage::AudioConfig(format),
            KnownMessage::Error { message } => ServerMessage::Error { message },
        };

        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_authenticate_serialization() {
        // ---
        let json = ClientMessage::Authenticate {
            password: "audiopirate".into(),
        }
        .to_json()
        .unwrap();

        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "authenticate");
        assert_eq!(value["password"], "audiopirate");
    }

    #[test]
    fn test_start_stream_serialization() {
        // ---
        let json = ClientMessage::StartStream { token: "T1".into() }
            .to_json()
            .unwrap();

        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "start_stream");
        assert_eq!(value["token"], "T1");
    }

    #[test]
    fn test_parse_audio_config() {
        // ---
        let msg = ServerMessage::parse(
            r#"{"type":"audio_config","sampleRate":48000,"channels":2,"bitsPerSample":32}"#,
        )
        .unwrap();

        let format = AudioFormat::new(48000, 2, 32);
        assert_eq!(msg, ServerMessage::AudioConfig(format));
        assert_eq!(format.summary(), "48000Hz 2ch 32bit");
        assert_eq!(format.wire_frame_bytes(), 8);
    }

    #[test]
    fn test_parse_auth_messages() {
        // ---
        assert_eq!(
            ServerMessage::parse(r#"{"type":"auth_success","token":"abc"}"#).unwrap(),
            ServerMessage::AuthSuccess {
                token: "abc".into()
            }
        );
        assert_eq!(
            ServerMessage::parse(r#"{"type":"auth_failed"}"#).unwrap(),
            ServerMessage::AuthFailed {
                message: "Authentication failed".into()
            }
        );
        assert_eq!(
            ServerMessage::parse(r#"{"type":"error","message":"busy"}"#).unwrap(),
            ServerMessage::Error {
                message: "busy".into()
            }
        );
    }

    #[test]
    fn test_unknown_type_is_unrecognized() {
        // ---
        let msg = ServerMessage::parse(r#"{"type":"heartbeat","n":3}"#).unwrap();
        assert_eq!(
            msg,
            ServerMessage::Unrecognized {
                kind: "heartbeat".into()
            }
        );
    }

    #[test]
    fn test_malformed_messages() {
        // ---
        assert!(matches!(
            ServerMessage::parse("not json"),
            Err(ProtocolError::Json(_))
        ));
        assert!(matches!(
            ServerMessage::parse(r#"{"token":"abc"}"#),
            Err(ProtocolError::MissingType)
        ));
        // Known type with a missing required field
        assert!(matches!(
            ServerMessage::parse(r#"{"type":"audio_config","channels":2}"#),
            Err(ProtocolError::Json(_))
        ));
    }

    #[test]
    fn test_format_validation() {
        // ---
        assert!(AudioFormat::new(48000, 2, 32).validate().is_ok());
        assert!(AudioFormat::new(44100, 1, 32).validate().is_ok());
        assert!(AudioFormat::new(0, 2, 32).validate().is_err());
        assert!(AudioFormat::new(384_000, 2, 32).validate().is_ok());
        assert!(matches!(
            AudioFormat::new(4_000_000_000, 2, 32).validate(),
            Err(ProtocolError::InvalidFormat(_))
        ));
        assert!(AudioFormat::new(48000, 6, 32).validate().is_err());
    }
}
