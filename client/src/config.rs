//! Engine configuration.

use std::time::Duration;

use crate::playback::PlaybackConfig;
use crate::recording::RecordingConfig;

/// Everything the engine needs besides a backend and a metrics context.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    // ---
    pub playback: PlaybackConfig,

    pub recording: RecordingConfig,

    /// Bound on opening the WebSocket
    pub connect_timeout: Duration,

    /// Bound on transport open through `Connected`; `None` waits forever
    pub handshake_timeout: Option<Duration>,

    /// How often session counters are logged while connected
    pub stats_interval: Duration,

    /// Depth of the handle-to-engine command channel
    pub command_queue: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        // ---
        Self {
            playback: PlaybackConfig::default(),
            recording: RecordingConfig::default(),
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Some(Duration::from_secs(10)),
            stats_interval: Duration::from_secs(5),
            command_queue: 32,
        }
    }
}
