//! Per-session telemetry.
//!
//! Counts what arrived on the socket since the current connection attempt
//! began. The engine owns the only mutable copy and publishes snapshots in
//! [`crate::EngineStatus`].

use chrono::{DateTime, Local};
use tracing::info;

use crate::declick::clamp_gain;

/// Counters and details shown to observers.
#[derive(Debug, Clone, PartialEq)]
pub struct Telemetry {
    // ---
    /// Total binary payload bytes received
    pub received_bytes: u64,

    /// Total frames received, text and binary
    pub message_count: u64,

    /// Wall-clock time of the most recent frame
    pub last_message_at: Option<DateTime<Local>>,

    /// Verbose detail of the most recent failure
    pub last_error_detail: Option<String>,

    /// Playback gain in [0.0, 3.0]
    pub gain: f32,
}

impl Telemetry {
    // ---
    pub fn new() -> Self {
        // ---
        Self {
            received_bytes: 0,
            message_count: 0,
            last_message_at: None,
            last_error_detail: None,
            gain: 1.0,
        }
    }

    /// Records an inbound text frame.
    pub fn record_text_frame(&mut self) {
        // ---
        self.message_count += 1;
        self.last_message_at = Some(Local::now());
    }

    /// Records an inbound binary frame of `len` bytes.
    pub fn record_binary_frame(&mut self, len: usize) {
        // ---
        self.message_count += 1;
        self.received_bytes += len as u64;
        self.last_message_at = Some(Local::now());
    }

    /// Zeroes the counters at the start of an attempt or on disconnect.
    ///
    /// Gain is a user setting and survives.
    pub fn reset_counters(&mut self) {
        // ---
        self.received_bytes = 0;
        self.message_count = 0;
        self.last_message_at = None;
        self.last_error_detail = None;
    }

    /// Sets the gain, clamped to the supported range.
    pub fn set_gain(&mut self, gain: f32) -> f32 {
        // ---
        self.gain = clamp_gain(gain);
        self.gain
    }

    pub fn record_error(&mut self, detail: impl Into<String>) {
        // ---
        self.last_error_detail = Some(detail.into());
    }

    /// `HH:MM:SS` of the last frame, or `--:--:--` before any.
    pub fn last_message_label(&self) -> String {
        // ---
        match self.last_message_at {
            Some(at) => at.format("%H:%M:%S").to_string(),
            None => "--:--:--".to_string(),
        }
    }

    /// Logs the counters at info level.
    pub fn log(&self) {
        // ---
        info!(
            "Stream stats: {} msgs, {} bytes, last at {}, gain {:.2}",
            self.message_count,
            self.received_bytes,
            self.last_message_label(),
            self.gain
        );
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        // ---
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_frames_counted() {
        // ---
        let mut telemetry = Telemetry::default();

        telemetry.record_text_frame();
        telemetry.record_binary_frame(800);
        telemetry.record_binary_frame(800);

        assert_eq!(telemetry.message_count, 3);
        assert_eq!(telemetry.received_bytes, 1600);
        assert!(telemetry.last_message_at.is_some());
    }

    #[test]
    fn test_reset_keeps_gain() {
        // ---
        let mut telemetry = Telemetry::default();
        telemetry.set_gain(2.0);
        telemetry.record_binary_frame(8);
        telemetry.record_error("boom");

        telemetry.reset_counters();

        assert_eq!(telemetry.message_count, 0);
        assert_eq!(telemetry.received_bytes, 0);
        assert_eq!(telemetry.last_message_at, None);
        assert_eq!(telemetry.last_error_detail, None);
        assert_eq!(telemetry.gain, 2.0);
    }

    #[test]
    fn test_gain_clamped() {
        // ---
        let mut telemetry = Telemetry::default();

        assert_eq!(telemetry.set_gain(7.5), 3.0);
        assert_eq!(telemetry.set_gain(-1.0), 0.0);
        assert_eq!(telemetry.set_gain(f32::NAN), 1.0);
    }

    #[test]
    fn test_last_message_label() {
        // ---
        let mut telemetry = Telemetry::default();
        assert_eq!(telemetry.last_message_label(), "--:--:--");

        telemetry.last_message_at =
            Some(chrono::TimeZone::with_ymd_and_hms(&Local, 2024, 1, 2, 9, 8, 7).unwrap());
        assert_eq!(telemetry.last_message_label(), "09:08:07");
    }
}
