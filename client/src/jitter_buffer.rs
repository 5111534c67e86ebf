//! Jitter buffer for playback smoothing.
//!
//! Holds back incoming packets until a fill threshold is reached, then
//! releases everything in arrival order. Once primed it never re-buffers:
//! an underrun at the sink is a quality hit, not a reason to stall.

use std::collections::VecDeque;
use tracing::{debug, warn};

/// Jitter buffer configuration.
#[derive(Debug, Clone)]
pub struct JitterBufferConfig {
    // ---
    /// Packets to accumulate before playback starts
    pub threshold_packets: usize,

    /// Maximum packets to hold while priming
    pub max_packets: usize,
}

impl Default for JitterBufferConfig {
    fn default() -> Self {
        // ---
        Self {
            threshold_packets: 5,
            max_packets: 256, // Safety limit for a stalled sink
        }
    }
}

/// FIFO jitter buffer for converted sample blocks.
///
/// # Example
///
/// ```
/// use client::jitter_buffer::{JitterBuffer, JitterBufferConfig};
///
/// let mut buffer = JitterBuffer::new(JitterBufferConfig {
///     threshold_packets: 2,
///     max_packets: 16,
/// });
///
/// buffer.push(vec![1, 2]);
/// assert!(buffer.get_next().is_none()); // still priming
///
/// buffer.push(vec![3, 4]);
/// assert_eq!(buffer.get_next(), Some(vec![1, 2]));
/// assert_eq!(buffer.get_next(), Some(vec![3, 4]));
/// ```
#[derive(Debug)]
pub struct JitterBuffer {
    // ---
    /// Buffer configuration
    config: JitterBufferConfig,

    /// Packets in arrival order
    buffer: VecDeque<Vec<i16>>,

    /// Whether buffer has been primed (filled to threshold)
    is_primed: bool,
}

impl JitterBuffer {
    // ---
    /// Creates a new jitter buffer with the given configuration.
    pub fn new(mut config: JitterBufferConfig) -> Self {
        // ---
        // A cap below the threshold would never let playback start
        config.max_packets = config.max_packets.max(config.threshold_packets).max(1);
        let capacity = config.threshold_packets.max(1);
        Self {
            config,
            buffer: VecDeque::with_capacity(capacity),
            is_primed: false,
        }
    }

    /// Appends a packet.
    ///
    /// Returns `false` if the buffer was full and the oldest packet was dropped
    /// to make room.
    pub fn push(&mut self, packet: Vec<i16>) -> bool {
        // ---
        self.buffer.push_back(packet);

        if self.buffer.len() > self.config.max_packets {
            warn!("Jitter buffer overflow, dropping oldest packet");
            self.buffer.pop_front();
            return false;
        }

        true
    }

    /// Retrieves the next packet ready for playout.
    ///
    /// Returns `None` while the buffer is still priming or when it is empty.
    pub fn get_next(&mut self) -> Option<Vec<i16>> {
        // ---
        if !self.is_primed {
            if self.buffer.len() >= self.config.threshold_packets {
                self.is_primed = true;
                debug!(
                    "Jitter buffer primed with {} packets, starting playout",
                    self.buffer.len()
                );
            } else {
                return None;
            }
        }

        self.buffer.pop_front()
    }

    pub fn is_primed(&self) -> bool {
        // ---
        self.is_primed
    }

    /// Drops all queued packets and returns to the priming phase.
    pub fn reset(&mut self) {
        // ---
        self.buffer.clear();
        self.is_primed = false;
    }

    /// Returns current buffer status for observability.
    pub fn status(&self) -> JitterBufferStatus {
        // ---
        JitterBufferStatus {
            buffered_packets: self.buffer.len(),
            is_primed: self.is_primed,
        }
    }
}

/// Jitter buffer status for observability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JitterBufferStatus {
    pub buffered_packets: usize,
    pub is_primed: bool,
}
