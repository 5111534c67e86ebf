//! Gain and packet-boundary declicking.
//!
//! Network packets arrive as independent buffers, and butting them together
//! leaves audible seams. The [`Declicker`] keeps the tail of the last packet it
//! emitted and cosine-blends it into the head of the next one.

use std::f32::consts::PI;
use tracing::debug;

/// Default cross-fade length in samples (~10.7ms of 48kHz mono).
pub const DEFAULT_FADE_LEN: usize = 512;

/// Largest accepted gain (300%).
pub const MAX_GAIN: f32 = 3.0;

/// Clamps a requested gain into `[0.0, MAX_GAIN]`; NaN falls back to unity.
pub fn clamp_gain(gain: f32) -> f32 {
    // ---
    if gain.is_nan() {
        return 1.0;
    }
    gain.clamp(0.0, MAX_GAIN)
}

/// Multiplies every sample by `gain`, saturating to the i16 range.
///
/// Returns the number of samples that had to be clipped.
pub fn apply_gain(samples: &mut [i16], gain: f32) -> usize {
    // ---
    if gain == 1.0 {
        return 0;
    }

    let mut clipped = 0;
    for sample in samples.iter_mut() {
        let amplified = (*sample as f32 * gain) as i32;
        let clamped = amplified.clamp(i16::MIN as i32, i16::MAX as i32);
        if clamped != amplified {
            clipped += 1;
        }
        *sample = clamped as i16;
    }
    clipped
}

/// Cross-fades consecutive packets.
///
/// # Example
///
/// ```
/// use client::declick::Declicker;
///
/// let mut declicker = Declicker::new(4);
/// let first = declicker.process(vec![100; 8], 1.0);
/// assert_eq!(first, vec![100; 8]); // nothing to blend with yet
/// let second = declicker.process(vec![0; 8], 1.0);
/// assert_eq!(second[0], 100); // starts from the previous tail
/// ```
#[derive(Debug)]
pub struct Declicker {
    // ---
    fade_len: usize,

    /// Last `fade_len` (or fewer) output samples of the previous packet
    tail: Vec<i16>,
}

impl Declicker {
    // ---
    pub fn new(fade_len: usize) -> Self {
        // ---
        Self {
            fade_len,
            tail: Vec::with_capacity(fade_len),
        }
    }

    /// Applies gain, blends with the retained tail, and retains the new tail.
    pub fn process(&mut self, mut packet: Vec<i16>, gain: f32) -> Vec<i16> {
        // ---
        let gain = clamp_gain(gain);
        let clipped = apply_gain(&mut packet, gain);
        if clipped > 0 && gain > 1.0 {
            debug!(
                "Gain {:.0}%: {}/{} samples clipped",
                gain * 100.0,
                clipped,
                packet.len()
            );
        }

        let fade = self.fade_len.min(packet.len()).min(self.tail.len());
        if fade > 0 {
            let tail = &self.tail[self.tail.len() - fade..];
            for (i, (out, &prev)) in packet.iter_mut().zip(tail).enumerate() {
                let progress = i as f32 / fade as f32;
                let fade_out = ((progress * PI).cos() + 1.0) / 2.0;
                let fade_in = 1.0 - fade_out;
                let mixed = prev as f32 * fade_out + *out as f32 * fade_in;
                *out = (mixed as i32).clamp(i16::MIN as i32, i16::MAX as i32) as i16;
            }
        }

        let keep = self.fade_len.min(packet.len());
        self.tail.clear();
        self.tail.extend_from_slice(&packet[packet.len() - keep..]);

        packet
    }

    /// Forgets the retained tail; the next packet passes through with gain only.
    pub fn reset(&mut self) {
        // ---
        self.tail.clear();
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn ramp(len: usize) -> Vec<i16> {
        (0..len).map(|i| (i as i16).wrapping_mul(37)).collect()
    }

    #[test]
    fn test_unity_gain_first_packet_is_identity() {
        // ---
        let mut declicker = Declicker::new(16);
        let input = ramp(64);
        assert_eq!(declicker.process(input.clone(), 1.0), input);
    }

    #[test]
    fn test_zero_gain_silences() {
        // ---
        let mut declicker = Declicker::new(16);
        assert!(declicker
            .process(vec![12345; 64], 0.0)
            .iter()
            .all(|&s| s == 0));
        // Second packet blends a silent tail into silence
        assert!(declicker
            .process(vec![-20000; 64], 0.0)
            .iter()
            .all(|&s| s == 0));
    }

    #[test]
    fn test_gain_saturates() {
        // ---
        let mut samples = vec![i16::MAX, i16::MIN, 20000, -20000, 100];
        let clipped = apply_gain(&mut samples, 3.0);
        assert_eq!(samples, vec![i16::MAX, i16::MIN, i16::MAX, i16::MIN, 300]);
        assert_eq!(clipped, 4);
    }

    #[test]
    fn test_gain_is_clamped() {
        // ---
        assert_eq!(clamp_gain(5.0), 3.0);
        assert_eq!(clamp_gain(-1.0), 0.0);
        assert_eq!(clamp_gain(f32::NAN), 1.0);
        assert_eq!(clamp_gain(1.5), 1.5);
    }

    #[test]
    fn test_second_packet_starts_from_previous_tail() {
        // ---
        let mut declicker = Declicker::new(8);
        declicker.process(vec![1000; 32], 1.0);
        let out = declicker.process(vec![-1000; 32], 1.0);

        // Blend starts on the old level and moves monotonically toward the new one
        assert_eq!(out[0], 1000);
        for pair in out[..8].windows(2) {
            assert!(pair[1] <= pair[0]);
        }
        // Past the fade region the packet is untouched
        assert!(out[8..].iter().all(|&s| s == -1000));
    }

    #[test]
    fn test_fade_limited_by_short_packet() {
        // ---
        let mut declicker = Declicker::new(16);
        declicker.process(vec![500; 4], 1.0);
        let out = declicker.process(vec![0; 32], 1.0);

        // Only 4 tail samples were retained
        assert!(out[..4].iter().any(|&s| s != 0));
        assert!(out[4..].iter().all(|&s| s == 0));
    }

    #[test]
    fn test_reset_drops_tail() {
        // ---
        let mut declicker = Declicker::new(8);
        declicker.process(vec![1000; 16], 1.0);
        assert!(!declicker.tail.is_empty());

        declicker.reset();
        assert!(declicker.tail.is_empty());
        assert_eq!(declicker.process(vec![-7; 16], 1.0), vec![-7; 16]);
    }
}
