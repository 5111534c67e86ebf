//! Wire PCM to playback PCM conversion.
//!
//! The server streams interleaved S32_LE samples. Playback and recording
//! both work on i16, obtained by keeping the upper 16 bits of each sample.
//! This is a plain truncation, not a dithered downscale.

use audiopirate_common::{AudioFormat, WIRE_BYTES_PER_SAMPLE};

use crate::error::FormatError;

/// Converts S32_LE bytes to i16 samples, one output sample per input sample.
///
/// # Errors
///
/// Returns [`FormatError::Misaligned`] if `bytes.len()` is not a multiple of 4.
pub fn s32le_to_s16(bytes: &[u8]) -> Result<Vec<i16>, FormatError> {
    // ---
    if bytes.len() % WIRE_BYTES_PER_SAMPLE != 0 {
        return Err(FormatError::Misaligned { len: bytes.len() });
    }

    Ok(bytes
        .chunks_exact(WIRE_BYTES_PER_SAMPLE)
        .map(|s| i16::from_le_bytes([s[2], s[3]]))
        .collect())
}

/// Checks that a frame holds a whole number of interleaved frames for `format`.
pub fn check_frame_alignment(len: usize, format: &AudioFormat) -> Result<(), FormatError> {
    // ---
    if len % WIRE_BYTES_PER_SAMPLE != 0 {
        return Err(FormatError::Misaligned { len });
    }

    let frame_bytes = format.wire_frame_bytes();
    if len % frame_bytes != 0 {
        return Err(FormatError::PartialFrame { len, frame_bytes });
    }

    Ok(())
}
