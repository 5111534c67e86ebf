//! Streaming sample-rate conversion for the recording path.
//!
//! Linear interpolation between neighbouring frames, carried across chunk
//! boundaries so that a stream cut into arbitrary network-sized pieces
//! resamples exactly as if it were converted in one go. Positions are kept
//! as integers in units of `1 / to_rate` input frames, so the output length
//! does not drift over long recordings.

/// Stateful linear resampler for interleaved `i16` audio.
#[derive(Debug, Clone)]
pub struct LinearResampler {
    // ---
    from_rate: u64,
    to_rate: u64,
    channels: usize,

    /// Last input frame of the previous chunk
    last: Vec<i16>,

    /// Next output position, measured from `last` (or from the first input
    /// frame before anything was processed)
    position: u64,
}

impl LinearResampler {
    // ---
    pub fn new(from_rate: u32, to_rate: u32, channels: u16) -> Self {
        // ---
        Self {
            from_rate: from_rate.max(1) as u64,
            to_rate: to_rate.max(1) as u64,
            channels: channels.max(1) as usize,
            last: Vec::new(),
            position: 0,
        }
    }

    pub fn output_rate(&self) -> u32 {
        // ---
        self.to_rate as u32
    }

    /// Appends every output frame that `input` completes to `out`.
    ///
    /// Output at the very end of the input is held back until the next
    /// chunk (or [`flush`](Self::flush)) supplies the frame to interpolate
    /// towards.
    pub fn process(&mut self, input: &[i16], out: &mut Vec<i16>) {
        // ---
        let ch = self.channels;
        let frames_in = input.len() / ch;
        if frames_in == 0 {
            return;
        }

        let carried = usize::from(!self.last.is_empty());
        let total = frames_in + carried;

        loop {
            let idx = (self.position / self.to_rate) as usize;
            if idx + 1 >= total {
                break;
            }
            let frac = (self.position % self.to_rate) as i64;
            let a = frame(&self.last, input, carried, ch, idx);
            let b = frame(&self.last, input, carried, ch, idx + 1);
            for (&s0, &s1) in a.iter().zip(b) {
                let (s0, s1) = (s0 as i64, s1 as i64);
                out.push((s0 + (s1 - s0) * frac / self.to_rate as i64) as i16);
            }
            self.position += self.from_rate;
        }

        self.position -= (total as u64 - 1) * self.to_rate;
        self.last.clear();
        self.last.extend_from_slice(&input[(frames_in - 1) * ch..frames_in * ch]);
    }

    /// Emits the output that falls after the last input frame and resets.
    pub fn flush(&mut self, out: &mut Vec<i16>) {
        // ---
        if !self.last.is_empty() {
            while self.position < self.to_rate {
                out.extend_from_slice(&self.last);
                self.position += self.from_rate;
            }
        }
        self.last.clear();
        self.position = 0;
    }
}

/// Frame `idx` of the carried frame followed by `input`.
fn frame<'a>(
    last: &'a [i16],
    input: &'a [i16],
    carried: usize,
    ch: usize,
    idx: usize,
) -> &'a [i16] {
    // ---
    if idx < carried {
        last
    } else {
        let start = (idx - carried) * ch;
        &input[start..start + ch]
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn resample_all(resampler: &mut LinearResampler, input: &[i16], chunk: usize) -> Vec<i16> {
        let mut out = Vec::new();
        for piece in input.chunks(chunk) {
            resampler.process(piece, &mut out);
        }
        resampler.flush(&mut out);
        out
    }

    #[test]
    fn test_output_length_follows_rate_ratio() {
        // ---
        let input = vec![0i16; 44100 * 2];
        let mut resampler = LinearResampler::new(44100, 48000, 2);
        let out = resample_all(&mut resampler, &input, 882);
        assert_eq!(out.len(), 48000 * 2);
        assert_eq!(resampler.output_rate(), 48000);
    }

    #[test]
    fn test_chunking_does_not_change_output() {
        // ---
        let input: Vec<i16> = (0..4410).map(|i| (i * 7 % 3000) as i16).collect();

        let whole = resample_all(&mut LinearResampler::new(44100, 48000, 1), &input, input.len());
        let pieces = resample_all(&mut LinearResampler::new(44100, 48000, 1), &input, 37);
        assert_eq!(whole, pieces);
    }

    #[test]
    fn test_interpolates_between_frames() {
        // ---
        // Doubling the rate puts a midpoint between every input pair
        let mut resampler = LinearResampler::new(1, 2, 1);
        let out = resample_all(&mut resampler, &[0, 100, 200], 1);
        assert_eq!(out, vec![0, 50, 100, 150, 200, 200]);
    }

    #[test]
    fn test_channels_stay_interleaved() {
        // ---
        let mut resampler = LinearResampler::new(1, 2, 2);
        let out = resample_all(&mut resampler, &[0, -10, 100, -110], 4);
        assert_eq!(out, vec![0, -10, 50, -60, 100, -110, 100, -110]);
    }

    #[test]
    fn test_downsampling_skips_frames() {
        // ---
        let mut resampler = LinearResampler::new(2, 1, 1);
        let out = resample_all(&mut resampler, &[0, 1, 2, 3, 4, 5], 2);
        assert_eq!(out, vec![0, 2, 4]);
    }
}
