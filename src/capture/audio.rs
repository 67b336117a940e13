//! PCM sample helpers shared by the audio sources and writers
//!
//! Capture callbacks hand over interleaved or planar `f32` data in whatever
//! channel layout the device offers. Writers want interleaved stereo.

/// Apply a linear gain, clamping to the valid `[-1.0, 1.0]` range
pub fn apply_gain(samples: &mut [f32], gain: f32) {
    if (gain - 1.0).abs() < f32::EPSILON {
        return;
    }
    for sample in samples.iter_mut() {
        *sample = (*sample * gain).clamp(-1.0, 1.0);
    }
}

/// Convert interleaved samples with `channels` channels to interleaved stereo.
///
/// Mono is duplicated; layouts wider than stereo keep the first two channels.
pub fn to_stereo(samples: &[f32], channels: u16) -> Vec<f32> {
    match channels {
        0 => Vec::new(),
        1 => samples.iter().flat_map(|&s| [s, s]).collect(),
        2 => samples.to_vec(),
        n => samples
            .chunks_exact(n as usize)
            .flat_map(|frame| [frame[0], frame[1]])
            .collect(),
    }
}

/// Interleave planar channel buffers (`[L L L][R R R]` to `L R L R L R`)
pub fn interleave(planes: &[&[f32]]) -> Vec<f32> {
    let Some(frames) = planes.iter().map(|p| p.len()).min() else {
        return Vec::new();
    };
    let mut out = Vec::with_capacity(frames * planes.len());
    for i in 0..frames {
        for plane in planes {
            out.push(plane[i]);
        }
    }
    out
}

pub fn f32_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

pub fn i16_to_f32(sample: i16) -> f32 {
    sample as f32 / i16::MAX as f32
}

pub fn u16_to_f32(sample: u16) -> f32 {
    (sample as f32 / u16::MAX as f32) * 2.0 - 1.0
}

/// Streaming linear resampler for interleaved stereo.
///
/// Keeps the last input frame and the fractional read position between
/// calls so consecutive chunks resample as one continuous signal.
#[derive(Debug, Clone)]
pub struct StereoResampler {
    target_rate: u32,
    source_rate: u32,
    /// Next output position in source frames, relative to `previous`
    position: f64,
    previous: Option<[f32; 2]>,
}

impl StereoResampler {
    pub fn new(target_rate: u32) -> Self {
        Self {
            target_rate,
            source_rate: target_rate,
            position: 0.0,
            previous: None,
        }
    }

    pub fn target_rate(&self) -> u32 {
        self.target_rate
    }

    /// Resample interleaved stereo captured at `source_rate` to the target
    /// rate. A rate of zero is taken as already matching.
    pub fn process(&mut self, source_rate: u32, stereo: &[f32]) -> Vec<f32> {
        if source_rate == 0 || source_rate == self.target_rate || self.target_rate == 0 {
            self.source_rate = self.target_rate;
            self.previous = None;
            self.position = 0.0;
            return stereo.to_vec();
        }
        if source_rate != self.source_rate {
            tracing::debug!("Resampling {}Hz to {}Hz", source_rate, self.target_rate);
            self.source_rate = source_rate;
            self.previous = None;
            self.position = 0.0;
        }

        let previous = self.previous;
        let carried = usize::from(previous.is_some());
        let total = carried + stereo.len() / 2;
        if total == 0 {
            return Vec::new();
        }
        let frame = |index: usize| -> [f32; 2] {
            match (previous, index.checked_sub(carried)) {
                (Some(prev), None) => prev,
                (_, Some(i)) => [stereo[i * 2], stereo[i * 2 + 1]],
                (None, None) => [0.0, 0.0],
            }
        };

        let step = source_rate as f64 / self.target_rate as f64;
        let estimate = ((total as f64 - self.position) / step).ceil().max(0.0) as usize;
        let mut out = Vec::with_capacity(estimate * 2);
        let mut position = self.position;
        while position + 1.0 < total as f64 {
            let index = position.floor() as usize;
            let frac = (position - index as f64) as f32;
            let (a, b) = (frame(index), frame(index + 1));
            out.push(a[0] + (b[0] - a[0]) * frac);
            out.push(a[1] + (b[1] - a[1]) * frac);
            position += step;
        }

        self.previous = Some(frame(total - 1));
        self.position = position - (total - 1) as f64;
        out
    }
}

/// Decode little-endian `f32` bytes, ignoring a trailing partial sample
pub fn f32_from_le_bytes(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gain_clips() {
        let mut samples = vec![0.25, -0.25, 0.75, -0.9];
        apply_gain(&mut samples, 2.0);
        assert_eq!(samples, vec![0.5, -0.5, 1.0, -1.0]);
    }

    #[test]
    fn test_to_stereo_layouts() {
        assert_eq!(to_stereo(&[0.1, 0.2], 1), vec![0.1, 0.1, 0.2, 0.2]);
        assert_eq!(to_stereo(&[0.1, 0.2, 0.3, 0.4, 0.5, 0.6], 3), vec![0.1, 0.2, 0.4, 0.5]);
        assert!(to_stereo(&[0.1], 0).is_empty());
    }

    #[test]
    fn test_interleave_uses_shortest_plane() {
        let left = [1.0, 2.0, 3.0];
        let right = [-1.0, -2.0];
        assert_eq!(interleave(&[&left, &right]), vec![1.0, -1.0, 2.0, -2.0]);
    }

    #[test]
    fn test_integer_conversions() {
        assert_eq!(f32_to_i16(1.0), i16::MAX);
        assert_eq!(f32_to_i16(2.0), i16::MAX);
        assert_eq!(f32_to_i16(0.0), 0);
        assert!((u16_to_f32(0) + 1.0).abs() < 1e-6);
        assert!((i16_to_f32(i16::MAX) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_resampler_keeps_duration_across_chunks() {
        let mut resampler = StereoResampler::new(48_000);
        let chunk: Vec<f32> = (0..4_410)
            .flat_map(|i| {
                let s = (i as f32 / 4_410.0) - 0.5;
                [s, -s]
            })
            .collect();

        let mut frames = 0;
        for _ in 0..10 {
            frames += resampler.process(44_100, &chunk).len() / 2;
        }
        // One second of 44.1kHz input is one second at 48kHz
        assert!((47_990..=48_000).contains(&frames), "got {frames} frames");
    }

    #[test]
    fn test_resampler_interpolates_between_frames() {
        let mut resampler = StereoResampler::new(2);
        let out = resampler.process(1, &[0.0, 0.0, 1.0, -1.0]);
        assert_eq!(out, vec![0.0, 0.0, 0.5, -0.5]);
        // The carried frame joins the next chunk
        let out = resampler.process(1, &[0.0, 0.0]);
        assert_eq!(out, vec![1.0, -1.0, 0.5, -0.5]);
    }

    #[test]
    fn test_resampler_passes_matching_rate_through() {
        let mut resampler = StereoResampler::new(48_000);
        assert_eq!(resampler.process(48_000, &[0.1, 0.2]), vec![0.1, 0.2]);
        assert_eq!(resampler.process(0, &[0.3, 0.4]), vec![0.3, 0.4]);
    }

    #[test]
    fn test_le_bytes_ignore_partial_tail() {
        let mut bytes = 0.5f32.to_le_bytes().to_vec();
        bytes.push(0xff);
        assert_eq!(f32_from_le_bytes(&bytes), vec![0.5]);
    }
}
