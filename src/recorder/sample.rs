//! Media samples flowing from capture sources into the writer coordinator

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::time::Duration;

/// Rational presentation time, `value / timescale` seconds.
///
/// Same shape as the CoreMedia time values delivered by ScreenCaptureKit so
/// capture adapters can hand timestamps through without rounding.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MediaTime {
    pub value: i64,
    pub timescale: i32,
}

impl MediaTime {
    pub const ZERO: MediaTime = MediaTime { value: 0, timescale: 1 };

    /// Marks a buffer whose timestamp could not be read
    pub const INVALID: MediaTime = MediaTime { value: 0, timescale: 0 };

    pub fn new(value: i64, timescale: i32) -> Self {
        Self { value, timescale }
    }

    pub fn from_seconds(seconds: f64, timescale: i32) -> Self {
        Self {
            value: (seconds * timescale as f64).round() as i64,
            timescale,
        }
    }

    /// Valid times have a positive timescale
    pub fn is_valid(&self) -> bool {
        self.timescale > 0
    }

    pub fn as_seconds(&self) -> f64 {
        if self.timescale <= 0 {
            return 0.0;
        }
        self.value as f64 / self.timescale as f64
    }

    /// Signed distance `self - earlier` in seconds
    pub fn seconds_since(&self, earlier: MediaTime) -> f64 {
        self.as_seconds() - earlier.as_seconds()
    }

    /// Non-negative elapsed duration since `earlier`, zero when `earlier` is later
    pub fn duration_since(&self, earlier: MediaTime) -> Duration {
        Duration::from_secs_f64(self.seconds_since(earlier).max(0.0))
    }

    // Cross-multiplied so differing timescales compare exactly.
    fn cross(&self, other: &MediaTime) -> (i128, i128) {
        (
            self.value as i128 * other.timescale as i128,
            other.value as i128 * self.timescale as i128,
        )
    }
}

impl PartialEq for MediaTime {
    fn eq(&self, other: &Self) -> bool {
        let (a, b) = self.cross(other);
        a == b
    }
}

impl Eq for MediaTime {}

impl PartialOrd for MediaTime {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MediaTime {
    fn cmp(&self, other: &Self) -> Ordering {
        let (a, b) = self.cross(other);
        a.cmp(&b)
    }
}

impl fmt::Display for MediaTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6}s ({}/{})", self.as_seconds(), self.value, self.timescale)
    }
}

/// Logical track a sample belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TrackKind {
    Video,
    SystemAudio,
    MicrophoneAudio,
}

impl TrackKind {
    /// Order in which tracks are marked finished during finalization
    pub const FINALIZE_ORDER: [TrackKind; 3] = [
        TrackKind::Video,
        TrackKind::SystemAudio,
        TrackKind::MicrophoneAudio,
    ];

    pub fn is_audio(&self) -> bool {
        !matches!(self, TrackKind::Video)
    }
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Video => write!(f, "video"),
            TrackKind::SystemAudio => write!(f, "system-audio"),
            TrackKind::MicrophoneAudio => write!(f, "microphone"),
        }
    }
}

/// One captured BGRA frame
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    /// Bytes per row, may include padding beyond `width * 4`
    pub bytes_per_row: u32,
    pub data: Vec<u8>,
}

impl VideoFrame {
    /// Pixel data with row padding removed
    pub fn packed(&self) -> std::borrow::Cow<'_, [u8]> {
        let row = self.width as usize * 4;
        let stride = self.bytes_per_row as usize;
        let height = self.height as usize;
        if stride == row || stride == 0 {
            let end = (row * height).min(self.data.len());
            return std::borrow::Cow::Borrowed(&self.data[..end]);
        }

        let mut packed = Vec::with_capacity(row * height);
        for y in 0..height {
            let start = y * stride;
            if start + row > self.data.len() {
                break;
            }
            packed.extend_from_slice(&self.data[start..start + row]);
        }
        std::borrow::Cow::Owned(packed)
    }
}

/// Interleaved 32-bit float PCM
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub sample_rate: u32,
    pub channels: u16,
    pub samples: Vec<f32>,
}

impl AudioChunk {
    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            return 0;
        }
        self.samples.len() / self.channels as usize
    }
}

#[derive(Debug, Clone)]
pub enum MediaPayload {
    Video(VideoFrame),
    Audio(AudioChunk),
}

/// Per-frame color extension metadata, only read for HDR diagnostics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColorAttachments {
    pub color_primaries: Option<String>,
    pub transfer_function: Option<String>,
    pub ycbcr_matrix: Option<String>,
}

/// Timestamped unit of media handed from a capture source to the coordinator
#[derive(Debug, Clone)]
pub struct SampleBuffer {
    pub kind: TrackKind,
    pub presentation_time: MediaTime,
    pub valid: bool,
    pub payload: MediaPayload,
    pub color: Option<ColorAttachments>,
}

impl SampleBuffer {
    pub fn video(presentation_time: MediaTime, frame: VideoFrame) -> Self {
        Self {
            kind: TrackKind::Video,
            presentation_time,
            valid: true,
            payload: MediaPayload::Video(frame),
            color: None,
        }
    }

    pub fn audio(kind: TrackKind, presentation_time: MediaTime, chunk: AudioChunk) -> Self {
        Self {
            kind,
            presentation_time,
            valid: true,
            payload: MediaPayload::Audio(chunk),
            color: None,
        }
    }

    pub fn with_color(mut self, color: ColorAttachments) -> Self {
        self.color = Some(color);
        self
    }

    pub fn invalid(mut self) -> Self {
        self.valid = false;
        self
    }

    /// A buffer is usable when flagged valid, carries a valid timestamp and
    /// a payload matching its track kind.
    pub fn is_valid(&self) -> bool {
        if !self.valid || !self.presentation_time.is_valid() {
            return false;
        }
        match (&self.payload, self.kind) {
            (MediaPayload::Video(frame), TrackKind::Video) => {
                frame.width > 0 && frame.height > 0 && !frame.data.is_empty()
            }
            (MediaPayload::Audio(chunk), kind) if kind.is_audio() => chunk.channels > 0,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_time_compares_across_timescales() {
        let a = MediaTime::new(1, 60);
        let b = MediaTime::new(1000, 60_000);
        assert_eq!(a, b);
        assert!(MediaTime::new(2, 60) > b);
        assert!((MediaTime::new(90, 60).seconds_since(MediaTime::new(30, 60)) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_duration_since_clamps_negative() {
        let early = MediaTime::new(10, 1);
        let late = MediaTime::new(12, 1);
        assert_eq!(early.duration_since(late), Duration::ZERO);
        assert_eq!(late.duration_since(early), Duration::from_secs(2));
    }

    #[test]
    fn test_packed_strips_row_padding() {
        let frame = VideoFrame {
            width: 1,
            height: 2,
            bytes_per_row: 8,
            data: vec![1, 2, 3, 4, 0, 0, 0, 0, 5, 6, 7, 8, 0, 0, 0, 0],
        };
        assert_eq!(frame.packed().as_ref(), &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_validity_checks_payload_kind() {
        let chunk = AudioChunk { sample_rate: 48_000, channels: 2, samples: vec![0.0; 4] };
        let audio_as_video = SampleBuffer {
            kind: TrackKind::Video,
            presentation_time: MediaTime::new(1, 1),
            valid: true,
            payload: MediaPayload::Audio(chunk.clone()),
            color: None,
        };
        assert!(!audio_as_video.is_valid());

        let audio = SampleBuffer::audio(TrackKind::SystemAudio, MediaTime::new(1, 1), chunk);
        assert!(audio.is_valid());
        assert!(!audio.clone().invalid().is_valid());

        let bad_time = SampleBuffer { presentation_time: MediaTime::new(1, 0), ..audio };
        assert!(!bad_time.is_valid());
    }
}
