//! Container writer abstraction
//!
//! A `ContainerWriter` owns one output file and its `TrackInput`s. The
//! lifecycle follows the platform asset-writer model: `start_writing`,
//! then exactly one `start_session`, then appends, then an asynchronous
//! `finish_writing` whose completion the caller waits on.

use super::channel::RecordingResult;
use super::sample::{MediaTime, SampleBuffer, TrackKind};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

/// Writing status of a container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WriterStatus {
    NotStarted,
    Writing,
    Finished,
    Failed,
    Cancelled,
}

impl WriterStatus {
    pub(crate) fn to_u8(self) -> u8 {
        match self {
            WriterStatus::NotStarted => 0,
            WriterStatus::Writing => 1,
            WriterStatus::Finished => 2,
            WriterStatus::Failed => 3,
            WriterStatus::Cancelled => 4,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => WriterStatus::Writing,
            2 => WriterStatus::Finished,
            3 => WriterStatus::Failed,
            4 => WriterStatus::Cancelled,
            _ => WriterStatus::NotStarted,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ContainerFormat {
    Mpeg4,
    QuickTime,
    Wav,
}

impl ContainerFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ContainerFormat::Mpeg4 => "mp4",
            ContainerFormat::QuickTime => "mov",
            ContainerFormat::Wav => "wav",
        }
    }
}

/// Callback invoked once when an asynchronous finish completes
pub type FinishCallback = Box<dyn FnOnce(WriterStatus) + Send + 'static>;

/// One track of one container.
///
/// `append` must never block: implementations either accept the buffer into
/// their own bounded buffering or return an error.
pub trait TrackInput: Send + Sync {
    fn kind(&self) -> TrackKind;

    /// Time-varying readiness, queried before every append
    fn is_ready_for_more_media_data(&self) -> bool;

    fn append(&self, buffer: SampleBuffer) -> RecordingResult<()>;

    /// One-way transition. A second call returns `TrackAlreadyFinished`.
    fn mark_as_finished(&self) -> RecordingResult<()>;

    fn is_finished(&self) -> bool;
}

pub trait ContainerWriter: Send + Sync {
    fn output_path(&self) -> &Path;

    fn format(&self) -> ContainerFormat;

    fn status(&self) -> WriterStatus;

    /// Last error reported by the writer, if any
    fn error(&self) -> Option<String>;

    fn inputs(&self) -> Vec<Arc<dyn TrackInput>>;

    /// Move from `NotStarted` to `Writing`
    fn start_writing(&self) -> RecordingResult<()>;

    /// Anchor the timeline. Called exactly once, after `start_writing` and
    /// before any append.
    fn start_session(&self, at: MediaTime) -> RecordingResult<()>;

    /// Begin asynchronous finalization; `on_complete` fires once with the
    /// terminal status. Only valid while `Writing`.
    fn finish_writing(&self, on_complete: FinishCallback);

    /// Abandon the file without finalizing
    fn cancel_writing(&self);
}

/// Video encoder settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoSettings {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub hdr: bool,
    pub codec: String,
}

impl VideoSettings {
    pub const SDR_ENCODER_FACTOR: f64 = 0.9;
    pub const HDR_ENCODER_FACTOR: f64 = 1.2;

    pub fn encoder_factor(&self) -> f64 {
        if self.hdr {
            Self::HDR_ENCODER_FACTOR
        } else {
            Self::SDR_ENCODER_FACTOR
        }
    }

    /// Average bitrate in bits per second: width × height × (fps / 8) × factor
    pub fn bitrate(&self) -> u64 {
        let pixels = self.width as f64 * self.height as f64;
        (pixels * (self.fps as f64 / 8.0) * self.encoder_factor()).round() as u64
    }
}

/// Audio track settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioSettings {
    pub sample_rate: u32,
    pub channels: u16,
    /// Encoded bitrate for compressed tracks
    pub bitrate: u32,
    /// Sample width for PCM tracks
    pub bits_per_sample: u16,
}

impl AudioSettings {
    /// AAC system-audio track of the screen container
    pub const fn aac() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 2,
            bitrate: 256_000,
            bits_per_sample: 32,
        }
    }

    /// Uncompressed microphone file
    pub const fn pcm_wav() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 2,
            bitrate: 0,
            bits_per_sample: 16,
        }
    }
}
