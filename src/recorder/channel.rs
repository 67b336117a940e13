//! Capture channel trait
//!
//! Defines the interface between capture sources (screen + system audio,
//! microphone) and the sink that consumes their sample buffers.

use super::sample::{SampleBuffer, TrackKind};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur during recording
#[derive(Error, Debug)]
pub enum RecordingError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Setup failed: {0}")]
    SetupFailure(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Capture stream failed: {0}")]
    StreamFailure(String),

    #[error("Writer failed: {0}")]
    WriterFailure(String),

    #[error("Telemetry failed: {0}")]
    TelemetryFailure(String),

    #[error("Timed out: {0}")]
    TimeoutFailure(String),

    #[error("Already recording")]
    AlreadyRecording,

    #[error("Not recording")]
    NotRecording,

    #[error("Track {0} was already marked finished")]
    TrackAlreadyFinished(TrackKind),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RecordingError {
    /// Stable code for display layers
    pub fn kind(&self) -> &'static str {
        match self {
            RecordingError::PermissionDenied(_) => "PERMISSION_DENIED",
            RecordingError::SetupFailure(_) | RecordingError::DeviceNotFound(_) => "SETUP_FAILURE",
            RecordingError::StreamFailure(_) => "STREAM_FAILURE",
            RecordingError::WriterFailure(_) | RecordingError::TrackAlreadyFinished(_) => {
                "WRITER_FAILURE"
            }
            RecordingError::TelemetryFailure(_) => "TELEMETRY_FAILURE",
            RecordingError::TimeoutFailure(_) => "TIMEOUT",
            RecordingError::AlreadyRecording | RecordingError::NotRecording => "INVALID_STATE",
            RecordingError::Io(_) => "IO_ERROR",
            RecordingError::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }

    /// Errors that must tear the recording down
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            RecordingError::TelemetryFailure(_) | RecordingError::TimeoutFailure(_)
        )
    }
}

/// Result type for recording operations
pub type RecordingResult<T> = Result<T, RecordingError>;

/// Consumer of sample buffers, injected into capture channels at start.
///
/// Both methods are called from capture-owned threads and must return
/// without blocking.
pub trait SampleSink: Send + Sync {
    /// Deliver one buffer from the given source track
    fn on_sample(&self, buffer: SampleBuffer, kind: TrackKind);

    /// Report that the source stopped with an error
    fn on_stream_error(&self, cause: RecordingError);
}

/// Types of capture channels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelType {
    /// Screen capture, optionally carrying system audio on the same stream
    Display,
    /// Microphone capture
    Microphone,
}

impl std::fmt::Display for ChannelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelType::Display => write!(f, "display"),
            ChannelType::Microphone => write!(f, "microphone"),
        }
    }
}

/// Trait for capture channels
///
/// Each channel wraps one OS capture source and pushes its buffers into the
/// sink it was started with. Channels are owned by the `Recorder`.
#[async_trait]
pub trait CaptureChannel: Send + Sync {
    /// Get the channel identifier (e.g., "display-1", "microphone")
    fn id(&self) -> &str;

    /// Get the channel type
    fn channel_type(&self) -> ChannelType;

    /// Tracks this channel produces
    fn tracks(&self) -> Vec<TrackKind>;

    /// Start delivering buffers to `sink`
    async fn start(&mut self, sink: Arc<dyn SampleSink>) -> RecordingResult<()>;

    /// Stop delivering buffers. Calling stop on a stopped channel is a no-op.
    async fn stop(&mut self) -> RecordingResult<()>;

    /// Check if the channel is currently delivering
    fn is_running(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(RecordingError::PermissionDenied("screen".into()).kind(), "PERMISSION_DENIED");
        assert_eq!(RecordingError::DeviceNotFound("mic".into()).kind(), "SETUP_FAILURE");
        assert_eq!(
            RecordingError::TrackAlreadyFinished(TrackKind::Video).kind(),
            "WRITER_FAILURE"
        );
    }

    #[test]
    fn test_soft_errors_are_not_fatal() {
        assert!(!RecordingError::TelemetryFailure("tap".into()).is_fatal());
        assert!(!RecordingError::TimeoutFailure("finalize".into()).is_fatal());
        assert!(RecordingError::StreamFailure("stopped".into()).is_fatal());
        assert!(RecordingError::WriterFailure("disk full".into()).is_fatal());
    }
}
