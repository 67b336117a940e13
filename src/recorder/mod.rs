//! Recording pipeline
//!
//! Capture sources push timestamped sample buffers into a writer coordinator,
//! which anchors one session across every container writer and finalizes
//! them together. The `Recorder` state machine drives the whole run.

pub mod barrier;
pub mod channel;
pub mod controller;
pub mod coordinator;
pub mod ffmpeg;
pub mod queue;
pub mod sample;
pub mod state;
pub mod wav;
pub mod writer;

#[cfg(test)]
mod testing;

pub use channel::{CaptureChannel, ChannelType, RecordingError, RecordingResult, SampleSink};
pub use controller::{default_writers, CaptureBackend, Recorder, RecorderEvent};
pub use coordinator::{DropStats, FinalizeOutcome, WriterCoordinator};
pub use sample::{MediaTime, SampleBuffer, TrackKind};
pub use state::{CaptureSession, RecorderState, RecordingConfig, RecordingOutput, TelemetryFormat};
