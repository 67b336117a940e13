//! Recording state management
//!
//! Defines the recorder state machine, its configuration and the per-run
//! capture session.

use super::channel::{RecordingError, RecordingResult};
use crate::capture::traits::DisplayInfo;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

/// Current state of the recorder
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "state", content = "cause")]
pub enum RecorderState {
    /// No recording in progress
    #[default]
    Idle,
    /// Sources and writers are being set up
    Preparing,
    /// The first frame anchored the session
    Recording,
    /// Unrecoverable failure; a new start resets it
    Error(String),
}

impl RecorderState {
    /// Whether a start request should be ignored
    pub fn is_busy(&self) -> bool {
        matches!(self, RecorderState::Preparing | RecorderState::Recording)
    }
}

impl std::fmt::Display for RecorderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecorderState::Idle => write!(f, "idle"),
            RecorderState::Preparing => write!(f, "preparing"),
            RecorderState::Recording => write!(f, "recording"),
            RecorderState::Error(cause) => write!(f, "error: {}", cause),
        }
    }
}

/// On-disk format of the cursor/keyboard telemetry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TelemetryFormat {
    /// Incremental, flushed in batches
    #[default]
    Csv,
    /// Buffered in memory and written once on stop
    Json,
}

impl TelemetryFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            TelemetryFormat::Csv => "csv",
            TelemetryFormat::Json => "json",
        }
    }
}

/// Configuration for starting a recording
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RecordingConfig {
    /// Display to capture; the main display when unset
    pub display_id: Option<u32>,

    /// Where output files land; `$HOME/Downloads` when unset
    pub output_dir: Option<PathBuf>,

    pub fps: u32,

    pub hdr: bool,

    pub capture_system_audio: bool,

    pub capture_microphone: bool,

    /// Input device name; the default input when unset
    pub microphone_device: Option<String>,

    /// Linear gain applied in the microphone tap
    pub microphone_gain: f32,

    /// Write the microphone to its own WAV file instead of a second track
    pub separate_microphone_file: bool,

    /// Record cursor and keyboard telemetry
    pub track_input: bool,

    pub telemetry_format: TelemetryFormat,

    pub cursor_fps: u32,

    pub telemetry_batch_size: usize,

    pub telemetry_flush_interval_ms: u64,

    pub finalize_timeout_ms: u64,

    /// Buffers each writer track holds before reporting not-ready
    pub writer_queue_depth: usize,

    pub ffmpeg_path: String,

    pub video_codec: String,

    /// External denoiser run over the microphone file after stop
    pub denoiser_path: Option<PathBuf>,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            display_id: None,
            output_dir: None,
            fps: 60,
            hdr: false,
            capture_system_audio: true,
            capture_microphone: false,
            microphone_device: None,
            microphone_gain: 2.0,
            separate_microphone_file: true,
            track_input: true,
            telemetry_format: TelemetryFormat::Csv,
            cursor_fps: 30,
            telemetry_batch_size: 150,
            telemetry_flush_interval_ms: 5_000,
            finalize_timeout_ms: 3_000,
            writer_queue_depth: 8,
            ffmpeg_path: "ffmpeg".to_string(),
            video_codec: "libx264".to_string(),
            denoiser_path: None,
        }
    }
}

impl RecordingConfig {
    /// Load a JSON config file; missing fields take their defaults
    pub fn load(path: &Path) -> RecordingResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> RecordingResult<()> {
        if self.fps == 0 || self.cursor_fps == 0 {
            return Err(RecordingError::SetupFailure(
                "frame rates must be positive".to_string(),
            ));
        }
        if self.telemetry_batch_size == 0 {
            return Err(RecordingError::SetupFailure(
                "telemetry batch size must be positive".to_string(),
            ));
        }
        if !(self.microphone_gain.is_finite() && self.microphone_gain >= 0.0) {
            return Err(RecordingError::SetupFailure(format!(
                "invalid microphone gain {}",
                self.microphone_gain
            )));
        }
        Ok(())
    }

    pub fn finalize_timeout(&self) -> Duration {
        Duration::from_millis(self.finalize_timeout_ms)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.telemetry_flush_interval_ms)
    }

    /// Output directory, falling back to the user's Downloads folder
    pub fn resolved_output_dir(&self) -> RecordingResult<PathBuf> {
        if let Some(dir) = &self.output_dir {
            return Ok(dir.clone());
        }
        std::env::var_os("HOME")
            .map(|home| PathBuf::from(home).join("Downloads"))
            .ok_or_else(|| {
                RecordingError::SetupFailure("HOME is not set; no Downloads directory".to_string())
            })
    }

    /// Whether the microphone lands in its own WAV writer
    pub fn microphone_to_wav(&self) -> bool {
        self.capture_microphone && self.separate_microphone_file
    }
}

/// Filename stem for a recording started at `at`
pub fn file_stem(at: &DateTime<Local>) -> String {
    at.format("%Y-%m-%d-%H-%M-%S").to_string()
}

/// One recording run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureSession {
    pub id: Uuid,

    pub started_at: DateTime<Local>,

    pub video_path: PathBuf,

    /// Separate microphone file, when configured
    pub microphone_path: Option<PathBuf>,

    pub telemetry_path: Option<PathBuf>,

    pub display: DisplayInfo,

    pub fps: u32,

    pub sample_rate: u32,

    pub channels: u16,

    pub hdr: bool,
}

impl CaptureSession {
    pub fn new(config: &RecordingConfig, display: DisplayInfo) -> RecordingResult<Self> {
        Self::new_at(config, display, Local::now())
    }

    pub fn new_at(
        config: &RecordingConfig,
        display: DisplayInfo,
        started_at: DateTime<Local>,
    ) -> RecordingResult<Self> {
        let dir = config.resolved_output_dir()?;
        if !dir.is_dir() {
            return Err(RecordingError::SetupFailure(format!(
                "output directory {:?} does not exist",
                dir
            )));
        }

        let stem = file_stem(&started_at);
        let microphone_path = config
            .microphone_to_wav()
            .then(|| dir.join(format!("{stem}-microphone.wav")));
        let telemetry_path = config.track_input.then(|| {
            dir.join(format!(
                "{stem}-telemetry.{}",
                config.telemetry_format.extension()
            ))
        });

        Ok(Self {
            id: Uuid::new_v4(),
            started_at,
            video_path: dir.join(format!("{stem}.mp4")),
            microphone_path,
            telemetry_path,
            display,
            fps: config.fps,
            sample_rate: 48_000,
            channels: 2,
            hdr: config.hdr,
        })
    }
}

/// Files produced by a completed recording
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingOutput {
    pub video: Option<PathBuf>,
    pub microphone: Option<PathBuf>,
    /// Denoised copy of the microphone file
    pub denoised_microphone: Option<PathBuf>,
    pub telemetry: Option<PathBuf>,
    /// Finalization hit its timeout; files may be truncated
    pub timed_out: bool,
}

impl RecordingOutput {
    pub fn files(&self) -> Vec<&Path> {
        [
            &self.video,
            &self.microphone,
            &self.denoised_microphone,
            &self.telemetry,
        ]
        .into_iter()
        .filter_map(|p| p.as_deref())
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn display() -> DisplayInfo {
        DisplayInfo {
            id: 1,
            name: "Built-in".into(),
            width: 2880,
            height: 1800,
            screen_width: 1440.0,
            screen_height: 900.0,
            scale_factor: 2.0,
            is_primary: true,
        }
    }

    #[test]
    fn test_config_defaults_fill_missing_fields() {
        let config: RecordingConfig =
            serde_json::from_str(r#"{"fps": 30, "telemetryFormat": "json"}"#).unwrap();
        assert_eq!(config.fps, 30);
        assert_eq!(config.telemetry_format, TelemetryFormat::Json);
        assert_eq!(config.cursor_fps, 30);
        assert_eq!(config.telemetry_batch_size, 150);
        assert_eq!(config.microphone_gain, 2.0);
        assert_eq!(config.finalize_timeout(), Duration::from_secs(3));
    }

    #[test]
    fn test_load_rejects_zero_fps() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"fps": 0}"#).unwrap();
        let err = RecordingConfig::load(&path).unwrap_err();
        assert_eq!(err.kind(), "SETUP_FAILURE");

        std::fs::write(&path, "not json").unwrap();
        let err = RecordingConfig::load(&path).unwrap_err();
        assert_eq!(err.kind(), "SERIALIZATION_ERROR");
    }

    #[test]
    fn test_session_paths_are_timestamped() {
        let dir = tempfile::tempdir().unwrap();
        let config = RecordingConfig {
            output_dir: Some(dir.path().to_path_buf()),
            capture_microphone: true,
            ..Default::default()
        };
        let at = Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        let session = CaptureSession::new_at(&config, display(), at).unwrap();

        assert_eq!(session.video_path, dir.path().join("2024-03-09-14-05-07.mp4"));
        assert_eq!(
            session.microphone_path,
            Some(dir.path().join("2024-03-09-14-05-07-microphone.wav"))
        );
        assert_eq!(
            session.telemetry_path,
            Some(dir.path().join("2024-03-09-14-05-07-telemetry.csv"))
        );
    }

    #[test]
    fn test_missing_output_dir_is_setup_failure() {
        let dir = tempfile::tempdir().unwrap();
        let config = RecordingConfig {
            output_dir: Some(dir.path().join("missing")),
            ..Default::default()
        };
        let err = CaptureSession::new(&config, display()).unwrap_err();
        assert_eq!(err.kind(), "SETUP_FAILURE");
    }

    #[test]
    fn test_error_state_serializes_cause() {
        let json = serde_json::to_string(&RecorderState::Error("boom".into())).unwrap();
        assert_eq!(json, r#"{"state":"error","cause":"boom"}"#);
        assert!(RecorderState::Preparing.is_busy());
        assert!(!RecorderState::Error("x".into()).is_busy());
    }
}
