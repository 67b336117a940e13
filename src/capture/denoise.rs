//! External microphone denoiser
//!
//! The denoiser is an opaque binary invoked as `<bin> <input.wav> -o <dir>`.
//! It writes a file with the input's name into `dir`. A non-zero exit or a
//! missing output file is a failure; the raw recording is kept either way.

use crate::recorder::channel::{RecordingError, RecordingResult};
use std::path::{Path, PathBuf};
use tokio::process::Command;

/// Subdirectory next to the input that receives denoised files
pub const OUTPUT_DIR: &str = "denoised";

pub struct Denoiser {
    binary: PathBuf,
}

impl Denoiser {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn output_for(input: &Path) -> RecordingResult<PathBuf> {
        let name = input.file_name().ok_or_else(|| {
            RecordingError::SetupFailure(format!("{:?} has no file name", input))
        })?;
        let dir = input.parent().unwrap_or_else(|| Path::new("."));
        Ok(dir.join(OUTPUT_DIR).join(name))
    }

    /// Denoise `input`, returning the path of the cleaned file
    pub async fn run(&self, input: &Path) -> RecordingResult<PathBuf> {
        let output = Self::output_for(input)?;
        let out_dir = output.parent().unwrap_or_else(|| Path::new("."));
        tokio::fs::create_dir_all(out_dir).await?;

        tracing::info!("Denoising {:?} with {:?}", input, self.binary);
        let result = Command::new(&self.binary)
            .arg(input)
            .arg("-o")
            .arg(out_dir)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                RecordingError::SetupFailure(format!("failed to run {:?}: {}", self.binary, e))
            })?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(RecordingError::WriterFailure(format!(
                "denoiser exited with {}: {}",
                result.status,
                stderr.trim()
            )));
        }
        if !tokio::fs::try_exists(&output).await.unwrap_or(false) {
            return Err(RecordingError::WriterFailure(format!(
                "denoiser produced no {:?}",
                output
            )));
        }

        tracing::info!("Denoised microphone written to {:?}", output);
        Ok(output)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("denoise.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn test_output_lands_in_subdirectory() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("mic.wav");
        std::fs::write(&input, b"RIFF").unwrap();
        // $1 = input, $2 = -o, $3 = output dir
        let bin = script(dir.path(), r#"cp "$1" "$3/$(basename "$1")""#);

        let output = Denoiser::new(bin).run(&input).await.unwrap();
        assert_eq!(output, dir.path().join("denoised").join("mic.wav"));
        assert_eq!(std::fs::read(&output).unwrap(), b"RIFF");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_failure() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("mic.wav");
        std::fs::write(&input, b"RIFF").unwrap();
        let bin = script(dir.path(), "echo boom >&2; exit 3");

        let err = Denoiser::new(bin).run(&input).await.unwrap_err();
        assert!(err.to_string().contains("boom"));
        assert!(input.exists());
    }

    #[tokio::test]
    async fn test_missing_output_is_failure() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("mic.wav");
        std::fs::write(&input, b"RIFF").unwrap();
        let bin = script(dir.path(), "exit 0");

        assert!(Denoiser::new(bin).run(&input).await.is_err());
    }
}
