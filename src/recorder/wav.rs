//! Uncompressed microphone file writer

use super::channel::{RecordingError, RecordingResult};
use super::queue::{QueuedTrack, TrackReceiver};
use super::sample::{MediaPayload, MediaTime, TrackKind};
use super::writer::{
    AudioSettings, ContainerFormat, ContainerWriter, FinishCallback, TrackInput, WriterStatus,
};
use crate::capture::audio::{f32_to_i16, to_stereo, StereoResampler};
use parking_lot::Mutex;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

type WavFile = hound::WavWriter<BufWriter<File>>;

/// Single-track PCM WAV writer.
///
/// WAV has no timestamps: samples are written back to back in append order,
/// so the session origin only gates when appends may begin. Chunks captured
/// at another rate are resampled to the file's rate on the way in.
pub struct WavContainerWriter {
    path: PathBuf,
    settings: AudioSettings,
    status: Arc<AtomicU8>,
    error: Arc<Mutex<Option<String>>>,
    track: Arc<QueuedTrack>,
    receiver: Mutex<Option<TrackReceiver>>,
    worker: Mutex<Option<JoinHandle<Result<WavFile, String>>>>,
    session: Mutex<Option<MediaTime>>,
    frames_written: Arc<AtomicU64>,
}

impl WavContainerWriter {
    pub fn new(path: PathBuf, settings: AudioSettings, queue_depth: usize) -> Self {
        let status = Arc::new(AtomicU8::new(WriterStatus::NotStarted.to_u8()));
        let (track, receiver) =
            QueuedTrack::new(TrackKind::MicrophoneAudio, queue_depth, status.clone());
        Self {
            path,
            settings,
            status,
            error: Arc::new(Mutex::new(None)),
            track,
            receiver: Mutex::new(Some(receiver)),
            worker: Mutex::new(None),
            session: Mutex::new(None),
            frames_written: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Stereo frames written so far
    pub fn frames_written(&self) -> u64 {
        self.frames_written.load(Ordering::Relaxed)
    }

    fn spec(&self) -> hound::WavSpec {
        hound::WavSpec {
            channels: self.settings.channels,
            sample_rate: self.settings.sample_rate,
            bits_per_sample: self.settings.bits_per_sample,
            sample_format: hound::SampleFormat::Int,
        }
    }
}

fn pump(
    mut wav: WavFile,
    rx: TrackReceiver,
    mut resampler: StereoResampler,
    frames: Arc<AtomicU64>,
    status: Arc<AtomicU8>,
) -> Result<WavFile, String> {
    while let Some(buffer) = rx.recv() {
        let MediaPayload::Audio(chunk) = &buffer.payload else {
            continue;
        };
        let stereo = resampler.process(
            chunk.sample_rate,
            &to_stereo(&chunk.samples, chunk.channels),
        );
        for &sample in &stereo {
            if let Err(e) = wav.write_sample(f32_to_i16(sample)) {
                status.store(WriterStatus::Failed.to_u8(), Ordering::SeqCst);
                return Err(format!("writing microphone sample: {e}"));
            }
        }
        frames.fetch_add((stereo.len() / 2) as u64, Ordering::Relaxed);
    }
    Ok(wav)
}

impl ContainerWriter for WavContainerWriter {
    fn output_path(&self) -> &Path {
        &self.path
    }

    fn format(&self) -> ContainerFormat {
        ContainerFormat::Wav
    }

    fn status(&self) -> WriterStatus {
        WriterStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    fn error(&self) -> Option<String> {
        self.error.lock().clone()
    }

    fn inputs(&self) -> Vec<Arc<dyn TrackInput>> {
        vec![self.track.clone()]
    }

    fn start_writing(&self) -> RecordingResult<()> {
        let mut receiver = self.receiver.lock();
        if receiver.is_none() {
            return Err(RecordingError::SetupFailure(format!(
                "writer for {:?} already started",
                self.path
            )));
        }
        let wav = hound::WavWriter::create(&self.path, self.spec()).map_err(|e| {
            RecordingError::SetupFailure(format!("creating {:?}: {}", self.path, e))
        })?;
        let Some(rx) = receiver.take() else {
            return Err(RecordingError::SetupFailure("microphone track missing".to_string()));
        };
        drop(receiver);

        let frames = self.frames_written.clone();
        let status = self.status.clone();
        let resampler = StereoResampler::new(self.settings.sample_rate);
        let handle = std::thread::Builder::new()
            .name("wav-microphone".into())
            .spawn(move || pump(wav, rx, resampler, frames, status))?;

        *self.worker.lock() = Some(handle);
        self.status.store(WriterStatus::Writing.to_u8(), Ordering::SeqCst);
        tracing::info!(
            "Started WAV writer {:?}: {}Hz {}ch {}-bit",
            self.path,
            self.settings.sample_rate,
            self.settings.channels,
            self.settings.bits_per_sample
        );
        Ok(())
    }

    fn start_session(&self, at: MediaTime) -> RecordingResult<()> {
        let mut session = self.session.lock();
        if session.is_some() {
            return Err(RecordingError::WriterFailure("session already started".to_string()));
        }
        *session = Some(at);
        Ok(())
    }

    fn finish_writing(&self, on_complete: FinishCallback) {
        let status = self.status();
        if status != WriterStatus::Writing {
            on_complete(status);
            return;
        }
        self.track.close();
        let Some(worker) = self.worker.lock().take() else {
            on_complete(WriterStatus::Failed);
            return;
        };

        let status_cell = self.status.clone();
        let error = self.error.clone();
        let path = self.path.clone();
        let frames = self.frames_written.clone();
        let spawned = std::thread::Builder::new()
            .name("wav-finish".into())
            .spawn(move || {
                let result = match worker.join() {
                    Ok(Ok(wav)) => wav.finalize().map_err(|e| format!("finalizing WAV: {e}")),
                    Ok(Err(e)) => Err(e),
                    Err(_) => Err("microphone writer thread panicked".to_string()),
                };
                let final_status = match result {
                    Ok(()) => {
                        tracing::info!(
                            "Microphone file finished: {} frames, {:?}",
                            frames.load(Ordering::Relaxed),
                            path
                        );
                        WriterStatus::Finished
                    }
                    Err(e) => {
                        tracing::error!("Microphone file {:?} failed: {}", path, e);
                        *error.lock() = Some(e);
                        WriterStatus::Failed
                    }
                };
                status_cell.store(final_status.to_u8(), Ordering::SeqCst);
                on_complete(final_status);
            });
        if let Err(e) = spawned {
            tracing::error!("Could not spawn WAV finish thread: {}", e);
            self.status.store(WriterStatus::Failed.to_u8(), Ordering::SeqCst);
        }
    }

    fn cancel_writing(&self) {
        self.track.close();
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
        let _ = std::fs::remove_file(&self.path);
        self.status.store(WriterStatus::Cancelled.to_u8(), Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::sample::{AudioChunk, SampleBuffer};
    use std::sync::mpsc;
    use std::time::Duration;

    fn chunk(value: i64, channels: u16, samples: Vec<f32>) -> SampleBuffer {
        chunk_at_rate(value, 48_000, channels, samples)
    }

    fn chunk_at_rate(value: i64, rate: u32, channels: u16, samples: Vec<f32>) -> SampleBuffer {
        SampleBuffer::audio(
            TrackKind::MicrophoneAudio,
            MediaTime::new(value, rate as i32),
            AudioChunk {
                sample_rate: rate,
                channels,
                samples,
            },
        )
    }

    fn finish(writer: &WavContainerWriter) -> WriterStatus {
        let (tx, rx) = mpsc::channel();
        writer.finish_writing(Box::new(move |status| {
            let _ = tx.send(status);
        }));
        rx.recv_timeout(Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_writes_stereo_pcm16() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mic.wav");
        let writer = WavContainerWriter::new(path.clone(), AudioSettings::pcm_wav(), 16);

        writer.start_writing().unwrap();
        writer.start_session(MediaTime::new(0, 48_000)).unwrap();
        let input = writer.inputs().remove(0);
        assert!(input.is_ready_for_more_media_data());
        input.append(chunk(0, 1, vec![0.5; 480])).unwrap();
        input.append(chunk(480, 2, vec![-0.5; 960])).unwrap();

        assert_eq!(finish(&writer), WriterStatus::Finished);
        assert_eq!(writer.frames_written(), 960);

        let reader = hound::WavReader::open(&path).unwrap();
        let spec = reader.spec();
        assert_eq!(spec.channels, 2);
        assert_eq!(spec.sample_rate, 48_000);
        assert_eq!(spec.bits_per_sample, 16);
        assert_eq!(reader.duration(), 960);
    }

    #[test]
    fn test_44_1khz_capture_keeps_its_duration() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mic.wav");
        let writer = WavContainerWriter::new(path.clone(), AudioSettings::pcm_wav(), 32);

        writer.start_writing().unwrap();
        writer.start_session(MediaTime::new(0, 44_100)).unwrap();
        let input = writer.inputs().remove(0);
        // One second of stereo at 44.1kHz in ten callbacks
        for i in 0..10 {
            input
                .append(chunk_at_rate(i * 4_410, 44_100, 2, vec![0.25; 8_820]))
                .unwrap();
        }

        assert_eq!(finish(&writer), WriterStatus::Finished);
        let reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().sample_rate, 48_000);
        let seconds = reader.duration() as f64 / 48_000.0;
        assert!((seconds - 1.0).abs() < 0.001, "1s of capture plays back as {seconds}s");
        assert_eq!(writer.frames_written(), reader.duration() as u64);
    }

    #[test]
    fn test_second_session_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let writer =
            WavContainerWriter::new(dir.path().join("mic.wav"), AudioSettings::pcm_wav(), 4);
        writer.start_writing().unwrap();
        writer.start_session(MediaTime::ZERO).unwrap();
        assert!(writer.start_session(MediaTime::ZERO).is_err());
        assert_eq!(finish(&writer), WriterStatus::Finished);
    }

    #[test]
    fn test_cancel_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mic.wav");
        let writer = WavContainerWriter::new(path.clone(), AudioSettings::pcm_wav(), 4);
        writer.start_writing().unwrap();
        assert!(path.exists());

        writer.cancel_writing();
        assert_eq!(writer.status(), WriterStatus::Cancelled);
        assert!(!path.exists());
        assert!(!writer.inputs()[0].is_ready_for_more_media_data());
    }

    #[test]
    fn test_missing_directory_fails_setup() {
        let writer = WavContainerWriter::new(
            PathBuf::from("/nonexistent/dir/mic.wav"),
            AudioSettings::pcm_wav(),
            4,
        );
        let err = writer.start_writing().unwrap_err();
        assert_eq!(err.kind(), "SETUP_FAILURE");
    }
}
