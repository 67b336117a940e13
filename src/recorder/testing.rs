//! In-memory writers and sources shared by the recorder tests

use super::channel::{
    CaptureChannel, ChannelType, RecordingError, RecordingResult, SampleSink,
};
use super::sample::{AudioChunk, MediaTime, SampleBuffer, TrackKind, VideoFrame};
use super::writer::{ContainerFormat, ContainerWriter, FinishCallback, TrackInput, WriterStatus};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub fn video_at(value: i64) -> SampleBuffer {
    SampleBuffer::video(
        MediaTime::new(value, 60),
        VideoFrame {
            width: 2,
            height: 2,
            bytes_per_row: 8,
            data: vec![0; 16],
        },
    )
}

pub fn audio_at(kind: TrackKind, value: i64) -> SampleBuffer {
    SampleBuffer::audio(
        kind,
        MediaTime::new(value, 60),
        AudioChunk {
            sample_rate: 48_000,
            channels: 2,
            samples: vec![0.0; 1600],
        },
    )
}

pub struct FakeInput {
    kind: TrackKind,
    pub ready: AtomicBool,
    pub fail_appends: AtomicBool,
    finished: AtomicBool,
    pub appended: Mutex<Vec<MediaTime>>,
    /// Appends that arrived after `mark_as_finished`
    pub appended_after_finish: AtomicUsize,
    writer_status: Arc<AtomicU8>,
}

impl FakeInput {
    pub fn appended_count(&self) -> usize {
        self.appended.lock().len()
    }
}

impl TrackInput for FakeInput {
    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn is_ready_for_more_media_data(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn append(&self, buffer: SampleBuffer) -> RecordingResult<()> {
        if self.fail_appends.load(Ordering::SeqCst) {
            self.writer_status
                .store(WriterStatus::Failed.to_u8(), Ordering::SeqCst);
            return Err(RecordingError::WriterFailure("disk full".into()));
        }
        if self.finished.load(Ordering::SeqCst) {
            self.appended_after_finish.fetch_add(1, Ordering::SeqCst);
        }
        self.appended.lock().push(buffer.presentation_time);
        Ok(())
    }

    fn mark_as_finished(&self) -> RecordingResult<()> {
        if self.finished.swap(true, Ordering::SeqCst) {
            return Err(RecordingError::TrackAlreadyFinished(self.kind));
        }
        Ok(())
    }

    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishBehavior {
    Complete,
    Hang,
    Fail,
}

pub struct FakeWriter {
    path: PathBuf,
    format: ContainerFormat,
    status: Arc<AtomicU8>,
    pub inputs: Vec<Arc<FakeInput>>,
    pub sessions: Mutex<Vec<MediaTime>>,
    pub finish_calls: AtomicUsize,
    pub cancelled: AtomicBool,
    behavior: FinishBehavior,
    // Callbacks held by hanging writers so they are never dropped mid-test
    parked: Mutex<Vec<FinishCallback>>,
}

impl FakeWriter {
    pub fn new(path: &str, kinds: &[TrackKind], behavior: FinishBehavior) -> Arc<Self> {
        let status = Arc::new(AtomicU8::new(WriterStatus::NotStarted.to_u8()));
        let inputs = kinds
            .iter()
            .map(|&kind| {
                Arc::new(FakeInput {
                    kind,
                    ready: AtomicBool::new(true),
                    fail_appends: AtomicBool::new(false),
                    finished: AtomicBool::new(false),
                    appended: Mutex::new(Vec::new()),
                    appended_after_finish: AtomicUsize::new(0),
                    writer_status: status.clone(),
                })
            })
            .collect();
        let format = if kinds == [TrackKind::MicrophoneAudio].as_slice() {
            ContainerFormat::Wav
        } else {
            ContainerFormat::Mpeg4
        };
        Arc::new(Self {
            path: PathBuf::from(path),
            format,
            status,
            inputs,
            sessions: Mutex::new(Vec::new()),
            finish_calls: AtomicUsize::new(0),
            cancelled: AtomicBool::new(false),
            behavior,
            parked: Mutex::new(Vec::new()),
        })
    }

    pub fn input(&self, kind: TrackKind) -> Arc<FakeInput> {
        self.inputs
            .iter()
            .find(|i| i.kind == kind)
            .cloned()
            .expect("fake writer has no input of that kind")
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }
}

impl ContainerWriter for FakeWriter {
    fn output_path(&self) -> &Path {
        &self.path
    }

    fn format(&self) -> ContainerFormat {
        self.format
    }

    fn status(&self) -> WriterStatus {
        WriterStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    fn error(&self) -> Option<String> {
        (self.status() == WriterStatus::Failed).then(|| "fake failure".to_string())
    }

    fn inputs(&self) -> Vec<Arc<dyn TrackInput>> {
        self.inputs
            .iter()
            .map(|i| i.clone() as Arc<dyn TrackInput>)
            .collect()
    }

    fn start_writing(&self) -> RecordingResult<()> {
        self.status
            .store(WriterStatus::Writing.to_u8(), Ordering::SeqCst);
        Ok(())
    }

    fn start_session(&self, at: MediaTime) -> RecordingResult<()> {
        self.sessions.lock().push(at);
        Ok(())
    }

    fn finish_writing(&self, on_complete: FinishCallback) {
        self.finish_calls.fetch_add(1, Ordering::SeqCst);
        match self.behavior {
            FinishBehavior::Complete => {
                let status = self.status.clone();
                std::thread::spawn(move || {
                    std::thread::sleep(Duration::from_millis(20));
                    status.store(WriterStatus::Finished.to_u8(), Ordering::SeqCst);
                    on_complete(WriterStatus::Finished);
                });
            }
            FinishBehavior::Fail => {
                self.status
                    .store(WriterStatus::Failed.to_u8(), Ordering::SeqCst);
                on_complete(WriterStatus::Failed);
            }
            FinishBehavior::Hang => self.parked.lock().push(on_complete),
        }
    }

    fn cancel_writing(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.status
            .store(WriterStatus::Cancelled.to_u8(), Ordering::SeqCst);
    }
}

/// Source that emits a scripted list of buffers when started
pub struct ScriptedChannel {
    id: String,
    channel_type: ChannelType,
    script: Vec<SampleBuffer>,
    pub fail_start: bool,
    pub stop_calls: Arc<AtomicUsize>,
    running: bool,
    pub sink: Arc<Mutex<Option<Arc<dyn SampleSink>>>>,
}

impl ScriptedChannel {
    pub fn new(channel_type: ChannelType, script: Vec<SampleBuffer>) -> Self {
        Self {
            id: channel_type.to_string(),
            channel_type,
            script,
            fail_start: false,
            stop_calls: Arc::new(AtomicUsize::new(0)),
            running: false,
            sink: Arc::new(Mutex::new(None)),
        }
    }
}

#[async_trait]
impl CaptureChannel for ScriptedChannel {
    fn id(&self) -> &str {
        &self.id
    }

    fn channel_type(&self) -> ChannelType {
        self.channel_type
    }

    fn tracks(&self) -> Vec<TrackKind> {
        match self.channel_type {
            ChannelType::Display => vec![TrackKind::Video, TrackKind::SystemAudio],
            ChannelType::Microphone => vec![TrackKind::MicrophoneAudio],
        }
    }

    async fn start(&mut self, sink: Arc<dyn SampleSink>) -> RecordingResult<()> {
        if self.fail_start {
            return Err(RecordingError::DeviceNotFound(format!("{} unavailable", self.id)));
        }
        for buffer in self.script.drain(..) {
            let kind = buffer.kind;
            sink.on_sample(buffer, kind);
        }
        *self.sink.lock() = Some(sink);
        self.running = true;
        Ok(())
    }

    async fn stop(&mut self) -> RecordingResult<()> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.running = false;
        self.sink.lock().take();
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running
    }
}
