//! Recorder state machine
//!
//! `Recorder` gates the capture sources, the writer coordinator and the
//! telemetry collector behind `idle → preparing → recording → idle`. Any
//! stream or writer fault runs the same teardown as an explicit stop and
//! leaves the recorder in `Error` with whatever files were produced.

use super::channel::{CaptureChannel, RecordingError, RecordingResult, SampleSink};
use super::coordinator::{
    CoordinatorObserver, CoordinatorOptions, DropStats, FinalizeOutcome, WriterCoordinator,
};
use super::ffmpeg::{ffmpeg_available, FfmpegContainerWriter, FfmpegWriterConfig};
use super::sample::{MediaTime, TrackKind};
use super::state::{CaptureSession, RecorderState, RecordingConfig, RecordingOutput};
use super::wav::WavContainerWriter;
use super::writer::{AudioSettings, ContainerFormat, ContainerWriter, VideoSettings};
use crate::capture::denoise::Denoiser;
use crate::capture::input::{
    InputProbe, KeyboardTap, RecordingInfo, TelemetryCollector, TelemetryOptions,
    TimelineAnchor,
};
use crate::capture::traits::{DisplayInfo, Permission};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;

/// How often the watchdog polls writer status between faults
const WRITER_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Platform services the recorder is built on
#[async_trait]
pub trait CaptureBackend: Send + Sync {
    fn has_permission(&self, permission: Permission) -> bool;

    /// Resolve the display to capture; the main display when `id` is unset
    async fn display(&self, id: Option<u32>) -> RecordingResult<DisplayInfo>;

    /// Create (not start) the capture sources for a session
    async fn open_sources(
        &self,
        config: &RecordingConfig,
        session: &CaptureSession,
    ) -> RecordingResult<Vec<Box<dyn CaptureChannel>>>;

    /// Create the container writers for a session
    fn open_writers(
        &self,
        config: &RecordingConfig,
        session: &CaptureSession,
    ) -> RecordingResult<Vec<Arc<dyn ContainerWriter>>> {
        default_writers(config, session)
    }

    fn input_probe(&self) -> Option<Arc<dyn InputProbe>>;

    fn keyboard_tap(&self) -> Option<Box<dyn KeyboardTap>>;
}

/// MPEG-4 screen writer plus, when configured, a separate WAV microphone
pub fn default_writers(
    config: &RecordingConfig,
    session: &CaptureSession,
) -> RecordingResult<Vec<Arc<dyn ContainerWriter>>> {
    if !ffmpeg_available(&config.ffmpeg_path) {
        return Err(RecordingError::SetupFailure(format!(
            "{} not found. Please install FFmpeg.",
            config.ffmpeg_path
        )));
    }

    let mut audio_tracks = Vec::new();
    if config.capture_system_audio {
        audio_tracks.push(TrackKind::SystemAudio);
    }
    if config.capture_microphone && !config.separate_microphone_file {
        audio_tracks.push(TrackKind::MicrophoneAudio);
    }

    let screen = FfmpegContainerWriter::new(FfmpegWriterConfig {
        ffmpeg: config.ffmpeg_path.clone(),
        output: session.video_path.clone(),
        format: ContainerFormat::Mpeg4,
        video: VideoSettings {
            width: session.display.width,
            height: session.display.height,
            fps: session.fps,
            hdr: session.hdr,
            codec: config.video_codec.clone(),
        },
        audio_tracks,
        audio: AudioSettings::aac(),
        queue_depth: config.writer_queue_depth,
    });

    let mut writers: Vec<Arc<dyn ContainerWriter>> = vec![Arc::new(screen)];
    if let Some(path) = &session.microphone_path {
        writers.push(Arc::new(WavContainerWriter::new(
            path.clone(),
            AudioSettings::pcm_wav(),
            config.writer_queue_depth * 8,
        )));
    }
    Ok(writers)
}

/// Push notifications for observers of the recorder
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase", tag = "type", content = "payload")]
pub enum RecorderEvent {
    StateChanged(RecorderState),
    SessionStarted(MediaTime),
    /// Telemetry is missing or partial; the recording continues
    TelemetryDegraded(String),
    Stopped(RecordingOutput),
}

struct ActiveRecording {
    generation: u64,
    config: RecordingConfig,
    session: CaptureSession,
    coordinator: Arc<WriterCoordinator>,
    sources: Vec<Box<dyn CaptureChannel>>,
    telemetry: Option<TelemetryCollector>,
    watchdog: Option<JoinHandle<()>>,
}

struct Inner {
    backend: Arc<dyn CaptureBackend>,
    state: parking_lot::Mutex<RecorderState>,
    events: broadcast::Sender<RecorderEvent>,
    active: Mutex<Option<ActiveRecording>>,
    generation: AtomicU64,
}

impl Inner {
    fn emit(&self, event: RecorderEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    // Events are sent under the state lock so subscribers see transitions
    // in the order they were applied.
    fn set_state(&self, next: RecorderState) {
        let mut state = self.state.lock();
        if *state == next {
            return;
        }
        tracing::info!("Recorder state: {} -> {}", *state, next);
        *state = next.clone();
        self.emit(RecorderEvent::StateChanged(next));
    }

    /// Compare-and-set: moves `from` to `to` only while `generation` is the
    /// current attempt and the state is still `from`.
    fn transition(&self, generation: u64, from: &RecorderState, to: RecorderState) -> bool {
        let mut state = self.state.lock();
        if *state != *from || self.generation.load(Ordering::SeqCst) != generation {
            return false;
        }
        tracing::info!("Recorder state: {} -> {}", *state, to);
        *state = to.clone();
        self.emit(RecorderEvent::StateChanged(to));
        true
    }
}

/// Bridges coordinator notifications from producer threads
struct SessionObserver {
    generation: u64,
    inner: Weak<Inner>,
    faults: mpsc::UnboundedSender<RecordingError>,
    anchor: Arc<TimelineAnchor>,
}

impl CoordinatorObserver for SessionObserver {
    fn session_started(&self, origin: MediaTime) {
        self.anchor.mark();
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        if inner.generation.load(Ordering::SeqCst) != self.generation {
            return;
        }
        inner.emit(RecorderEvent::SessionStarted(origin));
        if !inner.transition(self.generation, &RecorderState::Preparing, RecorderState::Recording)
        {
            tracing::debug!("Session started after the attempt moved on");
        }
    }

    fn fault(&self, error: RecordingError) {
        let _ = self.faults.send(error);
    }
}

#[derive(Clone)]
pub struct Recorder {
    inner: Arc<Inner>,
}

impl Recorder {
    pub fn new(backend: Arc<dyn CaptureBackend>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                backend,
                state: parking_lot::Mutex::new(RecorderState::Idle),
                events,
                active: Mutex::new(None),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn state(&self) -> RecorderState {
        self.inner.state.lock().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RecorderEvent> {
        self.inner.events.subscribe()
    }

    /// The running session, if any
    pub async fn session(&self) -> Option<CaptureSession> {
        self.inner
            .active
            .lock()
            .await
            .as_ref()
            .map(|r| r.session.clone())
    }

    pub async fn drop_stats(&self) -> Option<DropStats> {
        self.inner
            .active
            .lock()
            .await
            .as_ref()
            .map(|r| r.coordinator.drop_stats())
    }

    /// Start a recording. A no-op while preparing or recording.
    ///
    /// Setup and permission failures are returned and leave the recorder in
    /// `Error`; a later start always begins from scratch.
    pub async fn start(&self, config: RecordingConfig) -> RecordingResult<()> {
        let mut active = self.inner.active.lock().await;
        if self.state().is_busy() {
            tracing::debug!("Start ignored while {}", self.state());
            return Ok(());
        }

        // Bump the generation first so observers of an older attempt can
        // never promote this one.
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.set_state(RecorderState::Preparing);

        match self.prepare(config, generation).await {
            Ok(recording) => {
                tracing::info!(
                    "Recording {} started: {:?}",
                    recording.session.id,
                    recording.session.video_path
                );
                *active = Some(recording);
                Ok(())
            }
            Err(e) => {
                tracing::error!("Failed to start recording: {}", e);
                self.inner.set_state(RecorderState::Error(e.to_string()));
                Err(e)
            }
        }
    }

    async fn prepare(
        &self,
        config: RecordingConfig,
        generation: u64,
    ) -> RecordingResult<ActiveRecording> {
        config.validate()?;
        let backend = &self.inner.backend;

        if !backend.has_permission(Permission::ScreenRecording) {
            return Err(RecordingError::PermissionDenied(
                "Screen recording permission not granted".to_string(),
            ));
        }
        if config.capture_microphone && !backend.has_permission(Permission::Microphone) {
            return Err(RecordingError::PermissionDenied(
                "Microphone permission not granted".to_string(),
            ));
        }

        let display = backend.display(config.display_id).await?;
        let session = CaptureSession::new(&config, display)?;

        let writers = backend.open_writers(&config, &session)?;
        let (faults_tx, faults_rx) = mpsc::unbounded_channel();
        let anchor = Arc::new(TimelineAnchor::new());
        let observer = SessionObserver {
            generation,
            inner: Arc::downgrade(&self.inner),
            faults: faults_tx,
            anchor: anchor.clone(),
        };
        let coordinator = Arc::new(
            WriterCoordinator::new(
                writers,
                CoordinatorOptions {
                    hdr: config.hdr,
                    finalize_timeout: config.finalize_timeout(),
                },
            )
            .with_observer(Arc::new(observer)),
        );
        if let Err(e) = coordinator.arm() {
            finalize(&coordinator).await;
            return Err(e);
        }

        let mut sources = match backend.open_sources(&config, &session).await {
            Ok(sources) => sources,
            Err(e) => {
                finalize(&coordinator).await;
                return Err(e);
            }
        };
        let sink: Arc<dyn SampleSink> = coordinator.clone();
        for index in 0..sources.len() {
            if let Err(e) = sources[index].start(sink.clone()).await {
                tracing::error!("Source {} failed to start: {}", sources[index].id(), e);
                for started in sources[..index].iter_mut() {
                    if let Err(stop_err) = started.stop().await {
                        tracing::warn!("Stopping {}: {}", started.id(), stop_err);
                    }
                }
                finalize(&coordinator).await;
                return Err(e);
            }
        }

        let telemetry = self.start_telemetry(&config, &session, anchor);

        let watchdog = tokio::spawn(watch(
            Arc::downgrade(&self.inner),
            generation,
            coordinator.clone(),
            faults_rx,
        ));

        Ok(ActiveRecording {
            generation,
            config,
            session,
            coordinator,
            sources,
            telemetry,
            watchdog: Some(watchdog),
        })
    }

    fn start_telemetry(
        &self,
        config: &RecordingConfig,
        session: &CaptureSession,
        anchor: Arc<TimelineAnchor>,
    ) -> Option<TelemetryCollector> {
        let path = session.telemetry_path.as_ref()?;
        let backend = &self.inner.backend;

        let Some(probe) = backend.input_probe() else {
            self.degrade("input probe unavailable on this platform".to_string());
            return None;
        };
        let tap = if backend.has_permission(Permission::Accessibility) {
            backend.keyboard_tap()
        } else {
            self.degrade("accessibility permission missing; keyboard not recorded".to_string());
            None
        };

        let display = &session.display;
        let info = RecordingInfo {
            display_id: display.id,
            start_time: chrono::Utc::now().timestamp_millis().max(0) as u64,
            end_time: 0,
            duration: 0,
            cursor_frame_rate: config.cursor_fps,
            video_frame_rate: session.fps,
            video_width: display.width,
            video_height: display.height,
            screen_x_width: display.screen_width,
            screen_y_height: display.screen_height,
        };

        let mut collector = TelemetryCollector::new(TelemetryOptions::from(config), probe, tap);
        if !anchor.is_set() {
            tracing::debug!("Telemetry waits for the first video frame");
        }
        match collector.start_anchored(path, info, anchor) {
            Ok(()) => {
                for warning in collector.warnings().to_vec() {
                    self.degrade(warning);
                }
                Some(collector)
            }
            Err(e) => {
                self.degrade(e.to_string());
                None
            }
        }
    }

    fn degrade(&self, reason: String) {
        tracing::warn!("Telemetry degraded: {}", reason);
        self.inner.emit(RecorderEvent::TelemetryDegraded(reason));
    }

    /// Stop the recording and return the produced files
    pub async fn stop(&self) -> RecordingResult<RecordingOutput> {
        let recording = self.inner.active.lock().await.take();
        let Some(recording) = recording else {
            return Err(RecordingError::NotRecording);
        };

        let output = self.teardown(recording).await;
        self.inner.set_state(RecorderState::Idle);
        self.inner.emit(RecorderEvent::Stopped(output.clone()));
        Ok(output)
    }

    /// Asynchronous fault path: same teardown as `stop`, then `Error`
    async fn fail(&self, generation: u64, error: RecordingError) {
        let recording = {
            let mut active = self.inner.active.lock().await;
            match active.as_ref() {
                Some(r) if r.generation == generation => active.take(),
                _ => None,
            }
        };
        let Some(recording) = recording else {
            tracing::debug!("Fault after recording ended: {}", error);
            return;
        };

        tracing::error!("Recording failed: {}", error);
        let output = self.teardown(recording).await;
        self.inner.set_state(RecorderState::Error(error.to_string()));
        self.inner.emit(RecorderEvent::Stopped(output));
    }

    /// Stop sources, finalize writers, stop telemetry, then post-process
    async fn teardown(&self, recording: ActiveRecording) -> RecordingOutput {
        let ActiveRecording {
            config,
            session,
            coordinator,
            mut sources,
            telemetry,
            watchdog,
            ..
        } = recording;

        if let Some(watchdog) = watchdog {
            watchdog.abort();
        }

        for source in sources.iter_mut() {
            if let Err(e) = source.stop().await {
                tracing::warn!("Stopping {} failed: {}", source.id(), e);
            }
        }

        let outcome = finalize(&coordinator).await;
        if outcome.timed_out {
            tracing::warn!(
                "{}",
                RecordingError::TimeoutFailure(format!(
                    "writers did not finish within {:?}",
                    config.finalize_timeout()
                ))
            );
        }
        let drops = outcome.drops;
        if drops.total() > 0 {
            tracing::info!(
                "Dropped buffers: {} not ready, {} before session, {} after finish, {} invalid",
                drops.not_ready,
                drops.before_session,
                drops.after_finish,
                drops.invalid
            );
        }

        let mut telemetry_path = None;
        if let Some(mut collector) = telemetry {
            match collector.stop().await {
                Ok(summary) => telemetry_path = summary.map(|s| s.path),
                Err(e) => {
                    self.degrade(e.to_string());
                    telemetry_path = session.telemetry_path.clone();
                }
            }
        }

        let mut denoised_microphone = None;
        if let (Some(binary), Some(mic)) = (&config.denoiser_path, &outcome.microphone) {
            match Denoiser::new(binary).run(mic).await {
                Ok(path) => denoised_microphone = Some(path),
                Err(e) => tracing::warn!("Denoising failed, keeping raw microphone: {}", e),
            }
        }

        tracing::info!(
            "Recording {} stopped: {} buffers appended",
            session.id,
            outcome.appended
        );
        RecordingOutput {
            video: outcome.video,
            microphone: outcome.microphone,
            denoised_microphone,
            telemetry: telemetry_path,
            timed_out: outcome.timed_out,
        }
    }
}

/// Run the bounded, blocking finalize off the async workers
async fn finalize(coordinator: &Arc<WriterCoordinator>) -> FinalizeOutcome {
    let coordinator = coordinator.clone();
    match tokio::task::spawn_blocking(move || coordinator.finalize()).await {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!("Finalize task failed: {}", e);
            FinalizeOutcome::default()
        }
    }
}

/// Wait for the first fault of a recording, then hand it to the fault path
async fn watch(
    inner: Weak<Inner>,
    generation: u64,
    coordinator: Arc<WriterCoordinator>,
    mut faults: mpsc::UnboundedReceiver<RecordingError>,
) {
    let mut ticker = tokio::time::interval(WRITER_POLL_INTERVAL);
    let error = loop {
        tokio::select! {
            Some(error) = faults.recv() => break error,
            _ = ticker.tick() => {
                if let Some(error) = coordinator.check_writers() {
                    break error;
                }
            }
        }
    };

    if let Some(inner) = inner.upgrade() {
        let recorder = Recorder { inner };
        // Teardown aborts this watchdog, so it runs on its own task
        tokio::spawn(async move { recorder.fail(generation, error).await });
    }
}
