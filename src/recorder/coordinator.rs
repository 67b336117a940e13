//! Multi-track writer coordinator
//!
//! Routes sample buffers from independent capture producers to the matching
//! track of the matching container writer. The first valid video buffer
//! anchors the shared timeline; nothing is appended before it and nothing
//! after finalization begins. Appends never block: a track that is not
//! ready drops the buffer.

use super::barrier::CompletionBarrier;
use super::channel::{RecordingError, RecordingResult, SampleSink};
use super::sample::{MediaTime, SampleBuffer, TrackKind};
use super::writer::{ContainerWriter, TrackInput, WriterStatus};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Default bound on how long `finalize` waits for writers
pub const DEFAULT_FINALIZE_TIMEOUT: Duration = Duration::from_secs(3);

/// Notifications raised from producer threads. Implementations must not block.
pub trait CoordinatorObserver: Send + Sync {
    /// The first valid video frame anchored the timeline
    fn session_started(&self, origin: MediaTime);

    /// A writer or stream failed; raised at most once per coordinator
    fn fault(&self, error: RecordingError);
}

#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    /// Log color metadata of the first frame after session start
    pub hdr: bool,
    pub finalize_timeout: Duration,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            hdr: false,
            finalize_timeout: DEFAULT_FINALIZE_TIMEOUT,
        }
    }
}

/// Why buffers were dropped instead of appended
#[derive(Debug, Default)]
struct DropCounters {
    invalid: AtomicU64,
    unrouted: AtomicU64,
    before_session: AtomicU64,
    not_ready: AtomicU64,
    after_finish: AtomicU64,
    append_failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DropStats {
    pub invalid: u64,
    pub unrouted: u64,
    pub before_session: u64,
    pub not_ready: u64,
    pub after_finish: u64,
    pub append_failed: u64,
}

impl DropStats {
    pub fn total(&self) -> u64 {
        self.invalid
            + self.unrouted
            + self.before_session
            + self.not_ready
            + self.after_finish
            + self.append_failed
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriterReport {
    pub path: PathBuf,
    pub status: WriterStatus,
}

/// Files produced by `finalize`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeOutcome {
    /// Container holding the video track
    pub video: Option<PathBuf>,
    /// Separate microphone container, when the microphone has its own writer
    pub microphone: Option<PathBuf>,
    /// At least one writer did not report completion within the bound
    pub timed_out: bool,
    pub writers: Vec<WriterReport>,
    pub appended: u64,
    pub drops: DropStats,
}

struct TrackSlot {
    kind: TrackKind,
    input: Arc<dyn TrackInput>,
    writer: Arc<dyn ContainerWriter>,
    // Guards check-ready-then-append against mark-finished
    finished: Mutex<bool>,
    appended: AtomicU64,
}

#[derive(Debug, Default)]
struct SessionGate {
    started: bool,
    closed: bool,
    origin: Option<MediaTime>,
    color_logged: bool,
}

pub struct WriterCoordinator {
    writers: Vec<Arc<dyn ContainerWriter>>,
    tracks: Vec<TrackSlot>,
    gate: Mutex<SessionGate>,
    drops: DropCounters,
    fault_raised: AtomicBool,
    observer: Option<Arc<dyn CoordinatorObserver>>,
    options: CoordinatorOptions,
    outcome: Mutex<Option<FinalizeOutcome>>,
}

impl WriterCoordinator {
    /// Build a coordinator over `writers`. Each track kind is routed to the
    /// first writer exposing an input of that kind.
    pub fn new(writers: Vec<Arc<dyn ContainerWriter>>, options: CoordinatorOptions) -> Self {
        let mut tracks: Vec<TrackSlot> = Vec::new();
        for writer in &writers {
            for input in writer.inputs() {
                let kind = input.kind();
                if tracks.iter().any(|t| t.kind == kind) {
                    tracing::warn!(
                        "Duplicate {} input on {:?}; keeping the first",
                        kind,
                        writer.output_path()
                    );
                    continue;
                }
                tracks.push(TrackSlot {
                    kind,
                    input,
                    writer: writer.clone(),
                    finished: Mutex::new(false),
                    appended: AtomicU64::new(0),
                });
            }
        }

        Self {
            writers,
            tracks,
            gate: Mutex::new(SessionGate::default()),
            drops: DropCounters::default(),
            fault_raised: AtomicBool::new(false),
            observer: None,
            options,
            outcome: Mutex::new(None),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn CoordinatorObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Put every writer into `Writing`. Buffers are accepted only after this.
    pub fn arm(&self) -> RecordingResult<()> {
        for writer in &self.writers {
            if writer.status() == WriterStatus::NotStarted {
                writer.start_writing()?;
            }
        }
        tracing::info!(
            "Writer coordinator armed: {} writer(s), tracks [{}]",
            self.writers.len(),
            self.tracks
                .iter()
                .map(|t| t.kind.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(())
    }

    pub fn session_origin(&self) -> Option<MediaTime> {
        self.gate.lock().origin
    }

    pub fn is_session_started(&self) -> bool {
        self.gate.lock().started
    }

    pub fn is_finalized(&self) -> bool {
        self.gate.lock().closed
    }

    pub fn drop_stats(&self) -> DropStats {
        let d = &self.drops;
        DropStats {
            invalid: d.invalid.load(Ordering::Relaxed),
            unrouted: d.unrouted.load(Ordering::Relaxed),
            before_session: d.before_session.load(Ordering::Relaxed),
            not_ready: d.not_ready.load(Ordering::Relaxed),
            after_finish: d.after_finish.load(Ordering::Relaxed),
            append_failed: d.append_failed.load(Ordering::Relaxed),
        }
    }

    pub fn appended(&self, kind: TrackKind) -> u64 {
        self.slot(kind)
            .map(|s| s.appended.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn slot(&self, kind: TrackKind) -> Option<&TrackSlot> {
        self.tracks.iter().find(|t| t.kind == kind)
    }

    /// Route one buffer from `source` to its track.
    pub fn on_sample_buffer(&self, buffer: SampleBuffer, source: TrackKind) {
        if buffer.kind != source || !buffer.is_valid() {
            self.drops.invalid.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let Some(slot) = self.slot(source) else {
            self.drops.unrouted.fetch_add(1, Ordering::Relaxed);
            return;
        };

        let mut anchored = None;
        let mut inspect_color = false;
        {
            let mut gate = self.gate.lock();
            if gate.closed {
                self.drops.after_finish.fetch_add(1, Ordering::Relaxed);
                return;
            }

            if !gate.started {
                if source != TrackKind::Video {
                    self.drops.before_session.fetch_add(1, Ordering::Relaxed);
                    return;
                }

                let origin = buffer.presentation_time;
                for writer in &self.writers {
                    if let Err(e) = writer.start_session(origin) {
                        // Nothing can be appended to a writer without a session
                        gate.closed = true;
                        drop(gate);
                        self.raise_fault(RecordingError::WriterFailure(format!(
                            "start session on {:?}: {}",
                            writer.output_path(),
                            e
                        )));
                        return;
                    }
                }
                gate.started = true;
                gate.origin = Some(origin);
                anchored = Some(origin);
            }

            if source == TrackKind::Video && self.options.hdr && !gate.color_logged {
                gate.color_logged = true;
                inspect_color = true;
            }
        }

        if let Some(origin) = anchored {
            tracing::info!("Session started at {}", origin);
            if let Some(observer) = &self.observer {
                observer.session_started(origin);
            }
        }

        if inspect_color {
            log_color_attachments(&buffer);
        }

        self.append_to(slot, buffer);
    }

    fn append_to(&self, slot: &TrackSlot, buffer: SampleBuffer) {
        let result = {
            let finished = slot.finished.lock();
            if *finished {
                self.drops.after_finish.fetch_add(1, Ordering::Relaxed);
                return;
            }
            if !slot.input.is_ready_for_more_media_data() {
                self.drops.not_ready.fetch_add(1, Ordering::Relaxed);
                return;
            }
            slot.input.append(buffer)
        };

        match result {
            Ok(()) => {
                slot.appended.fetch_add(1, Ordering::Relaxed);
                if slot.writer.status() == WriterStatus::Failed {
                    self.raise_writer_fault(slot);
                }
            }
            Err(e) => {
                self.drops.append_failed.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Append to {} track failed: {}", slot.kind, e);
                if slot.writer.status() == WriterStatus::Failed {
                    self.raise_writer_fault(slot);
                }
            }
        }
    }

    fn raise_writer_fault(&self, slot: &TrackSlot) {
        let detail = slot
            .writer
            .error()
            .unwrap_or_else(|| "writer entered failed status".to_string());
        self.raise_fault(RecordingError::WriterFailure(format!(
            "{:?}: {}",
            slot.writer.output_path(),
            detail
        )));
    }

    fn raise_fault(&self, error: RecordingError) {
        if self.fault_raised.swap(true, Ordering::SeqCst) {
            tracing::debug!("Suppressing follow-up fault: {}", error);
            return;
        }
        tracing::error!("Recording fault: {}", error);
        if let Some(observer) = &self.observer {
            observer.fault(error);
        }
    }

    /// Poll writers for a failure that happened without an append noticing it
    pub fn check_writers(&self) -> Option<RecordingError> {
        self.writers
            .iter()
            .find(|w| w.status() == WriterStatus::Failed)
            .map(|w| {
                RecordingError::WriterFailure(format!(
                    "{:?}: {}",
                    w.output_path(),
                    w.error().unwrap_or_else(|| "failed".to_string())
                ))
            })
    }

    /// Close every track and wait, bounded, for all writers to finish.
    ///
    /// Blocks the calling thread for at most the configured timeout. A
    /// timeout is reported in the outcome, never as an error. Repeated calls
    /// return the first outcome.
    pub fn finalize(&self) -> FinalizeOutcome {
        let mut stored = self.outcome.lock();
        if let Some(outcome) = stored.as_ref() {
            return outcome.clone();
        }

        let started = {
            let mut gate = self.gate.lock();
            gate.closed = true;
            gate.started
        };

        for kind in TrackKind::FINALIZE_ORDER {
            let Some(slot) = self.slot(kind) else {
                continue;
            };
            let mut finished = slot.finished.lock();
            if !*finished {
                *finished = true;
                if let Err(e) = slot.input.mark_as_finished() {
                    tracing::error!("Marking {} track finished: {}", kind, e);
                }
            }
        }

        let outcome = if started {
            self.finish_writers()
        } else {
            tracing::info!("Finalize before session start; cancelling writers");
            for writer in &self.writers {
                writer.cancel_writing();
            }
            FinalizeOutcome {
                writers: self.reports(),
                drops: self.drop_stats(),
                ..Default::default()
            }
        };

        *stored = Some(outcome.clone());
        outcome
    }

    fn finish_writers(&self) -> FinalizeOutcome {
        let started_at = Instant::now();
        let writing: Vec<&Arc<dyn ContainerWriter>> = self
            .writers
            .iter()
            .filter(|w| w.status() == WriterStatus::Writing)
            .collect();

        let barrier = CompletionBarrier::new(writing.len());
        for writer in &writing {
            let done = barrier.clone();
            let path = writer.output_path().to_path_buf();
            writer.finish_writing(Box::new(move |status| {
                tracing::debug!("Writer {:?} finished with {:?}", path, status);
                done.leave();
            }));
        }

        let completed = barrier.wait_timeout(self.options.finalize_timeout);
        if completed {
            tracing::info!(
                "Finalized {} writer(s) in {:?}",
                writing.len(),
                started_at.elapsed()
            );
        } else {
            tracing::warn!(
                "{} of {} writer(s) did not finish within {:?}; keeping partial files",
                barrier.remaining(),
                writing.len(),
                self.options.finalize_timeout
            );
        }

        let video_writer = self.slot(TrackKind::Video).map(|s| s.writer.clone());
        let mic_writer = self.slot(TrackKind::MicrophoneAudio).map(|s| s.writer.clone());
        let microphone = match (&mic_writer, &video_writer) {
            (Some(mic), Some(video)) if Arc::ptr_eq(mic, video) => None,
            (Some(mic), _) => Some(mic.output_path().to_path_buf()),
            _ => None,
        };

        FinalizeOutcome {
            video: video_writer.map(|w| w.output_path().to_path_buf()),
            microphone,
            timed_out: !completed,
            writers: self.reports(),
            appended: self.tracks.iter().map(|t| t.appended.load(Ordering::Relaxed)).sum(),
            drops: self.drop_stats(),
        }
    }

    fn reports(&self) -> Vec<WriterReport> {
        self.writers
            .iter()
            .map(|w| WriterReport {
                path: w.output_path().to_path_buf(),
                status: w.status(),
            })
            .collect()
    }
}

impl SampleSink for WriterCoordinator {
    fn on_sample(&self, buffer: SampleBuffer, kind: TrackKind) {
        self.on_sample_buffer(buffer, kind);
    }

    fn on_stream_error(&self, cause: RecordingError) {
        let error = match cause {
            RecordingError::StreamFailure(_) => cause,
            other => RecordingError::StreamFailure(other.to_string()),
        };
        self.raise_fault(error);
    }
}

fn log_color_attachments(buffer: &SampleBuffer) {
    match &buffer.color {
        Some(color) => tracing::info!(
            "HDR first frame: primaries={}, transfer={}, matrix={}",
            color.color_primaries.as_deref().unwrap_or("unknown"),
            color.transfer_function.as_deref().unwrap_or("unknown"),
            color.ycbcr_matrix.as_deref().unwrap_or("unknown")
        ),
        None => tracing::debug!("HDR first frame carried no color attachments"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::testing::{audio_at, video_at, FakeWriter, FinishBehavior};

    #[derive(Default)]
    struct RecordingObserver {
        started: Mutex<Vec<MediaTime>>,
        faults: Mutex<Vec<String>>,
    }

    impl CoordinatorObserver for RecordingObserver {
        fn session_started(&self, origin: MediaTime) {
            self.started.lock().push(origin);
        }

        fn fault(&self, error: RecordingError) {
            self.faults.lock().push(error.kind().to_string());
        }
    }

    fn screen_writer() -> Arc<FakeWriter> {
        FakeWriter::new(
            "/tmp/screen.mp4",
            &[TrackKind::Video, TrackKind::SystemAudio],
            FinishBehavior::Complete,
        )
    }

    fn coordinator(writers: &[Arc<FakeWriter>], timeout: Duration) -> WriterCoordinator {
        let writers = writers
            .iter()
            .map(|w| w.clone() as Arc<dyn ContainerWriter>)
            .collect();
        let coordinator = WriterCoordinator::new(
            writers,
            CoordinatorOptions {
                hdr: false,
                finalize_timeout: timeout,
            },
        );
        coordinator.arm().unwrap();
        coordinator
    }

    #[test]
    fn test_audio_only_input_appends_nothing() {
        let screen = screen_writer();
        let c = coordinator(&[screen.clone()], DEFAULT_FINALIZE_TIMEOUT);

        for i in 0..20 {
            c.on_sample_buffer(audio_at(TrackKind::SystemAudio, i), TrackKind::SystemAudio);
        }

        assert_eq!(screen.input(TrackKind::SystemAudio).appended_count(), 0);
        assert_eq!(screen.session_count(), 0);
        assert_eq!(c.drop_stats().before_session, 20);
        assert!(!c.is_session_started());
    }

    #[test]
    fn test_audio_before_first_video_is_dropped() {
        let screen = screen_writer();
        let c = coordinator(&[screen.clone()], DEFAULT_FINALIZE_TIMEOUT);

        c.on_sample_buffer(audio_at(TrackKind::SystemAudio, 1), TrackKind::SystemAudio);
        c.on_sample_buffer(audio_at(TrackKind::SystemAudio, 2), TrackKind::SystemAudio);
        c.on_sample_buffer(video_at(3), TrackKind::Video);
        c.on_sample_buffer(audio_at(TrackKind::SystemAudio, 4), TrackKind::SystemAudio);

        let audio = screen.input(TrackKind::SystemAudio).appended.lock().clone();
        assert_eq!(audio, vec![MediaTime::new(4, 60)]);
        assert_eq!(c.session_origin(), Some(MediaTime::new(3, 60)));
    }

    #[test]
    fn test_concurrent_video_starts_session_once() {
        let screen = screen_writer();
        let mic = FakeWriter::new("/tmp/mic.wav", &[TrackKind::MicrophoneAudio], FinishBehavior::Complete);
        let c = Arc::new(coordinator(&[screen.clone(), mic.clone()], DEFAULT_FINALIZE_TIMEOUT));

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let c = c.clone();
                std::thread::spawn(move || {
                    for i in 0..25 {
                        c.on_sample_buffer(video_at(t * 100 + i), TrackKind::Video);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(screen.session_count(), 1);
        assert_eq!(mic.session_count(), 1);
        assert_eq!(screen.input(TrackKind::Video).appended_count(), 200);
    }

    #[test]
    fn test_not_ready_track_drops_without_touching_others() {
        let screen = screen_writer();
        let c = coordinator(&[screen.clone()], DEFAULT_FINALIZE_TIMEOUT);
        c.on_sample_buffer(video_at(0), TrackKind::Video);

        screen.input(TrackKind::SystemAudio).ready.store(false, Ordering::SeqCst);
        let started = Instant::now();
        c.on_sample_buffer(audio_at(TrackKind::SystemAudio, 1), TrackKind::SystemAudio);
        assert!(started.elapsed() < Duration::from_millis(50));

        c.on_sample_buffer(video_at(2), TrackKind::Video);

        assert_eq!(screen.input(TrackKind::SystemAudio).appended_count(), 0);
        assert_eq!(screen.input(TrackKind::Video).appended_count(), 2);
        assert_eq!(c.drop_stats().not_ready, 1);
    }

    #[test]
    fn test_buffers_after_finalize_are_ignored() {
        let screen = screen_writer();
        let c = coordinator(&[screen.clone()], DEFAULT_FINALIZE_TIMEOUT);
        c.on_sample_buffer(video_at(0), TrackKind::Video);

        let outcome = c.finalize();
        assert!(!outcome.timed_out);

        c.on_sample_buffer(video_at(1), TrackKind::Video);
        c.on_sample_buffer(audio_at(TrackKind::SystemAudio, 2), TrackKind::SystemAudio);

        assert_eq!(screen.input(TrackKind::Video).appended_count(), 1);
        assert_eq!(screen.input(TrackKind::SystemAudio).appended_count(), 0);
        assert_eq!(c.drop_stats().after_finish, 2);
        assert_eq!(screen.session_count(), 1);

        // Second finalize returns the stored outcome without finishing again
        let again = c.finalize();
        assert_eq!(again.video, outcome.video);
        assert_eq!(screen.finish_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_producers_racing_finalize_never_append_to_finished_tracks() {
        let screen = screen_writer();
        let mic = FakeWriter::new("/tmp/mic.wav", &[TrackKind::MicrophoneAudio], FinishBehavior::Complete);
        let c = Arc::new(coordinator(&[screen.clone(), mic.clone()], DEFAULT_FINALIZE_TIMEOUT));
        c.on_sample_buffer(video_at(0), TrackKind::Video);

        const PER_THREAD: i64 = 2_000;
        let barrier = Arc::new(std::sync::Barrier::new(7));
        let producers: Vec<_> = (0..6)
            .map(|t| {
                let c = c.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    let kind = [TrackKind::Video, TrackKind::SystemAudio, TrackKind::MicrophoneAudio]
                        [t as usize % 3];
                    barrier.wait();
                    for i in 0..PER_THREAD {
                        let value = 1 + t * PER_THREAD + i;
                        let buffer = match kind {
                            TrackKind::Video => video_at(value),
                            audio => audio_at(audio, value),
                        };
                        c.on_sample_buffer(buffer, kind);
                    }
                })
            })
            .collect();
        let finalizer = {
            let c = c.clone();
            let barrier = barrier.clone();
            std::thread::spawn(move || {
                barrier.wait();
                std::thread::sleep(Duration::from_millis(2));
                c.finalize()
            })
        };

        for producer in producers {
            producer.join().unwrap();
        }
        let outcome = finalizer.join().unwrap();
        assert!(!outcome.timed_out);

        let inputs = [
            screen.input(TrackKind::Video),
            screen.input(TrackKind::SystemAudio),
            mic.input(TrackKind::MicrophoneAudio),
        ];
        for input in &inputs {
            assert!(input.is_finished());
            assert_eq!(input.appended_after_finish.load(Ordering::SeqCst), 0);
        }

        // Every buffer was either appended or counted as a drop
        let appended: u64 = TrackKind::FINALIZE_ORDER.iter().map(|&k| c.appended(k)).sum();
        assert_eq!(appended + c.drop_stats().total(), 1 + 6 * PER_THREAD as u64);
        let recorded: usize = inputs.iter().map(|i| i.appended_count()).sum();
        assert_eq!(recorded as u64, appended);
    }

    #[test]
    fn test_interleaved_scenario_counts() {
        let screen = screen_writer();
        let observer = Arc::new(RecordingObserver::default());
        let c = coordinator(&[screen.clone()], DEFAULT_FINALIZE_TIMEOUT)
            .with_observer(observer.clone());

        // 60 fps spacing on a 600 timescale
        for i in 0..10 {
            c.on_sample_buffer(
                SampleBuffer { presentation_time: MediaTime::new(1000 + i * 10, 600), ..video_at(0) },
                TrackKind::Video,
            );
            c.on_sample_buffer(
                SampleBuffer {
                    presentation_time: MediaTime::new(1000 + i * 10 + 5, 600),
                    ..audio_at(TrackKind::SystemAudio, 0)
                },
                TrackKind::SystemAudio,
            );
        }

        assert_eq!(screen.input(TrackKind::Video).appended_count(), 10);
        assert_eq!(screen.input(TrackKind::SystemAudio).appended_count(), 10);
        assert_eq!(*screen.sessions.lock(), vec![MediaTime::new(1000, 600)]);
        assert_eq!(*observer.started.lock(), vec![MediaTime::new(1000, 600)]);

        let outcome = c.finalize();
        assert_eq!(outcome.appended, 20);
        assert_eq!(outcome.video, Some(PathBuf::from("/tmp/screen.mp4")));
        assert_eq!(outcome.microphone, None);
    }

    #[test]
    fn test_finalize_returns_after_timeout_when_writer_hangs() {
        let screen = FakeWriter::new(
            "/tmp/hang.mp4",
            &[TrackKind::Video, TrackKind::SystemAudio],
            FinishBehavior::Hang,
        );
        let c = coordinator(&[screen.clone()], DEFAULT_FINALIZE_TIMEOUT);
        c.on_sample_buffer(video_at(0), TrackKind::Video);

        let started = Instant::now();
        let outcome = c.finalize();
        let elapsed = started.elapsed();

        assert!(outcome.timed_out);
        assert!(elapsed >= Duration::from_secs(3));
        assert!(elapsed < Duration::from_millis(3500));
        assert_eq!(outcome.video, Some(PathBuf::from("/tmp/hang.mp4")));
    }

    #[test]
    fn test_hanging_writer_does_not_block_the_other() {
        let screen = FakeWriter::new(
            "/tmp/hang.mp4",
            &[TrackKind::Video, TrackKind::SystemAudio],
            FinishBehavior::Hang,
        );
        let mic = FakeWriter::new("/tmp/mic.wav", &[TrackKind::MicrophoneAudio], FinishBehavior::Complete);
        let c = coordinator(&[screen.clone(), mic.clone()], Duration::from_millis(300));
        c.on_sample_buffer(video_at(0), TrackKind::Video);
        c.on_sample_buffer(audio_at(TrackKind::MicrophoneAudio, 1), TrackKind::MicrophoneAudio);

        let outcome = c.finalize();

        assert!(outcome.timed_out);
        assert_eq!(outcome.microphone, Some(PathBuf::from("/tmp/mic.wav")));
        assert_eq!(mic.status(), WriterStatus::Finished);
        assert_eq!(mic.input(TrackKind::MicrophoneAudio).appended_count(), 1);
        assert!(mic.input(TrackKind::MicrophoneAudio).is_finished());
    }

    #[test]
    fn test_finalize_before_session_cancels_writers() {
        let screen = screen_writer();
        let c = coordinator(&[screen.clone()], DEFAULT_FINALIZE_TIMEOUT);

        let outcome = c.finalize();

        assert!(outcome.video.is_none());
        assert!(screen.cancelled.load(Ordering::SeqCst));
        assert_eq!(screen.finish_calls.load(Ordering::SeqCst), 0);
        assert!(screen.input(TrackKind::Video).is_finished());

        c.on_sample_buffer(video_at(5), TrackKind::Video);
        assert_eq!(screen.session_count(), 0);
    }

    #[test]
    fn test_invalid_and_unrouted_buffers_are_dropped() {
        let screen = screen_writer();
        let c = coordinator(&[screen.clone()], DEFAULT_FINALIZE_TIMEOUT);

        c.on_sample_buffer(video_at(0).invalid(), TrackKind::Video);
        assert!(!c.is_session_started());

        c.on_sample_buffer(video_at(1), TrackKind::Video);
        c.on_sample_buffer(audio_at(TrackKind::MicrophoneAudio, 2), TrackKind::MicrophoneAudio);
        c.on_sample_buffer(audio_at(TrackKind::SystemAudio, 3), TrackKind::MicrophoneAudio);

        let stats = c.drop_stats();
        assert_eq!(stats.invalid, 2);
        assert_eq!(stats.unrouted, 1);
        assert_eq!(c.session_origin(), Some(MediaTime::new(1, 60)));
    }

    #[test]
    fn test_hdr_frame_without_color_metadata_still_appends() {
        let screen = screen_writer();
        let writers = vec![screen.clone() as Arc<dyn ContainerWriter>];
        let c = WriterCoordinator::new(
            writers,
            CoordinatorOptions {
                hdr: true,
                finalize_timeout: DEFAULT_FINALIZE_TIMEOUT,
            },
        );
        c.arm().unwrap();

        c.on_sample_buffer(video_at(0), TrackKind::Video);
        c.on_sample_buffer(
            video_at(1).with_color(crate::recorder::sample::ColorAttachments {
                color_primaries: Some("ITU_R_2020".into()),
                transfer_function: Some("ITU_R_2100_HLG".into()),
                ycbcr_matrix: None,
            }),
            TrackKind::Video,
        );

        assert_eq!(screen.input(TrackKind::Video).appended_count(), 2);
    }

    #[test]
    fn test_writer_failure_is_reported_once() {
        let screen = screen_writer();
        let observer = Arc::new(RecordingObserver::default());
        let c = coordinator(&[screen.clone()], DEFAULT_FINALIZE_TIMEOUT)
            .with_observer(observer.clone());
        c.on_sample_buffer(video_at(0), TrackKind::Video);

        screen.input(TrackKind::Video).fail_appends.store(true, Ordering::SeqCst);
        c.on_sample_buffer(video_at(1), TrackKind::Video);
        c.on_sample_buffer(video_at(2), TrackKind::Video);
        c.on_stream_error(RecordingError::StreamFailure("display removed".into()));

        assert_eq!(*observer.faults.lock(), vec!["WRITER_FAILURE".to_string()]);
        assert_eq!(c.drop_stats().append_failed, 2);
        assert!(c.check_writers().is_some());
    }

    #[test]
    fn test_stream_error_is_wrapped_as_stream_failure() {
        let screen = screen_writer();
        let observer = Arc::new(RecordingObserver::default());
        let c = coordinator(&[screen], DEFAULT_FINALIZE_TIMEOUT).with_observer(observer.clone());

        c.on_stream_error(RecordingError::DeviceNotFound("display".into()));

        assert_eq!(*observer.faults.lock(), vec!["STREAM_FAILURE".to_string()]);
    }
}
