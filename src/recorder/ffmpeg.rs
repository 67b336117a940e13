//! FFmpeg-backed MPEG-4 container writer
//!
//! The video track is piped as raw BGRA into an `ffmpeg` encoder process at
//! a constant frame rate. Each frame is placed on that timeline by its
//! presentation time: gaps repeat the previous frame and frames landing on
//! an already written slot are skipped. Audio tracks are resampled to the
//! track rate and spooled to raw f32le files next to the output. On
//! finish, the encoded video and the spooled audio are muxed into the final
//! container, each audio track offset by its first timestamp relative to
//! the session origin.

use super::channel::{RecordingError, RecordingResult};
use super::queue::{QueuedTrack, TrackReceiver};
use super::sample::{MediaPayload, MediaTime, TrackKind, VideoFrame};
use super::writer::{
    AudioSettings, ContainerFormat, ContainerWriter, FinishCallback, TrackInput, VideoSettings,
    WriterStatus,
};
use crate::capture::audio::{to_stereo, StereoResampler};
use parking_lot::Mutex;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Check if an ffmpeg binary is callable
pub fn ffmpeg_available(ffmpeg: &str) -> bool {
    Command::new(ffmpeg)
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

#[derive(Debug, Clone)]
pub struct FfmpegWriterConfig {
    pub ffmpeg: String,
    pub output: PathBuf,
    pub format: ContainerFormat,
    pub video: VideoSettings,
    /// Audio tracks muxed alongside the video, in output order
    pub audio_tracks: Vec<TrackKind>,
    pub audio: AudioSettings,
    pub queue_depth: usize,
}

impl FfmpegWriterConfig {
    fn video_spool(&self) -> PathBuf {
        spool_path(&self.output, "video", self.format.extension())
    }

    fn audio_spool(&self, kind: TrackKind) -> PathBuf {
        spool_path(&self.output, &kind.to_string(), "pcm")
    }
}

fn spool_path(output: &Path, tag: &str, extension: &str) -> PathBuf {
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "recording".to_string());
    output.with_file_name(format!(".{stem}.{tag}.{extension}"))
}

/// Arguments for the realtime video encoder reading BGRA from stdin
pub fn encoder_args(config: &FfmpegWriterConfig) -> Vec<String> {
    let v = &config.video;
    let bitrate = v.bitrate();
    vec![
        "-y".into(),
        "-loglevel".into(), "error".into(),
        "-nostats".into(),
        "-f".into(), "rawvideo".into(),
        "-pixel_format".into(), "bgra".into(),
        "-video_size".into(), format!("{}x{}", v.width, v.height),
        "-framerate".into(), v.fps.to_string(),
        "-i".into(), "-".into(),
        "-c:v".into(), v.codec.clone(),
        "-b:v".into(), bitrate.to_string(),
        "-maxrate".into(), (bitrate * 2).to_string(),
        "-bufsize".into(), (bitrate * 2).to_string(),
        "-pix_fmt".into(), "yuv420p".into(),
        "-g".into(), (v.fps * 2).to_string(),
        config.video_spool().to_string_lossy().to_string(),
    ]
}

/// One spooled audio input to the final mux
#[derive(Debug, Clone)]
pub struct AudioSpool {
    pub path: PathBuf,
    /// Seconds after the session origin the first sample plays
    pub offset_seconds: f64,
}

/// Arguments combining the encoded video with spooled PCM tracks
pub fn mux_args(config: &FfmpegWriterConfig, spools: &[AudioSpool]) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-y".into(),
        "-loglevel".into(), "error".into(),
        "-nostats".into(),
        "-i".into(), config.video_spool().to_string_lossy().to_string(),
    ];
    for spool in spools {
        args.extend([
            "-itsoffset".into(), format!("{:.6}", spool.offset_seconds),
            "-f".into(), "f32le".into(),
            "-ar".into(), config.audio.sample_rate.to_string(),
            "-ac".into(), config.audio.channels.to_string(),
            "-i".into(), spool.path.to_string_lossy().to_string(),
        ]);
    }
    args.extend(["-map".into(), "0:v".into()]);
    for index in 1..=spools.len() {
        args.extend(["-map".into(), format!("{index}:a")]);
    }
    args.extend(["-c:v".into(), "copy".into()]);
    if !spools.is_empty() {
        args.extend([
            "-c:a".into(), "aac".into(),
            "-b:a".into(), config.audio.bitrate.to_string(),
        ]);
    }
    args.extend([
        "-movflags".into(), "+faststart".into(),
        config.output.to_string_lossy().to_string(),
    ]);
    args
}

/// Maps frame presentation times onto constant-rate output slots
#[derive(Debug, Clone)]
pub struct FramePacer {
    fps: u32,
    origin: Option<MediaTime>,
    next_slot: u64,
}

impl FramePacer {
    pub fn new(fps: u32) -> Self {
        Self {
            fps: fps.max(1),
            origin: None,
            next_slot: 0,
        }
    }

    pub fn is_anchored(&self) -> bool {
        self.origin.is_some()
    }

    pub fn anchor(&mut self, origin: MediaTime) {
        self.origin = Some(origin);
    }

    fn slot(&self, origin: MediaTime, at: MediaTime) -> u64 {
        (at.seconds_since(origin).max(0.0) * self.fps as f64).round() as u64
    }

    /// Place a frame at `pts`. Returns how many copies of the previous frame
    /// fill the gap before it, or `None` when its slot is already written.
    /// An unanchored pacer anchors on the first frame.
    pub fn place(&mut self, pts: MediaTime) -> Option<u64> {
        let origin = *self.origin.get_or_insert(pts);
        let slot = self.slot(origin, pts);
        if slot < self.next_slot {
            return None;
        }
        let gap = slot - self.next_slot;
        self.next_slot = slot + 1;
        Some(gap)
    }

    /// Copies of the last frame needed for the video to last until `end`
    pub fn fill_to(&mut self, end: MediaTime) -> u64 {
        let Some(origin) = self.origin else {
            return 0;
        };
        let slots = self.slot(origin, end);
        let fill = slots.saturating_sub(self.next_slot);
        self.next_slot += fill;
        fill
    }

    /// Slots written so far
    pub fn written(&self) -> u64 {
        self.next_slot
    }
}

/// Video worker state: paces frames and writes packed BGRA to the encoder
struct VideoPump {
    width: u32,
    height: u32,
    pacer: FramePacer,
    origin: Arc<Mutex<Option<MediaTime>>>,
    end: Arc<Mutex<Option<MediaTime>>>,
    frames: Arc<AtomicU64>,
}

impl VideoPump {
    fn frame_len(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }

    fn write_frame<W: Write>(&self, out: &mut W, frame: &VideoFrame) -> io::Result<()> {
        let expected = self.frame_len();
        let packed = frame.packed();
        out.write_all(&packed[..expected])?;
        let count = self.frames.fetch_add(1, Ordering::Relaxed) + 1;
        if count % 600 == 0 {
            tracing::debug!("Encoded {} frames", count);
        }
        Ok(())
    }

    fn run<W: Write>(mut self, rx: &TrackReceiver, out: &mut W) -> io::Result<()> {
        let mut last: Option<VideoFrame> = None;
        let (mut mismatched, mut skipped, mut repeated) = (0u64, 0u64, 0u64);

        while let Some(buffer) = rx.recv() {
            let pts = buffer.presentation_time;
            let MediaPayload::Video(frame) = buffer.payload else {
                continue;
            };
            if frame.width != self.width || frame.height != self.height {
                mismatched += 1;
                if mismatched == 1 {
                    tracing::warn!(
                        "Skipping {}x{} frame, encoder expects {}x{}",
                        frame.width,
                        frame.height,
                        self.width,
                        self.height
                    );
                }
                continue;
            }
            if frame.packed().len() < self.frame_len() {
                continue;
            }

            if !self.pacer.is_anchored() {
                if let Some(origin) = *self.origin.lock() {
                    self.pacer.anchor(origin);
                }
            }
            let Some(gap) = self.pacer.place(pts) else {
                skipped += 1;
                continue;
            };
            for _ in 0..gap {
                self.write_frame(out, last.as_ref().unwrap_or(&frame))?;
            }
            repeated += gap;
            self.write_frame(out, &frame)?;
            last = Some(frame);
        }

        let end = *self.end.lock();
        if let (Some(end), Some(frame)) = (end, last.as_ref()) {
            let fill = self.pacer.fill_to(end);
            for _ in 0..fill {
                self.write_frame(out, frame)?;
            }
            repeated += fill;
        }
        tracing::info!(
            "Video track paced: {} frames written, {} repeated, {} skipped early",
            self.pacer.written(),
            repeated,
            skipped
        );
        Ok(())
    }
}

struct Running {
    encoder: Child,
    workers: Vec<(TrackKind, JoinHandle<()>)>,
}

pub struct FfmpegContainerWriter {
    config: FfmpegWriterConfig,
    status: Arc<AtomicU8>,
    error: Arc<Mutex<Option<String>>>,
    video: Arc<QueuedTrack>,
    audio: Vec<Arc<QueuedTrack>>,
    receivers: Mutex<Vec<(TrackKind, TrackReceiver)>>,
    running: Mutex<Option<Running>>,
    origin: Arc<Mutex<Option<MediaTime>>>,
    /// Latest timestamp over every track, set when finishing
    end: Arc<Mutex<Option<MediaTime>>>,
    frames_written: Arc<AtomicU64>,
}

impl FfmpegContainerWriter {
    pub fn new(config: FfmpegWriterConfig) -> Self {
        let status = Arc::new(AtomicU8::new(WriterStatus::NotStarted.to_u8()));
        let mut receivers = Vec::new();

        let (video, rx) = QueuedTrack::new(TrackKind::Video, config.queue_depth, status.clone());
        receivers.push((TrackKind::Video, rx));

        let mut audio = Vec::new();
        for &kind in &config.audio_tracks {
            // Audio chunks are small; give them a deeper queue than frames
            let (track, rx) = QueuedTrack::new(kind, config.queue_depth * 8, status.clone());
            receivers.push((kind, rx));
            audio.push(track);
        }

        Self {
            config,
            status,
            error: Arc::new(Mutex::new(None)),
            video,
            audio,
            receivers: Mutex::new(receivers),
            running: Mutex::new(None),
            origin: Arc::new(Mutex::new(None)),
            end: Arc::new(Mutex::new(None)),
            frames_written: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written.load(Ordering::Relaxed)
    }

    fn set_status(&self, status: WriterStatus) {
        self.status.store(status.to_u8(), Ordering::SeqCst);
    }

    fn close_tracks(&self) {
        self.video.close();
        for track in &self.audio {
            track.close();
        }
    }

    fn spawn_video_worker(
        &self,
        rx: TrackReceiver,
        stdin: ChildStdin,
    ) -> RecordingResult<JoinHandle<()>> {
        let status = self.status.clone();
        let error = self.error.clone();
        let pump = VideoPump {
            width: self.config.video.width,
            height: self.config.video.height,
            pacer: FramePacer::new(self.config.video.fps),
            origin: self.origin.clone(),
            end: self.end.clone(),
            frames: self.frames_written.clone(),
        };

        let handle = std::thread::Builder::new()
            .name("ffmpeg-video".into())
            .spawn(move || {
                let mut stdin = stdin;
                if let Err(e) = pump.run(&rx, &mut stdin) {
                    tracing::error!("Video encoder pipe closed: {}", e);
                    *error.lock() = Some(format!("video encoder pipe: {e}"));
                    status.store(WriterStatus::Failed.to_u8(), Ordering::SeqCst);
                }
                // Dropping stdin signals EOF to the encoder
            })?;
        Ok(handle)
    }

    fn spawn_audio_worker(
        &self,
        kind: TrackKind,
        rx: TrackReceiver,
        path: PathBuf,
    ) -> RecordingResult<JoinHandle<()>> {
        let status = self.status.clone();
        let error = self.error.clone();
        let file = File::create(&path)?;
        let mut resampler = StereoResampler::new(self.config.audio.sample_rate);

        let handle = std::thread::Builder::new()
            .name(format!("spool-{kind}"))
            .spawn(move || {
                let mut out = BufWriter::new(file);
                while let Some(buffer) = rx.recv() {
                    let MediaPayload::Audio(chunk) = &buffer.payload else {
                        continue;
                    };
                    let stereo = resampler.process(
                        chunk.sample_rate,
                        &to_stereo(&chunk.samples, chunk.channels),
                    );
                    let mut bytes = Vec::with_capacity(stereo.len() * 4);
                    for sample in stereo {
                        bytes.extend_from_slice(&sample.to_le_bytes());
                    }
                    if let Err(e) = out.write_all(&bytes) {
                        tracing::error!("Spooling {} failed: {}", kind, e);
                        *error.lock() = Some(format!("{kind} spool: {e}"));
                        status.store(WriterStatus::Failed.to_u8(), Ordering::SeqCst);
                        return;
                    }
                }
                if let Err(e) = out.flush() {
                    tracing::warn!("Flushing {} spool: {}", kind, e);
                }
            })?;
        Ok(handle)
    }
}

impl ContainerWriter for FfmpegContainerWriter {
    fn output_path(&self) -> &Path {
        &self.config.output
    }

    fn format(&self) -> ContainerFormat {
        self.config.format
    }

    fn status(&self) -> WriterStatus {
        WriterStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    fn error(&self) -> Option<String> {
        self.error.lock().clone()
    }

    fn inputs(&self) -> Vec<Arc<dyn TrackInput>> {
        let mut inputs: Vec<Arc<dyn TrackInput>> = vec![self.video.clone()];
        inputs.extend(self.audio.iter().map(|t| t.clone() as Arc<dyn TrackInput>));
        inputs
    }

    fn start_writing(&self) -> RecordingResult<()> {
        if self.status() != WriterStatus::NotStarted {
            return Err(RecordingError::SetupFailure(format!(
                "writer for {:?} already started",
                self.config.output
            )));
        }

        let mut encoder = Command::new(&self.config.ffmpeg)
            .args(encoder_args(&self.config))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                RecordingError::SetupFailure(format!(
                    "failed to start {}: {}",
                    self.config.ffmpeg, e
                ))
            })?;
        let mut stdin = Some(encoder.stdin.take().ok_or_else(|| {
            RecordingError::SetupFailure("video encoder has no stdin".to_string())
        })?);

        let mut workers = Vec::new();
        for (kind, rx) in self.receivers.lock().drain(..) {
            let handle = match (kind, stdin.take()) {
                (TrackKind::Video, Some(pipe)) => self.spawn_video_worker(rx, pipe),
                (TrackKind::Video, None) => Err(RecordingError::SetupFailure(
                    "video track registered twice".to_string(),
                )),
                (_, pipe) => {
                    stdin = pipe;
                    self.spawn_audio_worker(kind, rx, self.config.audio_spool(kind))
                }
            };
            match handle {
                Ok(h) => workers.push((kind, h)),
                Err(e) => {
                    let _ = encoder.kill();
                    return Err(e);
                }
            }
        }
        // Drop the pipe if no video worker took it
        drop(stdin);

        *self.running.lock() = Some(Running { encoder, workers });
        self.set_status(WriterStatus::Writing);

        tracing::info!(
            "Started {} writer {:?}: {}x{} @ {}fps, {} bps, audio [{}]",
            self.config.video.codec,
            self.config.output,
            self.config.video.width,
            self.config.video.height,
            self.config.video.fps,
            self.config.video.bitrate(),
            self.config
                .audio_tracks
                .iter()
                .map(|k| k.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(())
    }

    fn start_session(&self, at: MediaTime) -> RecordingResult<()> {
        if self.status() != WriterStatus::Writing {
            return Err(RecordingError::WriterFailure(format!(
                "start session while {:?}",
                self.status()
            )));
        }
        let mut origin = self.origin.lock();
        if origin.is_some() {
            return Err(RecordingError::WriterFailure("session already started".to_string()));
        }
        *origin = Some(at);
        Ok(())
    }

    fn finish_writing(&self, on_complete: FinishCallback) {
        let status = self.status();
        if status != WriterStatus::Writing {
            tracing::warn!("finish_writing on {:?} while {:?}", self.config.output, status);
            on_complete(status);
            return;
        }

        // The video worker pads its last frame up to the latest timestamp
        *self.end.lock() = std::iter::once(&self.video)
            .chain(self.audio.iter())
            .filter_map(|t| t.last_time())
            .max();
        self.close_tracks();
        let Some(running) = self.running.lock().take() else {
            on_complete(WriterStatus::Failed);
            return;
        };

        let config = self.config.clone();
        let origin = (*self.origin.lock()).unwrap_or(MediaTime::ZERO);
        let firsts: Vec<(TrackKind, Option<MediaTime>)> =
            self.audio.iter().map(|t| (t.kind(), t.first_time())).collect();
        let status_cell = self.status.clone();
        let error = self.error.clone();

        let spawned = std::thread::Builder::new()
            .name("ffmpeg-finish".into())
            .spawn(move || {
                let result = complete(&config, running, origin, &firsts);
                let failed_before = WriterStatus::from_u8(status_cell.load(Ordering::SeqCst))
                    == WriterStatus::Failed;
                let final_status = match result {
                    Ok(()) if !failed_before => WriterStatus::Finished,
                    Ok(()) => WriterStatus::Failed,
                    Err(e) => {
                        tracing::error!("Finishing {:?} failed: {}", config.output, e);
                        *error.lock() = Some(e);
                        WriterStatus::Failed
                    }
                };
                status_cell.store(final_status.to_u8(), Ordering::SeqCst);
                on_complete(final_status);
            });
        if let Err(e) = spawned {
            tracing::error!("Could not spawn finish thread: {}", e);
            self.set_status(WriterStatus::Failed);
        }
    }

    fn cancel_writing(&self) {
        self.close_tracks();
        if let Some(mut running) = self.running.lock().take() {
            let _ = running.encoder.kill();
            let _ = running.encoder.wait();
            for (_, worker) in running.workers {
                let _ = worker.join();
            }
        }
        let _ = std::fs::remove_file(self.config.video_spool());
        for kind in &self.config.audio_tracks {
            let _ = std::fs::remove_file(self.config.audio_spool(*kind));
        }
        self.set_status(WriterStatus::Cancelled);
        tracing::info!("Cancelled writer {:?}", self.config.output);
    }
}

fn complete(
    config: &FfmpegWriterConfig,
    running: Running,
    origin: MediaTime,
    firsts: &[(TrackKind, Option<MediaTime>)],
) -> Result<(), String> {
    let Running { encoder, workers } = running;
    for (kind, worker) in workers {
        if worker.join().is_err() {
            tracing::warn!("{} worker panicked", kind);
        }
    }

    let output = encoder
        .wait_with_output()
        .map_err(|e| format!("waiting for video encoder: {e}"))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!("video encoder exited with {}: {}", output.status, stderr.trim()));
    }

    let spools: Vec<AudioSpool> = firsts
        .iter()
        .filter_map(|(kind, first)| {
            let path = config.audio_spool(*kind);
            let has_data = std::fs::metadata(&path).map(|m| m.len() > 0).unwrap_or(false);
            match (first, has_data) {
                (Some(first), true) => Some(AudioSpool {
                    path,
                    offset_seconds: first.seconds_since(origin).max(0.0),
                }),
                _ => {
                    let _ = std::fs::remove_file(&path);
                    None
                }
            }
        })
        .collect();

    let video_spool = config.video_spool();
    if spools.is_empty() {
        std::fs::rename(&video_spool, &config.output)
            .map_err(|e| format!("moving video into place: {e}"))?;
        return Ok(());
    }

    let mux = Command::new(&config.ffmpeg)
        .args(mux_args(config, &spools))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .map_err(|e| format!("starting mux: {e}"))?;

    if !mux.status.success() {
        // Keep the video alone rather than nothing
        let _ = std::fs::rename(&video_spool, &config.output);
        return Err(format!(
            "mux exited with {}: {}",
            mux.status,
            String::from_utf8_lossy(&mux.stderr).trim()
        ));
    }

    let _ = std::fs::remove_file(&video_spool);
    for spool in &spools {
        let _ = std::fs::remove_file(&spool.path);
    }
    Ok(())
}
