//! macOS display and system audio capture using ScreenCaptureKit
//!
//! One `SCStream` delivers both the screen frames and the system audio of the
//! selected display. Each delivery is copied into a `SampleBuffer` carrying
//! the stream's own presentation timestamp and pushed to the sink.
//!
//! ScreenCaptureKit may deliver audio either interleaved in one buffer or as
//! one buffer per channel; both are normalized to interleaved f32.

use super::color::buffer_color_attachments;
use crate::capture::audio::{f32_from_le_bytes, interleave};
use crate::capture::traits::DisplayInfo;
use crate::recorder::channel::{
    CaptureChannel, ChannelType, RecordingError, RecordingResult, SampleSink,
};
use crate::recorder::sample::{AudioChunk, MediaTime, SampleBuffer, TrackKind, VideoFrame};
use async_trait::async_trait;
use core_graphics::display::CGDisplay;
use screencapturekit::cm::{AudioBufferList, CMFormatDescription};
use screencapturekit::cv::CVPixelBufferLockFlags;
use screencapturekit::prelude::*;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

pub const SYSTEM_AUDIO_SAMPLE_RATE: u32 = 48_000;
pub const SYSTEM_AUDIO_CHANNELS: u16 = 2;

/// List active displays
pub fn get_displays() -> Vec<DisplayInfo> {
    let display_ids = CGDisplay::active_displays().unwrap_or_default();

    display_ids
        .iter()
        .enumerate()
        .map(|(index, &id)| {
            let display = CGDisplay::new(id);
            let bounds = display.bounds();
            let is_main = display.is_main();
            let scale_factor = if bounds.size.height > 0.0 {
                display.pixels_high() as f64 / bounds.size.height
            } else {
                1.0
            };

            DisplayInfo {
                id,
                name: if is_main {
                    "Main Display".to_string()
                } else {
                    format!("Display {}", index + 1)
                },
                width: display.pixels_wide() as u32,
                height: display.pixels_high() as u32,
                screen_width: bounds.size.width,
                screen_height: bounds.size.height,
                scale_factor,
                is_primary: is_main,
            }
        })
        .collect()
}

/// Resolve `id`, or the main display when unset
pub fn find_display_info(id: Option<u32>) -> RecordingResult<DisplayInfo> {
    let displays = get_displays();
    let found = match id {
        Some(id) => displays.into_iter().find(|d| d.id == id),
        None => displays.into_iter().find(|d| d.is_primary),
    };
    found.ok_or_else(|| match id {
        Some(id) => RecordingError::DeviceNotFound(format!("Display {} not found", id)),
        None => RecordingError::DeviceNotFound("No main display".to_string()),
    })
}

fn media_time(time: CMTime) -> MediaTime {
    MediaTime::new(time.value, time.timescale)
}

/// Screen frame handler
struct FrameHandler {
    sink: Arc<dyn SampleSink>,
    running: Arc<AtomicBool>,
    frames: AtomicU64,
    fps: u32,
    /// Copy color attachments onto frames for HDR diagnostics
    hdr: bool,
}

impl SCStreamOutputTrait for FrameHandler {
    fn did_output_sample_buffer(&self, sample: CMSampleBuffer, output_type: SCStreamOutputType) {
        if !matches!(output_type, SCStreamOutputType::Screen) {
            return;
        }
        if !self.running.load(Ordering::Relaxed) {
            return;
        }

        // Idle and blank frames carry no image
        let Some(pixel_buffer) = sample.image_buffer() else {
            return;
        };
        let Ok(guard) = pixel_buffer.lock(CVPixelBufferLockFlags::READ_ONLY) else {
            return;
        };

        let frame = VideoFrame {
            width: pixel_buffer.width() as u32,
            height: pixel_buffer.height() as u32,
            bytes_per_row: pixel_buffer.bytes_per_row() as u32,
            data: guard.as_slice().to_vec(),
        };
        drop(guard);

        let pts = media_time(sample.presentation_timestamp());
        let mut buffer = SampleBuffer::video(pts, frame);
        if self.hdr {
            // SAFETY: the pixel buffer is retained by `pixel_buffer` for the call
            let color = unsafe { buffer_color_attachments(pixel_buffer.as_ptr() as *const _) };
            if let Some(color) = color {
                buffer = buffer.with_color(color);
            }
        }
        self.sink.on_sample(buffer, TrackKind::Video);

        let count = self.frames.fetch_add(1, Ordering::Relaxed) + 1;
        if count % (u64::from(self.fps.max(1)) * 10) == 0 {
            tracing::debug!("Captured {} frames", count);
        }
    }
}

/// System audio handler
struct AudioOutputHandler {
    sink: Arc<dyn SampleSink>,
    running: Arc<AtomicBool>,
    format_logged: AtomicBool,
}

impl AudioOutputHandler {
    fn log_audio_format(&self, list: &AudioBufferList, format: Option<&CMFormatDescription>) {
        let buffers = list.num_buffers();
        let channels_per_buffer = list.get(0).map(|b| b.number_channels).unwrap_or(0);
        match format {
            Some(fd) => {
                tracing::info!(
                    "System audio format: buffers={}, ch/buffer={}, sample_rate={:?}Hz, float={}",
                    buffers,
                    channels_per_buffer,
                    fd.audio_sample_rate(),
                    fd.audio_is_float()
                );
                let rate = fd.audio_sample_rate().unwrap_or(0.0) as u32;
                if rate != SYSTEM_AUDIO_SAMPLE_RATE || !fd.audio_is_float() {
                    tracing::warn!("System audio is not 48kHz float; output may be distorted");
                }
            }
            None => tracing::info!(
                "System audio format: buffers={}, ch/buffer={} (no description)",
                buffers,
                channels_per_buffer
            ),
        }
    }

    /// Normalize the delivered buffers to interleaved stereo
    fn samples(list: &AudioBufferList) -> Option<Vec<f32>> {
        match list.num_buffers() {
            0 => None,
            1 => {
                let data = list.get(0)?.data();
                (!data.is_empty()).then(|| f32_from_le_bytes(data))
            }
            n => {
                if n > 2 {
                    tracing::warn!("{} audio planes; keeping the first two", n);
                }
                let left = f32_from_le_bytes(list.get(0)?.data());
                let right = f32_from_le_bytes(list.get(1)?.data());
                if left.is_empty() || left.len() != right.len() {
                    tracing::warn!(
                        "Mismatched audio planes: left={}, right={}",
                        left.len(),
                        right.len()
                    );
                    return None;
                }
                Some(interleave(&[&left, &right]))
            }
        }
    }
}

impl SCStreamOutputTrait for AudioOutputHandler {
    fn did_output_sample_buffer(&self, sample: CMSampleBuffer, output_type: SCStreamOutputType) {
        if output_type != SCStreamOutputType::Audio || !self.running.load(Ordering::Relaxed) {
            return;
        }
        let Some(list) = sample.audio_buffer_list() else {
            return;
        };
        if !self.format_logged.swap(true, Ordering::Relaxed) {
            self.log_audio_format(&list, sample.format_description().as_ref());
        }
        let Some(samples) = Self::samples(&list) else {
            return;
        };

        let chunk = AudioChunk {
            sample_rate: SYSTEM_AUDIO_SAMPLE_RATE,
            channels: SYSTEM_AUDIO_CHANNELS,
            samples,
        };
        let pts = media_time(sample.presentation_timestamp());
        self.sink.on_sample(
            SampleBuffer::audio(TrackKind::SystemAudio, pts, chunk),
            TrackKind::SystemAudio,
        );
    }
}

/// Forwards an asynchronous stream stop to the sink
struct StreamErrorHandler {
    sink: Arc<dyn SampleSink>,
    running: Arc<AtomicBool>,
}

impl SCStreamDelegateTrait for StreamErrorHandler {
    fn did_stop_with_error(&self, error: SCError) {
        if self.running.swap(false, Ordering::SeqCst) {
            self.sink.on_stream_error(RecordingError::StreamFailure(format!(
                "ScreenCaptureKit stream stopped: {:?}",
                error
            )));
        }
    }
}

/// Display (and optionally system audio) source backed by one `SCStream`
pub struct DisplayCaptureChannel {
    id: String,
    display_id: u32,
    width: u32,
    height: u32,
    fps: u32,
    capture_audio: bool,
    hdr: bool,
    running: Arc<AtomicBool>,
    stream: Option<SCStream>,
}

impl DisplayCaptureChannel {
    pub fn new(display: &DisplayInfo, fps: u32, capture_audio: bool, hdr: bool) -> Self {
        Self {
            id: format!("display-{}", display.id),
            display_id: display.id,
            width: display.width,
            height: display.height,
            fps,
            capture_audio,
            hdr,
            running: Arc::new(AtomicBool::new(false)),
            stream: None,
        }
    }

    fn find_display(&self) -> RecordingResult<SCDisplay> {
        let content = SCShareableContent::get().map_err(|e| {
            RecordingError::SetupFailure(format!("Failed to get shareable content: {:?}", e))
        })?;

        content
            .displays()
            .into_iter()
            .find(|d| d.display_id() == self.display_id)
            .ok_or_else(|| {
                RecordingError::DeviceNotFound(format!("Display {} not found", self.display_id))
            })
    }
}

#[async_trait]
impl CaptureChannel for DisplayCaptureChannel {
    fn id(&self) -> &str {
        &self.id
    }

    fn channel_type(&self) -> ChannelType {
        ChannelType::Display
    }

    fn tracks(&self) -> Vec<TrackKind> {
        if self.capture_audio {
            vec![TrackKind::Video, TrackKind::SystemAudio]
        } else {
            vec![TrackKind::Video]
        }
    }

    async fn start(&mut self, sink: Arc<dyn SampleSink>) -> RecordingResult<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(RecordingError::AlreadyRecording);
        }

        let display = self.find_display()?;
        let filter = SCContentFilter::create()
            .with_display(&display)
            .with_excluding_windows(&[])
            .build();

        let frame_interval = CMTime::new(1, self.fps as i32);
        let mut config = SCStreamConfiguration::new()
            .with_width(self.width)
            .with_height(self.height)
            .with_pixel_format(PixelFormat::BGRA)
            .with_minimum_frame_interval(&frame_interval)
            .with_shows_cursor(true);
        if self.capture_audio {
            config = config
                .with_captures_audio(true)
                .with_sample_rate(SYSTEM_AUDIO_SAMPLE_RATE as i32)
                .with_channel_count(SYSTEM_AUDIO_CHANNELS as i32)
                .with_excludes_current_process_audio(true);
        }

        let delegate = StreamErrorHandler {
            sink: sink.clone(),
            running: self.running.clone(),
        };
        let mut stream = SCStream::new_with_delegate(&filter, &config, delegate);
        stream.add_output_handler(
            FrameHandler {
                sink: sink.clone(),
                running: self.running.clone(),
                frames: AtomicU64::new(0),
                fps: self.fps,
                hdr: self.hdr,
            },
            SCStreamOutputType::Screen,
        );
        if self.capture_audio {
            stream.add_output_handler(
                AudioOutputHandler {
                    sink,
                    running: self.running.clone(),
                    format_logged: AtomicBool::new(false),
                },
                SCStreamOutputType::Audio,
            );
        }

        self.running.store(true, Ordering::SeqCst);
        if let Err(e) = stream.start_capture() {
            self.running.store(false, Ordering::SeqCst);
            return Err(RecordingError::SetupFailure(format!(
                "Failed to start capture: {:?}",
                e
            )));
        }
        self.stream = Some(stream);

        tracing::info!(
            "Display capture started for display {} ({}x{} @ {}fps, system audio: {})",
            self.display_id,
            self.width,
            self.height,
            self.fps,
            self.capture_audio
        );
        Ok(())
    }

    async fn stop(&mut self) -> RecordingResult<()> {
        self.running.store(false, Ordering::SeqCst);
        let Some(stream) = self.stream.take() else {
            return Ok(());
        };
        stream.stop_capture().map_err(|e| {
            RecordingError::StreamFailure(format!("Failed to stop capture: {:?}", e))
        })?;
        tracing::info!("Display capture stopped");
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
