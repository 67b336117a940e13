//! Microphone capture using cpal
//!
//! The cpal stream lives on a dedicated thread because `cpal::Stream` is not
//! `Send`. Each callback converts to `f32`, applies the configured gain and
//! forwards one `SampleBuffer` stamped with the callback's capture time.

use crate::capture::audio::{apply_gain, i16_to_f32, u16_to_f32};
use crate::capture::traits::AudioDeviceInfo;
use crate::recorder::channel::{
    CaptureChannel, ChannelType, RecordingError, RecordingResult, SampleSink,
};
use crate::recorder::sample::{AudioChunk, MediaTime, SampleBuffer, TrackKind};
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, StreamConfig, StreamInstant};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::Duration;

const NANOS_PER_SECOND: i32 = 1_000_000_000;
const PREFERRED_SAMPLE_RATE: u32 = 48_000;

/// List available audio input devices
pub fn get_audio_input_devices() -> Vec<AudioDeviceInfo> {
    let host = cpal::default_host();
    let default_name = host.default_input_device().and_then(|d| d.name().ok());

    let Ok(devices) = host.input_devices() else {
        return Vec::new();
    };
    devices
        .filter_map(|device| device.name().ok())
        .map(|name| AudioDeviceInfo {
            id: name.clone(),
            is_default: default_name.as_ref() == Some(&name),
            name,
        })
        .collect()
}

fn find_device(name: Option<&str>) -> RecordingResult<Device> {
    let host = cpal::default_host();
    match name {
        Some(name) => host
            .input_devices()
            .ok()
            .and_then(|mut devices| devices.find(|d| d.name().ok().as_deref() == Some(name)))
            .ok_or_else(|| {
                RecordingError::DeviceNotFound(format!("Audio device '{}' not found", name))
            }),
        None => host.default_input_device().ok_or_else(|| {
            RecordingError::DeviceNotFound("No default audio input device".to_string())
        }),
    }
}

/// The device's default input config, moved to 48kHz when the device
/// supports it with the same layout. Writers resample any other rate.
fn preferred_config(device: &Device) -> RecordingResult<cpal::SupportedStreamConfig> {
    let default = device.default_input_config().map_err(|e| {
        RecordingError::SetupFailure(format!("Failed to get audio config: {e}"))
    })?;
    if default.sample_rate().0 == PREFERRED_SAMPLE_RATE {
        return Ok(default);
    }
    let target = cpal::SampleRate(PREFERRED_SAMPLE_RATE);
    let matching = device.supported_input_configs().ok().and_then(|mut configs| {
        configs.find(|c| {
            c.channels() == default.channels()
                && c.sample_format() == default.sample_format()
                && c.min_sample_rate() <= target
                && c.max_sample_rate() >= target
        })
    });
    Ok(match matching {
        Some(range) => range.with_sample_rate(target),
        None => {
            tracing::info!(
                "Microphone has no {}Hz mode; capturing at {}Hz and resampling",
                PREFERRED_SAMPLE_RATE,
                default.sample_rate().0
            );
            default
        }
    })
}

/// Capture time of a callback on the host clock.
///
/// CoreAudio stream instants are host time in nanoseconds, the same clock
/// ScreenCaptureKit stamps its buffers with.
fn capture_time(info: &cpal::InputCallbackInfo) -> MediaTime {
    info.timestamp()
        .capture
        .duration_since(&StreamInstant::new(0, 0))
        .map(|d| MediaTime::new(d.as_nanos() as i64, NANOS_PER_SECOND))
        .unwrap_or(MediaTime::INVALID)
}

/// Per-callback state shared by every sample format
struct MicrophoneTap {
    sink: Arc<dyn SampleSink>,
    running: Arc<AtomicBool>,
    gain: f32,
    sample_rate: u32,
    channels: u16,
    callbacks: AtomicU64,
}

impl MicrophoneTap {
    fn deliver(&self, mut samples: Vec<f32>, info: &cpal::InputCallbackInfo) {
        let count = self.callbacks.fetch_add(1, Ordering::Relaxed);
        if count == 0 {
            tracing::info!("Microphone: first callback received");
        } else if count % 500 == 0 {
            tracing::debug!("Microphone: {} callbacks, {} samples", count, samples.len());
        }
        if !self.running.load(Ordering::Relaxed) {
            return;
        }

        apply_gain(&mut samples, self.gain);
        let chunk = AudioChunk {
            sample_rate: self.sample_rate,
            channels: self.channels,
            samples,
        };
        self.sink.on_sample(
            SampleBuffer::audio(TrackKind::MicrophoneAudio, capture_time(info), chunk),
            TrackKind::MicrophoneAudio,
        );
    }
}

fn build_stream(
    device: &Device,
    format: SampleFormat,
    config: &StreamConfig,
    tap: Arc<MicrophoneTap>,
) -> RecordingResult<cpal::Stream> {
    let on_error = {
        let tap = tap.clone();
        move |err: cpal::StreamError| {
            tracing::error!("Microphone stream error: {}", err);
            if tap.running.swap(false, Ordering::SeqCst) {
                tap.sink
                    .on_stream_error(RecordingError::StreamFailure(format!("microphone: {err}")));
            }
        }
    };

    let stream = match format {
        SampleFormat::F32 => device.build_input_stream(
            config,
            move |data: &[f32], info: &cpal::InputCallbackInfo| tap.deliver(data.to_vec(), info),
            on_error,
            None,
        ),
        SampleFormat::I16 => device.build_input_stream(
            config,
            move |data: &[i16], info: &cpal::InputCallbackInfo| {
                tap.deliver(data.iter().map(|&s| i16_to_f32(s)).collect(), info)
            },
            on_error,
            None,
        ),
        SampleFormat::U16 => device.build_input_stream(
            config,
            move |data: &[u16], info: &cpal::InputCallbackInfo| {
                tap.deliver(data.iter().map(|&s| u16_to_f32(s)).collect(), info)
            },
            on_error,
            None,
        ),
        other => {
            return Err(RecordingError::SetupFailure(format!(
                "Unsupported microphone sample format: {:?}",
                other
            )))
        }
    };
    stream.map_err(|e| RecordingError::SetupFailure(format!("Failed to build audio stream: {e}")))
}

/// Microphone source
pub struct MicrophoneCaptureChannel {
    id: String,
    device_name: Option<String>,
    gain: f32,
    running: Arc<AtomicBool>,
    stream_thread: Option<JoinHandle<()>>,
}

impl MicrophoneCaptureChannel {
    /// Capture from `device_name`, or the default input when `None`
    pub fn new(device_name: Option<String>, gain: f32) -> Self {
        Self {
            id: "microphone".to_string(),
            device_name,
            gain,
            running: Arc::new(AtomicBool::new(false)),
            stream_thread: None,
        }
    }
}

#[async_trait]
impl CaptureChannel for MicrophoneCaptureChannel {
    fn id(&self) -> &str {
        &self.id
    }

    fn channel_type(&self) -> ChannelType {
        ChannelType::Microphone
    }

    fn tracks(&self) -> Vec<TrackKind> {
        vec![TrackKind::MicrophoneAudio]
    }

    async fn start(&mut self, sink: Arc<dyn SampleSink>) -> RecordingResult<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(RecordingError::AlreadyRecording);
        }
        self.running.store(true, Ordering::SeqCst);

        // The thread reports whether the stream came up
        let (ready_tx, ready_rx) = mpsc::channel::<RecordingResult<()>>();
        let device_name = self.device_name.clone();
        let running = self.running.clone();
        let gain = self.gain;

        let handle = std::thread::Builder::new()
            .name("microphone".into())
            .spawn(move || {
                let started = (|| {
                    let device = find_device(device_name.as_deref())?;
                    let supported = preferred_config(&device)?;
                    let format = supported.sample_format();
                    let config: StreamConfig = supported.into();
                    tracing::info!(
                        "Microphone stream config: {} format={:?}, {}Hz, {}ch",
                        device.name().unwrap_or_else(|_| "Unknown".to_string()),
                        format,
                        config.sample_rate.0,
                        config.channels
                    );

                    let tap = Arc::new(MicrophoneTap {
                        sink,
                        running: running.clone(),
                        gain,
                        sample_rate: config.sample_rate.0,
                        channels: config.channels,
                        callbacks: AtomicU64::new(0),
                    });
                    let stream = build_stream(&device, format, &config, tap)?;
                    stream.play().map_err(|e| {
                        RecordingError::SetupFailure(format!("Failed to start microphone: {e}"))
                    })?;
                    Ok(stream)
                })();

                let stream = match started {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        running.store(false, Ordering::SeqCst);
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                while running.load(Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(100));
                }
                drop(stream);
                tracing::info!("Microphone audio stream stopped");
            })?;

        let ready = tokio::task::spawn_blocking(move || {
            ready_rx.recv().unwrap_or_else(|_| {
                Err(RecordingError::SetupFailure(
                    "microphone thread exited during setup".to_string(),
                ))
            })
        })
        .await
        .map_err(|e| RecordingError::SetupFailure(format!("microphone setup task: {e}")))?;

        if let Err(e) = ready {
            self.running.store(false, Ordering::SeqCst);
            let _ = handle.join();
            return Err(e);
        }

        self.stream_thread = Some(handle);
        tracing::info!("Microphone capture started (gain {:.1})", self.gain);
        Ok(())
    }

    async fn stop(&mut self) -> RecordingResult<()> {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.stream_thread.take() {
            tokio::task::spawn_blocking(move || handle.join())
                .await
                .map_err(|e| RecordingError::StreamFailure(e.to_string()))?
                .map_err(|_| {
                    RecordingError::StreamFailure("microphone thread panicked".to_string())
                })?;
            tracing::info!("Microphone capture stopped");
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
