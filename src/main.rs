//! Screen recorder CLI

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use open_screenrecorder::capture::{request_permission, Permission};
use open_screenrecorder::recorder::{RecordingConfig, TelemetryFormat};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "screenrec")]
#[command(about = "Record the screen, system audio, microphone and input telemetry")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record until Ctrl+C or the given duration elapses
    Record {
        /// JSON config file; flags below override it
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Output directory (defaults to ~/Downloads)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Display ID (defaults to the main display)
        #[arg(long)]
        display: Option<u32>,

        #[arg(long)]
        fps: Option<u32>,

        /// Capture the microphone into a separate WAV file
        #[arg(long)]
        mic: bool,

        /// Input device name
        #[arg(long)]
        mic_device: Option<String>,

        /// Skip system audio
        #[arg(long)]
        no_system_audio: bool,

        /// Skip cursor and keyboard telemetry
        #[arg(long)]
        no_input: bool,

        /// Write telemetry as JSON instead of CSV
        #[arg(long)]
        json: bool,

        #[arg(long)]
        hdr: bool,

        /// Stop after this many seconds
        #[arg(short, long)]
        duration: Option<u64>,
    },

    /// List displays
    Displays,

    /// List audio input devices
    Devices,

    /// Check permissions
    Permissions {
        /// Request the ones not granted
        #[arg(long)]
        request: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    open_screenrecorder::init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Record {
            config,
            output,
            display,
            fps,
            mic,
            mic_device,
            no_system_audio,
            no_input,
            json,
            hdr,
            duration,
        } => {
            let mut config = match config {
                Some(path) => RecordingConfig::load(&path)
                    .with_context(|| format!("loading config {}", path.display()))?,
                None => RecordingConfig::default(),
            };
            if output.is_some() {
                config.output_dir = output;
            }
            if display.is_some() {
                config.display_id = display;
            }
            if let Some(fps) = fps {
                config.fps = fps;
            }
            if mic {
                config.capture_microphone = true;
            }
            if mic_device.is_some() {
                config.microphone_device = mic_device;
            }
            if no_system_audio {
                config.capture_system_audio = false;
            }
            if no_input {
                config.track_input = false;
            }
            if json {
                config.telemetry_format = TelemetryFormat::Json;
            }
            config.hdr |= hdr;
            record(config, duration.map(Duration::from_secs)).await?;
        }
        Commands::Displays => displays()?,
        Commands::Devices => devices()?,
        Commands::Permissions { request } => permissions(request),
    }

    Ok(())
}

#[cfg(target_os = "macos")]
async fn record(config: RecordingConfig, duration: Option<Duration>) -> Result<()> {
    use open_screenrecorder::capture::macos::MacCaptureBackend;
    use open_screenrecorder::recorder::{Recorder, RecorderEvent, RecorderState};
    use std::sync::Arc;

    let recorder = Recorder::new(Arc::new(MacCaptureBackend));
    let mut events = recorder.subscribe();
    recorder.start(config).await?;
    println!("Recording (Ctrl+C to stop)");

    let sleep = async {
        match duration {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(sleep);

    let output = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break recorder.stop().await?,
            _ = &mut sleep => break recorder.stop().await?,
            event = events.recv() => match event {
                Ok(RecorderEvent::TelemetryDegraded(reason)) => {
                    eprintln!("Telemetry degraded: {}", reason);
                }
                Ok(RecorderEvent::Stopped(output)) => {
                    // Stopped on its own after a fault
                    if let RecorderState::Error(cause) = recorder.state() {
                        eprintln!("Recording failed: {}", cause);
                    }
                    break output;
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    bail!("recorder went away")
                }
            },
        }
    };

    if output.timed_out {
        eprintln!("Warning: writers did not finish in time; files may be truncated");
    }
    for file in output.files() {
        println!("{}", file.display());
    }
    Ok(())
}

#[cfg(not(target_os = "macos"))]
async fn record(_config: RecordingConfig, _duration: Option<Duration>) -> Result<()> {
    bail!("recording is only supported on macOS")
}

#[cfg(target_os = "macos")]
fn displays() -> Result<()> {
    for display in open_screenrecorder::capture::macos::get_displays() {
        println!(
            "{}\t{}\t{}x{} @{}x{}",
            display.id,
            display.name,
            display.width,
            display.height,
            display.scale_factor,
            if display.is_primary { " (main)" } else { "" }
        );
    }
    Ok(())
}

#[cfg(target_os = "macos")]
fn devices() -> Result<()> {
    for device in open_screenrecorder::capture::macos::get_audio_input_devices() {
        let marker = if device.is_default { " (default)" } else { "" };
        println!("{}{}", device.name, marker);
    }
    Ok(())
}

#[cfg(not(target_os = "macos"))]
fn displays() -> Result<()> {
    bail!("display listing is only supported on macOS")
}

#[cfg(not(target_os = "macos"))]
fn devices() -> Result<()> {
    bail!("device listing is only supported on macOS")
}

fn permissions(request: bool) {
    use open_screenrecorder::capture::has_permission;

    for permission in [
        Permission::ScreenRecording,
        Permission::Microphone,
        Permission::Accessibility,
    ] {
        let granted = if request && !has_permission(permission) {
            request_permission(permission)
        } else {
            has_permission(permission)
        };
        println!("{}: {}", permission, if granted { "granted" } else { "missing" });
    }
}
