//! Open ScreenRecorder - screen, audio and input capture for macOS.
//!
//! Captures one display with its system audio, an optional microphone and
//! cursor/keyboard telemetry into timestamped files. The writer coordinator
//! keeps every track on one timeline anchored at the first video frame.

pub mod capture;
pub mod recorder;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global tracing subscriber.
///
/// `RUST_LOG` overrides the default filter.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "open_screenrecorder=debug,screenrec=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
