//! macOS capture implementations
//!
//! ScreenCaptureKit for the display and system audio, cpal for the
//! microphone, AppKit and CoreGraphics for input telemetry.

pub mod backend;
pub mod color;
pub mod input;
pub mod keyboard;
pub mod microphone;
pub mod permissions;
pub mod screen;

pub use backend::MacCaptureBackend;
pub use microphone::{get_audio_input_devices, MicrophoneCaptureChannel};
pub use permissions::{has_permission, request_permission};
pub use screen::{get_displays, DisplayCaptureChannel};
