//! Capture sources and input telemetry
//!
//! Platform-independent helpers live here; the OS adapters are under
//! `macos`.

pub mod audio;
pub mod denoise;
pub mod input;
pub mod traits;

#[cfg(target_os = "macos")]
pub mod macos;

pub use traits::{has_permission, request_permission, AudioDeviceInfo, DisplayInfo, Permission};
