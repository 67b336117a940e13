//! Capture type definitions
//!
//! Platform-agnostic descriptions of capture targets and permissions.

use serde::{Deserialize, Serialize};

/// Information about a display/screen
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayInfo {
    /// Unique display ID
    pub id: u32,

    pub name: String,

    /// Capture width in pixels
    pub width: u32,

    /// Capture height in pixels
    pub height: u32,

    /// Logical screen size in points, used by cursor telemetry
    pub screen_width: f64,
    pub screen_height: f64,

    /// Scale factor (e.g., 2.0 for Retina)
    pub scale_factor: f64,

    pub is_primary: bool,
}

/// Information about an audio device
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioDeviceInfo {
    pub id: String,
    pub name: String,
    pub is_default: bool,
}

/// OS privacy permissions the recorder depends on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Permission {
    ScreenRecording,
    Microphone,
    /// Needed for the global keyboard tap
    Accessibility,
}

impl std::fmt::Display for Permission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Permission::ScreenRecording => write!(f, "screen recording"),
            Permission::Microphone => write!(f, "microphone"),
            Permission::Accessibility => write!(f, "accessibility"),
        }
    }
}

/// Check whether a permission is granted on this platform
pub fn has_permission(permission: Permission) -> bool {
    #[cfg(target_os = "macos")]
    {
        crate::capture::macos::permissions::has_permission(permission)
    }

    #[cfg(not(target_os = "macos"))]
    {
        let _ = permission;
        false
    }
}

/// Ask the system for a permission, returning whether it is granted now
pub fn request_permission(permission: Permission) -> bool {
    #[cfg(target_os = "macos")]
    {
        crate::capture::macos::permissions::request_permission(permission)
    }

    #[cfg(not(target_os = "macos"))]
    {
        let _ = permission;
        false
    }
}
