//! macOS permission handling
//!
//! Screen recording goes through the CoreGraphics preflight/request calls.
//! Microphone access is read from the AVFoundation authorization status; an
//! undetermined status is prompted for by the system on first capture.
//! Accessibility is needed by the keyboard tap.

use crate::capture::traits::Permission;
use core_graphics::access::ScreenCaptureAccess;
use cpal::traits::HostTrait;
use objc2::msg_send;
use objc2::runtime::AnyClass;
use objc2_foundation::NSString;

#[link(name = "AVFoundation", kind = "framework")]
extern "C" {
    static AVMediaTypeAudio: &'static NSString;
}

/// `AVAuthorizationStatus` for audio capture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MicrophoneAuthorization {
    NotDetermined,
    Restricted,
    Denied,
    Authorized,
}

impl MicrophoneAuthorization {
    fn from_raw(status: isize) -> Self {
        match status {
            1 => MicrophoneAuthorization::Restricted,
            2 => MicrophoneAuthorization::Denied,
            3 => MicrophoneAuthorization::Authorized,
            _ => MicrophoneAuthorization::NotDetermined,
        }
    }

    /// Whether capture may start. Undetermined access is allowed through
    /// when an input device exists, since starting capture shows the prompt.
    fn allows_capture(self, has_input_device: bool) -> bool {
        match self {
            MicrophoneAuthorization::Authorized => true,
            MicrophoneAuthorization::NotDetermined => has_input_device,
            MicrophoneAuthorization::Restricted | MicrophoneAuthorization::Denied => false,
        }
    }
}

pub fn microphone_authorization() -> MicrophoneAuthorization {
    let Some(class) = AnyClass::get("AVCaptureDevice") else {
        tracing::warn!("AVCaptureDevice unavailable; microphone access unknown");
        return MicrophoneAuthorization::NotDetermined;
    };
    // SAFETY: class method taking an AVMediaType and returning NSInteger
    let status: isize =
        unsafe { msg_send![class, authorizationStatusForMediaType: AVMediaTypeAudio] };
    MicrophoneAuthorization::from_raw(status)
}

fn has_microphone_permission() -> bool {
    let authorization = microphone_authorization();
    let has_device = cpal::default_host().default_input_device().is_some();
    tracing::debug!("Microphone authorization: {:?}, input device: {}", authorization, has_device);
    authorization.allows_capture(has_device)
}

pub fn has_permission(permission: Permission) -> bool {
    match permission {
        Permission::ScreenRecording => ScreenCaptureAccess::preflight(),
        Permission::Microphone => has_microphone_permission(),
        Permission::Accessibility => has_accessibility_permission(),
    }
}

/// Ask the system for `permission`; returns whether it is granted now.
///
/// Screen recording shows the system prompt. Accessibility can only be
/// granted in System Settings, so its pane is opened instead.
pub fn request_permission(permission: Permission) -> bool {
    match permission {
        Permission::ScreenRecording => {
            let granted = ScreenCaptureAccess::request();
            if !granted {
                open_privacy_pane("Privacy_ScreenCapture");
            }
            granted
        }
        Permission::Microphone => {
            let granted = has_permission(Permission::Microphone);
            if !granted {
                open_privacy_pane("Privacy_Microphone");
            }
            granted
        }
        Permission::Accessibility => {
            let granted = has_accessibility_permission();
            if !granted {
                open_privacy_pane("Privacy_Accessibility");
            }
            granted
        }
    }
}

fn has_accessibility_permission() -> bool {
    unsafe {
        extern "C" {
            fn AXIsProcessTrusted() -> bool;
        }
        AXIsProcessTrusted()
    }
}

fn open_privacy_pane(anchor: &str) {
    let url = format!("x-apple.systempreferences:com.apple.preference.security?{anchor}");
    match std::process::Command::new("open").arg(&url).output() {
        Ok(output) if output.status.success() => {}
        _ => tracing::warn!("Failed to open System Settings at {}", anchor),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authorization_status_mapping() {
        assert_eq!(MicrophoneAuthorization::from_raw(0), MicrophoneAuthorization::NotDetermined);
        assert_eq!(MicrophoneAuthorization::from_raw(2), MicrophoneAuthorization::Denied);
        assert_eq!(MicrophoneAuthorization::from_raw(3), MicrophoneAuthorization::Authorized);
    }

    #[test]
    fn test_denied_blocks_capture_even_with_a_device() {
        assert!(!MicrophoneAuthorization::Denied.allows_capture(true));
        assert!(!MicrophoneAuthorization::Restricted.allows_capture(true));
        assert!(MicrophoneAuthorization::NotDetermined.allows_capture(true));
        assert!(!MicrophoneAuthorization::NotDetermined.allows_capture(false));
        assert!(MicrophoneAuthorization::Authorized.allows_capture(false));
    }
}
