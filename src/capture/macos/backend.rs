use super::input::MacInputProbe;
use super::keyboard::MacKeyboardTap;
use super::microphone::MicrophoneCaptureChannel;
use super::permissions;
use super::screen::{find_display_info, DisplayCaptureChannel};
use crate::capture::input::{InputProbe, KeyboardTap};
use crate::capture::traits::{DisplayInfo, Permission};
use crate::recorder::channel::{CaptureChannel, RecordingResult};
use crate::recorder::controller::CaptureBackend;
use crate::recorder::state::{CaptureSession, RecordingConfig};
use async_trait::async_trait;
use std::sync::Arc;

/// ScreenCaptureKit, cpal and AppKit behind the recorder
#[derive(Debug, Default)]
pub struct MacCaptureBackend;

#[async_trait]
impl CaptureBackend for MacCaptureBackend {
    fn has_permission(&self, permission: Permission) -> bool {
        permissions::has_permission(permission)
    }

    async fn display(&self, id: Option<u32>) -> RecordingResult<DisplayInfo> {
        find_display_info(id)
    }

    async fn open_sources(
        &self,
        config: &RecordingConfig,
        session: &CaptureSession,
    ) -> RecordingResult<Vec<Box<dyn CaptureChannel>>> {
        let mut sources: Vec<Box<dyn CaptureChannel>> = vec![Box::new(DisplayCaptureChannel::new(
            &session.display,
            session.fps,
            config.capture_system_audio,
            config.hdr,
        ))];
        if config.capture_microphone {
            sources.push(Box::new(MicrophoneCaptureChannel::new(
                config.microphone_device.clone(),
                config.microphone_gain,
            )));
        }
        Ok(sources)
    }

    fn input_probe(&self) -> Option<Arc<dyn InputProbe>> {
        Some(Arc::new(MacInputProbe::new()))
    }

    fn keyboard_tap(&self) -> Option<Box<dyn KeyboardTap>> {
        Some(Box::new(MacKeyboardTap::new()))
    }
}
