use crate::capture::input::cursor::CursorMetrics;
use crate::capture::input::InputProbe;
use core_graphics::display::CGDisplay;
use objc2::rc::Retained;
use objc2_app_kit::{NSCursor, NSEvent, NSImage};
use objc2_foundation::{NSPoint, NSSize};

/// Pointer state read through AppKit class methods.
///
/// AppKit reports global positions with the origin at the bottom left of
/// the main display; positions are flipped to a top-left origin.
pub struct MacInputProbe {
    main_height: f64,
}

impl MacInputProbe {
    pub fn new() -> Self {
        Self {
            main_height: CGDisplay::main().bounds().size.height,
        }
    }
}

impl Default for MacInputProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl InputProbe for MacInputProbe {
    fn pointer_location(&self) -> (f64, f64) {
        let pos: NSPoint = unsafe { NSEvent::mouseLocation() };
        (pos.x, self.main_height - pos.y)
    }

    fn pressed_buttons(&self) -> u32 {
        (unsafe { NSEvent::pressedMouseButtons() }) as u32 & 0b111
    }

    fn cursor_metrics(&self) -> Option<CursorMetrics> {
        let cursor: Retained<NSCursor> = unsafe { NSCursor::currentSystemCursor() }?;
        unsafe {
            let hotspot: NSPoint = cursor.hotSpot();
            let image: Retained<NSImage> = cursor.image();
            let size: NSSize = image.size();
            Some(CursorMetrics::new(
                size.width,
                size.height,
                hotspot.x,
                hotspot.y,
            ))
        }
    }
}
