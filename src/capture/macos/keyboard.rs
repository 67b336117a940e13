//! Global keyboard tap using a listen-only `CGEventTap`
//!
//! The tap and its run loop source live on a dedicated thread that spins the
//! run loop in short slices until asked to stop, then detaches the source.

use crate::capture::input::{KeyEvent, KeyEventHandler, KeyState, KeyboardTap, Modifiers};
use crate::recorder::channel::{RecordingError, RecordingResult};
use core_foundation::runloop::{kCFRunLoopCommonModes, kCFRunLoopDefaultMode, CFRunLoop};
use core_graphics::event::{
    CGEvent, CGEventFlags, CGEventTap, CGEventTapLocation, CGEventTapOptions,
    CGEventTapPlacement, CGEventType, EventField,
};
use foreign_types::ForeignType;
use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::Duration;

const RUN_LOOP_SLICE: Duration = Duration::from_millis(50);
const MAX_KEY_TEXT: usize = 8;

#[link(name = "ApplicationServices", kind = "framework")]
extern "C" {
    fn CGEventKeyboardGetUnicodeString(
        event: *const c_void,
        max_length: usize,
        actual_length: *mut usize,
        buffer: *mut u16,
    );
}

/// Text the event types under the active keyboard layout
fn event_text(event: &CGEvent) -> Option<String> {
    let mut units = [0u16; MAX_KEY_TEXT];
    let mut len = 0usize;
    // SAFETY: the event outlives the call and the buffer holds `MAX_KEY_TEXT` units
    unsafe {
        CGEventKeyboardGetUnicodeString(
            event.as_ptr() as *const c_void,
            units.len(),
            &mut len,
            units.as_mut_ptr(),
        );
    }
    decode_key_text(&units[..len.min(MAX_KEY_TEXT)])
}

fn decode_key_text(units: &[u16]) -> Option<String> {
    if units.is_empty() {
        return None;
    }
    String::from_utf16(units).ok()
}

fn modifiers_from_flags(flags: CGEventFlags) -> Modifiers {
    let mut modifiers = Modifiers::empty();
    for (flag, modifier) in [
        (CGEventFlags::CGEventFlagShift, Modifiers::SHIFT),
        (CGEventFlags::CGEventFlagControl, Modifiers::CONTROL),
        (CGEventFlags::CGEventFlagAlternate, Modifiers::OPTION),
        (CGEventFlags::CGEventFlagCommand, Modifiers::COMMAND),
        (CGEventFlags::CGEventFlagAlphaShift, Modifiers::CAPS_LOCK),
        (CGEventFlags::CGEventFlagSecondaryFn, Modifiers::FUNCTION),
    ] {
        if flags.contains(flag) {
            modifiers.insert(modifier);
        }
    }
    modifiers
}

fn key_event(event_type: CGEventType, event: &CGEvent) -> Option<KeyEvent> {
    let state = match event_type {
        CGEventType::KeyDown => KeyState::Down,
        CGEventType::KeyUp => KeyState::Up,
        _ => return None,
    };
    let key_code = event.get_integer_value_field(EventField::KEYBOARD_EVENT_KEYCODE) as u16;
    Some(KeyEvent {
        state,
        key_code,
        text: event_text(event),
        modifiers: modifiers_from_flags(event.get_flags()),
    })
}

fn run_tap(
    handler: KeyEventHandler,
    stop: Arc<AtomicBool>,
    ready: mpsc::Sender<RecordingResult<()>>,
) {
    let callback_handler = handler.clone();
    let tap = CGEventTap::new(
        CGEventTapLocation::Session,
        CGEventTapPlacement::TailAppendEventTap,
        CGEventTapOptions::ListenOnly,
        vec![CGEventType::KeyDown, CGEventType::KeyUp],
        move |_proxy, event_type, event| {
            if let Some(key) = key_event(event_type, event) {
                callback_handler(key);
            }
            None
        },
    );
    let tap = match tap {
        Ok(tap) => tap,
        Err(()) => {
            let _ = ready.send(Err(RecordingError::PermissionDenied(
                "could not create keyboard event tap; grant Accessibility access".to_string(),
            )));
            return;
        }
    };

    let source = match tap.mach_port.create_runloop_source(0) {
        Ok(source) => source,
        Err(()) => {
            let _ = ready.send(Err(RecordingError::TelemetryFailure(
                "could not create run loop source for keyboard tap".to_string(),
            )));
            return;
        }
    };

    let run_loop = CFRunLoop::get_current();
    // SAFETY: the mode constants are static CFStrings
    unsafe {
        run_loop.add_source(&source, kCFRunLoopCommonModes);
    }
    tap.enable();
    let _ = ready.send(Ok(()));
    tracing::info!("Keyboard tap installed");

    while !stop.load(Ordering::Relaxed) {
        // SAFETY: see above
        unsafe {
            CFRunLoop::run_in_mode(kCFRunLoopDefaultMode, RUN_LOOP_SLICE, true);
        }
    }

    unsafe {
        run_loop.remove_source(&source, kCFRunLoopCommonModes);
    }
    drop(tap);
    tracing::info!("Keyboard tap removed");
}

pub struct MacKeyboardTap {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl MacKeyboardTap {
    pub fn new() -> Self {
        Self {
            stop: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }
}

impl Default for MacKeyboardTap {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyboardTap for MacKeyboardTap {
    fn install(&mut self, handler: KeyEventHandler) -> RecordingResult<()> {
        if self.thread.is_some() {
            return Ok(());
        }
        self.stop.store(false, Ordering::SeqCst);

        let (ready_tx, ready_rx) = mpsc::channel();
        let stop = self.stop.clone();
        let thread = std::thread::Builder::new()
            .name("keyboard-tap".into())
            .spawn(move || run_tap(handler, stop, ready_tx))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.thread = Some(thread);
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(RecordingError::TelemetryFailure(
                    "keyboard tap thread exited during setup".to_string(),
                ))
            }
        }
    }

    fn remove(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!("Keyboard tap thread panicked");
            }
        }
    }

    fn is_installed(&self) -> bool {
        self.thread.is_some()
    }
}

impl Drop for MacKeyboardTap {
    fn drop(&mut self) {
        self.remove();
    }
}
