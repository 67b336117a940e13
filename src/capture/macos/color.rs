//! Color extension attachments of captured pixel buffers

use crate::recorder::sample::ColorAttachments;
use core_foundation::base::{CFType, CFTypeRef, TCFType};
use core_foundation::string::{CFString, CFStringRef};
use std::ffi::c_void;

#[link(name = "CoreVideo", kind = "framework")]
extern "C" {
    static kCVImageBufferColorPrimariesKey: CFStringRef;
    static kCVImageBufferTransferFunctionKey: CFStringRef;
    static kCVImageBufferYCbCrMatrixKey: CFStringRef;

    fn CVBufferCopyAttachment(
        buffer: *const c_void,
        key: CFStringRef,
        attachment_mode: *mut u32,
    ) -> CFTypeRef;
}

unsafe fn string_attachment(buffer: *const c_void, key: CFStringRef) -> Option<String> {
    let value = CVBufferCopyAttachment(buffer, key, std::ptr::null_mut());
    if value.is_null() {
        return None;
    }
    // Copy rule: the wrapper releases it
    let value = CFType::wrap_under_create_rule(value);
    value.downcast::<CFString>().map(|s| s.to_string())
}

/// Color primaries, transfer function and matrix of a `CVBuffer`, or `None`
/// when it carries none of them.
///
/// # Safety
///
/// `buffer` must be a valid `CVBufferRef` for the duration of the call.
pub unsafe fn buffer_color_attachments(buffer: *const c_void) -> Option<ColorAttachments> {
    if buffer.is_null() {
        return None;
    }
    let color = ColorAttachments {
        color_primaries: string_attachment(buffer, kCVImageBufferColorPrimariesKey),
        transfer_function: string_attachment(buffer, kCVImageBufferTransferFunctionKey),
        ycbcr_matrix: string_attachment(buffer, kCVImageBufferYCbCrMatrixKey),
    };
    (color != ColorAttachments::default()).then_some(color)
}
