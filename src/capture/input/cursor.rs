//! Cursor shape classification and movement detection

use super::types::CursorType;

/// Minimum displacement on either axis that counts as movement
pub const MOVEMENT_THRESHOLD: f64 = 2.1;

/// Size and hotspot of the current system cursor image, in points
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CursorMetrics {
    pub width: f64,
    pub height: f64,
    pub hotspot_x: f64,
    pub hotspot_y: f64,
}

impl CursorMetrics {
    pub const fn new(width: f64, height: f64, hotspot_x: f64, hotspot_y: f64) -> Self {
        Self {
            width,
            height,
            hotspot_x,
            hotspot_y,
        }
    }
}

// (width, height, hotspot x, hotspot y) of the standard system cursors
const CURSOR_TABLE: &[(CursorMetrics, CursorType)] = &[
    (CursorMetrics::new(17.0, 23.0, 4.0, 4.0), CursorType::Arrow),
    (CursorMetrics::new(9.0, 18.0, 4.0, 9.0), CursorType::IBeam),
    (CursorMetrics::new(32.0, 32.0, 13.0, 8.0), CursorType::PointingHand),
    (CursorMetrics::new(24.0, 24.0, 12.0, 12.0), CursorType::ResizeLeftRight),
    (CursorMetrics::new(24.0, 24.0, 12.0, 11.0), CursorType::ResizeUpDown),
    (CursorMetrics::new(24.0, 24.0, 11.0, 12.0), CursorType::ResizeLeft),
    (CursorMetrics::new(24.0, 24.0, 13.0, 12.0), CursorType::ResizeRight),
    (CursorMetrics::new(24.0, 24.0, 12.0, 10.0), CursorType::ResizeUp),
    (CursorMetrics::new(24.0, 24.0, 12.0, 13.0), CursorType::ResizeDown),
    (CursorMetrics::new(32.0, 32.0, 16.0, 16.0), CursorType::OpenHand),
    (CursorMetrics::new(32.0, 32.0, 16.0, 15.0), CursorType::ClosedHand),
    (CursorMetrics::new(24.0, 24.0, 11.0, 11.0), CursorType::Crosshair),
    (CursorMetrics::new(22.0, 24.0, 4.0, 4.0), CursorType::DragCopy),
    (CursorMetrics::new(28.0, 28.0, 11.0, 11.0), CursorType::ZoomIn),
    (CursorMetrics::new(28.0, 28.0, 11.0, 12.0), CursorType::ZoomOut),
];

/// Classify a cursor by exact metrics match, falling back to the arrow
pub fn classify(metrics: Option<CursorMetrics>) -> CursorType {
    let Some(metrics) = metrics else {
        return CursorType::Arrow;
    };
    CURSOR_TABLE
        .iter()
        .find(|(known, _)| *known == metrics)
        .map(|(_, kind)| *kind)
        .unwrap_or_default()
}

/// Whether the pointer moved since the previous sample.
///
/// The first sample of a run never counts as movement.
pub fn is_moving(previous: Option<(f64, f64)>, current: (f64, f64)) -> bool {
    match previous {
        Some((px, py)) => {
            (current.0 - px).abs() > MOVEMENT_THRESHOLD
                || (current.1 - py).abs() > MOVEMENT_THRESHOLD
        }
        None => false,
    }
}
