use serde::{Deserialize, Serialize};

/// Cursor shapes distinguished by the telemetry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CursorType {
    #[default]
    Arrow,
    IBeam,
    PointingHand,
    ResizeLeftRight,
    ResizeUpDown,
    ResizeLeft,
    ResizeRight,
    ResizeUp,
    ResizeDown,
    OpenHand,
    ClosedHand,
    Crosshair,
    DragCopy,
    ZoomIn,
    ZoomOut,
}

impl CursorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CursorType::Arrow => "arrow",
            CursorType::IBeam => "iBeam",
            CursorType::PointingHand => "pointingHand",
            CursorType::ResizeLeftRight => "resizeLeftRight",
            CursorType::ResizeUpDown => "resizeUpDown",
            CursorType::ResizeLeft => "resizeLeft",
            CursorType::ResizeRight => "resizeRight",
            CursorType::ResizeUp => "resizeUp",
            CursorType::ResizeDown => "resizeDown",
            CursorType::OpenHand => "openHand",
            CursorType::ClosedHand => "closedHand",
            CursorType::Crosshair => "crosshair",
            CursorType::DragCopy => "dragCopy",
            CursorType::ZoomIn => "zoomIn",
            CursorType::ZoomOut => "zoomOut",
        }
    }
}

/// Active modifier keys as a bit mask
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Modifiers(pub u32);

impl Modifiers {
    pub const SHIFT: Modifiers = Modifiers(1 << 0);
    pub const CONTROL: Modifiers = Modifiers(1 << 1);
    pub const OPTION: Modifiers = Modifiers(1 << 2);
    pub const COMMAND: Modifiers = Modifiers(1 << 3);
    pub const CAPS_LOCK: Modifiers = Modifiers(1 << 4);
    pub const FUNCTION: Modifiers = Modifiers(1 << 5);

    pub const fn empty() -> Self {
        Modifiers(0)
    }

    pub const fn contains(&self, other: Modifiers) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Modifiers) {
        self.0 |= other.0;
    }

    pub fn names(&self) -> Vec<&'static str> {
        [
            (Self::SHIFT, "shift"),
            (Self::CONTROL, "control"),
            (Self::OPTION, "option"),
            (Self::COMMAND, "command"),
            (Self::CAPS_LOCK, "capsLock"),
            (Self::FUNCTION, "function"),
        ]
        .into_iter()
        .filter(|(flag, _)| self.contains(*flag))
        .map(|(_, name)| name)
        .collect()
    }
}

impl std::ops::BitOr for Modifiers {
    type Output = Modifiers;

    fn bitor(self, rhs: Modifiers) -> Modifiers {
        Modifiers(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum KeyState {
    Down,
    Up,
}

impl KeyState {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyState::Down => "down",
            KeyState::Up => "up",
        }
    }
}

/// One pointer sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorSample {
    pub x: f64,
    pub y: f64,
    /// Milliseconds since tracking started
    pub timestamp: u64,
    /// Pressed mouse buttons, bit 0 = left, bit 1 = right, bit 2 = middle
    pub clicks: u32,
    pub cursor_type: CursorType,
    pub cursor_moving: bool,
}

/// One key transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeySample {
    pub timestamp: u64,
    pub key_state: KeyState,
    pub key_code: u16,
    pub character: Option<String>,
    pub modifiers: Modifiers,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryRecord {
    Cursor(CursorSample),
    Key(KeySample),
}

impl TelemetryRecord {
    pub fn timestamp(&self) -> u64 {
        match self {
            TelemetryRecord::Cursor(c) => c.timestamp,
            TelemetryRecord::Key(k) => k.timestamp,
        }
    }
}

/// Session-wide telemetry metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RecordingInfo {
    pub display_id: u32,
    /// Unix milliseconds
    pub start_time: u64,
    /// Unix milliseconds; zero until tracking stops
    pub end_time: u64,
    /// Milliseconds; zero until tracking stops
    pub duration: u64,
    pub cursor_frame_rate: u32,
    pub video_frame_rate: u32,
    pub video_width: u32,
    pub video_height: u32,
    pub screen_x_width: f64,
    pub screen_y_height: f64,
}

impl RecordingInfo {
    pub fn close(&mut self, end_time: u64) {
        self.end_time = end_time;
        self.duration = end_time.saturating_sub(self.start_time);
    }
}

/// A key transition as delivered by the keyboard tap
#[derive(Debug, Clone, PartialEq)]
pub struct KeyEvent {
    pub state: KeyState,
    pub key_code: u16,
    /// Text the system decoded for the event, if any
    pub text: Option<String>,
    pub modifiers: Modifiers,
}
