//! Input telemetry (cursor, clicks, keyboard) capture
//!
//! Records pointer samples at a fixed rate and key transitions from a
//! global tap into a side-channel file correlated with the recording by
//! elapsed time.

pub mod batch;
pub mod channel;
pub mod cursor;
pub mod keymap;
pub mod store;
pub mod types;

pub use channel::{
    InputProbe, KeyEventHandler, KeyboardTap, TelemetryCollector, TelemetryOptions,
    TelemetrySummary, TimelineAnchor,
};
pub use store::{open_store, CsvTelemetryStore, JsonTelemetryStore, TelemetryStore};
pub use types::{CursorType, KeyEvent, KeyState, Modifiers, RecordingInfo, TelemetryRecord};
