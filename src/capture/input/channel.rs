//! Cursor and keyboard telemetry collector
//!
//! While tracking, a polling task samples the pointer at a fixed rate and a
//! global keyboard tap reports key transitions. Both feed one batcher. A
//! flush task persists sealed batches as soon as they fill and everything
//! pending on a periodic timer. Telemetry is best effort: flush failures
//! are logged and counted, never raised.
//!
//! Timestamps are milliseconds since the video session anchored, so rows
//! line up with the first video frame. Input seen before that moment is not
//! recorded.

use super::batch::TelemetryBatcher;
use super::cursor::{classify, is_moving, CursorMetrics};
use super::keymap;
use super::store::{open_store, TelemetryStore};
use super::types::{
    CursorSample, KeyEvent, KeySample, Modifiers, RecordingInfo, TelemetryRecord,
};
use crate::recorder::channel::RecordingResult;
use crate::recorder::state::{RecordingConfig, TelemetryFormat};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Read-only access to pointer state
pub trait InputProbe: Send + Sync {
    /// Pointer position in screen points, origin at the top left
    fn pointer_location(&self) -> (f64, f64);

    /// Pressed buttons, bit 0 = left, bit 1 = right, bit 2 = middle
    fn pressed_buttons(&self) -> u32;

    /// Metrics of the current system cursor image, if it can be read
    fn cursor_metrics(&self) -> Option<CursorMetrics>;
}

pub type KeyEventHandler = Arc<dyn Fn(KeyEvent) + Send + Sync>;

/// A global, observe-only keyboard event tap.
///
/// `install` acquires the tap and `remove` disables it and detaches it from
/// its run loop. Events are never modified or suppressed.
pub trait KeyboardTap: Send {
    fn install(&mut self, handler: KeyEventHandler) -> RecordingResult<()>;

    fn remove(&mut self);

    fn is_installed(&self) -> bool;
}

#[derive(Debug, Clone)]
pub struct TelemetryOptions {
    pub format: TelemetryFormat,
    pub cursor_fps: u32,
    pub batch_size: usize,
    pub flush_interval: Duration,
}

impl Default for TelemetryOptions {
    fn default() -> Self {
        Self {
            format: TelemetryFormat::Csv,
            cursor_fps: 30,
            batch_size: 150,
            flush_interval: Duration::from_secs(5),
        }
    }
}

impl From<&RecordingConfig> for TelemetryOptions {
    fn from(config: &RecordingConfig) -> Self {
        Self {
            format: config.telemetry_format,
            cursor_fps: config.cursor_fps,
            batch_size: config.telemetry_batch_size,
            flush_interval: config.flush_interval(),
        }
    }
}

/// Monotonic moment the recording timeline starts at. Set once, by the
/// first video frame.
#[derive(Debug, Default)]
pub struct TimelineAnchor {
    at: Mutex<Option<Instant>>,
}

impl TimelineAnchor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Anchor already set to now, for tracking without a video session
    pub fn starting_now() -> Self {
        Self {
            at: Mutex::new(Some(Instant::now())),
        }
    }

    /// Set the anchor to now unless already set
    pub fn mark(&self) {
        self.at.lock().get_or_insert_with(Instant::now);
    }

    pub fn is_set(&self) -> bool {
        self.at.lock().is_some()
    }

    /// Milliseconds since the anchor, `None` before it is set
    pub fn elapsed_ms(&self) -> Option<u64> {
        self.at.lock().map(|at| at.elapsed().as_millis() as u64)
    }
}

/// Result of a completed tracking run
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetrySummary {
    pub path: PathBuf,
    pub records: u64,
    pub flush_failures: u64,
}

struct Shared {
    batcher: TelemetryBatcher,
    store: Mutex<Box<dyn TelemetryStore>>,
    anchor: Arc<TimelineAnchor>,
    cancelled: AtomicBool,
    stop: Notify,
    flush_failures: AtomicU64,
}

impl Shared {
    fn new(
        store: Box<dyn TelemetryStore>,
        batch_size: usize,
        anchor: Arc<TimelineAnchor>,
    ) -> Self {
        Self {
            batcher: TelemetryBatcher::new(batch_size),
            store: Mutex::new(store),
            anchor,
            cancelled: AtomicBool::new(false),
            stop: Notify::new(),
            flush_failures: AtomicU64::new(0),
        }
    }

    fn on_key(&self, event: KeyEvent) {
        if self.cancelled.load(Ordering::Relaxed) {
            return;
        }
        let Some(timestamp) = self.anchor.elapsed_ms() else {
            return;
        };
        let shift = event.modifiers.contains(Modifiers::SHIFT);
        let character = keymap::describe(event.key_code, event.text.as_deref(), shift);
        self.batcher.push(TelemetryRecord::Key(KeySample {
            timestamp,
            key_state: event.state,
            key_code: event.key_code,
            character,
            modifiers: event.modifiers,
        }));
    }

    /// Persist sealed batches, plus the partial batch when `everything`.
    /// The store lock is held across the drain so flushes never interleave.
    fn flush(&self, everything: bool) -> usize {
        let mut store = self.store.lock();
        let batches = if everything {
            self.batcher.take_all()
        } else {
            self.batcher.take_sealed()
        };

        let mut written = 0;
        for batch in batches {
            match store.append(&batch) {
                Ok(()) => written += batch.len(),
                Err(e) => {
                    self.flush_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!("Dropping {} telemetry records: {}", batch.len(), e);
                }
            }
        }
        if written > 0 {
            tracing::debug!("Flushed {} telemetry records", written);
        }
        written
    }
}

struct Tracking {
    shared: Arc<Shared>,
    poller: JoinHandle<()>,
    flusher: JoinHandle<()>,
    path: PathBuf,
}

/// Idle/tracking telemetry state machine. Owns the keyboard tap.
pub struct TelemetryCollector {
    options: TelemetryOptions,
    probe: Arc<dyn InputProbe>,
    tap: Option<Box<dyn KeyboardTap>>,
    tracking: Option<Tracking>,
    warnings: Vec<String>,
}

impl TelemetryCollector {
    pub fn new(
        options: TelemetryOptions,
        probe: Arc<dyn InputProbe>,
        tap: Option<Box<dyn KeyboardTap>>,
    ) -> Self {
        Self {
            options,
            probe,
            tap,
            tracking: None,
            warnings: Vec::new(),
        }
    }

    pub fn is_tracking(&self) -> bool {
        self.tracking.is_some()
    }

    /// Degradations noticed by the last `start`, such as a missing tap
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Records persisted so far in the current run
    pub fn persisted(&self) -> u64 {
        self.tracking
            .as_ref()
            .map(|t| t.shared.store.lock().persisted())
            .unwrap_or(0)
    }

    /// Start tracking into `path` with timestamps counted from now.
    /// A no-op while already tracking.
    ///
    /// Must be called within a Tokio runtime.
    pub fn start(&mut self, path: &Path, info: RecordingInfo) -> RecordingResult<()> {
        self.start_anchored(path, info, Arc::new(TimelineAnchor::starting_now()))
    }

    /// Start tracking with timestamps counted from `anchor`. Samples are
    /// skipped until the anchor is set.
    pub fn start_anchored(
        &mut self,
        path: &Path,
        info: RecordingInfo,
        anchor: Arc<TimelineAnchor>,
    ) -> RecordingResult<()> {
        if self.tracking.is_some() {
            tracing::debug!("Telemetry already tracking; ignoring start");
            return Ok(());
        }
        self.warnings.clear();

        let store = open_store(self.options.format, path, info)?;
        let shared = Arc::new(Shared::new(store, self.options.batch_size, anchor));

        if let Some(tap) = self.tap.as_mut() {
            let target = shared.clone();
            let handler: KeyEventHandler = Arc::new(move |event: KeyEvent| target.on_key(event));
            if let Err(e) = tap.install(handler) {
                tracing::warn!("Keyboard telemetry unavailable: {}", e);
                self.warnings.push(format!("keyboard tap: {e}"));
            }
        }

        let poller = tokio::spawn(poll_cursor(
            shared.clone(),
            self.probe.clone(),
            self.options.cursor_fps,
        ));
        let flusher = tokio::spawn(flush_loop(shared.clone(), self.options.flush_interval));

        tracing::info!(
            "Telemetry tracking started: {:?}, cursor {} fps, batch {}, flush every {:?}",
            path,
            self.options.cursor_fps,
            self.options.batch_size,
            self.options.flush_interval
        );
        self.tracking = Some(Tracking {
            shared,
            poller,
            flusher,
            path: path.to_path_buf(),
        });
        Ok(())
    }

    /// Stop tracking, flush what is pending and stamp the end time.
    /// A no-op returning `None` while idle.
    pub async fn stop(&mut self) -> RecordingResult<Option<TelemetrySummary>> {
        let Some(tracking) = self.tracking.take() else {
            return Ok(None);
        };
        let Tracking {
            shared,
            poller,
            flusher,
            path,
        } = tracking;

        shared.cancelled.store(true, Ordering::SeqCst);
        shared.stop.notify_one();
        if let Some(tap) = self.tap.as_mut() {
            tap.remove();
        }

        for (name, task) in [("cursor poller", poller), ("flusher", flusher)] {
            if let Err(e) = task.await {
                tracing::warn!("Telemetry {} ended abnormally: {}", name, e);
            }
        }

        shared.flush(true);
        let end_time = chrono::Utc::now().timestamp_millis().max(0) as u64;
        let records = {
            let mut store = shared.store.lock();
            store.finish(end_time)?;
            store.persisted()
        };
        let flush_failures = shared.flush_failures.load(Ordering::Relaxed);

        tracing::info!(
            "Telemetry tracking stopped: {} records, {} failed flush(es)",
            records,
            flush_failures
        );
        Ok(Some(TelemetrySummary {
            path,
            records,
            flush_failures,
        }))
    }
}

impl Drop for TelemetryCollector {
    fn drop(&mut self) {
        if let Some(tracking) = self.tracking.take() {
            tracking.shared.cancelled.store(true, Ordering::SeqCst);
            tracking.shared.stop.notify_one();
        }
        if let Some(tap) = self.tap.as_mut() {
            if tap.is_installed() {
                tap.remove();
            }
        }
    }
}

async fn poll_cursor(shared: Arc<Shared>, probe: Arc<dyn InputProbe>, fps: u32) {
    let period = Duration::from_secs_f64(1.0 / f64::from(fps.max(1)));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut previous: Option<(f64, f64)> = None;

    loop {
        ticker.tick().await;
        if shared.cancelled.load(Ordering::Relaxed) {
            break;
        }

        let Some(timestamp) = shared.anchor.elapsed_ms() else {
            continue;
        };
        let position = probe.pointer_location();
        let sample = CursorSample {
            x: position.0,
            y: position.1,
            timestamp,
            clicks: probe.pressed_buttons(),
            cursor_type: classify(probe.cursor_metrics()),
            cursor_moving: is_moving(previous, position),
        };
        previous = Some(position);
        shared.batcher.push(TelemetryRecord::Cursor(sample));
    }
}

async fn flush_loop(shared: Arc<Shared>, interval: Duration) {
    let mut timer = tokio::time::interval(interval.max(Duration::from_millis(1)));
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    timer.tick().await;

    loop {
        tokio::select! {
            _ = shared.stop.notified() => break,
            _ = shared.batcher.sealed() => {
                shared.flush(false);
            }
            _ = timer.tick() => {
                shared.flush(true);
            }
        }
        if shared.cancelled.load(Ordering::Relaxed) {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::channel::RecordingError;
    use crate::capture::input::store::CsvTelemetryStore;
    use crate::capture::input::types::{CursorType, KeyState};

    fn info() -> RecordingInfo {
        RecordingInfo {
            display_id: 1,
            start_time: chrono::Utc::now().timestamp_millis() as u64,
            end_time: 0,
            duration: 0,
            cursor_frame_rate: 100,
            video_frame_rate: 60,
            video_width: 1920,
            video_height: 1080,
            screen_x_width: 1920.0,
            screen_y_height: 1080.0,
        }
    }

    /// Replays scripted positions, then holds the last one
    struct ScriptedProbe {
        positions: Mutex<Vec<(f64, f64)>>,
    }

    impl ScriptedProbe {
        fn new(mut positions: Vec<(f64, f64)>) -> Arc<Self> {
            positions.reverse();
            Arc::new(Self {
                positions: Mutex::new(positions),
            })
        }
    }

    impl InputProbe for ScriptedProbe {
        fn pointer_location(&self) -> (f64, f64) {
            let mut positions = self.positions.lock();
            if positions.len() > 1 {
                positions.pop().unwrap_or_default()
            } else {
                positions.last().copied().unwrap_or_default()
            }
        }

        fn pressed_buttons(&self) -> u32 {
            0
        }

        fn cursor_metrics(&self) -> Option<CursorMetrics> {
            None
        }
    }

    #[derive(Clone, Default)]
    struct FakeTap {
        handler: Arc<Mutex<Option<KeyEventHandler>>>,
        installs: Arc<AtomicU64>,
        fail: bool,
    }

    impl FakeTap {
        fn press(&self, key_code: u16, text: &str) {
            let handler = self.handler.lock().clone();
            if let Some(handler) = handler {
                handler(KeyEvent {
                    state: KeyState::Down,
                    key_code,
                    text: Some(text.to_string()),
                    modifiers: Modifiers::empty(),
                });
            }
        }
    }

    impl KeyboardTap for FakeTap {
        fn install(&mut self, handler: KeyEventHandler) -> RecordingResult<()> {
            if self.fail {
                return Err(RecordingError::TelemetryFailure("tap refused".into()));
            }
            self.installs.fetch_add(1, Ordering::SeqCst);
            *self.handler.lock() = Some(handler);
            Ok(())
        }

        fn remove(&mut self) {
            self.handler.lock().take();
        }

        fn is_installed(&self) -> bool {
            self.handler.lock().is_some()
        }
    }

    fn options(batch_size: usize, flush_interval: Duration) -> TelemetryOptions {
        TelemetryOptions {
            format: TelemetryFormat::Csv,
            cursor_fps: 100,
            batch_size,
            flush_interval,
        }
    }

    fn data_rows(path: &Path) -> Vec<Vec<String>> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .skip(2)
            .map(|l| l.split(',').map(str::to_string).collect())
            .collect()
    }

    #[test]
    fn test_size_trigger_flushes_one_batch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.csv");
        let store = CsvTelemetryStore::create(&path, info()).unwrap();
        let shared = Shared::new(Box::new(store), 150, Arc::new(TimelineAnchor::starting_now()));

        for i in 0..151 {
            shared.batcher.push(TelemetryRecord::Cursor(CursorSample {
                x: i as f64,
                y: 0.0,
                timestamp: i,
                clicks: 0,
                cursor_type: CursorType::Arrow,
                cursor_moving: false,
            }));
        }
        assert_eq!(shared.flush(false), 150);
        assert_eq!(shared.batcher.pending(), 1);
        assert_eq!(data_rows(&path).len(), 150);

        assert_eq!(shared.flush(true), 1);
        shared.store.lock().finish(info().start_time + 10).unwrap();
        assert_eq!(data_rows(&path).len(), 151);
    }

    #[tokio::test]
    async fn test_tracking_writes_cursor_and_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.csv");
        let tap = FakeTap::default();
        let probe = ScriptedProbe::new(vec![(100.0, 100.0), (101.5, 101.5), (105.0, 101.5)]);
        let mut collector = TelemetryCollector::new(
            options(150, Duration::from_secs(60)),
            probe,
            Some(Box::new(tap.clone())),
        );

        let info = info();
        collector.start(&path, info.clone()).unwrap();
        assert!(collector.is_tracking());
        assert!(tap.is_installed());

        tokio::time::sleep(Duration::from_millis(100)).await;
        tap.press(0x00, "a");
        tokio::time::sleep(Duration::from_millis(20)).await;

        let summary = collector.stop().await.unwrap().unwrap();
        assert!(!collector.is_tracking());
        assert!(!tap.is_installed());
        assert_eq!(summary.flush_failures, 0);

        let rows = data_rows(&path);
        assert_eq!(rows.len() as u64, summary.records);

        let moving: Vec<&str> = rows
            .iter()
            .filter(|r| !r[10].is_empty())
            .take(3)
            .map(|r| r[15].as_str())
            .collect();
        assert_eq!(moving, vec!["0", "0", "1"]);

        let key_row = rows.iter().find(|r| r[16] == "down").unwrap();
        assert_eq!(key_row[17], "0");
        assert_eq!(key_row[18], "a");
        assert!(key_row[10].is_empty());

        let contents = std::fs::read_to_string(&path).unwrap();
        let meta: Vec<&str> = contents.lines().nth(1).unwrap().split(',').collect();
        let start: u64 = meta[1].parse().unwrap();
        let end: u64 = meta[2].parse().unwrap();
        let duration: u64 = meta[3].parse().unwrap();
        assert_eq!(start, info.start_time);
        assert_eq!(duration, end - start);
        assert!(duration >= 100);
    }

    #[tokio::test]
    async fn test_timestamps_count_from_the_anchor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.csv");
        let tap = FakeTap::default();
        let anchor = Arc::new(TimelineAnchor::new());
        let mut collector = TelemetryCollector::new(
            options(150, Duration::from_secs(60)),
            ScriptedProbe::new(vec![(1.0, 1.0)]),
            Some(Box::new(tap.clone())),
        );

        collector.start_anchored(&path, info(), anchor.clone()).unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        tap.press(0x00, "a");

        let marked = Instant::now();
        anchor.mark();
        tokio::time::sleep(Duration::from_millis(60)).await;
        tap.press(0x01, "s");
        collector.stop().await.unwrap();
        let since_mark = marked.elapsed().as_millis() as u64;

        let rows = data_rows(&path);
        assert!(rows.iter().any(|r| r[18] == "s"));
        assert!(rows.iter().all(|r| r[18] != "a"));
        let latest: u64 = rows.iter().map(|r| r[12].parse::<u64>().unwrap()).max().unwrap();
        // Counted from the anchor, not from the collector start 80ms earlier
        assert!(latest <= since_mark, "latest {latest}ms, anchored {since_mark}ms ago");
    }

    #[tokio::test]
    async fn test_full_batch_flushes_before_timer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.csv");
        let tap = FakeTap::default();
        let probe = ScriptedProbe::new(vec![(0.0, 0.0)]);
        let mut collector = TelemetryCollector::new(
            TelemetryOptions {
                cursor_fps: 1,
                ..options(5, Duration::from_secs(60))
            },
            probe,
            Some(Box::new(tap.clone())),
        );
        collector.start(&path, info()).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        for _ in 0..5 {
            tap.press(0x01, "s");
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(collector.persisted() >= 5);

        collector.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_create_failure_does_not_start() {
        let tap = FakeTap::default();
        let mut collector = TelemetryCollector::new(
            TelemetryOptions::default(),
            ScriptedProbe::new(vec![(0.0, 0.0)]),
            Some(Box::new(tap.clone())),
        );
        let err = collector
            .start(Path::new("/nonexistent/dir/t.csv"), info())
            .unwrap_err();
        assert_eq!(err.kind(), "TELEMETRY_FAILURE");
        assert!(!collector.is_tracking());
        assert_eq!(tap.installs.load(Ordering::SeqCst), 0);
        assert_eq!(collector.stop().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_repeat_start_is_noop_and_tap_failure_degrades() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.csv");
        let tap = FakeTap {
            fail: true,
            ..Default::default()
        };
        let mut collector = TelemetryCollector::new(
            options(150, Duration::from_millis(50)),
            ScriptedProbe::new(vec![(0.0, 0.0)]),
            Some(Box::new(tap)),
        );

        collector.start(&path, info()).unwrap();
        assert_eq!(collector.warnings().len(), 1);
        collector
            .start(&dir.path().join("other.csv"), info())
            .unwrap();
        assert!(!dir.path().join("other.csv").exists());

        tokio::time::sleep(Duration::from_millis(120)).await;
        // The timer flushed cursor samples while tracking
        assert!(collector.persisted() > 0);

        let summary = collector.stop().await.unwrap().unwrap();
        assert_eq!(summary.path, path);
    }
}
