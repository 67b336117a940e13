//! Bounded per-track queue backing the concrete writers
//!
//! Each track hands buffers to a dedicated worker thread through a bounded
//! channel. The queue depth is the writer's own buffering: readiness is
//! "the queue has room", and append never waits.

use super::channel::{RecordingError, RecordingResult};
use super::sample::{MediaTime, SampleBuffer, TrackKind};
use super::writer::{TrackInput, WriterStatus};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::Arc;

pub struct QueuedTrack {
    kind: TrackKind,
    depth: usize,
    in_flight: Arc<AtomicUsize>,
    sender: Mutex<Option<SyncSender<SampleBuffer>>>,
    finished: AtomicBool,
    first_time: Mutex<Option<MediaTime>>,
    last_time: Mutex<Option<MediaTime>>,
    writer_status: Arc<AtomicU8>,
}

/// Worker side of a `QueuedTrack`
pub struct TrackReceiver {
    receiver: Receiver<SampleBuffer>,
    in_flight: Arc<AtomicUsize>,
}

impl TrackReceiver {
    /// Next buffer, or `None` once the track is finished and drained
    pub fn recv(&self) -> Option<SampleBuffer> {
        let buffer = self.receiver.recv().ok()?;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Some(buffer)
    }
}

impl QueuedTrack {
    pub fn new(kind: TrackKind, depth: usize, writer_status: Arc<AtomicU8>) -> (Arc<Self>, TrackReceiver) {
        let depth = depth.max(1);
        let (sender, receiver) = mpsc::sync_channel(depth);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let track = Arc::new(Self {
            kind,
            depth,
            in_flight: in_flight.clone(),
            sender: Mutex::new(Some(sender)),
            finished: AtomicBool::new(false),
            first_time: Mutex::new(None),
            last_time: Mutex::new(None),
            writer_status,
        });
        (track, TrackReceiver { receiver, in_flight })
    }

    /// Presentation time of the first accepted buffer
    pub fn first_time(&self) -> Option<MediaTime> {
        *self.first_time.lock()
    }

    /// Latest presentation time accepted so far
    pub fn last_time(&self) -> Option<MediaTime> {
        *self.last_time.lock()
    }

    pub fn queued(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Close the queue without the one-shot check, used on cancel and
    /// when the writer finishes tracks the caller left open.
    pub fn close(&self) {
        self.finished.store(true, Ordering::SeqCst);
        self.sender.lock().take();
    }
}

impl TrackInput for QueuedTrack {
    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn is_ready_for_more_media_data(&self) -> bool {
        !self.finished.load(Ordering::SeqCst)
            && WriterStatus::from_u8(self.writer_status.load(Ordering::SeqCst)) == WriterStatus::Writing
            && self.in_flight.load(Ordering::SeqCst) < self.depth
    }

    fn append(&self, buffer: SampleBuffer) -> RecordingResult<()> {
        let guard = self.sender.lock();
        let Some(sender) = guard.as_ref() else {
            return Err(RecordingError::TrackAlreadyFinished(self.kind));
        };

        let time = buffer.presentation_time;
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        match sender.try_send(buffer) {
            Ok(()) => {
                self.first_time.lock().get_or_insert(time);
                let mut last = self.last_time.lock();
                if last.map_or(true, |t| time > t) {
                    *last = Some(time);
                }
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                Err(RecordingError::WriterFailure(format!("{} queue full", self.kind)))
            }
            Err(TrySendError::Disconnected(_)) => {
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                Err(RecordingError::WriterFailure(format!("{} worker exited", self.kind)))
            }
        }
    }

    fn mark_as_finished(&self) -> RecordingResult<()> {
        if self.finished.swap(true, Ordering::SeqCst) {
            return Err(RecordingError::TrackAlreadyFinished(self.kind));
        }
        self.sender.lock().take();
        Ok(())
    }

    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }
}
