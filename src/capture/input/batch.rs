//! In-memory telemetry batching
//!
//! Producers push records into the current batch. When it reaches capacity
//! the batch is sealed and the flusher is woken. Draining happens under the
//! store lock held by the caller, so two flush triggers never interleave.

use super::types::TelemetryRecord;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::Notify;

#[derive(Default)]
struct BatchState {
    current: Vec<TelemetryRecord>,
    sealed: VecDeque<Vec<TelemetryRecord>>,
}

pub struct TelemetryBatcher {
    capacity: usize,
    state: Mutex<BatchState>,
    sealed_ready: Notify,
}

impl TelemetryBatcher {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            state: Mutex::new(BatchState {
                current: Vec::with_capacity(capacity),
                sealed: VecDeque::new(),
            }),
            sealed_ready: Notify::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Add a record; returns true when this push sealed a full batch
    pub fn push(&self, record: TelemetryRecord) -> bool {
        let sealed = {
            let mut state = self.state.lock();
            state.current.push(record);
            if state.current.len() >= self.capacity {
                let full = std::mem::replace(
                    &mut state.current,
                    Vec::with_capacity(self.capacity),
                );
                state.sealed.push_back(full);
                true
            } else {
                false
            }
        };
        if sealed {
            self.sealed_ready.notify_one();
        }
        sealed
    }

    /// Wait until a batch has been sealed
    pub async fn sealed(&self) {
        self.sealed_ready.notified().await;
    }

    /// Take every sealed batch, oldest first
    pub fn take_sealed(&self) -> Vec<Vec<TelemetryRecord>> {
        self.state.lock().sealed.drain(..).collect()
    }

    /// Take sealed batches and the partial current batch, in order
    pub fn take_all(&self) -> Vec<Vec<TelemetryRecord>> {
        let mut state = self.state.lock();
        let mut batches: Vec<_> = state.sealed.drain(..).collect();
        if !state.current.is_empty() {
            let partial = std::mem::take(&mut state.current);
            batches.push(partial);
        }
        batches
    }

    /// Records held in memory, sealed or not
    pub fn pending(&self) -> usize {
        let state = self.state.lock();
        state.current.len() + state.sealed.iter().map(Vec::len).sum::<usize>()
    }
}
