//! Counting barrier with a deadline
//!
//! Waits for N asynchronous completions, giving up after a timeout.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct Inner {
    remaining: Mutex<usize>,
    done: Condvar,
}

/// Cloneable handle; every clone shares the same count.
#[derive(Debug, Clone)]
pub struct CompletionBarrier {
    inner: Arc<Inner>,
}

impl CompletionBarrier {
    pub fn new(count: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                remaining: Mutex::new(count),
                done: Condvar::new(),
            }),
        }
    }

    /// Record one completion. Extra calls past zero are ignored.
    pub fn leave(&self) {
        let mut remaining = self.inner.remaining.lock();
        if *remaining > 0 {
            *remaining -= 1;
            if *remaining == 0 {
                self.inner.done.notify_all();
            }
        }
    }

    pub fn remaining(&self) -> usize {
        *self.inner.remaining.lock()
    }

    /// Block until every completion arrived or `timeout` elapsed.
    /// Returns `true` when all completions arrived in time.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut remaining = self.inner.remaining.lock();
        while *remaining > 0 {
            if self.inner.done.wait_until(&mut remaining, deadline).timed_out() {
                return *remaining == 0;
            }
        }
        true
    }
}
