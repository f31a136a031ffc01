//! Read/write backpressure for one connection.
//!
//! Reading is paused once the application falls behind by more than the
//! high-water mark of unconsumed request body, and resumed when it catches
//! up to the low-water mark. Writing is paused by the connection while the
//! socket cannot keep up; application `send` calls wait in [`FlowControl::drain`].

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio::sync::Notify;

pub const DEFAULT_HIGH_WATER: usize = 64 * 1024;
pub const DEFAULT_LOW_WATER: usize = 16 * 1024;

#[derive(Debug)]
pub struct FlowControl {
    high_water: usize,
    low_water: usize,
    buffered: AtomicUsize,
    read_paused: AtomicBool,
    write_paused: AtomicBool,
    readable: Notify,
    writable: Notify,
}

impl Default for FlowControl {
    fn default() -> Self {
        Self::new(DEFAULT_HIGH_WATER, DEFAULT_LOW_WATER)
    }
}

impl FlowControl {
    pub fn new(high_water: usize, low_water: usize) -> Self {
        Self {
            high_water,
            low_water: low_water.min(high_water),
            buffered: AtomicUsize::new(0),
            read_paused: AtomicBool::new(false),
            write_paused: AtomicBool::new(false),
            readable: Notify::new(),
            writable: Notify::new(),
        }
    }

    pub fn high_water(&self) -> usize {
        self.high_water
    }

    pub fn pause_reading(&self) {
        if !self.read_paused.swap(true, Ordering::AcqRel) {
            tracing::trace!("pause reading");
        }
    }

    pub fn resume_reading(&self) {
        if self.read_paused.swap(false, Ordering::AcqRel) {
            tracing::trace!("resume reading");
            self.readable.notify_waiters();
        }
    }

    pub fn is_read_paused(&self) -> bool {
        self.read_paused.load(Ordering::Acquire)
    }

    /// Completes once reading is not paused.
    pub async fn readable(&self) {
        loop {
            let notified = self.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.is_read_paused() {
                return;
            }
            notified.await;
        }
    }

    pub fn pause_writing(&self) {
        self.write_paused.store(true, Ordering::Release);
    }

    pub fn resume_writing(&self) {
        if self.write_paused.swap(false, Ordering::AcqRel) {
            self.writable.notify_waiters();
        }
    }

    pub fn is_write_paused(&self) -> bool {
        self.write_paused.load(Ordering::Acquire)
    }

    /// Suspends until writing is resumed. Returns at once if it never paused.
    pub async fn drain(&self) {
        loop {
            let notified = self.writable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.is_write_paused() {
                return;
            }
            notified.await;
        }
    }

    /// Request body bytes were handed to the application's buffer.
    pub fn on_buffered(&self, n: usize) {
        let total = self.buffered.fetch_add(n, Ordering::AcqRel) + n;
        if total > self.high_water {
            self.pause_reading();
        }
    }

    /// The application took `n` buffered bytes.
    pub fn on_consumed(&self, n: usize) {
        let prev = self
            .buffered
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |b| {
                Some(b.saturating_sub(n))
            })
            .unwrap_or(0);
        if prev.saturating_sub(n) <= self.low_water {
            self.resume_reading();
        }
    }

    pub fn buffered(&self) -> usize {
        self.buffered.load(Ordering::Acquire)
    }

    /// Forget all accounting between cycles.
    pub fn reset(&self) {
        self.buffered.store(0, Ordering::Release);
        self.resume_reading();
    }
}
