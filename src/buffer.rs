use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Rejected push; hands the item back to the caller.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("queue is full")]
pub struct QueueFull<T>(pub T);

#[derive(Debug, Default)]
pub struct QueueMetrics {
    pub enqueued: AtomicU32,
    pub rejected: AtomicU32,
    pub high_water: AtomicU32,
}

struct Slots<T> {
    items: VecDeque<T>,
    // Popped but not yet settled by the consuming worker.
    in_flight: usize,
}

/// Fixed-capacity FIFO. Producers never block, the consumer does.
pub struct BoundedQueue<T> {
    slots: Mutex<Slots<T>>,
    available: Condvar,
    pub capacity: usize,
    pub metrics: QueueMetrics,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Mutex::new(Slots {
                items: VecDeque::with_capacity(capacity),
                in_flight: 0,
            }),
            available: Condvar::new(),
            capacity,
            metrics: QueueMetrics::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slots<T>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn try_push(&self, item: T) -> Result<(), QueueFull<T>> {
        let mut slots = self.lock();

        if slots.items.len() >= self.capacity {
            self.metrics.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(QueueFull(item));
        }

        slots.items.push_back(item);
        self.metrics.enqueued.fetch_add(1, Ordering::Relaxed);
        self.metrics.high_water.fetch_max(slots.items.len() as u32, Ordering::Relaxed);
        drop(slots);

        self.available.notify_one();
        Ok(())
    }

    /// Blocks up to `timeout` for an item. A popped item counts as in flight until `settle`.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut slots = self.lock();

        loop {
            if let Some(item) = slots.items.pop_front() {
                slots.in_flight += 1;
                return Some(item);
            }

            let remaining = deadline.checked_duration_since(Instant::now())?;
            if remaining.is_zero() {
                return None;
            }
            slots = self
                .available
                .wait_timeout(slots, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Marks one popped item as finished (done, requeued or dropped).
    pub fn settle(&self) {
        let mut slots = self.lock();
        slots.in_flight = slots.in_flight.saturating_sub(1);
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    /// Empty and nothing popped-but-unsettled.
    pub fn is_idle(&self) -> bool {
        let slots = self.lock();
        slots.items.is_empty() && slots.in_flight == 0
    }

    /// Drops every queued item, returning how many were discarded.
    pub fn clear(&self) -> usize {
        let mut slots = self.lock();
        let dropped = slots.items.len();
        slots.items.clear();
        dropped
    }
}
