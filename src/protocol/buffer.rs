//! Fixed-capacity FIFO used for the incoming and outgoing message queues.

use std::fmt::Debug;

/// Default number of slots per buffer.
pub const DEFAULT_CAPACITY: usize = 64;

/// Ring buffer that never grows.
///
/// Enqueueing into a full buffer drops the new item; the caller gets it back
/// in the `Err` and a warning is logged.
#[derive(Debug, Clone)]
pub struct CircularBuffer<T> {
    slots: Vec<Option<T>>,
    start: usize,
    size: usize,
}

impl<T: Debug> CircularBuffer<T> {
    /// Create an empty buffer with `capacity` slots.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "buffer capacity must be non-zero");
        Self {
            slots: std::iter::repeat_with(|| None).take(capacity).collect(),
            start: 0,
            size: 0,
        }
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.size
    }

    /// True if no slot is free.
    pub fn is_full(&self) -> bool {
        self.size == self.capacity()
    }

    /// True if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Append an item, or hand it back if the buffer is full.
    pub fn enqueue(&mut self, item: T) -> Result<(), T> {
        if self.is_full() {
            tracing::warn!(?item, capacity = self.capacity(), "Buffer full, data lost");
            return Err(item);
        }
        let end = (self.start + self.size) % self.capacity();
        self.slots[end] = Some(item);
        self.size += 1;
        Ok(())
    }

    /// Remove the oldest item.
    pub fn dequeue(&mut self) -> Option<T> {
        if self.is_empty() {
            return None;
        }
        let item = self.slots[self.start].take();
        self.start = (self.start + 1) % self.capacity();
        self.size -= 1;
        item
    }

    /// Oldest item without removing it.
    pub fn peek(&self) -> Option<&T> {
        if self.is_empty() {
            return None;
        }
        self.slots[self.start].as_ref()
    }

    /// Drop everything queued. Returns how many items were removed.
    pub fn flush(&mut self) -> usize {
        let mut removed = 0;
        while let Some(item) = self.dequeue() {
            tracing::debug!(?item, "Flushed from buffer");
            removed += 1;
        }
        removed
    }
}

impl<T: Debug> Default for CircularBuffer<T> {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
