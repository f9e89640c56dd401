//! Fixed-capacity ring buffer for staged sample records.
//!
//! The sampling engine stages finished records here from the timer context;
//! reads drain them FIFO. The buffer is *not* internally synchronized — it is
//! always accessed under the lock of whatever owns it (the engine's sampling
//! state), keeping the critical sections short and allocation-free on the
//! producer path.

use std::collections::VecDeque;

use crate::error::{DeviceError, Result};

/// Bounded FIFO with overwrite-oldest semantics on the producer side.
#[derive(Debug)]
pub struct RingBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    /// Create a buffer holding at most `capacity` records (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Push a record, discarding the oldest one when full. Never fails.
    pub fn force(&mut self, item: T) {
        if self.items.len() == self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }

    /// Remove and return the oldest record.
    pub fn get(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    /// Discard all staged records.
    pub fn flush(&mut self) {
        self.items.clear();
    }

    /// Change the capacity, discarding oldest records that no longer fit.
    ///
    /// A zero capacity is rejected with `NoSpace` so a misconfigured queue
    /// depth can never silently drop every sample.
    pub fn resize(&mut self, capacity: usize) -> Result<()> {
        if capacity == 0 {
            return Err(DeviceError::NoSpace("ring capacity must be >= 1".into()));
        }
        while self.items.len() > capacity {
            self.items.pop_front();
        }
        self.capacity = capacity;
        Ok(())
    }

    /// Number of records currently staged.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True when no records are staged.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Maximum number of records this buffer holds.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
