//! Bounded in-memory history of recent readings.
//!
//! Appends never trim. The buffer may grow past `capacity` between
//! maintenance ticks; [`HistoryBuffer::sweep`] brings it back down by
//! evicting from the oldest end.

use std::collections::VecDeque;

use tbrelay_api::Reading;

#[derive(Debug, Clone)]
pub struct HistoryBuffer {
    entries: VecDeque<Reading>,
    capacity: usize,
}

impl HistoryBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn append(&mut self, reading: Reading) {
        self.entries.push_back(reading);
    }

    /// The last `n` readings, oldest first.
    pub fn recent(&self, n: usize) -> impl ExactSizeIterator<Item = &Reading> {
        let skip = self.entries.len().saturating_sub(n);
        self.entries.range(skip..)
    }

    /// Trim to capacity. Returns the number of readings evicted.
    pub fn sweep(&mut self) -> usize {
        let excess = self.entries.len().saturating_sub(self.capacity);
        self.entries.drain(..excess);
        excess
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
