//! Sequence-number reorder buffer.
//!
//! Producers of chunked stream content number chunks from 0 per
//! (request id, stream type). The relay does not guarantee delivery order,
//! so every consumer funnels chunks through an [`OrderedQueue`]: in-order
//! chunks are delivered immediately together with any buffered successors,
//! out-of-order chunks wait in a gap map, and chunks older than the cursor
//! are dropped as duplicates.

use std::collections::HashMap;

use thiserror::Error;

/// Default bound on buffered out-of-order chunks per queue.
pub const DEFAULT_GAP_CAPACITY: usize = 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReorderError {
    /// The gap grew past capacity: the predecessor chunk is presumed lost
    /// and the consuming action must close.
    #[error("reorder gap exceeded capacity {0}")]
    GapOverflow(usize),
}

/// Reorder buffer for one (request id, stream type) pair.
#[derive(Debug)]
pub struct OrderedQueue<T> {
    next_seq: u64,
    pending: HashMap<u64, T>,
    capacity: usize,
}

impl<T> Default for OrderedQueue<T> {
    fn default() -> Self {
        Self::new(DEFAULT_GAP_CAPACITY)
    }
}

impl<T> OrderedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            next_seq: 0,
            pending: HashMap::new(),
            capacity,
        }
    }

    /// Offer chunk `seq`. Returns every chunk that became deliverable, in
    /// sequence order (empty when `seq` is a duplicate or still ahead of the
    /// cursor).
    pub fn push(&mut self, seq: u64, item: T) -> Result<Vec<T>, ReorderError> {
        if seq < self.next_seq {
            // duplicate of something already delivered
            return Ok(Vec::new());
        }
        if seq > self.next_seq {
            if self.pending.len() >= self.capacity {
                return Err(ReorderError::GapOverflow(self.capacity));
            }
            self.pending.insert(seq, item);
            return Ok(Vec::new());
        }

        let mut ready = vec![item];
        self.next_seq += 1;
        while let Some(next) = self.pending.remove(&self.next_seq) {
            ready.push(next);
            self.next_seq += 1;
        }
        Ok(ready)
    }

    /// The sequence number the queue is waiting for.
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Number of chunks parked in the gap map.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
