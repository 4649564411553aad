//! A time-indexed expiry queue.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use tokio::time::Instant;

/// A min-heap of deadlines, each tagged with a generation so that stale entries can be told
/// apart from live ones by the owner of the queue.
#[derive(Debug)]
pub struct ExpiryQueue<K: Ord> {
    heap: BinaryHeap<Reverse<(Instant, u64, K)>>,
}

impl<K: Ord> Default for ExpiryQueue<K> {
    fn default() -> Self {
        Self { heap: BinaryHeap::new() }
    }
}

impl<K: Ord> ExpiryQueue<K> {
    /// Schedule the given key to expire at the given deadline.
    pub fn schedule(&mut self, deadline: Instant, generation: u64, key: K) {
        self.heap.push(Reverse((deadline, generation, key)));
    }

    /// The earliest scheduled deadline, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse((deadline, _, _))| *deadline)
    }

    /// Pop every entry whose deadline is at or before `now`, earliest first.
    pub fn pop_expired(&mut self, now: Instant) -> Vec<(u64, K)> {
        let mut expired = vec![];
        while matches!(self.heap.peek(), Some(Reverse((deadline, _, _))) if *deadline <= now) {
            if let Some(Reverse((_, generation, key))) = self.heap.pop() {
                expired.push((generation, key));
            }
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
