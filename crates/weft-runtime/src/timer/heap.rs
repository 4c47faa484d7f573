//! BinaryHeap-based timer backend
//!
//! # Complexity
//!
//! - Insert: O(log n)
//! - Cancel: O(1) amortized (lazy cancellation)
//! - Poll expired: O(k log n) where k = number of expired timers
//! - Next deadline: O(1) unless cancelled entries sit at the top
//!
//! Cancelled handles go into a HashSet and are skipped when polled. The
//! set is cleared whenever the heap drains.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::time::Instant;

use super::{TimerBackend, TimerEntry, TimerHandle};

/// Min-heap ordering by deadline, ties broken by handle
struct HeapEntry(TimerEntry);

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.0.deadline == other.0.deadline && self.0.handle == other.0.handle
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap is a max-heap
        match other.0.deadline.cmp(&self.0.deadline) {
            Ordering::Equal => other.0.handle.raw().cmp(&self.0.handle.raw()),
            ord => ord,
        }
    }
}

/// Snapshot of backend counters
#[derive(Debug, Clone, Copy, Default)]
pub struct HeapTimerStats {
    pub active: usize,
    pub pending_cancellations: usize,
    pub total_inserted: u64,
    pub total_fired: u64,
    pub total_cancelled: u64,
}

pub struct HeapTimerBackend {
    heap: BinaryHeap<HeapEntry>,
    cancelled: HashSet<TimerHandle>,
    total_inserted: u64,
    total_fired: u64,
    total_cancelled: u64,
}

impl HeapTimerBackend {
    pub fn new() -> Self {
        Self::with_capacity(crate::config::defaults::TIMER_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            heap: BinaryHeap::with_capacity(capacity),
            cancelled: HashSet::with_capacity(capacity / 4),
            total_inserted: 0,
            total_fired: 0,
            total_cancelled: 0,
        }
    }

    pub fn stats(&self) -> HeapTimerStats {
        HeapTimerStats {
            active: self.len(),
            pending_cancellations: self.cancelled.len(),
            total_inserted: self.total_inserted,
            total_fired: self.total_fired,
            total_cancelled: self.total_cancelled,
        }
    }

    /// Drop cancelled entries sitting at the top of the heap
    fn skip_cancelled(&mut self) {
        while let Some(top) = self.heap.peek() {
            let handle = top.0.handle;
            if !self.cancelled.remove(&handle) {
                break;
            }
            self.heap.pop();
        }
        if self.heap.is_empty() {
            self.cancelled.clear();
        }
    }
}

impl Default for HeapTimerBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerBackend for HeapTimerBackend {
    fn insert(&mut self, entry: TimerEntry) -> TimerHandle {
        let handle = entry.handle;
        // Re-inserting a handle revives it
        self.cancelled.remove(&handle);
        self.heap.push(HeapEntry(entry));
        self.total_inserted += 1;
        handle
    }

    fn cancel(&mut self, handle: TimerHandle) -> bool {
        let inserted = self.cancelled.insert(handle);
        if inserted {
            self.total_cancelled += 1;
        }
        inserted
    }

    fn poll_expired(&mut self, now: Instant) -> Vec<TimerEntry> {
        let mut expired = Vec::new();

        while let Some(top) = self.heap.peek() {
            if top.0.deadline > now {
                break;
            }
            let Some(HeapEntry(entry)) = self.heap.pop() else {
                break;
            };
            if self.cancelled.remove(&entry.handle) {
                continue;
            }
            self.total_fired += 1;
            expired.push(entry);
        }

        if self.heap.is_empty() {
            self.cancelled.clear();
        }
        expired
    }

    fn next_deadline(&mut self) -> Option<Instant> {
        self.skip_cancelled();
        self.heap.peek().map(|e| e.0.deadline)
    }

    fn len(&self) -> usize {
        self.heap.len().saturating_sub(self.cancelled.len())
    }

    fn name(&self) -> &'static str {
        "heap"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_ordering() {
        let mut backend = HeapTimerBackend::with_capacity(8);
        let late = TimerEntry::timeout(Duration::from_millis(30));
        let early = TimerEntry::timeout(Duration::from_millis(10));
        backend.insert(late);
        backend.insert(early);

        assert_eq!(backend.next_deadline(), Some(early.deadline));

        let fired = backend.poll_expired(Instant::now() + Duration::from_millis(50));
        let handles: Vec<_> = fired.iter().map(|e| e.handle).collect();
        assert_eq!(handles, vec![early.handle, late.handle]);
        assert!(backend.is_empty());
    }

    #[test]
    fn test_lazy_cancel() {
        let mut backend = HeapTimerBackend::new();
        let entry = TimerEntry::timeout(Duration::from_millis(1));
        let handle = backend.insert(entry);
        assert_eq!(backend.len(), 1);

        assert!(backend.cancel(handle));
        assert!(!backend.cancel(handle));
        assert_eq!(backend.len(), 0);
        assert_eq!(backend.next_deadline(), None);

        let fired = backend.poll_expired(Instant::now() + Duration::from_secs(1));
        assert!(fired.is_empty());
        assert_eq!(backend.stats().total_cancelled, 1);
    }

    #[test]
    fn test_not_yet_expired() {
        let mut backend = HeapTimerBackend::new();
        backend.insert(TimerEntry::timeout(Duration::from_secs(60)));
        assert!(backend.poll_expired(Instant::now()).is_empty());
        assert_eq!(backend.len(), 1);
    }
}
