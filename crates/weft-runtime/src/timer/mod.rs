//! Timer subsystem
//!
//! `TimerQueue` owns the callbacks; a pluggable `TimerBackend` only orders
//! deadlines.
//!
//! ```text
//!   set_timeout / set_interval
//!               │
//!               ▼
//!        ┌────────────┐   handle → callback
//!        │ TimerQueue │────────────────────┐
//!        └────────────┘                    │
//!               │ (handle, deadline)       │
//!               ▼                          │
//!     ┌───────────────────┐                │
//!     │  dyn TimerBackend │ poll_expired ──► run(): invoke, re-arm intervals
//!     └───────────────────┘
//! ```
//!
//! Callbacks are taken out of the queue before they run, so a callback may
//! register new timers or clear any timer, itself included.

mod entry;
mod heap;

pub use entry::{TimerEntry, TimerHandle, TimerKind};
pub use heap::{HeapTimerBackend, HeapTimerStats};

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::{Duration, Instant};

use weft_core::kerror;

use crate::task::panic_message;

/// Deadline ordering backend
///
/// Single-threaded: the queue lives on the runtime thread.
pub trait TimerBackend {
    /// Insert an entry, returns its handle
    fn insert(&mut self, entry: TimerEntry) -> TimerHandle;

    /// Cancel by handle; true if the handle was newly marked
    fn cancel(&mut self, handle: TimerHandle) -> bool;

    /// Remove and return every live entry due at `now`, earliest first
    fn poll_expired(&mut self, now: Instant) -> Vec<TimerEntry>;

    /// Earliest live deadline, if any
    fn next_deadline(&mut self) -> Option<Instant>;

    /// Number of live entries
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn name(&self) -> &'static str {
        "unknown"
    }
}

enum TimerCallback {
    Once(Box<dyn FnOnce()>),
    Repeat(Box<dyn FnMut()>),
}

/// Pending timers and their callbacks
pub struct TimerQueue {
    backend: Box<dyn TimerBackend>,
    callbacks: HashMap<TimerHandle, TimerCallback>,
    /// Handles whose callback is out for invocation
    firing: HashSet<TimerHandle>,
}

impl TimerQueue {
    pub fn new(capacity: usize) -> Self {
        Self::with_backend(Box::new(HeapTimerBackend::with_capacity(capacity)))
    }

    pub fn with_backend(backend: Box<dyn TimerBackend>) -> Self {
        Self {
            backend,
            callbacks: HashMap::new(),
            firing: HashSet::new(),
        }
    }

    /// Run `f` once after `delay`
    pub fn set_timeout<F>(&mut self, delay: Duration, f: F) -> TimerHandle
    where
        F: FnOnce() + 'static,
    {
        let entry = TimerEntry::timeout(delay);
        self.callbacks.insert(entry.handle, TimerCallback::Once(Box::new(f)));
        self.backend.insert(entry)
    }

    /// Run `f` every `every` until cleared
    pub fn set_interval<F>(&mut self, every: Duration, f: F) -> TimerHandle
    where
        F: FnMut() + 'static,
    {
        let entry = TimerEntry::interval(every);
        self.callbacks.insert(entry.handle, TimerCallback::Repeat(Box::new(f)));
        self.backend.insert(entry)
    }

    /// Cancel a timeout. No-op for interval handles.
    pub fn clear_timeout(&mut self, handle: TimerHandle) -> bool {
        handle.kind() == TimerKind::Timeout && self.clear(handle)
    }

    /// Cancel an interval. No-op for timeout handles.
    pub fn clear_interval(&mut self, handle: TimerHandle) -> bool {
        handle.kind() == TimerKind::Interval && self.clear(handle)
    }

    fn clear(&mut self, handle: TimerHandle) -> bool {
        // Popped from the backend already; just keep it from running or re-arming
        if self.firing.remove(&handle) {
            return true;
        }
        if self.callbacks.remove(&handle).is_some() {
            self.backend.cancel(handle);
            return true;
        }
        false
    }

    pub fn is_active(&self, handle: TimerHandle) -> bool {
        self.callbacks.contains_key(&handle) || self.firing.contains(&handle)
    }

    pub fn len(&self) -> usize {
        self.callbacks.len() + self.firing.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.backend.next_deadline()
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    fn take_expired(&mut self, now: Instant) -> Vec<(TimerEntry, TimerCallback)> {
        let mut due = Vec::new();
        for entry in self.backend.poll_expired(now) {
            if let Some(cb) = self.callbacks.remove(&entry.handle) {
                self.firing.insert(entry.handle);
                due.push((entry, cb));
            }
        }
        due
    }

    fn finish(&mut self, entry: TimerEntry, cb: TimerCallback, now: Instant) {
        if !self.firing.remove(&entry.handle) {
            return;
        }
        if let Some(next) = entry.rearm(now) {
            self.callbacks.insert(entry.handle, cb);
            self.backend.insert(next);
        }
    }
}

impl fmt::Debug for TimerQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerQueue")
            .field("backend", &self.backend.name())
            .field("len", &self.len())
            .finish()
    }
}

/// Fire every due timer, returns how many callbacks ran
///
/// Takes the `RefCell` rather than `&mut TimerQueue` so the borrow is
/// released while a callback runs.
pub fn run(queue: &RefCell<TimerQueue>) -> usize {
    let due = queue.borrow_mut().take_expired(Instant::now());
    let mut ran = 0;

    for (entry, cb) in due {
        // Cleared by an earlier callback in this batch
        if !queue.borrow().firing.contains(&entry.handle) {
            continue;
        }
        ran += 1;
        let cb = match cb {
            TimerCallback::Once(f) => {
                if let Err(panic) = catch_unwind(AssertUnwindSafe(f)) {
                    kerror!("timer {} panicked: {}", entry.handle.raw(), panic_message(&panic));
                }
                queue.borrow_mut().firing.remove(&entry.handle);
                continue;
            }
            TimerCallback::Repeat(mut f) => {
                if let Err(panic) = catch_unwind(AssertUnwindSafe(|| f())) {
                    kerror!("interval {} panicked: {}", entry.handle.raw(), panic_message(&panic));
                }
                TimerCallback::Repeat(f)
            }
        };
        queue.borrow_mut().finish(entry, cb, Instant::now());
    }
    ran
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    fn wait(ms: u64) {
        std::thread::sleep(Duration::from_millis(ms));
    }

    #[test]
    fn test_timeout_fires_once() {
        let queue = RefCell::new(TimerQueue::new(16));
        let hits = Rc::new(Cell::new(0));
        let h = hits.clone();
        queue.borrow_mut().set_timeout(Duration::from_millis(5), move || h.set(h.get() + 1));

        assert_eq!(run(&queue), 0);
        wait(10);
        assert_eq!(run(&queue), 1);
        wait(10);
        assert_eq!(run(&queue), 0);
        assert_eq!(hits.get(), 1);
        assert!(queue.borrow().is_empty());
    }

    #[test]
    fn test_clear_is_kind_gated() {
        let mut queue = TimerQueue::new(16);
        let t = queue.set_timeout(Duration::from_secs(1), || {});
        let i = queue.set_interval(Duration::from_secs(1), || {});

        assert!(!queue.clear_interval(t));
        assert!(!queue.clear_timeout(i));
        assert_eq!(queue.len(), 2);

        assert!(queue.clear_timeout(t));
        assert!(queue.clear_interval(i));
        assert!(queue.is_empty());
        assert_eq!(queue.next_deadline(), None);
    }

    #[test]
    fn test_interval_rearms() {
        let queue = RefCell::new(TimerQueue::new(16));
        let hits = Rc::new(Cell::new(0));
        let h = hits.clone();
        let handle = queue
            .borrow_mut()
            .set_interval(Duration::from_millis(2), move || h.set(h.get() + 1));

        for _ in 0..3 {
            wait(5);
            run(&queue);
        }
        assert_eq!(hits.get(), 3);
        assert!(queue.borrow().is_active(handle));
    }

    #[test]
    fn test_interval_clears_itself() {
        let queue = Rc::new(RefCell::new(TimerQueue::new(16)));
        let hits = Rc::new(Cell::new(0));
        let slot: Rc<Cell<Option<TimerHandle>>> = Rc::new(Cell::new(None));

        let (q, h, s) = (queue.clone(), hits.clone(), slot.clone());
        let handle = queue.borrow_mut().set_interval(Duration::from_millis(1), move || {
            h.set(h.get() + 1);
            if h.get() == 2 {
                if let Some(me) = s.get() {
                    q.borrow_mut().clear_interval(me);
                }
            }
        });
        slot.set(Some(handle));

        for _ in 0..5 {
            wait(3);
            run(&queue);
        }
        assert_eq!(hits.get(), 2);
        assert!(queue.borrow().is_empty());
    }

    #[test]
    fn test_callback_registers_timer() {
        let queue = Rc::new(RefCell::new(TimerQueue::new(16)));
        let hits = Rc::new(Cell::new(0));

        let (q, h) = (queue.clone(), hits.clone());
        queue.borrow_mut().set_timeout(Duration::ZERO, move || {
            let h2 = h.clone();
            q.borrow_mut().set_timeout(Duration::ZERO, move || h2.set(h2.get() + 10));
            h.set(h.get() + 1);
        });

        wait(1);
        run(&queue);
        assert_eq!(hits.get(), 1);
        wait(1);
        run(&queue);
        assert_eq!(hits.get(), 11);
    }

    #[test]
    fn test_panicking_callback_is_contained() {
        let queue = RefCell::new(TimerQueue::new(16));
        let hits = Rc::new(Cell::new(0));
        let h = hits.clone();
        queue.borrow_mut().set_timeout(Duration::ZERO, || panic!("timer boom"));
        queue.borrow_mut().set_timeout(Duration::ZERO, move || h.set(1));

        wait(1);
        assert_eq!(run(&queue), 2);
        assert_eq!(hits.get(), 1);
    }
}
