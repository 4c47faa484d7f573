//! Timer entry and handle types

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Kind of timer; also gates which clear call may cancel it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Fires once
    Timeout,
    /// Re-arms after each firing
    Interval,
}

/// Globally unique timer handle for cancellation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle {
    id: u64,
    kind: TimerKind,
}

impl TimerHandle {
    /// Generate a new unique handle of the given kind
    #[inline]
    pub fn new(kind: TimerKind) -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        TimerHandle {
            id: COUNTER.fetch_add(1, Ordering::Relaxed),
            kind,
        }
    }

    /// Raw handle value (for logging)
    #[inline]
    pub fn raw(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn kind(&self) -> TimerKind {
        self.kind
    }
}

/// Timer entry stored in a backend
///
/// Carries only scheduling data. The callback lives in the `TimerQueue`,
/// keyed by handle.
#[derive(Debug, Clone, Copy)]
pub struct TimerEntry {
    pub handle: TimerHandle,
    pub deadline: Instant,
    /// Re-arm period; zero for one-shot timers
    pub interval: Duration,
}

impl TimerEntry {
    /// One-shot entry due `delay` from now
    #[inline]
    pub fn timeout(delay: Duration) -> Self {
        Self {
            handle: TimerHandle::new(TimerKind::Timeout),
            deadline: Instant::now() + delay,
            interval: Duration::ZERO,
        }
    }

    /// Repeating entry, first due one `interval` from now
    #[inline]
    pub fn interval(interval: Duration) -> Self {
        Self {
            handle: TimerHandle::new(TimerKind::Interval),
            deadline: Instant::now() + interval,
            interval,
        }
    }

    #[inline]
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    /// Time remaining until deadline (zero if expired)
    #[inline]
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Next occurrence of an interval entry, measured from `now`
    ///
    /// Keeps the handle so the owner can still clear it. `None` for
    /// one-shot entries.
    pub fn rearm(&self, now: Instant) -> Option<Self> {
        match self.handle.kind {
            TimerKind::Interval => Some(Self {
                handle: self.handle,
                deadline: now + self.interval,
                interval: self.interval,
            }),
            TimerKind::Timeout => None,
        }
    }
}
