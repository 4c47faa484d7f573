//! Identifier types for promises, tasks and workers
//!
//! Ids are handed out by a per-runtime counter, so two independent
//! runtimes may reuse the same raw values.

use core::fmt;

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Create an id from a raw value
            #[inline]
            pub const fn new(id: u64) -> Self {
                $name(id)
            }

            /// Get the raw u64 value
            #[inline]
            pub const fn as_u64(self) -> u64 {
                self.0
            }
        }

        impl From<u64> for $name {
            #[inline]
            fn from(id: u64) -> Self {
                $name(id)
            }
        }

        impl From<$name> for u64 {
            #[inline]
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($label, "#{}"), self.0)
            }
        }
    };
}

define_id!(
    /// Monotonic identifier of a Promise within one runtime
    PromiseId,
    "promise"
);

define_id!(
    /// Identifier of a Task (the coroutine backing a promise or green thread)
    TaskId,
    "task"
);

define_id!(
    /// Identifier of a subprocess Worker
    WorkerId,
    "worker"
);

/// Monotonic id source
///
/// Wraps around instead of overflowing; a runtime would need 2^64 live
/// records for a collision to matter.
#[derive(Debug, Default)]
pub struct IdGenerator {
    next: core::cell::Cell<u64>,
}

impl IdGenerator {
    pub const fn new() -> Self {
        Self {
            next: core::cell::Cell::new(0),
        }
    }

    /// Take the next raw id
    #[inline]
    pub fn next_raw(&self) -> u64 {
        let id = self.next.get();
        self.next.set(id.wrapping_add(1));
        id
    }

    #[inline]
    pub fn next_promise(&self) -> PromiseId {
        PromiseId(self.next_raw())
    }

    #[inline]
    pub fn next_task(&self) -> TaskId {
        TaskId(self.next_raw())
    }

    #[inline]
    pub fn next_worker(&self) -> WorkerId {
        WorkerId(self.next_raw())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_basics() {
        let id = PromiseId::new(42);
        assert_eq!(id.as_u64(), 42);
        assert_eq!(format!("{}", id), "promise#42");
        assert_eq!(format!("{:?}", id), "PromiseId(42)");
    }

    #[test]
    fn test_id_conversions() {
        let id: TaskId = 100u64.into();
        let raw: u64 = id.into();
        assert_eq!(raw, 100);
    }

    #[test]
    fn test_generator_is_monotonic() {
        let gen = IdGenerator::new();
        let a = gen.next_promise();
        let b = gen.next_promise();
        let c = gen.next_task();
        assert!(a < b);
        assert_eq!(c.as_u64(), 2);
    }

    #[test]
    fn test_generator_wraps() {
        let gen = IdGenerator::new();
        gen.next.set(u64::MAX);
        assert_eq!(gen.next_raw(), u64::MAX);
        assert_eq!(gen.next_raw(), 0);
    }
}
