//! Task and promise status types

use core::fmt;

/// Lifecycle of a Task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskStatus {
    /// Created, body not yet entered
    Pending = 0,

    /// Entered at least once and suspended at a yield point
    Running = 1,

    /// Body returned (or panicked); result is available
    Terminated = 2,
}

impl TaskStatus {
    #[inline]
    pub const fn is_terminated(&self) -> bool {
        matches!(self, TaskStatus::Terminated)
    }

    /// Started but not finished
    #[inline]
    pub const fn is_suspended(&self) -> bool {
        matches!(self, TaskStatus::Running)
    }
}

impl From<u8> for TaskStatus {
    fn from(v: u8) -> Self {
        match v {
            1 => TaskStatus::Running,
            2 => TaskStatus::Terminated,
            _ => TaskStatus::Pending,
        }
    }
}

/// Settlement state of a Promise
///
/// Moves only from `Pending` to one of the terminal states, once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PromiseStatus {
    #[default]
    Pending,
    Fulfilled,
    Rejected,
}

impl PromiseStatus {
    #[inline]
    pub const fn is_pending(&self) -> bool {
        matches!(self, PromiseStatus::Pending)
    }

    #[inline]
    pub const fn is_terminal(&self) -> bool {
        !self.is_pending()
    }

    /// Lowercase name used in `all_settled` records
    pub const fn as_str(&self) -> &'static str {
        match self {
            PromiseStatus::Pending => "pending",
            PromiseStatus::Fulfilled => "fulfilled",
            PromiseStatus::Rejected => "rejected",
        }
    }
}

impl fmt::Display for PromiseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_status() {
        assert!(TaskStatus::Terminated.is_terminated());
        assert!(!TaskStatus::Running.is_terminated());
        assert!(TaskStatus::Running.is_suspended());
        assert!(!TaskStatus::Pending.is_suspended());
        assert_eq!(TaskStatus::from(2), TaskStatus::Terminated);
        assert_eq!(TaskStatus::from(99), TaskStatus::Pending);
    }

    #[test]
    fn test_promise_status() {
        assert!(PromiseStatus::Pending.is_pending());
        assert!(PromiseStatus::Fulfilled.is_terminal());
        assert!(PromiseStatus::Rejected.is_terminal());
        assert_eq!(PromiseStatus::Rejected.to_string(), "rejected");
        assert_eq!(PromiseStatus::default(), PromiseStatus::Pending);
    }
}
