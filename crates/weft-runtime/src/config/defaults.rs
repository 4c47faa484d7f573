//! Library defaults for `RuntimeConfig`
//!
//! Used by `RuntimeConfig::new()` as-is and by `from_env()` when the
//! matching `WEFT_*` variable is unset.

/// How long a completed promise stays retrievable before it is purged
pub const RETENTION_MS: u64 = 10_000;

/// Upper bound on one idle sleep between ticks
pub const MAX_IDLE_SLEEP_MS: u64 = 10;

/// Wall-clock budget for a pending promise (0 disables TimeoutDrop)
pub const TASK_BUDGET_MS: u64 = 0;

/// Subprocesses a worker runs at once
pub const WORKER_THREADS: usize = 4;

/// Deepest work list a worker accepts
pub const WORKER_MAX_QUEUE: usize = 16;

/// Initial capacity of the timer heap
pub const TIMER_CAPACITY: usize = 1024;
