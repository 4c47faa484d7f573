//! Error types for the weft runtime

use core::fmt;
use serde_json::{json, Value};

/// Result type for runtime operations
pub type WeftResult<T> = Result<T, WeftError>;

/// Errors raised by the runtime
///
/// Registration problems come back synchronously as `Err`. Failures that
/// happen inside a running task become rejection payloads via
/// [`WeftError::to_value`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WeftError {
    /// A live green thread already uses this name
    DuplicateGreenThread(String),

    /// No green thread registered under this name
    GreenThreadNotFound(String),

    /// Work list is deeper than the worker allows
    QueueFull { queued: usize, max: usize },

    /// Configuration rejected by `validate`
    InvalidConfig(&'static str),

    /// Subprocess could not be started
    SpawnFailed(String),

    /// Subprocess wrote to stderr
    Subprocess(String),

    /// Pipe or process I/O failed
    Io(String),

    /// Task exceeded its wall-clock budget
    Timeout,

    /// Promise was cancelled before it settled
    Cancelled,

    /// Task body panicked
    Panicked(String),

    /// Green-thread operation used outside a registered green thread
    NotInGreenThread,

    /// Event loop ran dry while a caller was still waiting on a promise
    Stalled,
}

impl WeftError {
    /// Short machine-readable kind, used as the `error` field of payloads
    pub const fn kind(&self) -> &'static str {
        match self {
            WeftError::DuplicateGreenThread(_) => "duplicate_green_thread",
            WeftError::GreenThreadNotFound(_) => "green_thread_not_found",
            WeftError::QueueFull { .. } => "queue_full",
            WeftError::InvalidConfig(_) => "invalid_config",
            WeftError::SpawnFailed(_) => "spawn_failed",
            WeftError::Subprocess(_) => "subprocess",
            WeftError::Io(_) => "io",
            WeftError::Timeout => "timeout",
            WeftError::Cancelled => "cancelled",
            WeftError::Panicked(_) => "panicked",
            WeftError::NotInGreenThread => "not_in_green_thread",
            WeftError::Stalled => "stalled",
        }
    }

    /// Convert into a rejection payload
    pub fn to_value(&self) -> Value {
        json!({
            "error": self.kind(),
            "message": self.to_string(),
        })
    }

    /// Recover the kind from a payload made by `to_value`
    pub fn kind_of(payload: &Value) -> Option<&str> {
        payload.get("error").and_then(Value::as_str)
    }
}

impl fmt::Display for WeftError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WeftError::DuplicateGreenThread(name) => {
                write!(f, "green thread '{}' is already registered", name)
            }
            WeftError::GreenThreadNotFound(name) => {
                write!(f, "green thread '{}' not found", name)
            }
            WeftError::QueueFull { queued, max } => {
                write!(f, "work queue is full ({} queued, max {})", queued, max)
            }
            WeftError::InvalidConfig(msg) => write!(f, "invalid config: {}", msg),
            WeftError::SpawnFailed(msg) => write!(f, "unable to start thread: {}", msg),
            WeftError::Subprocess(stderr) => write!(f, "subprocess failed: {}", stderr),
            WeftError::Io(msg) => write!(f, "i/o error: {}", msg),
            WeftError::Timeout => write!(f, "task exceeded its time budget"),
            WeftError::Cancelled => write!(f, "operation cancelled"),
            WeftError::Panicked(msg) => write!(f, "task panicked: {}", msg),
            WeftError::NotInGreenThread => write!(f, "not running inside a green thread"),
            WeftError::Stalled => write!(f, "event loop has no work left but the promise is unsettled"),
        }
    }
}

impl std::error::Error for WeftError {}

impl From<std::io::Error> for WeftError {
    fn from(e: std::io::Error) -> Self {
        WeftError::Io(e.to_string())
    }
}

impl From<WeftError> for Value {
    fn from(e: WeftError) -> Self {
        e.to_value()
    }
}
