//! Runtime configuration
//!
//! Library defaults with environment overrides, adjusted through builder
//! setters.
//!
//! # Example
//!
//! ```rust,ignore
//! use weft_runtime::config::RuntimeConfig;
//!
//! // Defaults with env overrides
//! let config = RuntimeConfig::from_env();
//!
//! // Or pinned programmatically
//! let config = RuntimeConfig::new()
//!     .retention(Duration::from_secs(5))
//!     .worker_threads(2);
//! ```

pub mod defaults;

use std::time::Duration;
use weft_core::env::{env_get, env_get_ms};
use weft_core::WeftError;

/// Runtime configuration with builder pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// How long completed promises stay in the returns set
    pub retention: Duration,
    /// Longest single sleep when nothing is runnable
    pub max_idle_sleep: Duration,
    /// Reject pending promises older than this (`None` = never)
    pub task_budget: Option<Duration>,
    /// Default subprocess concurrency for workers
    pub worker_threads: usize,
    /// Default work-list limit for workers
    pub worker_max_queue: usize,
    /// Initial timer heap capacity
    pub timer_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl RuntimeConfig {
    /// Create config from library defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `WEFT_RETENTION_MS` - Promise retention in milliseconds
    /// - `WEFT_MAX_IDLE_SLEEP_MS` - Idle sleep cap in milliseconds
    /// - `WEFT_TASK_BUDGET_MS` - Pending promise budget (0 = off)
    /// - `WEFT_WORKER_THREADS` - Worker subprocess concurrency
    /// - `WEFT_WORKER_MAX_QUEUE` - Worker work-list limit
    /// - `WEFT_TIMER_CAPACITY` - Initial timer heap capacity
    pub fn from_env() -> Self {
        Self {
            retention: env_get_ms("WEFT_RETENTION_MS", defaults::RETENTION_MS),
            max_idle_sleep: env_get_ms("WEFT_MAX_IDLE_SLEEP_MS", defaults::MAX_IDLE_SLEEP_MS),
            task_budget: budget(env_get("WEFT_TASK_BUDGET_MS", defaults::TASK_BUDGET_MS)),
            worker_threads: env_get("WEFT_WORKER_THREADS", defaults::WORKER_THREADS),
            worker_max_queue: env_get("WEFT_WORKER_MAX_QUEUE", defaults::WORKER_MAX_QUEUE),
            timer_capacity: env_get("WEFT_TIMER_CAPACITY", defaults::TIMER_CAPACITY),
        }
    }

    /// Create config with library defaults only (no env override).
    pub fn new() -> Self {
        Self {
            retention: Duration::from_millis(defaults::RETENTION_MS),
            max_idle_sleep: Duration::from_millis(defaults::MAX_IDLE_SLEEP_MS),
            task_budget: budget(defaults::TASK_BUDGET_MS),
            worker_threads: defaults::WORKER_THREADS,
            worker_max_queue: defaults::WORKER_MAX_QUEUE,
            timer_capacity: defaults::TIMER_CAPACITY,
        }
    }

    // Builder methods

    pub fn retention(mut self, d: Duration) -> Self {
        self.retention = d;
        self
    }

    pub fn max_idle_sleep(mut self, d: Duration) -> Self {
        self.max_idle_sleep = d;
        self
    }

    pub fn task_budget(mut self, d: Option<Duration>) -> Self {
        self.task_budget = d;
        self
    }

    pub fn worker_threads(mut self, n: usize) -> Self {
        self.worker_threads = n;
        self
    }

    pub fn worker_max_queue(mut self, n: usize) -> Self {
        self.worker_max_queue = n;
        self
    }

    pub fn timer_capacity(mut self, n: usize) -> Self {
        self.timer_capacity = n;
        self
    }

    /// Validate configuration and return errors if invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_idle_sleep.is_zero() {
            return Err(ConfigError::InvalidValue("max_idle_sleep must be > 0"));
        }
        if self.max_idle_sleep > Duration::from_secs(1) {
            return Err(ConfigError::InvalidValue("max_idle_sleep must be <= 1s"));
        }
        if self.task_budget.is_some_and(|d| d.is_zero()) {
            return Err(ConfigError::InvalidValue("task_budget must be > 0 when set"));
        }
        if self.worker_threads == 0 {
            return Err(ConfigError::InvalidValue("worker_threads must be > 0"));
        }
        if self.worker_max_queue == 0 {
            return Err(ConfigError::InvalidValue("worker_max_queue must be > 0"));
        }
        Ok(())
    }

    /// Print configuration (for debugging)
    pub fn print(&self) {
        eprintln!("weft configuration:");
        eprintln!("  retention:         {:?}", self.retention);
        eprintln!("  max_idle_sleep:    {:?}", self.max_idle_sleep);
        eprintln!("  task_budget:       {:?}", self.task_budget);
        eprintln!("  worker_threads:    {}", self.worker_threads);
        eprintln!("  worker_max_queue:  {}", self.worker_max_queue);
        eprintln!("  timer_capacity:    {}", self.timer_capacity);
    }
}

fn budget(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

/// Configuration error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    InvalidValue(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidValue(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<ConfigError> for WeftError {
    fn from(e: ConfigError) -> Self {
        match e {
            ConfigError::InvalidValue(msg) => WeftError::InvalidConfig(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::new();
        assert_eq!(config.retention, Duration::from_secs(10));
        assert_eq!(config.max_idle_sleep, Duration::from_millis(10));
        assert_eq!(config.task_budget, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_env() {
        std::env::set_var("WEFT_WORKER_MAX_QUEUE", "3");
        let config = RuntimeConfig::from_env();
        std::env::remove_var("WEFT_WORKER_MAX_QUEUE");
        assert_eq!(config.worker_max_queue, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = RuntimeConfig::new()
            .retention(Duration::from_millis(5))
            .task_budget(Some(Duration::from_millis(50)))
            .worker_threads(2);

        assert_eq!(config.retention, Duration::from_millis(5));
        assert_eq!(config.task_budget, Some(Duration::from_millis(50)));
        assert_eq!(config.worker_threads, 2);
    }

    #[test]
    fn test_validation() {
        let config = RuntimeConfig::new().worker_threads(0);
        assert!(config.validate().is_err());

        let config = RuntimeConfig::new().max_idle_sleep(Duration::ZERO);
        assert!(config.validate().is_err());

        let config = RuntimeConfig::new().task_budget(Some(Duration::ZERO));
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidValue("task_budget must be > 0 when set"))
        );
    }

    #[test]
    fn test_into_weft_error() {
        let e: WeftError = ConfigError::InvalidValue("x").into();
        assert_eq!(e, WeftError::InvalidConfig("x"));
    }
}
