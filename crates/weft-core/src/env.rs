//! Environment variable helpers used by `RuntimeConfig::from_env`
//!
//! ```ignore
//! use weft_core::env::{env_get, env_get_bool, env_get_ms};
//!
//! let threads: usize = env_get("WEFT_WORKER_THREADS", 4);
//! let retention = env_get_ms("WEFT_RETENTION_MS", 10_000);
//! let debug = env_get_bool("WEFT_DEBUG", false);
//! ```

use std::str::FromStr;
use std::time::Duration;

/// Get environment variable parsed as `T`, or `default` when unset or unparsable
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Boolean variable; accepts "1", "true", "yes", "on" (any case) as true
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// `Some(T)` only if the variable is set and parses
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

#[inline]
pub fn env_get_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Millisecond count as a `Duration`
#[inline]
pub fn env_get_ms(key: &str, default_ms: u64) -> Duration {
    Duration::from_millis(env_get(key, default_ms))
}

#[inline]
pub fn env_is_set(key: &str) -> bool {
    std::env::var(key).is_ok()
}
