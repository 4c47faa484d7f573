//! Kernel-style print macros for weft
//!
//! Leveled, line-atomic output on stderr. Stdout is left alone because a
//! weft child process uses it as its control channel to the parent.
//!
//! # Environment Variables
//!
//! - `WEFT_LOG_LEVEL=<level>` - off, error, warn, info, debug, trace (or 0-5)
//! - `WEFT_FLUSH_EPRINT=1` - flush stderr after each line
//! - `WEFT_LOG_TIME=1` - prefix lines with milliseconds since first log
//!
//! # Usage
//!
//! ```ignore
//! use weft_core::{kinfo, kdebug, kwarn};
//!
//! kinfo!("runtime started");
//! kdebug!("tick {}: {} pending", n, pending);
//! kwarn!("promise {} rejected without handler", id);
//! ```

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

/// Log levels
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl LogLevel {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Off,
            1 => LogLevel::Error,
            2 => LogLevel::Warn,
            3 => LogLevel::Info,
            4 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }

    /// Parse a level name or digit; unknown input yields `None`
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "off" | "0" => Some(LogLevel::Off),
            "error" | "1" => Some(LogLevel::Error),
            "warn" | "2" => Some(LogLevel::Warn),
            "info" | "3" => Some(LogLevel::Info),
            "debug" | "4" => Some(LogLevel::Debug),
            "trace" | "5" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    pub fn prefix(&self) -> &'static str {
        match self {
            LogLevel::Off => "",
            LogLevel::Error => "[ERROR]",
            LogLevel::Warn => "[WARN] ",
            LogLevel::Info => "[INFO] ",
            LogLevel::Debug => "[DEBUG]",
            LogLevel::Trace => "[TRACE]",
        }
    }
}

static FLUSH_ENABLED: AtomicBool = AtomicBool::new(false);
static TIME_ENABLED: AtomicBool = AtomicBool::new(false);
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Warn as u8);
static INITIALIZED: AtomicBool = AtomicBool::new(false);
static START: OnceLock<Instant> = OnceLock::new();

/// Initialize logging from environment variables
///
/// Called automatically on first log. Programmatic setters called before
/// the first log line are overridden by the environment.
pub fn init() {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }
    let _ = START.get_or_init(Instant::now);

    if let Ok(val) = std::env::var("WEFT_FLUSH_EPRINT") {
        FLUSH_ENABLED.store(is_truthy(&val), Ordering::Relaxed);
    }

    if let Ok(val) = std::env::var("WEFT_LOG_TIME") {
        TIME_ENABLED.store(is_truthy(&val), Ordering::Relaxed);
    }

    if let Ok(val) = std::env::var("WEFT_LOG_LEVEL") {
        let level = LogLevel::parse(&val).unwrap_or(LogLevel::Warn);
        LOG_LEVEL.store(level as u8, Ordering::Relaxed);
    }
}

fn is_truthy(val: &str) -> bool {
    matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

#[inline]
fn ensure_init() {
    if !INITIALIZED.load(Ordering::Relaxed) {
        init();
    }
}

#[inline]
pub fn flush_enabled() -> bool {
    ensure_init();
    FLUSH_ENABLED.load(Ordering::Relaxed)
}

#[inline]
pub fn log_level() -> LogLevel {
    ensure_init();
    LogLevel::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

pub fn set_log_level(level: LogLevel) {
    ensure_init();
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn set_flush_enabled(enabled: bool) {
    ensure_init();
    FLUSH_ENABLED.store(enabled, Ordering::Relaxed);
}

pub fn set_time_enabled(enabled: bool) {
    ensure_init();
    TIME_ENABLED.store(enabled, Ordering::Relaxed);
}

#[inline]
pub fn level_enabled(level: LogLevel) -> bool {
    level != LogLevel::Off && level as u8 <= log_level() as u8
}

fn write_time_prefix(handle: &mut impl Write) {
    if TIME_ENABLED.load(Ordering::Relaxed) {
        let ms = START.get().map(|s| s.elapsed().as_millis()).unwrap_or(0);
        let _ = write!(handle, "[{:>8}ms] ", ms);
    }
}

#[doc(hidden)]
pub fn _kprint_impl(args: std::fmt::Arguments<'_>) {
    let stderr = std::io::stderr();
    let mut handle = stderr.lock();
    let _ = handle.write_fmt(args);
    if flush_enabled() {
        let _ = handle.flush();
    }
}

#[doc(hidden)]
pub fn _kprintln_impl(args: std::fmt::Arguments<'_>) {
    let stderr = std::io::stderr();
    let mut handle = stderr.lock();
    let _ = handle.write_fmt(args);
    let _ = handle.write_all(b"\n");
    if flush_enabled() {
        let _ = handle.flush();
    }
}

#[doc(hidden)]
pub fn _klog_impl(level: LogLevel, args: std::fmt::Arguments<'_>) {
    if !level_enabled(level) {
        return;
    }
    let stderr = std::io::stderr();
    let mut handle = stderr.lock();
    write_time_prefix(&mut handle);
    let _ = write!(handle, "{} ", level.prefix());
    let _ = handle.write_fmt(args);
    let _ = handle.write_all(b"\n");
    if flush_enabled() {
        let _ = handle.flush();
    }
}

// ============================================================================
// Public Macros
// ============================================================================

/// Print to stderr (no newline)
#[macro_export]
macro_rules! kprint {
    ($($arg:tt)*) => {{
        $crate::kprint::_kprint_impl(format_args!($($arg)*));
    }};
}

/// Print to stderr with newline
#[macro_export]
macro_rules! kprintln {
    () => {{
        $crate::kprint::_kprintln_impl(format_args!(""));
    }};
    ($($arg:tt)*) => {{
        $crate::kprint::_kprintln_impl(format_args!($($arg)*));
    }};
}

#[macro_export]
macro_rules! kerror {
    ($($arg:tt)*) => {{
        $crate::kprint::_klog_impl(
            $crate::kprint::LogLevel::Error,
            format_args!($($arg)*)
        );
    }};
}

#[macro_export]
macro_rules! kwarn {
    ($($arg:tt)*) => {{
        $crate::kprint::_klog_impl(
            $crate::kprint::LogLevel::Warn,
            format_args!($($arg)*)
        );
    }};
}

#[macro_export]
macro_rules! kinfo {
    ($($arg:tt)*) => {{
        $crate::kprint::_klog_impl(
            $crate::kprint::LogLevel::Info,
            format_args!($($arg)*)
        );
    }};
}

#[macro_export]
macro_rules! kdebug {
    ($($arg:tt)*) => {{
        $crate::kprint::_klog_impl(
            $crate::kprint::LogLevel::Debug,
            format_args!($($arg)*)
        );
    }};
}

/// Trace level log (most verbose)
#[macro_export]
macro_rules! ktrace {
    ($($arg:tt)*) => {{
        $crate::kprint::_klog_impl(
            $crate::kprint::LogLevel::Trace,
            format_args!($($arg)*)
        );
    }};
}
