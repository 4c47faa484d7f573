//! # weft - cooperative user-space concurrency
//!
//! One thread, one event loop, many interleaved computations.
//!
//! ## Features
//!
//! - **Promises**: then/catch/finally chains, `all`, `all_settled`, `any`,
//!   `race`, and `.await` inside any promise body
//! - **Timers**: `set_timeout` / `set_interval`, re-entrant callbacks
//! - **Green threads**: named tasks with their own sleep/wake protocol
//! - **Process workers**: subprocesses in bounded batches, talking to the
//!   parent over a line protocol on stdout
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::time::Duration;
//! use weft::{json, Promise};
//!
//! fn main() {
//!     let out = weft::block_on(|rt| {
//!         let rt2 = rt.clone();
//!         Promise::new(rt, move |resolver| async move {
//!             rt2.set_timeout(Duration::from_millis(100), move || resolver.resolve("tick"));
//!             Ok(())
//!         })
//!         .then(|v| json!([v, "tock"]))
//!     });
//!     assert_eq!(out, Ok(json!(["tick", "tock"])));
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      User Code                              │
//! │        Promise::new / then / await, set_timeout, green()    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Runtime (event loop)                      │
//! │    pending set · micro-tasks · returns set · wait-list      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!          ┌───────────────────┼───────────────────┐
//!          ▼                   ▼                   ▼
//!    ┌───────────┐      ┌───────────┐      ┌───────────┐
//!    │   Green   │      │   Timer   │      │  Thread / │
//!    │  threads  │      │   queue   │      │  Worker   │
//!    └───────────┘      └───────────┘      └───────────┘
//!                                                 │
//!                                                 ▼
//!                                      child processes (stdio)
//! ```

// Re-export core types
pub use weft_core::{
    CancellationToken,
    IdGenerator,
    PromiseId,
    PromiseStatus,
    TaskId,
    TaskStatus,
    Value,
    WeftError,
    WeftResult,
    WorkerId,
};

// Re-export kprint macros for debug logging
pub use weft_core::{kprint, kprintln, kerror, kwarn, kinfo, kdebug, ktrace};
pub use weft_core::kprint::{LogLevel, init as init_logging, set_log_level, set_flush_enabled, set_time_enabled};

// Re-export env utilities
pub use weft_core::{env_get, env_get_bool, env_get_ms, env_get_opt, env_get_str, env_is_set};

// Re-export runtime types
pub use weft_runtime::{
    Chained,
    ConfigError,
    GreenStatus,
    GreenThreadScheduler,
    Promise,
    PromiseFuture,
    Resolver,
    Runtime,
    RuntimeConfig,
    TaskOutput,
    Thread,
    ThreadInput,
    TimerHandle,
    TimerKind,
    Work,
    Worker,
    WorkerOptions,
    park_any,
    repeat,
    sleep,
    yield_now,
};

// Child side of the subprocess protocol
pub use weft_runtime::thread::child::{alert, job_from_args, post_main_thread, shared_data};
pub use weft_runtime::thread::protocol::JobRequest;

pub use serde_json::{json, Map};

/// Run `f` on a fresh runtime configured from the environment, drive the
/// loop until its promise completes, then shut the runtime down
///
/// A runtime that fails to build is reported as a rejection.
pub fn block_on<F>(f: F) -> TaskOutput
where
    F: FnOnce(&Runtime) -> Promise,
{
    let rt = Runtime::from_env().map_err(|e| e.to_value())?;
    let promise = f(&rt);
    let out = rt.block_on(&promise);
    rt.shutdown();
    out
}

/// Like `block_on`, then keep ticking until every timer, green thread and
/// promise has finished
pub fn run<F>(f: F) -> WeftResult<()>
where
    F: FnOnce(&Runtime),
{
    let rt = Runtime::from_env()?;
    f(&rt);
    rt.run_until_quiescent();
    rt.shutdown();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::Duration;

    #[test]
    fn test_block_on() {
        let out = block_on(|rt| Promise::resolved(rt, 20).then(|v| json!(v.as_i64().unwrap() + 1)));
        assert_eq!(out, Ok(json!(21)));
    }

    #[test]
    fn test_block_on_rejection() {
        let out = block_on(|rt| Promise::rejected(rt, "no"));
        assert_eq!(out, Err(json!("no")));
    }

    #[test]
    fn test_run_waits_for_everything() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let l = log.clone();
        run(move |rt| {
            let l2 = l.clone();
            rt.set_timeout(Duration::from_millis(10), move || l2.borrow_mut().push("timer"));
            rt.green()
                .register("g", move |_| async move {
                    l.borrow_mut().push("green");
                    Value::Null
                }, vec![])
                .unwrap();
        })
        .unwrap();
        assert_eq!(*log.borrow(), vec!["green", "timer"]);
    }
}
