//! # weft-runtime
//!
//! The single-threaded event loop and everything it schedules.
//!
//! This crate provides:
//! - Tasks (boxed futures resumed by the loop) and suspension points
//! - Promises with then/catch/finally chains and all/all_settled/any/race
//! - The micro-task queue that dispatches settled promises
//! - Timers (`set_timeout` / `set_interval`)
//! - Named green threads with their own sleep/wake protocol
//! - Subprocess threads and batching workers
//!
//! ```text
//!   Runtime::tick()
//!      │
//!      ├─► GreenThreadScheduler::run      one step per green thread
//!      ├─► pending promises               resume woken tasks
//!      ├─► MicroTaskQueue::run            then/catch/finally
//!      ├─► timer::run                     due timeouts and intervals
//!      └─► retention GC                   drop old completed promises
//! ```

pub mod config;
pub mod task;
pub mod suspend;
pub mod timer;
pub mod promise;
pub mod microtask;
pub mod event_loop;
pub mod green;
pub mod thread;

// Re-exports
pub use config::{ConfigError, RuntimeConfig};
pub use event_loop::Runtime;
pub use promise::{Chained, Promise, PromiseFuture, Resolver};
pub use task::{Task, TaskFuture, TaskOutput};
pub use suspend::{park_any, repeat, sleep, yield_now};
pub use timer::{TimerHandle, TimerKind};
pub use green::{GreenStatus, GreenThreadScheduler};
pub use microtask::MicroTaskQueue;
pub use thread::{Thread, ThreadInput, Work, Worker, WorkerOptions};
