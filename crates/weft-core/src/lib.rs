//! # weft-core
//!
//! Core types for the weft cooperative runtime.
//!
//! This crate holds no scheduling logic. Everything that drives tasks lives
//! in `weft-runtime`.
//!
//! ## Modules
//!
//! - `id` - Promise, task and worker identifiers
//! - `state` - Task and promise status enums
//! - `cancel` - Cancellation token for cooperative cancellation
//! - `error` - Error type and rejection payload conversion
//! - `kprint` - Kernel-style leveled logging macros
//! - `env` - Environment variable utilities

pub mod id;
pub mod state;
pub mod cancel;
pub mod error;
pub mod kprint;
pub mod env;

pub use id::{IdGenerator, PromiseId, TaskId, WorkerId};
pub use state::{PromiseStatus, TaskStatus};
pub use cancel::CancellationToken;
pub use error::{WeftError, WeftResult};
pub use env::{env_get, env_get_bool, env_get_ms, env_get_opt, env_get_str, env_is_set};

/// Payload type carried by promises, green-thread outputs and the
/// subprocess shared map.
pub use serde_json::Value;
