//! Callback dispatch, run by the micro-task queue
//!
//! Rejected: the reject callback maps the reason, then `finally` runs.
//! Fulfilled: the value flows through the `then` callbacks in order. A
//! callback that returns a promise hands the rest of the chain (and the
//! reject/finally callbacks) to that promise, which is queued again if it
//! already completed. A callback that panics switches to the rejected
//! path with the panic as the reason; this is the only place a terminal
//! status is rewritten, so a failed chain never reports Fulfilled.

use std::mem;
use std::panic::{catch_unwind, AssertUnwindSafe};

use weft_core::{kerror, ktrace, PromiseStatus, Value, WeftError};

use super::{Callbacks, Chained, Promise};
use crate::task::panic_message;

/// Run `f`, turning a panic into a rejection payload
fn guarded<T>(f: impl FnOnce() -> T) -> Result<T, Value> {
    catch_unwind(AssertUnwindSafe(f))
        .map_err(|panic| WeftError::Panicked(panic_message(&panic)).to_value())
}

impl Promise {
    pub(crate) fn use_callbacks(&self) {
        let (mut status, mut value, mut callbacks) = {
            let mut st = self.state_mut();
            st.forward = None;
            (st.status, st.result.clone(), mem::take(&mut st.callbacks))
        };

        if status == PromiseStatus::Fulfilled {
            while let Some(cb) = callbacks.resolve.pop_front() {
                match guarded(move || cb(value)) {
                    Ok(Chained::Value(next)) => value = next,
                    Ok(Chained::Continuation(next)) => {
                        self.forward_chain(next, callbacks);
                        return;
                    }
                    Err(reason) => {
                        status = PromiseStatus::Rejected;
                        value = reason;
                        break;
                    }
                }
            }
        }

        if status == PromiseStatus::Rejected {
            callbacks.resolve.clear();
            if let Some(cb) = callbacks.reject.take() {
                value = match guarded(move || cb(value)) {
                    Ok(mapped) => mapped,
                    Err(reason) => reason,
                };
            }
        }

        {
            let mut st = self.state_mut();
            st.status = status;
            st.result = value;
        }

        if let Some(cb) = callbacks.finally.take() {
            if let Err(reason) = guarded(cb) {
                kerror!("finally callback of promise {} panicked: {}", self.id(), reason);
            }
        }
    }

    fn forward_chain(&self, next: Promise, rest: Callbacks) {
        let target = next.chain_end();
        if target == *self {
            // A promise continuing on itself would never finish
            kerror!("promise {} returned itself from then()", self.id());
            return;
        }
        ktrace!("promise {} continues on {}", self.id(), target.id());
        self.state_mut().forward = Some(target.clone());

        if rest.is_empty() {
            return;
        }
        {
            let mut st = target.state_mut();
            st.callbacks.resolve.extend(rest.resolve);
            if rest.reject.is_some() {
                st.callbacks.reject = rest.reject;
            }
            if rest.finally.is_some() {
                st.callbacks.finally = rest.finally;
            }
        }
        target.requeue_if_complete();
    }
}
