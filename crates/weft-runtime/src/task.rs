//! Task: one cooperatively-suspendable computation
//!
//! A task wraps a boxed future. Rust futures are stackless coroutines, so
//! the event loop acts as the trampoline: `start` enters the body, every
//! `resume` re-enters it, and the body hands control back at each
//! `.await` that returns `Pending`.
//!
//! Each task owns a waker. Waking does not run anything; it only flags the
//! task so the next tick resumes it. A task parked on a promise stays
//! unflagged until that promise completes.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};

use weft_core::{TaskId, TaskStatus, Value, WeftError};

/// What a task body produces: `Ok` for a return value, `Err` for a thrown one
pub type TaskOutput = Result<Value, Value>;

/// Boxed body of a task
pub type TaskFuture = Pin<Box<dyn Future<Output = TaskOutput>>>;

/// Waker payload: a single "resume me" flag
struct TaskWaker {
    woken: AtomicBool,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.woken.store(true, Ordering::Release);
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.woken.store(true, Ordering::Release);
    }
}

pub struct Task {
    id: TaskId,
    status: TaskStatus,
    future: Option<TaskFuture>,
    result: Option<TaskOutput>,
    flag: Arc<TaskWaker>,
    waker: Waker,
}

impl Task {
    /// Create a task without entering its body
    pub fn new<F>(id: TaskId, fut: F) -> Self
    where
        F: Future<Output = TaskOutput> + 'static,
    {
        let flag = Arc::new(TaskWaker {
            woken: AtomicBool::new(false),
        });
        let waker = Waker::from(flag.clone());
        Self {
            id,
            status: TaskStatus::Pending,
            future: Some(Box::pin(fut)),
            result: None,
            flag,
            waker,
        }
    }

    #[inline]
    pub fn id(&self) -> TaskId {
        self.id
    }

    #[inline]
    pub fn status(&self) -> TaskStatus {
        self.status
    }

    /// Enter the body for the first time. No-op once started.
    pub fn start(&mut self) {
        if self.status != TaskStatus::Pending {
            return;
        }
        self.status = TaskStatus::Running;
        self.poll_once();
    }

    /// Re-enter a suspended body. No-op unless suspended.
    pub fn resume(&mut self) {
        if self.status != TaskStatus::Running {
            return;
        }
        self.poll_once();
    }

    #[inline]
    pub fn is_started(&self) -> bool {
        self.status != TaskStatus::Pending
    }

    #[inline]
    pub fn is_suspended(&self) -> bool {
        self.status.is_suspended()
    }

    #[inline]
    pub fn is_terminated(&self) -> bool {
        self.status.is_terminated()
    }

    /// True if something woke the task since it last ran
    #[inline]
    pub fn is_woken(&self) -> bool {
        self.flag.woken.load(Ordering::Acquire)
    }

    /// A waker that flags this task
    pub fn waker(&self) -> Waker {
        self.waker.clone()
    }

    #[inline]
    pub fn result(&self) -> Option<&TaskOutput> {
        self.result.as_ref()
    }

    pub fn take_result(&mut self) -> Option<TaskOutput> {
        self.result.take()
    }

    /// Drop the body without running it further and terminate with `reason`
    pub fn abort(&mut self, reason: Value) {
        if self.status.is_terminated() {
            return;
        }
        self.future = None;
        self.finish(Err(reason));
    }

    fn poll_once(&mut self) {
        let Some(fut) = self.future.as_mut() else {
            return;
        };
        self.flag.woken.store(false, Ordering::Release);
        let mut cx = Context::from_waker(&self.waker);

        match catch_unwind(AssertUnwindSafe(|| fut.as_mut().poll(&mut cx))) {
            Ok(Poll::Pending) => {}
            Ok(Poll::Ready(out)) => self.finish(out),
            Err(panic) => {
                let msg = panic_message(&panic);
                weft_core::kwarn!("{} panicked: {}", self.id, msg);
                self.finish(Err(WeftError::Panicked(msg).to_value()));
            }
        }
    }

    fn finish(&mut self, out: TaskOutput) {
        self.future = None;
        self.result = Some(out);
        self.status = TaskStatus::Terminated;
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("status", &self.status)
            .field("woken", &self.is_woken())
            .finish()
    }
}

/// Best-effort text of a panic payload
pub(crate) fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::suspend::yield_now;
    use serde_json::json;

    fn task<F>(fut: F) -> Task
    where
        F: Future<Output = TaskOutput> + 'static,
    {
        Task::new(TaskId::new(1), fut)
    }

    #[test]
    fn test_instant_termination() {
        let mut t = task(async { Ok(json!(7)) });
        assert_eq!(t.status(), TaskStatus::Pending);
        t.start();
        assert!(t.is_terminated());
        assert_eq!(t.result(), Some(&Ok(json!(7))));
    }

    #[test]
    fn test_yield_suspends_and_wakes() {
        let mut t = task(async {
            yield_now().await;
            yield_now().await;
            Ok(json!("done"))
        });
        t.start();
        assert!(t.is_suspended());
        assert!(t.is_woken());

        t.resume();
        assert!(t.is_suspended());

        t.resume();
        assert!(t.is_terminated());
        assert_eq!(t.take_result(), Some(Ok(json!("done"))));
    }

    #[test]
    fn test_resume_before_start_is_noop() {
        let mut t = task(async { Ok(Value::Null) });
        t.resume();
        assert!(!t.is_started());
    }

    #[test]
    fn test_panic_becomes_rejection() {
        fn boom() -> TaskOutput {
            panic!("Test panic")
        }
        let mut t = task(async { boom() });
        t.start();
        assert!(t.is_terminated());
        let err = t.take_result().unwrap().unwrap_err();
        assert_eq!(WeftError::kind_of(&err), Some("panicked"));
        assert!(err["message"].as_str().unwrap().contains("Test panic"));
    }

    #[test]
    fn test_thrown_value() {
        let mut t = task(async { Err(json!("y")) });
        t.start();
        assert_eq!(t.result(), Some(&Err(json!("y"))));
    }

    #[test]
    fn test_abort() {
        let mut t = task(async {
            yield_now().await;
            Ok(json!(1))
        });
        t.start();
        t.abort(json!("stop"));
        assert!(t.is_terminated());
        assert_eq!(t.result(), Some(&Err(json!("stop"))));

        // Aborting a terminated task keeps the first result
        t.abort(json!("again"));
        assert_eq!(t.result(), Some(&Err(json!("stop"))));
    }
}
