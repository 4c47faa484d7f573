//! Named green threads stepped once per tick
//!
//! A green thread is a task registered under a unique name. `run` gives
//! every thread one step per tick, in registration order, skipping those
//! still sleeping. When a thread finishes, its record is dropped and its
//! return value is kept under its name in `outputs`.

use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};

use weft_core::{kdebug, kwarn, IdGenerator, Value, WeftError, WeftResult};

use crate::suspend::{yield_now, YieldNow};
use crate::task::Task;

/// Scheduling state of one green thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GreenStatus {
    registered_at: Instant,
    started: bool,
    sleep_until: Option<Instant>,
}

impl GreenStatus {
    fn new() -> Self {
        Self {
            registered_at: Instant::now(),
            started: false,
            sleep_until: None,
        }
    }

    pub fn registered_at(&self) -> Instant {
        self.registered_at
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn sleep_until(&self) -> Option<Instant> {
        self.sleep_until
    }

    /// Sleep deadline (if any) has passed
    pub fn can_wake_up(&self, now: Instant) -> bool {
        self.sleep_until.map_or(true, |at| now >= at)
    }

    pub fn is_sleeping(&self, now: Instant) -> bool {
        !self.can_wake_up(now)
    }
}

struct GreenThread {
    name: String,
    args: Vec<Value>,
    /// `None` while the scheduler is stepping it
    task: Option<Task>,
    status: GreenStatus,
}

#[derive(Default)]
pub struct GreenThreadScheduler {
    threads: RefCell<Vec<GreenThread>>,
    outputs: RefCell<HashMap<String, Value>>,
    ids: IdGenerator,
}

impl GreenThreadScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `f(args)` under `name` without running it
    pub fn register<F, Fut>(&self, name: &str, f: F, args: Vec<Value>) -> WeftResult<()>
    where
        F: FnOnce(Vec<Value>) -> Fut,
        Fut: Future<Output = Value> + 'static,
    {
        if self.threads.borrow().iter().any(|t| t.name == name) {
            return Err(WeftError::DuplicateGreenThread(name.to_string()));
        }
        let fut = f(args.clone());
        let task = Task::new(self.ids.next_task(), async move { Ok(fut.await) });
        kdebug!("green thread '{}' registered as {}", name, task.id());

        self.threads.borrow_mut().push(GreenThread {
            name: name.to_string(),
            args,
            task: Some(task),
            status: GreenStatus::new(),
        });
        Ok(())
    }

    /// Step every awake thread once, returns how many were stepped
    pub fn run(&self) -> usize {
        let now = Instant::now();
        let names: Vec<String> = self.threads.borrow().iter().map(|t| t.name.clone()).collect();
        let mut stepped = 0;

        for name in names {
            let taken = {
                let mut threads = self.threads.borrow_mut();
                match threads.iter_mut().find(|t| t.name == name) {
                    Some(t) if t.status.can_wake_up(now) => {
                        t.status.started = true;
                        t.task.take()
                    }
                    _ => None,
                }
            };
            let Some(mut task) = taken else {
                continue;
            };

            if task.is_started() {
                task.resume();
            } else {
                task.start();
            }
            stepped += 1;

            if task.is_terminated() {
                let output = match task.take_result() {
                    Some(Ok(v)) | Some(Err(v)) => v,
                    None => Value::Null,
                };
                kdebug!("green thread '{}' finished", name);
                self.threads.borrow_mut().retain(|t| t.name != name);
                self.outputs.borrow_mut().insert(name, output);
            } else if let Some(t) = self.threads.borrow_mut().iter_mut().find(|t| t.name == name) {
                t.task = Some(task);
            }
        }
        stepped
    }

    /// Put `name` to sleep for `duration`, then yield
    ///
    /// Await the result from inside that green thread:
    ///
    /// ```ignore
    /// rt.green().sleep("poller", Duration::from_millis(50)).await;
    /// ```
    pub fn sleep(&self, name: &str, duration: Duration) -> YieldNow {
        let deadline = Instant::now() + duration;
        match self.threads.borrow_mut().iter_mut().find(|t| t.name == name) {
            Some(t) => t.status.sleep_until = Some(deadline),
            None => kwarn!("sleep: {}", WeftError::GreenThreadNotFound(name.to_string())),
        }
        yield_now()
    }

    pub fn sleep_secs(&self, name: &str, secs: f64) -> YieldNow {
        self.sleep(name, Duration::from_secs_f64(secs.max(0.0)))
    }

    pub fn get_output(&self, name: &str) -> Option<Value> {
        self.outputs.borrow().get(name).cloned()
    }

    pub fn outputs(&self) -> HashMap<String, Value> {
        self.outputs.borrow().clone()
    }

    pub fn get_status(&self, name: &str) -> Option<GreenStatus> {
        self.threads.borrow().iter().find(|t| t.name == name).map(|t| t.status)
    }

    /// Arguments a live thread was registered with
    pub fn get_args(&self, name: &str) -> Option<Vec<Value>> {
        self.threads.borrow().iter().find(|t| t.name == name).map(|t| t.args.clone())
    }

    /// Live thread names in registration order
    pub fn names(&self) -> Vec<String> {
        self.threads.borrow().iter().map(|t| t.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.threads.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.borrow().is_empty()
    }

    /// Earliest moment some thread may be stepped; `now` if one is awake
    pub fn next_wake(&self, now: Instant) -> Option<Instant> {
        self.threads
            .borrow()
            .iter()
            .map(|t| t.status.sleep_until.map_or(now, |at| at.max(now)))
            .min()
    }

    /// Drop every live thread and stored output
    pub fn clear(&self) {
        let threads = std::mem::take(&mut *self.threads.borrow_mut());
        self.outputs.borrow_mut().clear();
        drop(threads);
    }
}

impl std::fmt::Debug for GreenThreadScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GreenThreadScheduler")
            .field("threads", &self.names())
            .field("outputs", &self.outputs.borrow().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::event_loop::Runtime;
    use serde_json::json;
    use std::rc::Rc;

    #[test]
    fn test_register_does_not_run() {
        let sched = GreenThreadScheduler::new();
        let ran = Rc::new(std::cell::Cell::new(false));
        let r = ran.clone();
        sched
            .register("a", move |_| async move {
                r.set(true);
                json!(1)
            }, vec![])
            .unwrap();

        assert!(!ran.get());
        assert_eq!(sched.names(), vec!["a".to_string()]);
        assert!(!sched.get_status("a").unwrap().is_started());

        sched.run();
        assert!(ran.get());
        assert!(sched.is_empty());
        assert_eq!(sched.get_output("a"), Some(json!(1)));
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let sched = GreenThreadScheduler::new();
        sched.register("a", |_| async { Value::Null }, vec![]).unwrap();
        let err = sched.register("a", |_| async { Value::Null }, vec![]).unwrap_err();
        assert_eq!(err, WeftError::DuplicateGreenThread("a".into()));

        // Name is free again once the first one finished
        sched.run();
        assert!(sched.register("a", |_| async { Value::Null }, vec![]).is_ok());
    }

    #[test]
    fn test_args_are_passed() {
        let sched = GreenThreadScheduler::new();
        sched
            .register("sum", |args| async move {
                json!(args.iter().filter_map(Value::as_i64).sum::<i64>())
            }, vec![json!(2), json!(3)])
            .unwrap();
        assert_eq!(sched.get_args("sum"), Some(vec![json!(2), json!(3)]));
        sched.run();
        assert_eq!(sched.get_output("sum"), Some(json!(5)));
    }

    #[test]
    fn test_interleaving() {
        let sched = GreenThreadScheduler::new();
        let log = Rc::new(RefCell::new(Vec::new()));

        for name in ["a", "b"] {
            let log = log.clone();
            sched
                .register(name, move |_| async move {
                    for i in 0..2 {
                        log.borrow_mut().push(format!("{}{}", name, i));
                        yield_now().await;
                    }
                    json!(name)
                }, vec![])
                .unwrap();
        }

        while !sched.is_empty() {
            sched.run();
        }
        assert_eq!(*log.borrow(), vec!["a0", "b0", "a1", "b1"]);
        assert_eq!(sched.outputs().len(), 2);
    }

    #[test]
    fn test_sleep_skips_until_deadline() {
        let rt = Runtime::new(RuntimeConfig::new()).unwrap();
        let steps = Rc::new(std::cell::Cell::new(0));
        let (s, rt2) = (steps.clone(), rt.clone());

        rt.green()
            .register("sleeper", move |_| async move {
                s.set(s.get() + 1);
                rt2.green().sleep("sleeper", Duration::from_millis(50)).await;
                s.set(s.get() + 1);
                Value::Null
            }, vec![])
            .unwrap();

        let start = Instant::now();
        rt.green().run();
        assert_eq!(steps.get(), 1);
        assert!(rt.green().get_status("sleeper").unwrap().is_sleeping(Instant::now()));

        // Stepping again before the deadline does nothing
        rt.green().run();
        assert_eq!(steps.get(), 1);

        rt.run_until_quiescent();
        assert_eq!(steps.get(), 2);
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_panic_stored_as_output() {
        let sched = GreenThreadScheduler::new();
        fn boom() -> Value {
            panic!("green boom")
        }
        sched.register("bad", |_| async { boom() }, vec![]).unwrap();
        sched.run();

        let out = sched.get_output("bad").unwrap();
        assert_eq!(WeftError::kind_of(&out), Some("panicked"));
    }

    #[test]
    fn test_clear() {
        let sched = GreenThreadScheduler::new();
        sched.register("a", |_| async { Value::Null }, vec![]).unwrap();
        sched.clear();
        assert!(sched.is_empty());
        assert_eq!(sched.next_wake(Instant::now()), None);
    }
}
