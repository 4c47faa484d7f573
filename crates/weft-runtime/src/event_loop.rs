//! Event loop: the runtime handle and its tick
//!
//! # Tick phases
//!
//! ```text
//!   tick()
//!     1. green threads      one step each (skips sleepers)
//!     2. pending promises   cancel/budget checks, resume woken tasks,
//!                           move finished+settled ones to micro-tasks
//!     3. micro-tasks        dispatch callbacks, mark complete, wake waiters
//!     4. timers             fire everything due
//!     5. orphans            reap children whose promise went away
//!     6. retention          purge completed promises older than the TTL
//! ```
//!
//! All tables live behind `RefCell`s on one thread. No borrow is held while
//! a task is polled or a callback runs, so either may call back into the
//! runtime.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::process::Child;
use std::future::Future;
use std::rc::{Rc, Weak};
use std::task::Waker;
use std::time::{Duration, Instant};

use serde_json::Map;
use weft_core::{
    kdebug, kinfo, ktrace, kwarn, IdGenerator, PromiseId, TaskId, Value, WeftError, WeftResult,
    WorkerId,
};

use crate::config::RuntimeConfig;
use crate::green::GreenThreadScheduler;
use crate::microtask::MicroTaskQueue;
use crate::promise::Promise;
use crate::task::TaskOutput;
use crate::thread::Thread;
use crate::timer::{self, TimerHandle, TimerQueue};

pub(crate) struct RuntimeInner {
    config: RuntimeConfig,
    ids: IdGenerator,
    pending: RefCell<BTreeMap<PromiseId, Promise>>,
    returns: RefCell<BTreeMap<PromiseId, Promise>>,
    pub(crate) microtasks: RefCell<MicroTaskQueue>,
    timers: RefCell<TimerQueue>,
    green: GreenThreadScheduler,
    waiters: RefCell<HashMap<PromiseId, Vec<Waker>>>,
    shared: RefCell<Map<String, Value>>,
    threads: RefCell<HashMap<u32, Thread>>,
    orphans: RefCell<Vec<(Thread, Child)>>,
    worker_results: RefCell<HashMap<WorkerId, Vec<Value>>>,
    stopwatches: RefCell<HashMap<String, Instant>>,
    ticks: Cell<u64>,
}

/// Handle to one event loop; clones share it
///
/// Not `Send`: a runtime and everything it schedules stay on the thread
/// that created it.
#[derive(Clone)]
pub struct Runtime {
    inner: Rc<RuntimeInner>,
}

impl Runtime {
    /// Create a runtime; fails if the config does not validate
    pub fn new(config: RuntimeConfig) -> WeftResult<Self> {
        config.validate()?;
        kdebug!("runtime created (retention {:?})", config.retention);
        let timers = TimerQueue::new(config.timer_capacity);
        Ok(Self {
            inner: Rc::new(RuntimeInner {
                config,
                ids: IdGenerator::new(),
                pending: RefCell::new(BTreeMap::new()),
                returns: RefCell::new(BTreeMap::new()),
                microtasks: RefCell::new(MicroTaskQueue::new()),
                timers: RefCell::new(timers),
                green: GreenThreadScheduler::new(),
                waiters: RefCell::new(HashMap::new()),
                shared: RefCell::new(Map::new()),
                threads: RefCell::new(HashMap::new()),
                orphans: RefCell::new(Vec::new()),
                worker_results: RefCell::new(HashMap::new()),
                stopwatches: RefCell::new(HashMap::new()),
                ticks: Cell::new(0),
            }),
        })
    }

    /// Runtime configured from `WEFT_*` environment variables
    pub fn from_env() -> WeftResult<Self> {
        Self::new(RuntimeConfig::from_env())
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub(crate) fn inner(&self) -> &RuntimeInner {
        &self.inner
    }

    pub(crate) fn downgrade(&self) -> Weak<RuntimeInner> {
        Rc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(weak: &Weak<RuntimeInner>) -> Option<Runtime> {
        weak.upgrade().map(|inner| Runtime { inner })
    }

    pub(crate) fn next_promise_id(&self) -> PromiseId {
        self.inner.ids.next_promise()
    }

    pub(crate) fn next_task_id(&self) -> TaskId {
        self.inner.ids.next_task()
    }

    pub(crate) fn next_worker_id(&self) -> WorkerId {
        self.inner.ids.next_worker()
    }

    // ------------------------------------------------------------------
    // Driving
    // ------------------------------------------------------------------

    /// Run one pass over every phase
    pub fn tick(&self) {
        let inner = &*self.inner;
        let n = inner.ticks.get() + 1;
        inner.ticks.set(n);

        if !inner.green.is_empty() {
            inner.green.run();
        }

        let now = Instant::now();
        let pending: Vec<Promise> = inner.pending.borrow().values().cloned().collect();
        for promise in pending {
            promise.step(now, inner.config.task_budget);
            if promise.ready_for_dispatch() {
                inner.pending.borrow_mut().remove(&promise.id());
                inner.microtasks.borrow_mut().add(promise);
            }
        }

        MicroTaskQueue::run(self);
        timer::run(&inner.timers);
        self.reap_orphans();
        self.collect_garbage(Instant::now());

        ktrace!(
            "tick {}: {} pending, {} returns, {} timers",
            n,
            self.pending_len(),
            self.returns_len(),
            self.timers_len()
        );
    }

    /// Tick until no promise, micro-task, timer or green thread is left
    ///
    /// An interval that is never cleared keeps this running forever.
    pub fn run_until_quiescent(&self) {
        while self.has_work() {
            self.tick();
            self.idle();
        }
    }

    /// Tick until `promise` has completed and return its outcome
    ///
    /// Returns `Err(Stalled)` if the loop runs out of work first. Do not
    /// call this from inside a task; await the promise instead.
    pub fn block_on(&self, promise: &Promise) -> TaskOutput {
        loop {
            if let Some(out) = promise.outcome() {
                return out;
            }
            if !self.has_work() {
                kwarn!("block_on: promise {} can no longer settle", promise.id());
                return Err(WeftError::Stalled.to_value());
            }
            self.tick();
            if let Some(out) = promise.outcome() {
                return out;
            }
            self.idle();
        }
    }

    /// Start `fut` as a promise settled by its own return
    pub fn spawn<Fut>(&self, fut: Fut) -> Promise
    where
        Fut: Future<Output = TaskOutput> + 'static,
    {
        Promise::from_async(self, fut)
    }

    pub fn has_work(&self) -> bool {
        let inner = &*self.inner;
        !inner.pending.borrow().is_empty()
            || !inner.microtasks.borrow().is_empty()
            || !inner.timers.borrow().is_empty()
            || !inner.green.is_empty()
            || !inner.orphans.borrow().is_empty()
    }

    /// Sleep until something can make progress, capped by `max_idle_sleep`
    fn idle(&self) {
        if let Some(wait) = self.idle_wait(Instant::now()) {
            if !wait.is_zero() {
                std::thread::sleep(wait);
            }
        }
    }

    /// `None` when something is runnable right now
    fn idle_wait(&self, now: Instant) -> Option<Duration> {
        let inner = &*self.inner;
        if !inner.microtasks.borrow().is_empty() {
            return None;
        }

        let mut deadline = now + inner.config.max_idle_sleep;
        for p in inner.pending.borrow().values() {
            if p.is_runnable() || p.ready_for_dispatch() || p.is_cancelled() {
                return None;
            }
            if let Some(budget) = inner.config.task_budget {
                deadline = deadline.min(p.created_at() + budget);
            }
        }
        if let Some(at) = inner.timers.borrow_mut().next_deadline() {
            deadline = deadline.min(at);
        }
        if let Some(at) = inner.green.next_wake(now) {
            deadline = deadline.min(at);
        }
        Some(deadline.saturating_duration_since(now))
    }

    fn collect_garbage(&self, now: Instant) {
        let ttl = self.inner.config.retention;
        let purged: Vec<Promise> = {
            let mut returns = self.inner.returns.borrow_mut();
            let expired: Vec<PromiseId> = returns
                .values()
                .filter(|p| p.can_drop_at(now, ttl))
                .map(Promise::id)
                .collect();
            expired.iter().filter_map(|id| returns.remove(id)).collect()
        };
        if purged.is_empty() {
            return;
        }
        {
            let mut waiters = self.inner.waiters.borrow_mut();
            for p in &purged {
                waiters.remove(&p.id());
                if p.is_rejected() {
                    kdebug!("dropping uncaught rejection of promise {}: {}", p.id(), p.result());
                }
            }
        }
        ktrace!("purged {} completed promises", purged.len());
        // Dropped here, with no table borrowed
        drop(purged);
    }

    /// Number of ticks run so far
    pub fn ticks(&self) -> u64 {
        self.inner.ticks.get()
    }

    /// Drop everything scheduled on this runtime
    ///
    /// Tasks that captured a `Runtime` handle keep it alive; shutting down
    /// releases them.
    pub fn shutdown(&self) {
        let inner = &*self.inner;
        let pending = std::mem::take(&mut *inner.pending.borrow_mut());
        let returns = std::mem::take(&mut *inner.returns.borrow_mut());
        let microtasks = std::mem::take(&mut *inner.microtasks.borrow_mut());
        let timers = std::mem::replace(
            &mut *inner.timers.borrow_mut(),
            TimerQueue::new(inner.config.timer_capacity),
        );
        let waiters = std::mem::take(&mut *inner.waiters.borrow_mut());
        let threads = std::mem::take(&mut *inner.threads.borrow_mut());
        inner.green.clear();
        kdebug!("runtime shut down with {} pending promises", pending.len());
        drop((pending, returns, microtasks, timers, waiters, threads));

        // Dropping the tasks above may have orphaned more children
        let orphans = std::mem::take(&mut *inner.orphans.borrow_mut());
        let left = orphans
            .into_iter()
            .filter_map(|(thread, mut child)| (!thread.reap(self, &mut child)).then_some(child))
            .count();
        if left > 0 {
            kdebug!("runtime shut down with {} subprocesses still running", left);
        }
    }

    // ------------------------------------------------------------------
    // Promise tables
    // ------------------------------------------------------------------

    pub(crate) fn add_pending(&self, promise: Promise) {
        self.inner.pending.borrow_mut().insert(promise.id(), promise);
    }

    pub(crate) fn add_return(&self, promise: Promise) {
        self.inner.returns.borrow_mut().insert(promise.id(), promise);
    }

    /// Put a completed promise back in the pending set for re-dispatch
    pub(crate) fn requeue(&self, promise: Promise) {
        let id = promise.id();
        self.inner.returns.borrow_mut().remove(&id);
        if self.inner.microtasks.borrow().get(id).is_none() {
            self.inner.pending.borrow_mut().insert(id, promise);
        }
    }

    pub fn pending_len(&self) -> usize {
        self.inner.pending.borrow().len()
    }

    pub fn returns_len(&self) -> usize {
        self.inner.returns.borrow().len()
    }

    pub fn microtasks_len(&self) -> usize {
        self.inner.microtasks.borrow().len()
    }

    pub fn get_pending(&self, id: PromiseId) -> Option<Promise> {
        self.inner.pending.borrow().get(&id).cloned()
    }

    /// A completed promise still inside its retention window
    pub fn get_return(&self, id: PromiseId) -> Option<Promise> {
        self.inner.returns.borrow().get(&id).cloned()
    }

    pub(crate) fn register_waiter(&self, id: PromiseId, waker: &Waker) {
        let mut waiters = self.inner.waiters.borrow_mut();
        let list = waiters.entry(id).or_default();
        if !list.iter().any(|w| w.will_wake(waker)) {
            list.push(waker.clone());
        }
    }

    pub(crate) fn wake_waiters(&self, id: PromiseId) {
        let woken = self.inner.waiters.borrow_mut().remove(&id);
        for waker in woken.into_iter().flatten() {
            waker.wake();
        }
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    pub fn set_timeout<F>(&self, delay: Duration, f: F) -> TimerHandle
    where
        F: FnOnce() + 'static,
    {
        self.inner.timers.borrow_mut().set_timeout(delay, f)
    }

    pub fn set_interval<F>(&self, every: Duration, f: F) -> TimerHandle
    where
        F: FnMut() + 'static,
    {
        self.inner.timers.borrow_mut().set_interval(every, f)
    }

    pub fn clear_timeout(&self, handle: TimerHandle) -> bool {
        self.inner.timers.borrow_mut().clear_timeout(handle)
    }

    pub fn clear_interval(&self, handle: TimerHandle) -> bool {
        self.inner.timers.borrow_mut().clear_interval(handle)
    }

    pub fn timers_len(&self) -> usize {
        self.inner.timers.borrow().len()
    }

    // ------------------------------------------------------------------
    // Green threads
    // ------------------------------------------------------------------

    pub fn green(&self) -> &GreenThreadScheduler {
        &self.inner.green
    }

    // ------------------------------------------------------------------
    // Shared map (parent side of the subprocess protocol)
    // ------------------------------------------------------------------

    /// Snapshot of the shared map
    pub fn shared(&self) -> Map<String, Value> {
        self.inner.shared.borrow().clone()
    }

    pub fn get_shared(&self, key: &str) -> Option<Value> {
        self.inner.shared.borrow().get(key).cloned()
    }

    pub fn add_shared(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.inner.shared.borrow_mut().insert(key.into(), value.into());
    }

    /// Merge `data` into the shared map, later keys win
    pub fn merge_shared(&self, data: Map<String, Value>) {
        self.inner.shared.borrow_mut().extend(data);
    }

    // ------------------------------------------------------------------
    // Subprocess registry
    // ------------------------------------------------------------------

    pub(crate) fn register_thread(&self, pid: u32, thread: Thread) {
        self.inner.threads.borrow_mut().insert(pid, thread);
    }

    pub(crate) fn unregister_thread(&self, pid: u32) {
        self.inner.threads.borrow_mut().remove(&pid);
    }

    /// Keep polling a child whose promise went away before it exited
    pub(crate) fn adopt_orphan(&self, thread: Thread, child: Child) {
        self.inner.orphans.borrow_mut().push((thread, child));
    }

    fn reap_orphans(&self) {
        if self.inner.orphans.borrow().is_empty() {
            return;
        }
        let orphans = std::mem::take(&mut *self.inner.orphans.borrow_mut());
        let alive: Vec<(Thread, Child)> = orphans
            .into_iter()
            .filter_map(|(thread, mut child)| (!thread.reap(self, &mut child)).then_some((thread, child)))
            .collect();
        self.inner.orphans.borrow_mut().extend(alive);
    }

    /// Subprocess `pid` was started here and has not exited
    pub fn thread_is_running(&self, pid: u32) -> bool {
        self.inner
            .threads
            .borrow()
            .get(&pid)
            .is_some_and(Thread::is_running)
    }

    /// Ask subprocess `pid` to stop; false if it is not ours or already gone
    pub fn kill_thread(&self, pid: u32) -> bool {
        let thread = self.inner.threads.borrow().get(&pid).cloned();
        match thread {
            Some(t) if t.is_running() => {
                t.stop();
                true
            }
            _ => false,
        }
    }

    // ------------------------------------------------------------------
    // Worker result buffers
    // ------------------------------------------------------------------

    pub(crate) fn init_worker_results(&self, id: WorkerId) {
        self.inner.worker_results.borrow_mut().entry(id).or_default();
    }

    pub(crate) fn push_worker_results(&self, id: WorkerId, results: Vec<Value>) {
        self.inner
            .worker_results
            .borrow_mut()
            .entry(id)
            .or_default()
            .extend(results);
    }

    pub(crate) fn worker_results(&self, id: WorkerId) -> Vec<Value> {
        self.inner
            .worker_results
            .borrow()
            .get(&id)
            .cloned()
            .unwrap_or_default()
    }

    pub(crate) fn remove_worker_results(&self, id: WorkerId) -> Option<Vec<Value>> {
        self.inner.worker_results.borrow_mut().remove(&id)
    }

    // ------------------------------------------------------------------
    // Stopwatch
    // ------------------------------------------------------------------

    /// Start (or restart) the stopwatch `label`
    pub fn time(&self, label: &str) {
        self.inner
            .stopwatches
            .borrow_mut()
            .insert(label.to_string(), Instant::now());
    }

    /// Stop `label` and log the elapsed time
    pub fn time_end(&self, label: &str) -> Option<Duration> {
        let started = self.inner.stopwatches.borrow_mut().remove(label);
        match started {
            Some(at) => {
                let elapsed = at.elapsed();
                kinfo!("{}: {:.3}ms", label, elapsed.as_secs_f64() * 1000.0);
                Some(elapsed)
            }
            None => {
                kwarn!("time_end: no stopwatch named '{}'", label);
                None
            }
        }
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("ticks", &self.ticks())
            .field("pending", &self.pending_len())
            .field("returns", &self.returns_len())
            .field("microtasks", &self.microtasks_len())
            .field("timers", &self.timers_len())
            .field("green", &self.inner.green.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::suspend::{sleep, yield_now};
    use serde_json::json;
    use std::cell::RefCell;

    fn runtime() -> Runtime {
        Runtime::new(RuntimeConfig::new()).unwrap()
    }

    #[test]
    fn test_invalid_config() {
        let err = Runtime::new(RuntimeConfig::new().worker_threads(0)).unwrap_err();
        assert_eq!(err.kind(), "invalid_config");
    }

    #[test]
    fn test_quiescent_when_empty() {
        let rt = runtime();
        assert!(!rt.has_work());
        rt.run_until_quiescent();
        assert_eq!(rt.ticks(), 0);
    }

    #[test]
    fn test_tick_phase_order() {
        let rt = runtime();
        let log = Rc::new(RefCell::new(Vec::new()));

        let l = log.clone();
        rt.set_timeout(Duration::ZERO, move || l.borrow_mut().push("timer"));

        let l = log.clone();
        rt.green()
            .register("g", move |_| async move {
                l.borrow_mut().push("green");
                Value::Null
            }, vec![])
            .unwrap();

        let p = Promise::from_async(&rt, async move {
            yield_now().await;
            Ok(Value::Null)
        });
        let l2 = log.clone();
        p.then(move |v| {
            l2.borrow_mut().push("microtask");
            v
        });

        std::thread::sleep(Duration::from_millis(1));
        rt.tick();
        assert_eq!(*log.borrow(), vec!["green", "microtask", "timer"]);
    }

    #[test]
    fn test_two_timers_in_parallel() {
        let rt = runtime();
        let start = Instant::now();
        let make = |v: &'static str| {
            let rt2 = rt.clone();
            Promise::new(&rt, move |resolver| async move {
                rt2.set_timeout(Duration::from_millis(100), move || resolver.resolve(v));
                Ok(())
            })
        };
        let all = Promise::all(&rt, vec![make("a"), make("b")]);

        assert_eq!(rt.block_on(&all), Ok(json!(["a", "b"])));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_millis(190), "ran serially: {:?}", elapsed);
    }

    #[test]
    fn test_idle_sleeps_instead_of_spinning() {
        let rt = runtime();
        rt.set_timeout(Duration::from_millis(50), || {});
        rt.run_until_quiescent();
        // ~50ms at a 10ms cap is a handful of ticks, never thousands
        assert!(rt.ticks() < 20, "ticks: {}", rt.ticks());
    }

    #[test]
    fn test_retention_purges_returns() {
        let rt = Runtime::new(RuntimeConfig::new().retention(Duration::from_millis(20))).unwrap();
        let p = Promise::resolved(&rt, json!(1));
        rt.tick();
        assert_eq!(rt.get_return(p.id()), Some(p.clone()));

        std::thread::sleep(Duration::from_millis(30));
        rt.tick();
        assert_eq!(rt.returns_len(), 0);
        assert!(rt.get_return(p.id()).is_none());
        // The handle still reports its outcome
        assert_eq!(p.outcome(), Some(Ok(json!(1))));
    }

    #[test]
    fn test_task_budget_times_out() {
        let config = RuntimeConfig::new().task_budget(Some(Duration::from_millis(30)));
        let rt = Runtime::new(config).unwrap();
        let never = Promise::new(&rt, |_resolver| async { Ok(()) });

        let out = rt.block_on(&never).unwrap_err();
        assert_eq!(WeftError::kind_of(&out), Some("timeout"));
    }

    #[test]
    fn test_cancel_rejects_next_tick() {
        let rt = runtime();
        let rt2 = rt.clone();
        let p = Promise::from_async(&rt, async move {
            sleep(&rt2, Duration::from_secs(5)).await;
            Ok(json!("late"))
        });
        p.cancel();
        let out = rt.block_on(&p).unwrap_err();
        assert_eq!(WeftError::kind_of(&out), Some("cancelled"));
        assert!(!rt.has_work());
    }

    #[test]
    fn test_block_on_stalled() {
        let rt = runtime();
        let p = Promise::new(&rt, |_resolver| async { Ok(()) });
        // Drop it from the tables so nothing can settle it
        rt.shutdown();
        let out = rt.block_on(&p).unwrap_err();
        assert_eq!(WeftError::kind_of(&out), Some("stalled"));
    }

    #[test]
    fn test_shared_map() {
        let rt = runtime();
        rt.add_shared("a", 1);
        let mut more = Map::new();
        more.insert("b".into(), json!("two"));
        more.insert("a".into(), json!(3));
        rt.merge_shared(more);

        assert_eq!(rt.get_shared("a"), Some(json!(3)));
        assert_eq!(rt.shared().len(), 2);
    }

    #[test]
    fn test_stopwatch() {
        let rt = runtime();
        rt.time("work");
        std::thread::sleep(Duration::from_millis(5));
        assert!(rt.time_end("work").unwrap() >= Duration::from_millis(5));
        assert!(rt.time_end("work").is_none());
    }

    #[test]
    fn test_spawn_alias() {
        let rt = runtime();
        let p = rt.spawn(async { Ok(json!("spawned")) });
        assert!(p.is_just_get_result());
        assert_eq!(rt.block_on(&p), Ok(json!("spawned")));
    }
}
