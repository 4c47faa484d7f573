//! Promise: a task plus its settlement state and callback chain
//!
//! Construction starts the task right away. The event loop keeps stepping
//! it while it is suspended. Once the task has terminated and the promise
//! is settled, the promise moves to the micro-task queue, which runs its
//! callbacks and marks it complete.
//!
//! ```ignore
//! let p = Promise::new(&rt, |resolver| async move {
//!     resolver.resolve(json!(1));
//!     Ok(())
//! })
//! .then(|v| json!(v.as_i64().unwrap_or(0) + 1))
//! .finally(|| kinfo!("done"));
//!
//! assert_eq!(rt.block_on(&p), Ok(json!(2)));
//! ```

mod combinators;
mod dispatch;

use std::cell::{Ref, RefCell, RefMut};
use std::collections::VecDeque;
use std::fmt;
use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use weft_core::{kdebug, ktrace, CancellationToken, PromiseId, PromiseStatus, Value, WeftError};

use crate::event_loop::{Runtime, RuntimeInner};
use crate::task::{Task, TaskOutput};

/// What a `then` callback hands to the next link
pub enum Chained {
    /// Plain value, fed to the next callback
    Value(Value),
    /// Another promise; the rest of the chain continues on it
    Continuation(Promise),
}

impl From<Value> for Chained {
    fn from(v: Value) -> Self {
        Chained::Value(v)
    }
}

impl From<Promise> for Chained {
    fn from(p: Promise) -> Self {
        Chained::Continuation(p)
    }
}

type ResolveCallback = Box<dyn FnOnce(Value) -> Chained>;
type RejectCallback = Box<dyn FnOnce(Value) -> Value>;
type FinallyCallback = Box<dyn FnOnce()>;

#[derive(Default)]
pub(crate) struct Callbacks {
    resolve: VecDeque<ResolveCallback>,
    reject: Option<RejectCallback>,
    finally: Option<FinallyCallback>,
}

impl Callbacks {
    fn is_empty(&self) -> bool {
        self.resolve.is_empty() && self.reject.is_none() && self.finally.is_none()
    }
}

struct State {
    status: PromiseStatus,
    result: Value,
    callbacks: Callbacks,
    /// Callbacks dispatched
    complete: bool,
    completed_at: Option<Instant>,
    /// Chain moved here by a `Continuation`
    forward: Option<Promise>,
}

pub(crate) struct PromiseInner {
    id: PromiseId,
    rt: Weak<RuntimeInner>,
    created_at: Instant,
    just_get_result: bool,
    token: CancellationToken,
    state: RefCell<State>,
    task: RefCell<Option<Task>>,
}

/// Handle to a promise; clones share state
#[derive(Clone)]
pub struct Promise {
    inner: Rc<PromiseInner>,
}

/// Settles the promise it was created for
///
/// Holds the promise weakly, so it can be moved into timer callbacks and
/// other long-lived closures freely. Only the first settlement counts.
#[derive(Clone)]
pub struct Resolver {
    promise: Weak<PromiseInner>,
}

impl Resolver {
    pub fn resolve(&self, value: impl Into<Value>) {
        if let Some(inner) = self.promise.upgrade() {
            Promise { inner }.settle(PromiseStatus::Fulfilled, value.into());
        }
    }

    pub fn reject(&self, reason: impl Into<Value>) {
        if let Some(inner) = self.promise.upgrade() {
            Promise { inner }.settle(PromiseStatus::Rejected, reason.into());
        }
    }

    /// The promise, if it is still alive
    pub fn promise(&self) -> Option<Promise> {
        self.promise.upgrade().map(|inner| Promise { inner })
    }
}

impl Promise {
    /// Create a promise settled through a `Resolver`
    ///
    /// The body starts immediately. Returning `Err` (or panicking) rejects
    /// the promise if it is still pending; returning `Ok(())` leaves
    /// settlement to the resolver.
    pub fn new<F, Fut>(rt: &Runtime, body: F) -> Promise
    where
        F: FnOnce(Resolver) -> Fut,
        Fut: Future<Output = Result<(), Value>> + 'static,
    {
        let promise = Promise::alloc(rt, false);
        let resolver = Resolver {
            promise: Rc::downgrade(&promise.inner),
        };
        let fut = body(resolver);
        promise.launch(rt, async move { fut.await.map(|()| Value::Null) });
        promise
    }

    /// Create a promise that settles with the body's own return
    pub fn from_async<Fut>(rt: &Runtime, fut: Fut) -> Promise
    where
        Fut: Future<Output = TaskOutput> + 'static,
    {
        let promise = Promise::alloc(rt, true);
        promise.launch(rt, fut);
        promise
    }

    pub fn resolved(rt: &Runtime, value: impl Into<Value>) -> Promise {
        let value = value.into();
        Promise::from_async(rt, async move { Ok(value) })
    }

    pub fn rejected(rt: &Runtime, reason: impl Into<Value>) -> Promise {
        let reason = reason.into();
        Promise::from_async(rt, async move { Err(reason) })
    }

    fn alloc(rt: &Runtime, just_get_result: bool) -> Promise {
        Promise {
            inner: Rc::new(PromiseInner {
                id: rt.next_promise_id(),
                rt: rt.downgrade(),
                created_at: Instant::now(),
                just_get_result,
                token: CancellationToken::new(),
                state: RefCell::new(State {
                    status: PromiseStatus::Pending,
                    result: Value::Null,
                    callbacks: Callbacks::default(),
                    complete: false,
                    completed_at: None,
                    forward: None,
                }),
                task: RefCell::new(None),
            }),
        }
    }

    fn launch<Fut>(&self, rt: &Runtime, fut: Fut)
    where
        Fut: Future<Output = TaskOutput> + 'static,
    {
        let mut task = Task::new(rt.next_task_id(), fut);
        rt.add_pending(self.clone());
        task.start();
        self.settle_from_task(&mut task);
        *self.inner.task.borrow_mut() = Some(task);
    }

    // ------------------------------------------------------------------
    // Callback chain
    // ------------------------------------------------------------------

    /// Append a fulfilment callback
    ///
    /// Returning a `Promise` (or `Chained::Continuation`) moves the rest of
    /// the chain onto that promise.
    pub fn then<F, R>(&self, f: F) -> Promise
    where
        F: FnOnce(Value) -> R + 'static,
        R: Into<Chained>,
    {
        let target = self.chain_end();
        target
            .state_mut()
            .callbacks
            .resolve
            .push_back(Box::new(move |v| f(v).into()));
        target.requeue_if_complete();
        self.clone()
    }

    /// Set the rejection callback; its return becomes the result
    pub fn catch<F>(&self, f: F) -> Promise
    where
        F: FnOnce(Value) -> Value + 'static,
    {
        let target = self.chain_end();
        target.state_mut().callbacks.reject = Some(Box::new(f));
        target.requeue_if_complete();
        self.clone()
    }

    /// Set the callback run once the chain has finished
    pub fn finally<F>(&self, f: F) -> Promise
    where
        F: FnOnce() + 'static,
    {
        let target = self.chain_end();
        target.state_mut().callbacks.finally = Some(Box::new(f));
        target.requeue_if_complete();
        self.clone()
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    #[inline]
    pub fn id(&self) -> PromiseId {
        self.inner.id
    }

    pub fn status(&self) -> PromiseStatus {
        self.state().status
    }

    pub fn result(&self) -> Value {
        self.state().result.clone()
    }

    pub fn is_pending(&self) -> bool {
        self.status().is_pending()
    }

    pub fn is_fulfilled(&self) -> bool {
        self.status() == PromiseStatus::Fulfilled
    }

    pub fn is_rejected(&self) -> bool {
        self.status() == PromiseStatus::Rejected
    }

    /// Callbacks have been dispatched
    pub fn is_complete(&self) -> bool {
        self.state().complete
    }

    /// Settles with its body's return rather than a resolver
    pub fn is_just_get_result(&self) -> bool {
        self.inner.just_get_result
    }

    pub fn created_at(&self) -> Instant {
        self.inner.created_at
    }

    pub fn completed_at(&self) -> Option<Instant> {
        self.state().completed_at
    }

    /// Completed more than `ttl` ago
    pub fn can_drop(&self, ttl: Duration) -> bool {
        self.can_drop_at(Instant::now(), ttl)
    }

    pub(crate) fn can_drop_at(&self, now: Instant, ttl: Duration) -> bool {
        let st = self.state();
        st.complete && st.completed_at.is_some_and(|at| now.saturating_duration_since(at) > ttl)
    }

    /// Promise this one's chain was moved to, if any
    pub fn forwarded_to(&self) -> Option<Promise> {
        self.state().forward.clone()
    }

    /// Request cancellation; the loop rejects with `Cancelled` next tick
    pub fn cancel(&self) {
        self.inner.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.inner.token
    }

    /// Final outcome once the whole chain has completed
    ///
    /// Follows forwarding, so a promise whose chain moved elsewhere reports
    /// where the chain ended up.
    pub fn outcome(&self) -> Option<TaskOutput> {
        let end = self.chain_end();
        let st = end.state();
        if !st.complete {
            return None;
        }
        match st.status {
            PromiseStatus::Fulfilled => Some(Ok(st.result.clone())),
            PromiseStatus::Rejected => Some(Err(st.result.clone())),
            PromiseStatus::Pending => None,
        }
    }

    /// Last promise along completed forwarding links
    pub(crate) fn chain_end(&self) -> Promise {
        let mut end = self.clone();
        loop {
            let next = {
                let st = end.state();
                if !st.complete {
                    break;
                }
                match st.forward {
                    Some(ref next) if !Rc::ptr_eq(&next.inner, &end.inner) => next.clone(),
                    _ => break,
                }
            };
            end = next;
        }
        end
    }

    // ------------------------------------------------------------------
    // Event-loop side
    // ------------------------------------------------------------------

    pub(crate) fn runtime(&self) -> Option<Runtime> {
        Runtime::upgrade(&self.inner.rt)
    }

    fn state(&self) -> Ref<'_, State> {
        self.inner.state.borrow()
    }

    fn state_mut(&self) -> RefMut<'_, State> {
        self.inner.state.borrow_mut()
    }

    /// First settlement wins
    pub(crate) fn settle(&self, status: PromiseStatus, value: Value) -> bool {
        let mut st = self.state_mut();
        if !st.status.is_pending() {
            return false;
        }
        match status {
            PromiseStatus::Fulfilled => ktrace!("promise {} fulfilled", self.inner.id),
            PromiseStatus::Rejected => kdebug!("promise {} rejected: {}", self.inner.id, value),
            PromiseStatus::Pending => return false,
        }
        st.status = status;
        st.result = value;
        true
    }

    fn settle_from_task(&self, task: &mut Task) {
        if !task.is_terminated() {
            return;
        }
        match task.take_result() {
            Some(Err(reason)) => {
                self.settle(PromiseStatus::Rejected, reason);
            }
            Some(Ok(value)) if self.inner.just_get_result => {
                self.settle(PromiseStatus::Fulfilled, value);
            }
            _ => {}
        }
    }

    /// Drive the task one step; called for every pending promise per tick
    pub(crate) fn step(&self, now: Instant, budget: Option<Duration>) {
        if self.is_pending() {
            if self.inner.token.is_cancelled() {
                self.abort(WeftError::Cancelled.to_value());
            } else if budget.is_some_and(|b| now.saturating_duration_since(self.inner.created_at) >= b) {
                kdebug!("promise {} exceeded its budget", self.inner.id);
                self.abort(WeftError::Timeout.to_value());
            }
        }

        let taken = self.inner.task.borrow_mut().take();
        if let Some(mut task) = taken {
            if task.is_suspended() && task.is_woken() {
                task.resume();
            }
            self.settle_from_task(&mut task);
            *self.inner.task.borrow_mut() = Some(task);
        }
    }

    fn abort(&self, reason: Value) {
        // Dropping the body runs its destructors, which may touch the runtime
        let taken = self.inner.task.borrow_mut().take();
        if let Some(mut task) = taken {
            task.abort(reason.clone());
            task.take_result();
            *self.inner.task.borrow_mut() = Some(task);
        }
        self.settle(PromiseStatus::Rejected, reason);
    }

    /// Task finished and promise settled
    pub(crate) fn ready_for_dispatch(&self) -> bool {
        let task_done = match *self.inner.task.borrow() {
            Some(ref task) => task.is_terminated(),
            None => true,
        };
        task_done && (!self.is_pending() || self.inner.just_get_result)
    }

    /// Task is runnable this tick
    pub(crate) fn is_runnable(&self) -> bool {
        match *self.inner.task.borrow() {
            Some(ref task) => task.is_suspended() && task.is_woken(),
            None => false,
        }
    }

    pub(crate) fn mark_complete(&self, now: Instant) {
        let mut st = self.state_mut();
        st.complete = true;
        st.completed_at = Some(now);
    }

    /// Send a complete promise back through dispatch so newly attached
    /// callbacks run
    fn requeue_if_complete(&self) {
        let was_complete = {
            let mut st = self.state_mut();
            let was = st.complete;
            if was {
                st.complete = false;
                st.completed_at = None;
            }
            was
        };
        if was_complete {
            if let Some(rt) = self.runtime() {
                rt.requeue(self.clone());
            }
        }
    }

    pub(crate) fn register_waiter(&self, waker: &Waker) {
        if let Some(rt) = self.runtime() {
            rt.register_waiter(self.inner.id, waker);
        }
    }
}

impl PartialEq for Promise {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Promise {}

impl fmt::Debug for Promise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.state();
        f.debug_struct("Promise")
            .field("id", &self.inner.id)
            .field("status", &st.status)
            .field("complete", &st.complete)
            .field("result", &st.result)
            .finish()
    }
}

/// `promise.await`: waits for the chain to complete, following forwarding
pub struct PromiseFuture {
    promise: Promise,
}

impl Future for PromiseFuture {
    type Output = TaskOutput;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<TaskOutput> {
        let end = self.promise.chain_end();
        match end.outcome() {
            Some(out) => Poll::Ready(out),
            None => {
                end.register_waiter(cx.waker());
                Poll::Pending
            }
        }
    }
}

impl IntoFuture for Promise {
    type Output = TaskOutput;
    type IntoFuture = PromiseFuture;

    fn into_future(self) -> PromiseFuture {
        PromiseFuture { promise: self }
    }
}

impl IntoFuture for &Promise {
    type Output = TaskOutput;
    type IntoFuture = PromiseFuture;

    fn into_future(self) -> PromiseFuture {
        PromiseFuture {
            promise: self.clone(),
        }
    }
}
