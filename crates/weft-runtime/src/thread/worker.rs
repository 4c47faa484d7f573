//! Worker: runs a list of thread inputs in bounded batches
//!
//! `run` spawns up to `threads` subprocesses, waits for the whole batch,
//! collects the results and moves on to the next batch. Child workers
//! added with `add_worker` run after the parent has drained its own work.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crossbeam_queue::SegQueue;
use weft_core::{kdebug, kwarn, Value, WeftError, WeftResult, WorkerId};

use super::{Thread, ThreadInput};
use crate::config::RuntimeConfig;
use crate::event_loop::Runtime;
use crate::promise::Promise;

/// FIFO work list
///
/// Lock-free, so producers on other OS threads may fill it before it is
/// handed to a worker on the runtime thread.
#[derive(Debug, Default)]
pub struct Work {
    queue: SegQueue<ThreadInput>,
}

impl Work {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, input: ThreadInput) {
        self.queue.push(input);
    }

    pub fn count(&self) -> usize {
        self.queue.len()
    }

    pub fn dequeue(&self) -> Option<ThreadInput> {
        self.queue.pop()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerOptions {
    /// Subprocesses per batch
    pub threads: usize,
    /// Largest work list `run` accepts
    pub max_queue: usize,
}

impl WorkerOptions {
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            threads: config.worker_threads,
            max_queue: config.worker_max_queue,
        }
    }

    pub fn threads(mut self, n: usize) -> Self {
        self.threads = n;
        self
    }

    pub fn max_queue(mut self, n: usize) -> Self {
        self.max_queue = n;
        self
    }
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self::from_config(&RuntimeConfig::new())
    }
}

type ResultCallback = Box<dyn FnOnce(Vec<Value>, &Worker)>;

struct WorkerInner {
    id: WorkerId,
    rt: Runtime,
    work: Work,
    options: WorkerOptions,
    children: RefCell<Vec<(Worker, ResultCallback)>>,
}

/// Handle to a worker; clones share it
#[derive(Clone)]
pub struct Worker {
    inner: Rc<WorkerInner>,
}

impl Worker {
    pub fn new(rt: &Runtime, work: Work, options: WorkerOptions) -> Self {
        let id = rt.next_worker_id();
        rt.init_worker_results(id);
        Self {
            inner: Rc::new(WorkerInner {
                id,
                rt: rt.clone(),
                work,
                options,
                children: RefCell::new(Vec::new()),
            }),
        }
    }

    pub fn id(&self) -> WorkerId {
        self.inner.id
    }

    pub fn options(&self) -> WorkerOptions {
        self.inner.options
    }

    pub fn work(&self) -> &Work {
        &self.inner.work
    }

    /// Run `child` after this worker's own work; `cb` gets the child's
    /// results
    pub fn add_worker<F>(&self, child: Worker, cb: F)
    where
        F: FnOnce(Vec<Value>, &Worker) + 'static,
    {
        self.inner.children.borrow_mut().push((child, Box::new(cb)));
    }

    /// Append one batch result
    pub fn collect(&self, result: Value) {
        self.inner.rt.push_worker_results(self.inner.id, vec![result]);
    }

    /// Everything collected so far
    pub fn get(&self) -> Vec<Value> {
        self.inner.rt.worker_results(self.inner.id)
    }

    /// Release this worker's result buffer
    pub fn done(&self) {
        self.inner.rt.remove_worker_results(self.inner.id);
    }

    /// Process the work list, then call `cb` with one entry per thread
    ///
    /// Fails up front with `QueueFull` when more items are queued than
    /// `max_queue` allows; nothing is spawned in that case. The returned
    /// promise rejects with the first thread rejection.
    pub fn run<F>(&self, cb: F) -> WeftResult<Promise>
    where
        F: FnOnce(Vec<Value>, &Worker) + 'static,
    {
        self.check_capacity()?;
        for (child, _) in self.inner.children.borrow().iter() {
            child.check_capacity()?;
        }

        let worker = self.clone();
        Ok(Promise::from_async(&self.inner.rt, async move {
            let results = worker.drain().await?;

            let children = std::mem::take(&mut *worker.inner.children.borrow_mut());
            for (child, child_cb) in children {
                let child_results = child.drain().await?;
                child_cb(child_results, &child);
            }

            cb(results.clone(), &worker);
            Ok::<Value, Value>(Value::Array(results))
        }))
    }

    fn check_capacity(&self) -> WeftResult<()> {
        let options = self.inner.options;
        if options.threads == 0 {
            return Err(WeftError::InvalidConfig("worker threads must be > 0"));
        }
        let queued = self.inner.work.count();
        if queued > options.max_queue {
            kwarn!("worker {}: {} items queued, max {}", self.inner.id, queued, options.max_queue);
            return Err(WeftError::QueueFull {
                queued,
                max: options.max_queue,
            });
        }
        Ok(())
    }

    /// Run every queued input in batches; returns the flattened results
    async fn drain(&self) -> Result<Vec<Value>, Value> {
        let rt = &self.inner.rt;
        let threads = self.inner.options.threads.max(1);

        while !self.inner.work.is_empty() {
            let mut batch = Vec::with_capacity(threads);
            while batch.len() < threads {
                match self.inner.work.dequeue() {
                    Some(input) => batch.push(Thread::new(input).start(rt)),
                    None => break,
                }
            }
            kdebug!("worker {}: batch of {}", self.inner.id, batch.len());
            let data = Promise::all(rt, batch).await?;
            self.collect(data);
        }

        Ok(flatten(self.get()))
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.inner.id)
            .field("queued", &self.inner.work.count())
            .field("options", &self.inner.options)
            .finish()
    }
}

/// Batches are arrays; splice them into one list
fn flatten(batches: Vec<Value>) -> Vec<Value> {
    let mut out = Vec::new();
    for batch in batches {
        match batch {
            Value::Array(items) => out.extend(items),
            other => out.push(other),
        }
    }
    out
}
