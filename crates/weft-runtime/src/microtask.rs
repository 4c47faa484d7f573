//! Micro-task queue: settled promises waiting for callback dispatch

use std::collections::BTreeMap;
use std::time::Instant;

use weft_core::PromiseId;

use crate::event_loop::Runtime;
use crate::promise::Promise;

/// Settled promises keyed by id, dispatched in id order
#[derive(Debug, Default)]
pub struct MicroTaskQueue {
    tasks: BTreeMap<PromiseId, Promise>,
}

impl MicroTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, promise: Promise) {
        self.tasks.insert(promise.id(), promise);
    }

    pub fn get(&self, id: PromiseId) -> Option<&Promise> {
        self.tasks.get(&id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    fn drain(&mut self) -> Vec<Promise> {
        std::mem::take(&mut self.tasks).into_values().collect()
    }

    /// Dispatch every queued promise, returns how many ran
    ///
    /// Each promise runs its callbacks, is stamped complete, moves to the
    /// returns set and wakes whatever awaited it. Promises queued while
    /// this runs wait for the next call.
    pub fn run(rt: &Runtime) -> usize {
        let batch = rt.inner().microtasks.borrow_mut().drain();
        let count = batch.len();
        for promise in batch {
            promise.use_callbacks();
            promise.mark_complete(Instant::now());
            rt.add_return(promise.clone());
            rt.wake_waiters(promise.id());
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use serde_json::json;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_dispatch_in_id_order() {
        let rt = Runtime::new(RuntimeConfig::new()).unwrap();
        let order = Rc::new(RefCell::new(Vec::new()));

        let promises: Vec<Promise> = (0..3).map(|i| Promise::resolved(&rt, json!(i))).collect();
        for p in promises.iter().rev() {
            let order = order.clone();
            p.then(move |v| {
                order.borrow_mut().push(v.clone());
                v
            });
        }

        // First tick moves them over and dispatches in the same pass
        rt.tick();
        assert_eq!(*order.borrow(), vec![json!(0), json!(1), json!(2)]);
        assert!(promises.iter().all(Promise::is_complete));
        assert_eq!(rt.returns_len(), 3);
    }

    #[test]
    fn test_queue_bookkeeping() {
        let rt = Runtime::new(RuntimeConfig::new()).unwrap();
        let p = Promise::resolved(&rt, json!("x"));

        let mut queue = MicroTaskQueue::new();
        assert!(queue.is_empty());
        queue.add(p.clone());
        queue.add(p.clone());
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get(p.id()), Some(&p));
    }
}
