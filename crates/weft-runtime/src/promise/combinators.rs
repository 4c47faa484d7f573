//! Promise combinators
//!
//! Each combinator is an ordinary promise whose body inspects its inputs,
//! and parks on the unfinished ones until one of them completes. Inputs
//! are always scanned in the order given, so same-tick ties go to the
//! earlier input.

use serde_json::json;
use weft_core::Value;

use super::Promise;
use crate::event_loop::Runtime;
use crate::suspend::park_any;

impl Promise {
    /// Fulfil with every result in input order, or reject with the first
    /// rejection seen
    pub fn all(rt: &Runtime, promises: Vec<Promise>) -> Promise {
        Promise::from_async(rt, async move {
            loop {
                let mut results = Vec::with_capacity(promises.len());
                let mut waiting = Vec::new();
                for p in &promises {
                    match p.outcome() {
                        Some(Ok(v)) => results.push(v),
                        Some(Err(reason)) => return Err(reason),
                        None => waiting.push(p.clone()),
                    }
                }
                if waiting.is_empty() {
                    return Ok(Value::Array(results));
                }
                park_any(&waiting).await;
            }
        })
    }

    /// Fulfil once every input finished, with one
    /// `{"status": ..., "result": ...}` record per input
    pub fn all_settled(rt: &Runtime, promises: Vec<Promise>) -> Promise {
        Promise::from_async(rt, async move {
            loop {
                let waiting: Vec<Promise> =
                    promises.iter().filter(|p| p.outcome().is_none()).cloned().collect();
                if waiting.is_empty() {
                    break;
                }
                park_any(&waiting).await;
            }

            let records = promises
                .iter()
                .filter_map(Promise::outcome)
                .map(|out| match out {
                    Ok(v) => json!({ "status": "fulfilled", "result": v }),
                    Err(reason) => json!({ "status": "rejected", "result": reason }),
                })
                .collect();
            Ok(Value::Array(records))
        })
    }

    /// Fulfil with the first fulfilment; reject with every reason only
    /// after all inputs rejected
    pub fn any(rt: &Runtime, promises: Vec<Promise>) -> Promise {
        Promise::from_async(rt, async move {
            loop {
                let mut reasons = Vec::with_capacity(promises.len());
                let mut waiting = Vec::new();
                for p in &promises {
                    match p.outcome() {
                        Some(Ok(v)) => return Ok(v),
                        Some(Err(reason)) => reasons.push(reason),
                        None => waiting.push(p.clone()),
                    }
                }
                if waiting.is_empty() {
                    return Err(Value::Array(reasons));
                }
                park_any(&waiting).await;
            }
        })
    }

    /// Settle like the first input to finish
    ///
    /// An empty input list rejects with an empty array rather than staying
    /// pending forever.
    pub fn race(rt: &Runtime, promises: Vec<Promise>) -> Promise {
        Promise::from_async(rt, async move {
            if promises.is_empty() {
                return Err(Value::Array(Vec::new()));
            }
            loop {
                if let Some(out) = promises.iter().find_map(Promise::outcome) {
                    return out;
                }
                park_any(&promises).await;
            }
        })
    }
}
