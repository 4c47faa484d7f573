//! Suspension points
//!
//! Every way a task gives control back to the loop ends up here:
//! `yield_now` for a plain cooperative yield, `park_any` to wait on
//! promises, `sleep` to wait on the timer queue. `repeat` loops over
//! `yield_now`.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use crate::event_loop::Runtime;
use crate::promise::Promise;
use crate::timer::TimerHandle;

/// Give control back to the loop once; resumed on the next tick
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

#[must_use = "futures do nothing unless awaited"]
pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}

/// Call `f(0)` .. `f(times - 1)`, yielding to the loop after each call
pub async fn repeat<F: FnMut(u64)>(times: u64, mut f: F) {
    for i in 0..times {
        f(i);
        yield_now().await;
    }
}

/// Suspend until at least one of `promises` has completed
///
/// Resolves immediately for an empty list or when one is already done.
pub fn park_any(promises: &[Promise]) -> ParkAny {
    ParkAny {
        promises: promises.to_vec(),
    }
}

#[must_use = "futures do nothing unless awaited"]
pub struct ParkAny {
    promises: Vec<Promise>,
}

impl Future for ParkAny {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.promises.is_empty() || self.promises.iter().any(|p| p.outcome().is_some()) {
            return Poll::Ready(());
        }
        for p in &self.promises {
            p.chain_end().register_waiter(cx.waker());
        }
        Poll::Pending
    }
}

/// Suspend for `duration` on the runtime's timer queue
pub fn sleep(rt: &Runtime, duration: Duration) -> Sleep {
    Sleep {
        rt: rt.clone(),
        deadline: Instant::now() + duration,
        timer: None,
    }
}

#[must_use = "futures do nothing unless awaited"]
pub struct Sleep {
    rt: Runtime,
    deadline: Instant,
    timer: Option<TimerHandle>,
}

impl Future for Sleep {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let now = Instant::now();
        if now >= self.deadline {
            self.timer = None;
            return Poll::Ready(());
        }
        if self.timer.is_none() {
            let waker = cx.waker().clone();
            let handle = self
                .rt
                .set_timeout(self.deadline - now, move || waker.wake());
            self.timer = Some(handle);
        }
        Poll::Pending
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        if let Some(handle) = self.timer.take() {
            self.rt.clear_timeout(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use serde_json::json;
    use weft_core::Value;

    fn runtime() -> Runtime {
        Runtime::new(RuntimeConfig::new()).unwrap()
    }

    #[test]
    fn test_sleep_waits_on_timer() {
        let rt = runtime();
        let rt2 = rt.clone();
        let start = Instant::now();
        let p = Promise::from_async(&rt, async move {
            sleep(&rt2, Duration::from_millis(30)).await;
            Ok(json!("woke"))
        });

        assert_eq!(rt.block_on(&p), Ok(json!("woke")));
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert_eq!(rt.timers_len(), 0);
    }

    #[test]
    fn test_repeat_interleaves() {
        use std::cell::RefCell;
        use std::rc::Rc;

        let rt = runtime();
        let log = Rc::new(RefCell::new(Vec::new()));
        let promises: Vec<Promise> = ["a", "b"]
            .into_iter()
            .map(|name| {
                let log = log.clone();
                Promise::from_async(&rt, async move {
                    repeat(3, |i| log.borrow_mut().push(format!("{}{}", name, i))).await;
                    Ok(json!(name))
                })
            })
            .collect();

        let all = Promise::all(&rt, promises);
        assert_eq!(rt.block_on(&all), Ok(json!(["a", "b"])));
        assert_eq!(*log.borrow(), vec!["a0", "b0", "a1", "b1", "a2", "b2"]);
    }

    #[test]
    fn test_repeat_zero_times() {
        let rt = runtime();
        let p = Promise::from_async(&rt, async {
            repeat(0, |_| panic!("called")).await;
            Ok(json!("done"))
        });
        assert_eq!(rt.block_on(&p), Ok(json!("done")));
    }

    #[test]
    fn test_park_any_empty_is_ready() {
        let rt = runtime();
        let p = Promise::from_async(&rt, async {
            park_any(&[]).await;
            Ok(json!(1))
        });
        assert!(p.is_fulfilled());
    }

    #[test]
    fn test_park_any_wakes_on_completion() {
        let rt = runtime();
        let rt2 = rt.clone();
        let slow = Promise::from_async(&rt, async move {
            sleep(&rt2, Duration::from_millis(10)).await;
            Ok(json!("slow"))
        });
        let watched = slow.clone();
        let waiter = Promise::from_async(&rt, async move {
            park_any(&[watched.clone()]).await;
            Ok(watched.result())
        });

        assert_eq!(rt.block_on(&waiter), Ok(json!("slow")));
    }

    #[test]
    fn test_dropped_sleep_clears_timer() {
        let rt = runtime();
        let rt2 = rt.clone();
        let p = Promise::from_async(&rt, async move {
            sleep(&rt2, Duration::from_secs(60)).await;
            Ok(Value::Null)
        });
        assert_eq!(rt.timers_len(), 1);

        p.cancel();
        rt.tick();
        assert_eq!(rt.timers_len(), 0);
        assert!(p.is_rejected());
    }
}
