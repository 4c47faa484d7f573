//! Basic weft example
//!
//! Timer-backed promises, a then chain, combinators, an interval and two
//! green threads, all interleaved on one thread.
//!
//! # Environment Variables
//!
//! - `WEFT_FLUSH_EPRINT=1` - Flush debug output immediately
//! - `WEFT_LOG_LEVEL=debug` - Set log level (off, error, warn, info, debug, trace)

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use weft::{json, kdebug, kinfo, Promise, Runtime, RuntimeConfig, Value};

// WEFT_LOG_LEVEL=debug cargo run -p weft-basic
fn main() {
    println!("=== weft Basic Example ===\n");

    let config = RuntimeConfig::from_env().retention(Duration::from_secs(1));
    let rt = match Runtime::new(config) {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("runtime: {}", e);
            std::process::exit(1);
        }
    };

    rt.time("total");

    // Two promises resolved by timers; `all` finishes when the slower does
    let delayed = |label: &'static str, ms: u64| {
        let rt2 = rt.clone();
        Promise::new(&rt, move |resolver| async move {
            rt2.set_timeout(Duration::from_millis(ms), move || resolver.resolve(label));
            Ok(())
        })
    };
    let both = Promise::all(&rt, vec![delayed("left", 300), delayed("right", 200)])
        .then(|v| {
            kinfo!("all: {}", v);
            v
        });

    // A then that hands the rest of the chain to another promise
    let rt2 = rt.clone();
    let chained = Promise::resolved(&rt, 1)
        .then(move |v| {
            let n = v.as_i64().unwrap_or(0);
            let rt3 = rt2.clone();
            Promise::from_async(&rt2, async move {
                weft::sleep(&rt3, Duration::from_millis(100)).await;
                Ok(json!(n + 1))
            })
        })
        .then(|v| json!(v.as_i64().unwrap_or(0) * 10))
        .finally(|| kdebug!("chain finished"));

    // Fastest of three wins
    let fastest = Promise::race(
        &rt,
        vec![delayed("slow", 250), delayed("fast", 50), delayed("medium", 150)],
    );

    // Interval that clears itself after three ticks
    let fired = Rc::new(Cell::new(0));
    let handle = Rc::new(Cell::new(None));
    let (f, h, rt4) = (fired.clone(), handle.clone(), rt.clone());
    let interval = rt.set_interval(Duration::from_millis(80), move || {
        f.set(f.get() + 1);
        kinfo!("interval tick {}", f.get());
        if f.get() == 3 {
            if let Some(me) = h.get() {
                rt4.clear_interval(me);
            }
        }
    });
    handle.set(Some(interval));

    // Green threads: step once per tick, sleep between steps
    for (name, pause) in [("ping", 60u64), ("pong", 90u64)] {
        let rt5 = rt.clone();
        let registered = rt.green().register(
            name,
            move |args| async move {
                let rounds = args.first().and_then(Value::as_u64).unwrap_or(1);
                for i in 0..rounds {
                    kdebug!("[{}] round {}", name, i);
                    rt5.green().sleep(name, Duration::from_millis(pause)).await;
                }
                json!(format!("{} done after {} rounds", name, rounds))
            },
            vec![json!(3)],
        );
        if let Err(e) = registered {
            eprintln!("green thread {}: {}", name, e);
        }
    }

    let all = Promise::all_settled(&rt, vec![both, chained, fastest]);
    match rt.block_on(&all) {
        Ok(results) => println!("settled: {}", results),
        Err(reason) => println!("failed: {}", reason),
    }

    // Let the interval and green threads wind down
    rt.run_until_quiescent();

    println!("interval fired {} times", fired.get());
    for (name, output) in rt.green().outputs() {
        println!("green {}: {}", name, output);
    }
    if let Some(elapsed) = rt.time_end("total") {
        println!("elapsed: {:?}", elapsed);
    }
    println!("ticks: {}", rt.ticks());

    rt.shutdown();
    println!("\n=== Example Complete ===");
}
