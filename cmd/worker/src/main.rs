//! Worker pool example
//!
//! The parent fans jobs out to subprocesses in batches. Each job is this
//! same binary re-executed with `--weft-job <name>`; the child reads the
//! shared map from stdin, posts its answer back on stdout and exits.
//!
//! # Environment Variables
//!
//! - `WEFT_WORKER_THREADS=N` - Subprocesses per batch (default 4)
//! - `WEFT_WORKER_MAX_QUEUE=N` - Largest accepted work list (default 16)
//! - `WEFT_LOG_LEVEL=debug` - Set log level

use std::time::Duration;

use weft::{
    json, kinfo, kwarn, JobRequest, Map, Runtime, ThreadInput, Value, Work, Worker,
    WorkerOptions,
};

// cargo run -p weft-worker -- 8
fn main() {
    if let Some(job) = weft::job_from_args() {
        std::process::exit(run_job(job));
    }

    let jobs: u64 = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(6);

    println!("=== weft Worker Example ===\n");

    let rt = match Runtime::from_env() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("runtime: {}", e);
            std::process::exit(1);
        }
    };
    rt.add_shared("offset", 100);

    let options = WorkerOptions::from_config(rt.config());
    println!("batch size {}, max queue {}\n", options.threads, options.max_queue);

    let squares = Work::new();
    for i in 1..=jobs {
        squares.add(ThreadInput::job("square", i));
    }
    let parent = Worker::new(&rt, squares, options);

    // Runs after the squares, in its own batches
    let slow = Work::new();
    for ms in [30, 10, 20] {
        slow.add(ThreadInput::job("nap", ms));
    }
    let child = Worker::new(&rt, slow, options.threads(2));
    parent.add_worker(child, |results, w| {
        kinfo!("worker {} finished naps: {:?}", w.id(), results);
        w.done();
    });

    rt.time("workers");
    let promise = match parent.run(|results, w| {
        let total: i64 = results.iter().flat_map(alerts).sum();
        println!("sum of squares + offsets: {}", total);
        w.done();
    }) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("worker rejected: {}", e);
            std::process::exit(1);
        }
    };

    let reported = promise.then(|v| {
        kinfo!("raw results: {}", v);
        v
    });

    match rt.block_on(&reported) {
        Ok(_) => {}
        Err(reason) => eprintln!("worker failed: {}", reason),
    }
    rt.time_end("workers");

    let shared = rt.shared();
    let mut keys: Vec<&String> = shared.keys().collect();
    keys.sort();
    println!("\nshared map ({} keys):", keys.len());
    for k in keys {
        println!("  {} = {}", k, shared[k.as_str()]);
    }

    // A work list over the limit fails up front
    let flood = Work::new();
    for _ in 0..=options.max_queue {
        flood.add(ThreadInput::job("square", 0));
    }
    match Worker::new(&rt, flood, options).run(|_, _| {}) {
        Ok(_) => kwarn!("oversized work list was accepted"),
        Err(e) => println!("\noversized work list: {}", e),
    }

    rt.shutdown();
    println!("\n=== Example Complete ===");
}

/// Numbers inside one thread's alert list
fn alerts(v: &Value) -> Vec<i64> {
    match v {
        Value::Array(items) => items.iter().filter_map(Value::as_i64).collect(),
        other => other.as_i64().into_iter().collect(),
    }
}

/// Child side: returns the process exit code
fn run_job(job: JobRequest) -> i32 {
    let shared = weft::shared_data();
    let offset = shared.get("offset").and_then(Value::as_i64).unwrap_or(0);

    let answer = match job.name.as_str() {
        "square" => {
            let n = job.input.as_i64().unwrap_or(0);
            let mut post = Map::new();
            post.insert(format!("square_{}", n), json!(n * n));
            if weft::post_main_thread(&post).is_err() {
                return 1;
            }
            json!(n * n + offset)
        }
        "nap" => {
            let ms = job.input.as_u64().unwrap_or(0);
            std::thread::sleep(Duration::from_millis(ms));
            json!(format!("napped {}ms", ms))
        }
        other => {
            // stderr output rejects the parent's promise
            eprintln!("unknown job '{}'", other);
            return 2;
        }
    };

    match weft::alert(&answer) {
        Ok(()) => 0,
        Err(_) => 1,
    }
}
