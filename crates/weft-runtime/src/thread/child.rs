//! Child side of the subprocess protocol
//!
//! A binary that hands work to `ThreadInput::Job` checks for a job request
//! first thing in `main`:
//!
//! ```ignore
//! fn main() {
//!     if let Some(job) = weft::job_from_args() {
//!         let shared = weft::shared_data();
//!         let answer = run_job(&job.name, job.input, &shared);
//!         weft::alert(&answer).ok();
//!         return;
//!     }
//!     // ... parent program
//! }
//! ```

use std::io::{self, BufRead, Write};

use serde_json::Map;
use weft_core::{kwarn, Value};

use super::protocol::{encode_alert, encode_post_main, JobRequest, JOB_FLAG, JOB_INPUT_ENV};

/// The job this process was started for, if any
pub fn job_from_args() -> Option<JobRequest> {
    job_from(std::env::args(), std::env::var(JOB_INPUT_ENV).ok())
}

fn job_from(args: impl IntoIterator<Item = String>, request: Option<String>) -> Option<JobRequest> {
    let mut args = args.into_iter();
    args.find(|a| a == JOB_FLAG)?;
    let name = args.next()?;
    let input = match request.map(|raw| serde_json::from_str::<JobRequest>(&raw)) {
        Some(Ok(req)) if req.name == name => req.input,
        Some(Ok(req)) => {
            kwarn!("job '{}': {} names job '{}'", name, JOB_INPUT_ENV, req.name);
            Value::Null
        }
        Some(Err(e)) => {
            kwarn!("job '{}': bad {}: {}", name, JOB_INPUT_ENV, e);
            Value::Null
        }
        None => Value::Null,
    };
    Some(JobRequest { name, input })
}

/// Read the shared map the parent wrote to stdin
///
/// Empty when stdin is closed or holds no valid object.
pub fn shared_data() -> Map<String, Value> {
    let mut line = String::new();
    match io::stdin().lock().read_line(&mut line) {
        Ok(_) => decode_shared(&line),
        Err(e) => {
            kwarn!("shared_data: {}", e);
            Map::new()
        }
    }
}

fn decode_shared(line: &str) -> Map<String, Value> {
    match serde_json::from_str::<Value>(line.trim()) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

/// Send keys to merge into the parent's shared map
pub fn post_main_thread(data: &Map<String, Value>) -> io::Result<()> {
    write_line(&encode_post_main(data))
}

/// Send a value for the parent's resolved alerts
pub fn alert(value: &Value) -> io::Result<()> {
    write_line(&encode_alert(value))
}

fn write_line(line: &str) -> io::Result<()> {
    let stdout = io::stdout();
    let mut handle = stdout.lock();
    handle.write_all(line.as_bytes())?;
    handle.write_all(b"\n")?;
    handle.flush()
}
