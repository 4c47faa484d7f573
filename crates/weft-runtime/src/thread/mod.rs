//! Subprocess threads and workers
//!
//! A `Thread` runs one child process behind a promise. The parent polls
//! the child once per tick until it exits, feeding the shared map to its
//! stdin and draining its pipes as it goes. Control lines on stdout
//! (see `protocol`) update the shared map or become the resolved value;
//! any stderr output rejects.

pub mod child;
pub mod protocol;
mod worker;

pub use worker::{Work, Worker, WorkerOptions};

use std::cell::Cell;
use std::io::{self, Read, Write};
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::rc::Rc;
use std::time::Duration;

use weft_core::{kdebug, ktrace, kwarn, Value, WeftError};

use crate::event_loop::Runtime;
use crate::promise::{Promise, Resolver};
use crate::suspend::sleep;
use protocol::{parse_line, ControlMessage, JobRequest, JOB_FLAG, JOB_INPUT_ENV};

/// Gap between exit-status polls
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// What a subprocess runs
#[derive(Debug, Clone, PartialEq)]
pub enum ThreadInput {
    /// Shell command line
    Command(String),
    /// Re-run the current executable as `<exe> --weft-job <name>`
    Job { name: String, input: Value },
}

impl ThreadInput {
    pub fn command(cmd: impl Into<String>) -> Self {
        ThreadInput::Command(cmd.into())
    }

    pub fn job(name: impl Into<String>, input: impl Into<Value>) -> Self {
        ThreadInput::Job {
            name: name.into(),
            input: input.into(),
        }
    }

    fn to_command(&self) -> io::Result<Command> {
        match self {
            ThreadInput::Command(line) => Ok(shell_command(line)),
            ThreadInput::Job { name, input } => {
                let request = JobRequest {
                    name: name.clone(),
                    input: input.clone(),
                };
                let mut cmd = Command::new(std::env::current_exe()?);
                cmd.arg(JOB_FLAG)
                    .arg(name)
                    .env(JOB_INPUT_ENV, serde_json::to_string(&request)?);
                Ok(cmd)
            }
        }
    }
}

#[derive(Debug)]
struct ThreadState {
    input: ThreadInput,
    pid: Cell<Option<u32>>,
    exit_code: Cell<Option<i32>>,
    running: Cell<bool>,
    signaled: Cell<bool>,
    stop_requested: Cell<bool>,
    stopped: Cell<bool>,
}

/// One child process; clones share state
#[derive(Debug, Clone)]
pub struct Thread {
    state: Rc<ThreadState>,
}

impl Thread {
    pub fn new(input: ThreadInput) -> Self {
        Self {
            state: Rc::new(ThreadState {
                input,
                pid: Cell::new(None),
                exit_code: Cell::new(None),
                running: Cell::new(false),
                signaled: Cell::new(false),
                stop_requested: Cell::new(false),
                stopped: Cell::new(false),
            }),
        }
    }

    pub fn input(&self) -> &ThreadInput {
        &self.state.input
    }

    /// Spawn the child; the promise resolves with its alerts
    ///
    /// A spawn failure rejects before this returns.
    pub fn start(&self, rt: &Runtime) -> Promise {
        let thread = self.clone();
        let rt2 = rt.clone();
        Promise::new(rt, move |resolver| async move {
            thread.drive(rt2, resolver).await;
            Ok(())
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.state.pid.get()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.state.exit_code.get()
    }

    pub fn is_running(&self) -> bool {
        self.state.running.get()
    }

    /// Child ended because of a signal
    pub fn is_signaled(&self) -> bool {
        self.state.signaled.get()
    }

    /// Child was stopped through `stop` (or `Runtime::kill_thread`)
    pub fn is_stopped(&self) -> bool {
        self.state.stopped.get()
    }

    /// Ask the child to terminate at the next poll
    pub fn stop(&self) {
        self.state.stop_requested.set(true);
    }

    async fn drive(self, rt: Runtime, resolver: Resolver) {
        let (mut child, mut feed) = match self.spawn(&rt) {
            Ok(spawned) => spawned,
            Err(e) => {
                kwarn!("thread spawn failed: {}", e);
                resolver.reject(e.to_value());
                return;
            }
        };
        let pid = child.id();
        self.state.pid.set(Some(pid));
        self.state.running.set(true);
        rt.register_thread(pid, self.clone());
        kdebug!("thread {} started", pid);

        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();
        let mut out = Vec::new();
        let mut err = Vec::new();
        let mut live = LiveChild {
            thread: self.clone(),
            rt: rt.clone(),
            child: Some(child),
        };

        let status = loop {
            feed.push(pid);
            if let Err(e) = pump(&mut stdout, &mut out, false).and_then(|_| pump(&mut stderr, &mut err, false)) {
                break Err(e);
            }
            if self.state.stop_requested.get() && !self.state.stopped.get() {
                live.terminate();
            }
            match live.try_wait() {
                Ok(Some(status)) => break Ok(status),
                Ok(None) => sleep(&rt, POLL_INTERVAL).await,
                Err(e) => break Err(e),
            }
        };
        drop(feed);

        let drained = pump(&mut stdout, &mut out, true).and_then(|_| pump(&mut stderr, &mut err, true));
        let status = match status.and_then(|s| drained.map(|_| s)) {
            Ok(status) => {
                live.finish(status);
                status
            }
            Err(e) => {
                drop(live);
                resolver.reject(WeftError::from(e).to_value());
                return;
            }
        };
        kdebug!("thread {} exited: {}", pid, status);

        let stderr_text = String::from_utf8_lossy(&err);
        if !stderr_text.trim().is_empty() {
            resolver.reject(WeftError::Subprocess(stderr_text.trim_end().to_string()).to_value());
            return;
        }

        let mut alerts = Vec::new();
        for line in String::from_utf8_lossy(&out).lines() {
            match parse_line(line) {
                Some(ControlMessage::PostMain(data)) => rt.merge_shared(data),
                Some(ControlMessage::Alert(value)) => alerts.push(value),
                None => ktrace!("thread {}: {}", pid, line),
            }
        }
        resolver.resolve(Value::Array(alerts));
    }

    fn spawn(&self, rt: &Runtime) -> Result<(Child, StdinFeed), WeftError> {
        let mut cmd = self
            .state
            .input
            .to_command()
            .map_err(|e| WeftError::SpawnFailed(e.to_string()))?;
        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| WeftError::SpawnFailed(e.to_string()))?;

        #[cfg(unix)]
        {
            let made = match (child.stdin.as_ref(), child.stdout.as_ref(), child.stderr.as_ref()) {
                (Some(inp), Some(out), Some(err)) => set_nonblocking(inp)
                    .and_then(|_| set_nonblocking(out))
                    .and_then(|_| set_nonblocking(err)),
                _ => Ok(()),
            };
            if let Err(e) = made {
                let _ = child.kill();
                let _ = child.wait();
                return Err(WeftError::SpawnFailed(e.to_string()));
            }
        }

        let mut snapshot = Value::Object(rt.shared()).to_string().into_bytes();
        snapshot.push(b'\n');
        let feed = StdinFeed {
            pipe: child.stdin.take(),
            data: snapshot,
            written: 0,
        };
        Ok((child, feed))
    }

    /// Poll a child whose promise is gone; true once it has been reaped
    pub(crate) fn reap(&self, rt: &Runtime, child: &mut Child) -> bool {
        if self.state.stop_requested.get() && !self.state.stopped.get() {
            self.terminate(child);
        }
        match child.try_wait() {
            Ok(None) => false,
            Ok(Some(status)) => {
                kdebug!("thread {} reaped: {}", child.id(), status);
                self.exited(rt, child.id(), Some(status));
                true
            }
            Err(e) => {
                kwarn!("thread {}: wait failed: {}", child.id(), e);
                self.exited(rt, child.id(), None);
                true
            }
        }
    }

    fn exited(&self, rt: &Runtime, pid: u32, status: Option<ExitStatus>) {
        self.state.running.set(false);
        rt.unregister_thread(pid);
        if let Some(status) = status {
            self.record_exit(status);
        }
    }

    fn terminate(&self, child: &mut Child) {
        match send_terminate(child) {
            Ok(()) => {
                kdebug!("thread {} terminated on request", child.id());
                self.state.stopped.set(true);
            }
            Err(e) => kwarn!("thread {}: terminate failed: {}", child.id(), e),
        }
    }

    fn record_exit(&self, status: ExitStatus) {
        self.state.exit_code.set(status.code());
        self.state.signaled.set(was_signaled(&status));
    }
}

/// A spawned child owned by `drive`
///
/// However `drive` ends (exit, cancel, task budget, shutdown) the child is
/// reaped, or handed to the runtime to reap on later ticks. It is never
/// killed here.
struct LiveChild {
    thread: Thread,
    rt: Runtime,
    child: Option<Child>,
}

impl LiveChild {
    fn try_wait(&mut self) -> io::Result<Option<ExitStatus>> {
        match self.child.as_mut() {
            Some(child) => child.try_wait(),
            None => Err(io::Error::new(io::ErrorKind::NotFound, "child already reaped")),
        }
    }

    fn terminate(&mut self) {
        if let Some(child) = self.child.as_mut() {
            self.thread.terminate(child);
        }
    }

    /// `status` came from `try_wait`, so the child is already reaped
    fn finish(mut self, status: ExitStatus) {
        if let Some(child) = self.child.take() {
            self.thread.exited(&self.rt, child.id(), Some(status));
        }
    }
}

impl Drop for LiveChild {
    fn drop(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        if !self.thread.reap(&self.rt, &mut child) {
            kdebug!("thread {} outlived its promise", child.id());
            self.rt.adopt_orphan(self.thread.clone(), child);
        }
    }
}

/// Shared-map snapshot still owed to a child's stdin
struct StdinFeed {
    pipe: Option<ChildStdin>,
    data: Vec<u8>,
    written: usize,
}

impl StdinFeed {
    /// Write as much as the pipe takes without blocking; closes the pipe
    /// once the snapshot is out or the child stopped reading
    ///
    /// Off unix the pipe blocks, so the first call writes everything.
    fn push(&mut self, pid: u32) {
        let Some(pipe) = self.pipe.as_mut() else {
            return;
        };
        while self.written < self.data.len() {
            match pipe.write(&self.data[self.written..]) {
                Ok(0) => break,
                Ok(n) => self.written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // The child may exit without reading
                    kdebug!("thread {}: stdin not written: {}", pid, e);
                    break;
                }
            }
        }
        ktrace!("thread {}: {} of {} stdin bytes written", pid, self.written, self.data.len());
        self.pipe = None;
    }
}

cfg_if::cfg_if! {
    if #[cfg(windows)] {
        fn shell_command(line: &str) -> Command {
            let mut cmd = Command::new("cmd");
            cmd.arg("/C").arg(line);
            cmd
        }
    } else {
        fn shell_command(line: &str) -> Command {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(line);
            cmd
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        fn send_terminate(child: &mut Child) -> io::Result<()> {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM).map_err(io::Error::from)
        }

        fn was_signaled(status: &ExitStatus) -> bool {
            use std::os::unix::process::ExitStatusExt;
            status.signal().is_some()
        }
    } else {
        fn send_terminate(child: &mut Child) -> io::Result<()> {
            child.kill()
        }

        fn was_signaled(_status: &ExitStatus) -> bool {
            false
        }
    }
}

#[cfg(unix)]
fn set_nonblocking(fd: &impl std::os::unix::io::AsRawFd) -> io::Result<()> {
    use nix::fcntl::{fcntl, FcntlArg, OFlag};

    let raw = fd.as_raw_fd();
    let flags = fcntl(raw, FcntlArg::F_GETFL).map_err(io::Error::from)?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(raw, FcntlArg::F_SETFL(flags)).map_err(io::Error::from)?;
    Ok(())
}

/// Move whatever the pipe holds into `buf`; closes the pipe at EOF
///
/// On unix the pipe is non-blocking, so this never waits. Elsewhere the
/// pipe is only read once the child has exited.
fn pump<R: Read>(pipe: &mut Option<R>, buf: &mut Vec<u8>, exited: bool) -> io::Result<()> {
    if cfg!(not(unix)) && !exited {
        return Ok(());
    }
    let Some(reader) = pipe.as_mut() else {
        return Ok(());
    };
    let mut chunk = [0u8; 4096];
    loop {
        match reader.read(&mut chunk) {
            Ok(0) => {
                *pipe = None;
                return Ok(());
            }
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use serde_json::json;

    fn runtime() -> Runtime {
        Runtime::new(RuntimeConfig::new()).unwrap()
    }

    #[test]
    fn test_alerts_resolve() {
        let rt = runtime();
        let thread = Thread::new(ThreadInput::command(
            "echo 'postAlertThread=>\"hi\"'; echo 'plain line'; echo 'postAlertThread=>{\"n\":2}'",
        ));
        let p = thread.start(&rt);

        assert_eq!(rt.block_on(&p), Ok(json!(["hi", {"n": 2}])));
        assert_eq!(thread.exit_code(), Some(0));
        assert!(!thread.is_running());
        assert!(thread.pid().is_some());
    }

    #[test]
    fn test_post_main_merges_shared() {
        let rt = runtime();
        let p = Thread::new(ThreadInput::command("echo 'postMainThread=>{\"k\":1}'")).start(&rt);

        assert_eq!(rt.block_on(&p), Ok(json!([])));
        assert_eq!(rt.get_shared("k"), Some(json!(1)));
    }

    #[test]
    fn test_shared_snapshot_on_stdin() {
        let rt = runtime();
        rt.add_shared("greeting", "hello");
        let p = Thread::new(ThreadInput::command(
            "read line; echo \"postAlertThread=>$line\"",
        ))
        .start(&rt);

        assert_eq!(rt.block_on(&p), Ok(json!([{"greeting": "hello"}])));
    }

    #[test]
    fn test_stderr_rejects() {
        let rt = runtime();
        let p = Thread::new(ThreadInput::command("echo boom >&2")).start(&rt);

        let err = rt.block_on(&p).unwrap_err();
        assert_eq!(WeftError::kind_of(&err), Some("subprocess"));
        assert_eq!(err["message"], "subprocess failed: boom");
    }

    #[test]
    fn test_nonzero_exit_without_stderr_resolves() {
        let rt = runtime();
        let thread = Thread::new(ThreadInput::command("exit 3"));
        let p = thread.start(&rt);

        assert_eq!(rt.block_on(&p), Ok(json!([])));
        assert_eq!(thread.exit_code(), Some(3));
    }

    #[test]
    fn test_kill_thread() {
        let rt = runtime();
        let thread = Thread::new(ThreadInput::command("sleep 5"));
        let p = thread.start(&rt);
        let pid = thread.pid().unwrap();
        assert!(rt.thread_is_running(pid));

        assert!(rt.kill_thread(pid));
        let start = std::time::Instant::now();
        rt.block_on(&p).unwrap();
        assert!(start.elapsed() < Duration::from_secs(4));
        assert!(thread.is_stopped());
        assert!(thread.is_signaled());
        assert!(!rt.thread_is_running(pid));
        assert!(!rt.kill_thread(pid));
    }

    #[test]
    fn test_chatty_child_does_not_deadlock() {
        let rt = runtime();
        // Well past a 64KiB pipe buffer
        let p = Thread::new(ThreadInput::command(
            "i=0; while [ $i -lt 5000 ]; do echo 'filler line of output number'; i=$((i+1)); done; echo 'postAlertThread=>1'",
        ))
        .start(&rt);

        assert_eq!(rt.block_on(&p), Ok(json!([1])));
    }

    #[test]
    fn test_large_snapshot_with_child_writing_first() {
        // Runtime is not Send, so build it on the helper thread
        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let rt = runtime();
            rt.add_shared("blob", "x".repeat(200_000));
            let p = Thread::new(ThreadInput::command(
                "head -c 200000 /dev/zero | tr '\\0' y; echo; read line; echo \"postAlertThread=>${#line}\"",
            ))
            .start(&rt);
            let _ = tx.send(rt.block_on(&p));
        });

        let out = rx
            .recv_timeout(Duration::from_secs(10))
            .expect("parent and child deadlocked on stdin");
        // {"blob":"xxx..."} without the newline
        assert_eq!(out, Ok(json!([200_011])));
    }

    #[test]
    fn test_child_ignoring_stdin_resolves() {
        let rt = runtime();
        rt.add_shared("blob", "x".repeat(200_000));
        let p = Thread::new(ThreadInput::command("echo 'postAlertThread=>1'")).start(&rt);

        assert_eq!(rt.block_on(&p), Ok(json!([1])));
    }

    #[test]
    fn test_cancelled_thread_is_reaped() {
        let rt = runtime();
        let thread = Thread::new(ThreadInput::command("sleep 0.5"));
        let p = thread.start(&rt);
        let pid = thread.pid().unwrap();

        p.cancel();
        let err = rt.block_on(&p).unwrap_err();
        assert_eq!(WeftError::kind_of(&err), Some("cancelled"));
        // Not killed: still running, now owned by the runtime
        assert!(rt.thread_is_running(pid));
        assert!(rt.has_work());

        rt.run_until_quiescent();
        assert!(!thread.is_running());
        assert!(!rt.thread_is_running(pid));
        assert!(!thread.is_stopped());
        assert_eq!(thread.exit_code(), Some(0));
    }

    #[test]
    fn test_timed_out_thread_is_reaped() {
        let rt = Runtime::new(RuntimeConfig::new().task_budget(Some(Duration::from_millis(30)))).unwrap();
        let thread = Thread::new(ThreadInput::command("sleep 0.5"));
        let p = thread.start(&rt);
        let pid = thread.pid().unwrap();

        let err = rt.block_on(&p).unwrap_err();
        assert_eq!(WeftError::kind_of(&err), Some("timeout"));

        rt.run_until_quiescent();
        assert!(!thread.is_running());
        assert!(!rt.thread_is_running(pid));
        assert_eq!(thread.exit_code(), Some(0));
    }

    #[test]
    fn test_kill_orphaned_thread() {
        let rt = runtime();
        let thread = Thread::new(ThreadInput::command("sleep 5"));
        let p = thread.start(&rt);
        let pid = thread.pid().unwrap();
        p.cancel();
        rt.block_on(&p).unwrap_err();

        assert!(rt.kill_thread(pid));
        let start = std::time::Instant::now();
        rt.run_until_quiescent();
        assert!(start.elapsed() < Duration::from_secs(4));
        assert!(thread.is_stopped());
        assert!(!rt.thread_is_running(pid));
    }

    #[test]
    fn test_job_command_carries_request() {
        let cmd = ThreadInput::job("square", 7).to_command().unwrap();
        let (_, raw) = cmd
            .get_envs()
            .find(|(k, _)| *k == JOB_INPUT_ENV)
            .unwrap();
        let req: JobRequest = serde_json::from_str(raw.unwrap().to_str().unwrap()).unwrap();
        assert_eq!(req, JobRequest { name: "square".into(), input: json!(7) });
        assert!(cmd.get_args().any(|a| a == JOB_FLAG));
    }
}
