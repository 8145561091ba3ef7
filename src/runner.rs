//! Abstraction over package tool execution for testability.
//!
//! All external tools (`apt-get`, `apt-cache`, `rpm`, `bootc`, `podman`,
//! `skopeo`, `distrobox`) are driven through the [`CommandRunner`] trait so
//! the engines can be unit-tested without spawning real subprocesses.
//!
//! Every command is run through `sh -c` with `LC_ALL=C` forced into the
//! environment, so tool output stays stable for the parsers regardless of the
//! host locale.

use anyhow::{Context, Result};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::io::Read;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Grace period between SIGTERM and SIGKILL when a command is cancelled.
const TERM_GRACE: Duration = Duration::from_secs(2);

/// Poll interval while waiting for a child process.
const WAIT_TICK: Duration = Duration::from_millis(50);

/// Captured result of a tool invocation.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    /// Exit code, `None` when the child was killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    /// Whether the tool exited zero.
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// stdout and stderr joined in that order, for error-pattern scanning.
    pub fn combined(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Cooperative cancellation flag carried by every request.
///
/// Cancelling terminates any pending subprocess with SIGTERM, escalating to
/// SIGKILL after a grace period.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Trait for abstracting package tool execution.
///
/// Stored as `Arc<dyn CommandRunner>` in the application state, mirroring the
/// other seams (event sink, dialog gate).
pub trait CommandRunner: Send + Sync {
    /// Run `sh -c <command>` and capture stdout, stderr and exit code.
    fn run(&self, command: &str, cancel: &CancelToken) -> Result<ToolOutput>;

    /// Run `sh -c <command>` and hand back its stdout as a stream.
    ///
    /// Used for `apt-cache dumpavail`, whose output is far too large to
    /// buffer. The returned reader yields the child's stdout incrementally;
    /// dropping it reaps the child.
    fn open_stream(&self, command: &str, cancel: &CancelToken) -> Result<Box<dyn Read + Send>>;
}

/// Production implementation that delegates to [`std::process::Command`].
pub struct RealCommandRunner;

impl RealCommandRunner {
    fn command(command: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command).env("LC_ALL", "C");
        cmd
    }
}

impl CommandRunner for RealCommandRunner {
    fn run(&self, command: &str, cancel: &CancelToken) -> Result<ToolOutput> {
        debug!(command, "running tool");
        let mut child = Self::command(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to spawn '{command}'"))?;

        // Drain stderr on a helper thread so a chatty tool cannot deadlock
        // against a full stdout pipe.
        let mut err_pipe = child.stderr.take().expect("stderr piped");
        let err_thread = std::thread::spawn(move || {
            let mut buf = String::new();
            let _ = err_pipe.read_to_string(&mut buf);
            buf
        });

        let mut stdout = String::new();
        child
            .stdout
            .take()
            .expect("stdout piped")
            .read_to_string(&mut stdout)
            .with_context(|| format!("Failed to read output of '{command}'"))?;

        let status = wait_cancellable(&mut child, cancel)
            .with_context(|| format!("Failed to wait for '{command}'"))?;
        let stderr = err_thread.join().unwrap_or_default();

        Ok(ToolOutput {
            code: status,
            stdout,
            stderr,
        })
    }

    fn open_stream(&self, command: &str, cancel: &CancelToken) -> Result<Box<dyn Read + Send>> {
        debug!(command, "streaming tool output");
        let mut child = Self::command(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("Failed to spawn '{command}'"))?;

        let stdout = child.stdout.take().expect("stdout piped");
        Ok(Box::new(ChildStream {
            child,
            stdout,
            cancel: cancel.clone(),
        }))
    }
}

/// Wait for a child, honouring the cancellation token.
///
/// Returns the exit code (or `None` for a signal death). On cancellation the
/// child gets SIGTERM, then SIGKILL once the grace period elapses.
fn wait_cancellable(child: &mut std::process::Child, cancel: &CancelToken) -> Result<Option<i32>> {
    let mut termed_at: Option<Instant> = None;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status.code());
        }
        if cancel.is_cancelled() {
            let pid = Pid::from_raw(child.id() as i32);
            match termed_at {
                None => {
                    warn!(pid = child.id(), "cancelling subprocess");
                    let _ = kill(pid, Signal::SIGTERM);
                    termed_at = Some(Instant::now());
                }
                Some(t) if t.elapsed() >= TERM_GRACE => {
                    let _ = kill(pid, Signal::SIGKILL);
                }
                Some(_) => {}
            }
        }
        std::thread::sleep(WAIT_TICK);
    }
}

/// Streaming child stdout that reaps the child on drop.
struct ChildStream {
    child: std::process::Child,
    stdout: std::process::ChildStdout,
    cancel: CancelToken,
}

impl Read for ChildStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.cancel.is_cancelled() {
            let _ = kill(Pid::from_raw(self.child.id() as i32), Signal::SIGTERM);
            return Ok(0);
        }
        self.stdout.read(buf)
    }
}

impl Drop for ChildStream {
    fn drop(&mut self) {
        if self.child.try_wait().ok().flatten().is_none() {
            let _ = kill(Pid::from_raw(self.child.id() as i32), Signal::SIGTERM);
        }
        let _ = self.child.wait();
    }
}

/// Recording mock for unit tests: returns canned outputs in call order.
#[cfg(any(test, feature = "test-support"))]
pub struct MockCommandRunner {
    calls: std::sync::Mutex<Vec<String>>,
    responses: std::sync::Mutex<std::collections::VecDeque<ToolOutput>>,
    streams: std::sync::Mutex<std::collections::VecDeque<Vec<u8>>>,
}

#[cfg(any(test, feature = "test-support"))]
impl MockCommandRunner {
    pub fn new() -> Self {
        Self {
            calls: std::sync::Mutex::new(Vec::new()),
            responses: std::sync::Mutex::new(std::collections::VecDeque::new()),
            streams: std::sync::Mutex::new(std::collections::VecDeque::new()),
        }
    }

    /// Queue a captured-output response.
    pub fn respond(&self, code: i32, stdout: &str, stderr: &str) {
        self.responses.lock().unwrap().push_back(ToolOutput {
            code: Some(code),
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        });
    }

    /// Queue a streamed response body.
    pub fn respond_stream(&self, body: &str) {
        self.streams
            .lock()
            .unwrap()
            .push_back(body.as_bytes().to_vec());
    }

    /// Commands observed so far, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[cfg(any(test, feature = "test-support"))]
impl Default for MockCommandRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(any(test, feature = "test-support"))]
impl CommandRunner for MockCommandRunner {
    fn run(&self, command: &str, _cancel: &CancelToken) -> Result<ToolOutput> {
        self.calls.lock().unwrap().push(command.to_string());
        Ok(self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default())
    }

    fn open_stream(&self, command: &str, _cancel: &CancelToken) -> Result<Box<dyn Read + Send>> {
        self.calls.lock().unwrap().push(command.to_string());
        let body = self.streams.lock().unwrap().pop_front().unwrap_or_default();
        Ok(Box::new(std::io::Cursor::new(body)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn real_runner_captures_output() {
        let runner = RealCommandRunner;
        let out = runner.run("echo hello", &CancelToken::new()).unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[test]
    fn real_runner_forces_c_locale() {
        let runner = RealCommandRunner;
        let out = runner.run("printf %s \"$LC_ALL\"", &CancelToken::new()).unwrap();
        assert_eq!(out.stdout, "C");
    }

    #[test]
    fn real_runner_reports_exit_code() {
        let runner = RealCommandRunner;
        let out = runner.run("exit 3", &CancelToken::new()).unwrap();
        assert_eq!(out.code, Some(3));
        assert!(!out.success());
    }

    #[test]
    fn combined_joins_stdout_then_stderr() {
        let out = ToolOutput {
            code: Some(1),
            stdout: "a".into(),
            stderr: "b".into(),
        };
        assert_eq!(out.combined(), "a\nb");
    }

    #[test]
    fn stream_yields_child_stdout() {
        let runner = RealCommandRunner;
        let mut reader = runner
            .open_stream("printf 'one\\ntwo\\n'", &CancelToken::new())
            .unwrap();
        let mut body = String::new();
        reader.read_to_string(&mut body).unwrap();
        assert_eq!(body, "one\ntwo\n");
    }

    #[test]
    fn cancelled_token_terminates_child() {
        let runner = RealCommandRunner;
        let cancel = CancelToken::new();
        let cancel2 = cancel.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            cancel2.cancel();
        });
        let started = Instant::now();
        let out = runner.run("sleep 30", &cancel).unwrap();
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_ne!(out.code, Some(0));
    }

    #[test]
    fn mock_runner_replays_responses() {
        let mock = MockCommandRunner::new();
        mock.respond(0, "ok", "");
        let out = mock.run("apt-get update", &CancelToken::new()).unwrap();
        assert_eq!(out.stdout, "ok");
        assert_eq!(mock.calls(), vec!["apt-get update".to_string()]);
    }
}
