//! Case executor.
//!
//! Runs the binary under test against one script, writes its standard output
//! to the case's captured artifact and enforces the per-case timeout.

use crate::config::HarnessConfig;
use crate::discovery::TestCase;
use std::collections::HashMap;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;

/// How long to wait for output pipes to close after the process group is killed.
const KILL_GRACE: Duration = Duration::from_secs(1);

/// Poll interval while waiting for the child.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Bytes of the binary's stderr kept in memory (the tail).
const STDERR_LIMIT: usize = 64 * 1024;

/// How the binary under test finished.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Termination {
    /// Exited normally with a status code.
    Exited(i32),
    /// Terminated by a signal (Unix only).
    Signaled(i32),
    /// Killed after exceeding the timeout.
    TimedOut(#[serde(serialize_with = "crate::report::serialize_duration")] Duration),
    /// Could not be started at all.
    SpawnFailed(String),
    /// Ran, but its output could not be captured.
    CaptureFailed(String),
}

impl Termination {
    /// Whether the run failed before comparison is meaningful.
    #[cfg_attr(not(test), allow(dead_code))]
    pub fn is_execution_error(&self) -> bool {
        matches!(
            self,
            Termination::TimedOut(_) | Termination::SpawnFailed(_) | Termination::CaptureFailed(_)
        )
    }
}

/// Result of executing one case. Consumed by the comparator.
#[derive(Debug)]
pub struct ExecutionResult {
    pub termination: Termination,
    /// Number of stdout bytes captured.
    pub stdout_len: usize,
    /// Whether the captured artifact was written and synced.
    pub artifact_written: bool,
    /// Tail of the binary's standard error. Observed, never compared.
    pub stderr: Vec<u8>,
    pub duration: Duration,
}

impl ExecutionResult {
    fn without_output(termination: Termination, start: Instant) -> Self {
        Self {
            termination,
            stdout_len: 0,
            artifact_written: false,
            stderr: Vec::new(),
            duration: start.elapsed(),
        }
    }
}

/// Invokes the binary under test, one case at a time.
///
/// Shared between worker threads; each call only touches its own case's files.
#[derive(Debug, Clone)]
pub struct Executor {
    binary: PathBuf,
    args: Vec<String>,
    timeout: Duration,
    env: HashMap<String, String>,
    inherit_env: bool,
}

impl Executor {
    /// Build an executor from a finalized config.
    pub fn from_config(config: &HarnessConfig) -> Self {
        Self {
            binary: config.binary.clone().unwrap_or_default(),
            args: config.args.clone(),
            timeout: config.timeout(),
            env: config.env.clone(),
            inherit_env: config.inherit_env,
        }
    }

    #[cfg_attr(not(test), allow(dead_code))]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn command(&self, case: &TestCase) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(&self.args).arg(&case.script);

        if !self.inherit_env {
            cmd.env_clear();
        }
        cmd.envs(&self.env);

        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        // Own process group so a timeout can take down every descendant.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        cmd
    }

    /// Run one case and write its captured artifact.
    pub fn execute(&self, case: &TestCase) -> ExecutionResult {
        let start = Instant::now();
        let deadline = start + self.timeout;

        let spool = match remove_stale(&case.captured).and_then(|()| spool_for(&case.captured)) {
            Ok(spool) => spool,
            Err(e) => {
                return ExecutionResult::without_output(
                    Termination::CaptureFailed(format!(
                        "failed to prepare {}: {e}",
                        case.captured.display()
                    )),
                    start,
                );
            }
        };

        let mut child = match self.command(case).spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::debug!(case = %case.id, binary = %self.binary.display(), error = %e, "spawn failed");
                return ExecutionResult::without_output(
                    Termination::SpawnFailed(format!(
                        "failed to spawn {}: {e}",
                        self.binary.display()
                    )),
                    start,
                );
            }
        };
        tracing::debug!(case = %case.id, pid = child.id(), "spawned");

        let stdout = child
            .stdout
            .take()
            .map(|pipe| Drain::spawn(move || spool_pipe(pipe, spool)));
        let stderr = child
            .stderr
            .take()
            .map(|pipe| Drain::spawn(move || read_tail(pipe, STDERR_LIMIT)));

        let status = match wait_until(&mut child, deadline) {
            Ok(Some(status)) => status,
            Ok(None) => {
                tracing::debug!(case = %case.id, "timed out, killing process group");
                kill_tree(&mut child);
                let _ = child.wait();
                // Reap the spool so the partial capture is deleted now.
                if let Some(drain) = stdout {
                    drain.discard();
                }
                return ExecutionResult::without_output(Termination::TimedOut(self.timeout), start);
            }
            Err(e) => {
                kill_tree(&mut child);
                let _ = child.wait();
                if let Some(drain) = stdout {
                    drain.discard();
                }
                return ExecutionResult::without_output(
                    Termination::CaptureFailed(format!("failed to wait: {e}")),
                    start,
                );
            }
        };

        // A descendant may still hold either pipe open after the child exits.
        let (spool, stdout_len) = match stdout.map(|d| d.finish(&mut child, deadline)) {
            None => (None, 0),
            Some(Drained::Done(Ok((spool, len)))) => (Some(spool), len),
            Some(Drained::Done(Err(e))) => {
                return ExecutionResult::without_output(
                    Termination::CaptureFailed(format!("failed to read stdout: {e}")),
                    start,
                );
            }
            Some(Drained::Overran) => {
                tracing::debug!(case = %case.id, "stdout held open past the timeout");
                return ExecutionResult::without_output(Termination::TimedOut(self.timeout), start);
            }
        };
        let stderr = match stderr.map(|d| d.finish(&mut child, deadline)) {
            None | Some(Drained::Done(Err(_))) => Vec::new(),
            Some(Drained::Done(Ok(bytes))) => bytes,
            Some(Drained::Overran) => {
                tracing::debug!(case = %case.id, "stderr held open past the timeout");
                return ExecutionResult::without_output(Termination::TimedOut(self.timeout), start);
            }
        };

        let termination = termination_of(status);
        let mut result = ExecutionResult {
            termination,
            stdout_len,
            artifact_written: false,
            stderr,
            duration: start.elapsed(),
        };

        // A signal with nothing on stdout is a crash before any output.
        if matches!(result.termination, Termination::Signaled(_)) && stdout_len == 0 {
            tracing::debug!(case = %case.id, "crashed without output");
            return result;
        }

        let persisted = match spool {
            Some(spool) => persist(spool, &case.captured),
            None => write_empty(&case.captured),
        };
        match persisted {
            Ok(()) => result.artifact_written = true,
            Err(e) => {
                result.termination = Termination::CaptureFailed(format!(
                    "failed to write {}: {e}",
                    case.captured.display()
                ));
            }
        }
        result.duration = start.elapsed();
        result
    }
}

/// Services one pipe on its own thread.
struct Drain<T>(mpsc::Receiver<io::Result<T>>);

enum Drained<T> {
    Done(io::Result<T>),
    /// Still open at the deadline; the process group was killed.
    Overran,
}

impl<T: Send + 'static> Drain<T> {
    fn spawn<F>(work: F) -> Self
    where
        F: FnOnce() -> io::Result<T> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let _ = tx.send(work());
        });
        Self(rx)
    }

    /// Wait for the pipe to close, killing the process group if it is still
    /// open at `deadline`.
    fn finish(self, child: &mut Child, deadline: Instant) -> Drained<T> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match self.0.recv_timeout(remaining) {
            Ok(result) => Drained::Done(result),
            Err(_) => {
                kill_tree(child);
                let _ = self.0.recv_timeout(KILL_GRACE);
                Drained::Overran
            }
        }
    }

    /// Drop the result once the (already killed) writers let go of the pipe.
    fn discard(self) {
        let _ = self.0.recv_timeout(KILL_GRACE);
    }
}

/// Temporary capture file next to the artifact, deleted unless persisted.
fn spool_for(captured: &Path) -> io::Result<NamedTempFile> {
    let dir = match captured.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;
    NamedTempFile::new_in(dir)
}

/// Copy a pipe into the spool without holding it in memory.
fn spool_pipe<R: Read>(mut pipe: R, mut spool: NamedTempFile) -> io::Result<(NamedTempFile, usize)> {
    let len = io::copy(&mut pipe, spool.as_file_mut())?;
    Ok((spool, len as usize))
}

/// Read a pipe to the end, keeping only its last `limit` bytes.
fn read_tail<R: Read>(mut pipe: R, limit: usize) -> io::Result<Vec<u8>> {
    let mut tail = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = match pipe.read(&mut buf) {
            Ok(0) => return Ok(tail),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        tail.extend_from_slice(&buf[..n]);
        if tail.len() > limit {
            tail.drain(..tail.len() - limit);
        }
    }
}

fn wait_until(child: &mut Child, deadline: Instant) -> io::Result<Option<ExitStatus>> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn termination_of(status: ExitStatus) -> Termination {
    if let Some(code) = status.code() {
        return Termination::Exited(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return Termination::Signaled(signal);
        }
    }
    Termination::CaptureFailed("process ended without an exit code".to_string())
}

#[cfg(unix)]
fn kill_tree(child: &mut Child) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let pgid = Pid::from_raw(child.id() as i32);
    match killpg(pgid, Signal::SIGKILL) {
        Ok(()) => {}
        // Group already gone.
        Err(nix::errno::Errno::ESRCH) => {}
        Err(e) => {
            tracing::warn!(pid = child.id(), error = %e, "failed to kill process group");
            let _ = child.kill();
        }
    }
}

#[cfg(not(unix))]
fn kill_tree(child: &mut Child) {
    if let Err(e) = child.kill() {
        tracing::warn!(pid = child.id(), error = %e, "failed to kill process");
    }
}

fn remove_stale(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Flush the spool to disk and move it over the artifact path.
fn persist(spool: NamedTempFile, captured: &Path) -> io::Result<()> {
    spool.as_file().sync_all()?;
    spool.persist(captured).map_err(|e| e.error)?;
    Ok(())
}

fn write_empty(captured: &Path) -> io::Result<()> {
    let file = std::fs::File::create(captured)?;
    file.sync_all()
}
