//! Supervised process lifecycle and durable output capture.
//!
//! Non-intrusive wrapper around the agent binary: start appends the
//! process's stdout and stderr to a durable log file that is never
//! truncated, stop escalates from SIGTERM to SIGKILL after a bounded
//! grace period, and liveness is re-verified against the OS process
//! table rather than trusting local state alone.

use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Chunk size for reading the output log backwards.
const TAIL_CHUNK: u64 = 8192;

/// Interval between exit polls while waiting for graceful termination.
const STOP_POLL: Duration = Duration::from_millis(100);

/// Supervisor operation errors.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The agent executable could not be found.
    #[error("agent executable not found: {0}")]
    Launch(String),
    /// The process could not be spawned for another reason.
    #[error("failed to spawn agent: {0}")]
    Spawn(String),
    /// A signal, wait, or stdin write failed during process control.
    #[error("process control error: {0}")]
    Control(String),
}

/// Snapshot of the supervised process's state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessStatus {
    /// Whether the process is currently alive.
    pub running: bool,
    /// Process id, present only while running.
    pub pid: Option<u32>,
    /// When the process was last seen alive.
    pub last_seen: Option<DateTime<Utc>>,
}

/// A bounded tail of the durable output log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogTail {
    /// The last lines of the log, oldest first.
    pub lines: Vec<String>,
    /// Number of lines returned (not total lines in the file).
    pub count: usize,
}

/// Live handle to the spawned process. Exists only while the process is
/// believed running.
#[derive(Debug)]
struct ProcessHandle {
    child: Child,
    pid: u32,
    started_at: DateTime<Utc>,
    stdin: Option<ChildStdin>,
}

/// Owns the supervised process's lifecycle and its durable output log.
#[derive(Debug)]
pub struct ProcessSupervisor {
    handle: Option<ProcessHandle>,
    log_path: PathBuf,
    stop_grace: Duration,
}

impl ProcessSupervisor {
    /// Create a supervisor writing agent output to `log_path`.
    pub fn new(log_path: &Path, stop_grace: Duration) -> Self {
        Self {
            handle: None,
            log_path: log_path.to_path_buf(),
            stop_grace,
        }
    }

    /// Path of the durable output log.
    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Start the agent process.
    ///
    /// Idempotent: when the process is already running, returns the
    /// current status without spawning a second process. Output is
    /// appended to the durable log; stdin is kept open for
    /// [`send_input`](Self::send_input).
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::Launch`] when the executable cannot be
    /// found and [`SupervisorError::Spawn`] for any other spawn failure.
    pub fn start(&mut self, executable: &str) -> Result<ProcessStatus, SupervisorError> {
        if self.is_running() {
            debug!("agent already running, start is a no-op");
            return Ok(self.status());
        }

        if let Some(parent) = self.log_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SupervisorError::Spawn(format!("create log dir: {e}")))?;
        }

        let stdout_log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .map_err(|e| {
                SupervisorError::Spawn(format!("open log {}: {e}", self.log_path.display()))
            })?;
        let stderr_log = stdout_log
            .try_clone()
            .map_err(|e| SupervisorError::Spawn(format!("clone log handle: {e}")))?;

        let mut child = Command::new(executable)
            .stdout(Stdio::from(stdout_log))
            .stderr(Stdio::from(stderr_log))
            .stdin(Stdio::piped())
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    SupervisorError::Launch(executable.to_owned())
                } else {
                    SupervisorError::Spawn(e.to_string())
                }
            })?;

        let pid = child.id();
        let stdin = child.stdin.take();
        self.handle = Some(ProcessHandle {
            child,
            pid,
            started_at: Utc::now(),
            stdin,
        });

        info!(pid, executable, log = %self.log_path.display(), "agent started");
        Ok(self.status())
    }

    /// Stop the agent process.
    ///
    /// Idempotent: a no-op when not running. Sends SIGTERM, waits up to
    /// the grace period, and force-kills on timeout. Local state is
    /// always cleared afterwards, even when the kill reports an error,
    /// so the supervisor can never get stuck claiming "running".
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::Control`] when the forced kill or the
    /// final wait fails (state is still cleared).
    pub async fn stop(&mut self) -> Result<ProcessStatus, SupervisorError> {
        if !self.is_running() {
            debug!("agent not running, stop is a no-op");
            return Ok(self.status());
        }

        // is_running() confirmed the handle is present.
        let Some(mut handle) = self.handle.take() else {
            return Ok(self.status());
        };

        info!(pid = handle.pid, "sending SIGTERM to agent");
        send_sigterm(handle.pid);

        let deadline = tokio::time::Instant::now()
            .checked_add(self.stop_grace)
            .unwrap_or_else(tokio::time::Instant::now);

        loop {
            match handle.child.try_wait() {
                Ok(Some(status)) => {
                    info!(pid = handle.pid, ?status, "agent exited gracefully");
                    return Ok(self.status());
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(pid = handle.pid, error = %e, "wait failed during stop");
                    return Err(SupervisorError::Control(format!("wait: {e}")));
                }
            }

            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(STOP_POLL).await;
        }

        warn!(pid = handle.pid, "grace period expired, force-killing agent");
        if let Err(e) = handle.child.kill() {
            return Err(SupervisorError::Control(format!("kill: {e}")));
        }
        handle
            .child
            .wait()
            .map_err(|e| SupervisorError::Control(format!("wait after kill: {e}")))?;

        info!(pid = handle.pid, "agent force-killed");
        Ok(self.status())
    }

    /// Current status, re-verifying liveness against the process table.
    pub fn status(&mut self) -> ProcessStatus {
        if self.is_running() {
            ProcessStatus {
                running: true,
                pid: self.handle.as_ref().map(|h| h.pid),
                last_seen: Some(Utc::now()),
            }
        } else {
            ProcessStatus {
                running: false,
                pid: None,
                last_seen: None,
            }
        }
    }

    /// When the current process was started, if one is running.
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.handle.as_ref().map(|h| h.started_at)
    }

    /// Whether the agent process is alive.
    ///
    /// Reaps the child if it has exited and consults the OS process
    /// table for the stored pid, so a crash is detected even though no
    /// stop was issued. A dead process clears the local handle.
    pub fn is_running(&mut self) -> bool {
        let Some(handle) = self.handle.as_mut() else {
            return false;
        };

        // Reap first: a zombie still shows up in the process table.
        match handle.child.try_wait() {
            Ok(Some(status)) => {
                info!(pid = handle.pid, ?status, "agent exited externally");
                self.handle = None;
                return false;
            }
            Ok(None) => {}
            Err(e) => {
                warn!(pid = handle.pid, error = %e, "try_wait failed, assuming dead");
                self.handle = None;
                return false;
            }
        }

        if pid_alive(handle.pid) {
            true
        } else {
            info!(pid = handle.pid, "agent pid no longer in process table");
            self.handle = None;
            false
        }
    }

    /// Last `tail` lines of the durable output log, read from the end.
    ///
    /// Purely read-only; the amount of file read is bounded by the
    /// requested line count, not by the file size. A missing log yields
    /// an empty tail.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::Control`] if the log exists but cannot
    /// be read.
    pub fn logs(&self, tail: usize) -> Result<LogTail, SupervisorError> {
        if !self.log_path.exists() {
            return Ok(LogTail {
                lines: Vec::new(),
                count: 0,
            });
        }

        let lines = tail_lines(&self.log_path, tail)
            .map_err(|e| SupervisorError::Control(format!("read log: {e}")))?;
        let count = lines.len();
        Ok(LogTail { lines, count })
    }

    /// Write one line to the agent's stdin.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::Control`] when the agent is not
    /// running, its stdin was not captured, or the write fails.
    pub fn send_input(&mut self, line: &str) -> Result<(), SupervisorError> {
        if !self.is_running() {
            return Err(SupervisorError::Control("agent is not running".to_owned()));
        }

        let stdin = self
            .handle
            .as_mut()
            .and_then(|h| h.stdin.as_mut())
            .ok_or_else(|| SupervisorError::Control("agent stdin not available".to_owned()))?;

        writeln!(stdin, "{line}").map_err(|e| SupervisorError::Control(format!("stdin: {e}")))?;
        stdin
            .flush()
            .map_err(|e| SupervisorError::Control(format!("stdin flush: {e}")))
    }
}

/// Send SIGTERM via the `kill` utility. Tolerates failure (the process
/// may already be gone); the caller escalates to a forced kill anyway.
fn send_sigterm(pid: u32) {
    let result = Command::new("kill")
        .arg(pid.to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();

    if let Err(e) = result {
        warn!(pid, error = %e, "failed to run kill");
    }
}

/// Check the OS process table for a pid using `kill -0`.
fn pid_alive(pid: u32) -> bool {
    Command::new("kill")
        .args(["-0", &pid.to_string()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Read the last `n` lines of a file by scanning backwards in chunks.
///
/// The amount of file read is bounded by the requested line count, not
/// the file size, so this stays cheap on large append-only logs.
///
/// # Errors
///
/// Returns an error if the file cannot be opened or read.
pub fn tail_lines(path: &Path, n: usize) -> std::io::Result<Vec<String>> {
    if n == 0 {
        return Ok(Vec::new());
    }

    let mut file = std::fs::File::open(path)?;
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(Vec::new());
    }

    // Walk backwards counting newlines until enough line boundaries have
    // been seen to cover the requested tail, or the start is reached.
    let mut offset = len;
    let mut newlines: usize = 0;
    let mut start: u64 = 0;
    let mut chunk = vec![0u8; usize::try_from(TAIL_CHUNK).unwrap_or(8192)];

    'scan: while offset > 0 {
        let take = offset.min(TAIL_CHUNK);
        offset = offset.saturating_sub(take);

        file.seek(SeekFrom::Start(offset))?;
        let read_len = usize::try_from(take).unwrap_or(chunk.len());
        let buf = &mut chunk[..read_len];
        file.read_exact(buf)?;

        for (i, byte) in buf.iter().enumerate().rev() {
            let pos = offset.saturating_add(u64::try_from(i).unwrap_or(u64::MAX));
            // The trailing newline of the final line is not a boundary
            // in front of a wanted line.
            if *byte == b'\n' && pos != len.saturating_sub(1) {
                newlines = newlines.saturating_add(1);
                if newlines >= n {
                    start = pos.saturating_add(1);
                    break 'scan;
                }
            }
        }
    }

    file.seek(SeekFrom::Start(start))?;
    let mut rest = Vec::new();
    file.read_to_end(&mut rest)?;

    // Arbitrary process output is not guaranteed to be valid UTF-8.
    let text = String::from_utf8_lossy(&rest);
    let mut lines: Vec<String> = text.lines().map(ToOwned::to_owned).collect();
    if lines.len() > n {
        lines.drain(..lines.len().saturating_sub(n));
    }
    Ok(lines)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_shorter_file_returns_everything() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("agent.log");
        std::fs::write(&path, "one\ntwo\nthree\n").expect("write");

        let supervisor = ProcessSupervisor::new(&path, Duration::from_secs(5));
        let tail = supervisor.logs(5).expect("logs");
        assert_eq!(tail.lines, vec!["one", "two", "three"]);
        assert_eq!(tail.count, 3);
    }

    #[test]
    fn tail_bounded_by_requested_count() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("agent.log");
        let body: String = (0..100).map(|i| format!("line {i}\n")).collect();
        std::fs::write(&path, body).expect("write");

        let supervisor = ProcessSupervisor::new(&path, Duration::from_secs(5));
        let tail = supervisor.logs(3).expect("logs");
        assert_eq!(tail.lines, vec!["line 97", "line 98", "line 99"]);
        assert_eq!(tail.count, 3);
    }

    #[test]
    fn tail_of_missing_log_is_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let supervisor =
            ProcessSupervisor::new(&dir.path().join("agent.log"), Duration::from_secs(5));

        let tail = supervisor.logs(10).expect("logs");
        assert!(tail.lines.is_empty());
        assert_eq!(tail.count, 0);
    }

    #[test]
    fn tail_handles_lines_larger_than_chunk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("agent.log");
        let long = "y".repeat(usize::try_from(TAIL_CHUNK).expect("chunk fits") * 2);
        std::fs::write(&path, format!("first\n{long}\nlast\n")).expect("write");

        let supervisor = ProcessSupervisor::new(&path, Duration::from_secs(5));
        let tail = supervisor.logs(2).expect("logs");
        assert_eq!(tail.count, 2);
        assert_eq!(tail.lines[0], long);
        assert_eq!(tail.lines[1], "last");
    }

    #[test]
    fn status_when_stopped_is_not_running() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut supervisor =
            ProcessSupervisor::new(&dir.path().join("agent.log"), Duration::from_secs(5));

        let status = supervisor.status();
        assert!(!status.running);
        assert_eq!(status.pid, None);
        assert_eq!(status.last_seen, None);
    }

    #[tokio::test]
    async fn stop_when_stopped_is_a_clean_no_op() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut supervisor =
            ProcessSupervisor::new(&dir.path().join("agent.log"), Duration::from_secs(5));

        let status = supervisor.stop().await.expect("stop");
        assert!(!status.running);
    }

    /// Write an executable shell script into `dir` and return its path.
    #[cfg(unix)]
    fn script(dir: &Path, name: &str, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("chmod script");
        path.to_string_lossy().into_owned()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn start_twice_keeps_the_same_pid() {
        let dir = tempfile::tempdir().expect("tempdir");
        let agent = script(dir.path(), "agent.sh", "sleep 30");
        let mut supervisor =
            ProcessSupervisor::new(&dir.path().join("agent.log"), Duration::from_secs(2));

        let first = supervisor.start(&agent).expect("first start");
        let second = supervisor.start(&agent).expect("second start");
        assert!(first.running && second.running);
        assert_eq!(first.pid, second.pid);

        let stopped = supervisor.stop().await.expect("stop");
        assert!(!stopped.running);
        assert!(supervisor.status().pid.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn external_death_detected_on_status() {
        let dir = tempfile::tempdir().expect("tempdir");
        let agent = script(dir.path(), "agent.sh", "exit 0");
        let mut supervisor =
            ProcessSupervisor::new(&dir.path().join("agent.log"), Duration::from_secs(2));

        supervisor.start(&agent).expect("start");

        // Give the short-lived script a moment to exit on its own.
        tokio::time::sleep(Duration::from_millis(300)).await;

        let status = supervisor.status();
        assert!(!status.running);
        assert_eq!(status.pid, None);

        // A subsequent stop is a clean no-op.
        let stopped = supervisor.stop().await.expect("stop");
        assert!(!stopped.running);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn output_appends_across_restarts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = dir.path().join("agent.log");
        let agent = script(dir.path(), "agent.sh", "echo run");
        let mut supervisor = ProcessSupervisor::new(&log, Duration::from_secs(2));

        supervisor.start(&agent).expect("first run");
        tokio::time::sleep(Duration::from_millis(300)).await;
        supervisor.start(&agent).expect("second run");
        tokio::time::sleep(Duration::from_millis(300)).await;

        // The log is appended to, never truncated.
        let tail = supervisor.logs(10).expect("logs");
        assert_eq!(tail.lines, vec!["run", "run"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn send_input_reaches_agent_stdin() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = dir.path().join("agent.log");
        // `cat` echoes stdin to stdout, which lands in the output log.
        let agent = script(dir.path(), "agent.sh", "cat");
        let mut supervisor = ProcessSupervisor::new(&log, Duration::from_secs(2));

        supervisor.start(&agent).expect("start");
        supervisor.send_input("hello agent").expect("send input");
        tokio::time::sleep(Duration::from_millis(300)).await;

        let tail = supervisor.logs(5).expect("logs");
        assert!(tail.lines.iter().any(|l| l == "hello agent"));

        supervisor.stop().await.expect("stop");
    }

    #[test]
    fn missing_executable_is_a_launch_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut supervisor =
            ProcessSupervisor::new(&dir.path().join("agent.log"), Duration::from_secs(5));

        let result = supervisor.start("definitely-not-a-real-binary-3141");
        assert!(matches!(result, Err(SupervisorError::Launch(_))));
        assert!(!supervisor.status().running);
    }
}
