//! Process execution with a hard time limit.
//!
//! The harness times each run around [`Runner::run`]; the runner itself only
//! launches, waits and reports the exit status. Output streams are discarded.

use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::error::{CalibrationError, Result};

/// Exit status of one execution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExitOutcome {
    /// Exit code; `None` when the process was terminated by a signal.
    pub code: Option<i32>,
}

impl ExitOutcome {
    pub fn matches(&self, expected: i32) -> bool {
        self.code == Some(expected)
    }
}

impl From<ExitStatus> for ExitOutcome {
    fn from(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
        }
    }
}

/// Runs an executable to completion.
pub trait Runner {
    fn run(&self, program: &Path, timeout: Duration) -> Result<ExitOutcome>;
}

/// Spawns real child processes.
#[derive(Clone, Debug)]
pub struct ProcessRunner {
    /// Granularity of the completion check. Bounds the timing error added to
    /// each measured run.
    pub poll_interval: Duration,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_micros(50),
        }
    }
}

impl Runner for ProcessRunner {
    fn run(&self, program: &Path, timeout: Duration) -> Result<ExitOutcome> {
        let mut cmd = Command::new(program);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        let status = run_with_timeout(&mut cmd, timeout, self.poll_interval, "run")?;
        Ok(status.into())
    }
}

/// Spawn `cmd` and wait for it, killing it once `timeout` has elapsed.
///
/// The caller configures stdio; piped streams are not drained here, so
/// redirect verbose output to a file or `Stdio::null()`.
pub fn run_with_timeout(
    cmd: &mut Command,
    timeout: Duration,
    poll_interval: Duration,
    what: &str,
) -> Result<ExitStatus> {
    let mut child = cmd.spawn()?;
    wait_with_timeout(&mut child, timeout, poll_interval, what)
}

fn wait_with_timeout(
    child: &mut Child,
    timeout: Duration,
    poll_interval: Duration,
    what: &str,
) -> Result<ExitStatus> {
    // `None` when the limit is too large to represent: wait indefinitely.
    let deadline = Instant::now().checked_add(timeout);
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            warn!(what, limit_ms = timeout.as_millis() as u64, "process.timeout");
            // The child may exit between the check and the kill.
            let _ = child.kill();
            let _ = child.wait();
            return Err(CalibrationError::Timeout {
                what: what.to_string(),
                limit: timeout,
            });
        }
        thread::sleep(poll_interval);
    }
}
