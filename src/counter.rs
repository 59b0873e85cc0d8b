//! Retired-instruction counting for executables whose work is not known
//! from a template.

use std::fs;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;

use tracing::debug;

use crate::error::{CalibrationError, Result};
use crate::process::run_with_timeout;

/// Reports how many instructions one run of a program retires.
pub trait InstructionCounter {
    fn count(&self, program: &Path) -> Result<u64>;
}

/// External tool that reads the hardware instruction counter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CounterTool {
    /// BSD `time -l`, which prints "instructions retired" on macOS.
    BsdTime,
    /// `perf stat` in CSV mode.
    Perf,
}

impl CounterTool {
    pub fn host() -> Self {
        if cfg!(target_os = "macos") {
            CounterTool::BsdTime
        } else {
            CounterTool::Perf
        }
    }

    fn command(&self, program: &Path) -> Command {
        match self {
            CounterTool::BsdTime => {
                let mut cmd = Command::new("/usr/bin/time");
                cmd.arg("-l").arg(program);
                cmd
            }
            CounterTool::Perf => {
                let mut cmd = Command::new("perf");
                cmd.args(["stat", "-x", ",", "-e", "instructions:u"]).arg(program);
                cmd
            }
        }
    }

    /// Extract the count from the tool's stderr.
    pub fn parse(&self, report: &str) -> Option<u64> {
        match self {
            CounterTool::BsdTime => parse_bsd_time(report),
            CounterTool::Perf => parse_perf_csv(report),
        }
    }
}

fn parse_bsd_time(report: &str) -> Option<u64> {
    report
        .lines()
        .find(|l| l.contains("instructions retired"))
        .and_then(|l| l.split_whitespace().next())
        .and_then(|n| n.parse().ok())
}

// `<value>,<unit>,<event>,...`; the value is `<not counted>` when unavailable.
fn parse_perf_csv(report: &str) -> Option<u64> {
    report.lines().find_map(|l| {
        let mut fields = l.split(',');
        let value = fields.next()?;
        let _unit = fields.next()?;
        let event = fields.next()?;
        if event.starts_with("instructions") {
            value.trim().parse().ok()
        } else {
            None
        }
    })
}

/// Counts by running the program once under a [`CounterTool`].
///
/// The program's own exit status is ignored.
#[derive(Clone, Debug)]
pub struct HardwareCounter {
    pub tool: CounterTool,
    pub timeout: Duration,
}

impl HardwareCounter {
    pub fn for_host(timeout: Duration) -> Self {
        Self {
            tool: CounterTool::host(),
            timeout,
        }
    }
}

impl InstructionCounter for HardwareCounter {
    fn count(&self, program: &Path) -> Result<u64> {
        let log = tempfile::NamedTempFile::new()?;
        let mut cmd = self.tool.command(program);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(log.reopen()?));
        run_with_timeout(&mut cmd, self.timeout, Duration::from_millis(1), "count")?;

        let report = fs::read_to_string(log.path())?;
        let count = self.tool.parse(&report).ok_or_else(|| CalibrationError::InstructionCount {
            program: program.display().to_string(),
            detail: format!("no instruction count in {:?} output", self.tool),
        })?;
        debug!(program = %program.display(), count, "counter.read");
        Ok(count)
    }
}
