//! Error types for calibration, measurement and comparison.

use std::time::Duration;

/// Errors that can occur while generating, building, measuring or fitting a
/// calibration workload.
#[derive(Debug, thiserror::Error)]
pub enum CalibrationError {
    /// Template name is not in the registry.
    #[error("unknown workload template: {name}")]
    UnknownTemplate {
        /// The name that failed to resolve.
        name: String,
    },

    /// Repetition count cannot be materialized by the count encoder.
    #[error("repetition count {count} too large (max {max})")]
    RepetitionCountTooLarge {
        /// Requested repetition count.
        count: u64,
        /// Largest encodable count.
        max: u64,
    },

    /// A loop must execute at least once to carry any work.
    #[error("repetition count must be at least 1")]
    ZeroRepetitions,

    /// Total work (instructions per iteration * repetitions) overflowed.
    #[error("total work overflows u64 ({per_iteration} x {count})")]
    WorkOverflow {
        /// Declared instructions per iteration.
        per_iteration: u64,
        /// Requested repetition count.
        count: u64,
    },

    /// The external toolchain rejected the generated source.
    #[error("build failed during {stage}: {stderr}")]
    BuildFailed {
        /// Toolchain stage that failed (e.g. "assemble", "link").
        stage: String,
        /// Captured diagnostic output.
        stderr: String,
    },

    /// A measured run exited with a status other than the expected one.
    #[error("unexpected exit code: expected {expected}, got {actual:?}")]
    UnexpectedExitCode {
        /// Exit code the workload is required to return.
        expected: i32,
        /// Observed exit code; `None` when terminated by a signal.
        actual: Option<i32>,
    },

    /// An external process exceeded its time limit and was killed.
    #[error("{what} timed out after {limit:?}")]
    Timeout {
        /// What was running ("build", "run").
        what: String,
        /// The limit that was exceeded.
        limit: Duration,
    },

    /// Not enough distinct work-unit values to separate slope from intercept.
    #[error("insufficient data points: {distinct} distinct, need {required}")]
    InsufficientDataPoints {
        /// Distinct usable work-unit values.
        distinct: usize,
        /// Minimum required.
        required: usize,
    },

    /// A latency or CPI value that is zero, negative or not finite.
    #[error("invalid metric {what}: {value}")]
    InvalidMetric {
        /// Which quantity was rejected.
        what: String,
        /// The rejected value.
        value: f64,
    },

    /// The least-squares solver could not produce a solution.
    #[error("least-squares solve failed: {detail}")]
    Solver {
        /// Solver diagnostic.
        detail: String,
    },

    /// Retired instructions of an executable could not be read.
    #[error("instruction count unavailable for {program}: {detail}")]
    InstructionCount {
        /// Executable that was counted.
        program: String,
        /// Why no count was obtained.
        detail: String,
    },

    /// The harness was asked to reduce an empty sample.
    #[error("no timing samples to reduce")]
    NoSamples,

    /// I/O error spawning processes or reading/writing files.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML manifest parse error.
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl CalibrationError {
    pub(crate) fn invalid_metric(what: &str, value: f64) -> Self {
        Self::InvalidMetric {
            what: what.to_string(),
            value,
        }
    }
}

/// Result type for calibration operations.
pub type Result<T> = std::result::Result<T, CalibrationError>;
