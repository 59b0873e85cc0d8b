use serde::{Deserialize, Serialize};

use crate::accuracy::{AccuracyRecord, SuiteSummary};
use crate::metrics::{DerivedMetric, EstimationMethod};

pub const SCHEMA_VERSION: u32 = 1;

/// R² stored for analytical entries, which have no fit.
pub const ANALYTICAL_R_SQUARED: f64 = 0.995;

pub const METHODOLOGY: &str = "Linear regression over repetition counts: \
time = slope * instructions + overhead. The slope is the per-instruction cost \
with process startup and other fixed overhead separated out. Fixed-size \
workloads use an analytical CPI.";

pub const FORMULA: &str = "cpi = latency_ns_per_instruction * reference_frequency_ghz";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMeta {
    pub schema_version: u32,
    pub tool_version: String,
    pub profile: String,
    pub seed: u64,
    pub timestamp_utc: String,
    pub git_sha: Option<String>,
}

/// One measured size of a calibration series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    pub instructions: u64,
    pub repetitions: u64,
    pub time_ms: f64,
    pub std_ms: f64,
    /// Hash of the generated source; absent for externally built kernels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_sha256: Option<String>,
}

/// A size that was dropped from the series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedPoint {
    pub repetitions: u64,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationRecord {
    pub name: String,
    pub description: String,
    pub instructions_per_iteration: u64,
    pub latency_ns_per_instruction: f64,
    /// Fitted intercept; `None` for analytical entries.
    pub overhead_ms: Option<f64>,
    pub cpi: f64,
    pub ipc: Option<f64>,
    pub r_squared: f64,
    pub reference_frequency_ghz: f64,
    pub estimation_method: EstimationMethod,
    pub calibrated: bool,
    /// CPI implied by the coarse timing of an analytical entry. Diagnostic only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub empirical_cpi: Option<f64>,
    #[serde(default)]
    pub data_points: Vec<DataPoint>,
    #[serde(default)]
    pub skipped_points: Vec<SkippedPoint>,
}

impl CalibrationRecord {
    /// The record's values as a metric, for accuracy comparison.
    pub fn metric(&self) -> DerivedMetric {
        DerivedMetric {
            latency_ns: self.latency_ns_per_instruction,
            cycles_per_unit: self.cpi,
            units_per_cycle: self.ipc,
            reference_frequency_ghz: self.reference_frequency_ghz,
            method: self.estimation_method,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkFailure {
    pub name: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSummary {
    pub calibrated: usize,
    pub analytical: usize,
    pub failed: usize,
}

impl CalibrationSummary {
    pub fn tally(records: &[CalibrationRecord], failures: &[BenchmarkFailure]) -> Self {
        let calibrated = records.iter().filter(|r| r.calibrated).count();
        Self {
            calibrated,
            analytical: records.len() - calibrated,
            failed: failures.len(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationReport {
    pub run: RunMeta,
    pub methodology: String,
    pub formula: String,
    pub reference_frequency_ghz: f64,
    pub results: Vec<CalibrationRecord>,
    pub summary: CalibrationSummary,
    #[serde(default)]
    pub failures: Vec<BenchmarkFailure>,
}

impl CalibrationReport {
    /// Fold a newer run into this report.
    ///
    /// Entries and failures named in the newer run replace the old ones;
    /// everything else is kept. The summary is recounted.
    pub fn merge(&mut self, records: Vec<CalibrationRecord>, failures: Vec<BenchmarkFailure>) {
        let replaced = |name: &str| {
            records.iter().any(|r| r.name == name) || failures.iter().any(|f| f.name == name)
        };
        self.results.retain(|r| !replaced(&r.name));
        self.failures.retain(|f| !replaced(&f.name));
        self.results.extend(records);
        self.failures.extend(failures);
        self.summary = CalibrationSummary::tally(&self.results, &self.failures);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccuracyReport {
    pub run: RunMeta,
    pub reference_frequency_ghz: f64,
    pub benchmarks: Vec<AccuracyRecord>,
    pub summary: SuiteSummary,
}
