//! Run configuration and the fixed-size workload manifest.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CalibrationError, Result};
use crate::harness::{HarnessConfig, Profile};
use crate::metrics::DEFAULT_REFERENCE_FREQUENCY_GHZ;
use crate::regression::RegressionBackend;
use crate::workload::TargetAbi;

/// Fewest distinct successful sizes a benchmark needs before it is fitted.
pub const DEFAULT_MIN_POINTS: usize = 3;

pub const DEFAULT_BUILD_TIMEOUT: Duration = Duration::from_secs(60);

/// Everything a calibration run needs. Built once, passed by reference.
#[derive(Clone, Debug)]
pub struct CalibrationConfig {
    pub profile: Profile,
    pub harness: HarnessConfig,
    /// Repetition counts, measured in ascending order.
    pub repetition_counts: Vec<u64>,
    pub min_points: usize,
    pub reference_frequency_ghz: f64,
    pub backend: RegressionBackend,
    pub abi: TargetAbi,
    pub build_timeout: Duration,
    /// Measured runs for a fixed-size workload's timing sample.
    pub fixed_runs: u32,
    pub seed: u64,
}

impl CalibrationConfig {
    pub fn for_profile(profile: Profile) -> Self {
        Self {
            profile,
            harness: HarnessConfig::for_profile(profile),
            repetition_counts: profile.repetition_counts(),
            min_points: DEFAULT_MIN_POINTS,
            reference_frequency_ghz: DEFAULT_REFERENCE_FREQUENCY_GHZ,
            backend: RegressionBackend::default(),
            abi: TargetAbi::host(),
            build_timeout: DEFAULT_BUILD_TIMEOUT,
            fixed_runs: profile.fixed_runs(),
            seed: 0,
        }
    }

    pub fn with_repetition_counts(mut self, mut counts: Vec<u64>) -> Self {
        counts.sort_unstable();
        counts.dedup();
        self.repetition_counts = counts;
        self
    }

    /// Harness parameters for a fixed-size workload's coarse timing.
    pub fn fixed_harness(&self) -> HarnessConfig {
        HarnessConfig {
            runs: self.fixed_runs,
            ..self.harness.clone()
        }
    }
}

/// A prebuilt workload whose cost is supplied analytically.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FixedWorkload {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub instructions_per_iteration: u64,
    /// Relative paths resolve against the manifest's directory.
    pub executable: PathBuf,
    #[serde(default)]
    pub expected_exit_code: i32,
    pub expected_cpi: f64,
}

/// `[[workload]]` tables of a TOML manifest.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FixedWorkloadManifest {
    #[serde(default, rename = "workload")]
    pub workloads: Vec<FixedWorkload>,
}

impl FixedWorkloadManifest {
    pub fn from_toml(text: &str) -> Result<Self> {
        let manifest: Self = toml::from_str(text)?;
        for w in &manifest.workloads {
            if !(w.expected_cpi.is_finite() && w.expected_cpi > 0.0) {
                return Err(CalibrationError::InvalidMetric {
                    what: format!("expected_cpi of {}", w.name),
                    value: w.expected_cpi,
                });
            }
        }
        Ok(manifest)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let mut manifest = Self::from_toml(&fs::read_to_string(path)?)?;
        if let Some(base) = path.parent() {
            for w in &mut manifest.workloads {
                if w.executable.is_relative() {
                    w.executable = base.join(&w.executable);
                }
            }
        }
        Ok(manifest)
    }
}

/// Repetition-count tier of an external kernel.
///
/// A cubic kernel retires far more instructions per call, so it needs fewer
/// calls to span the same range of run times.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KernelComplexity {
    Cubic,
    Quadratic,
}

impl KernelComplexity {
    pub fn repetition_counts(&self) -> Vec<u64> {
        match self {
            KernelComplexity::Cubic => vec![10, 50, 100, 500, 1_000, 5_000],
            KernelComplexity::Quadratic => vec![100, 500, 1_000, 5_000, 10_000, 50_000],
        }
    }
}

/// An externally built kernel calibrated by regression.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KernelSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub complexity: KernelComplexity,
    /// Overrides the tier's counts.
    #[serde(default)]
    pub repetition_counts: Option<Vec<u64>>,
    #[serde(default)]
    pub expected_exit_code: i32,
}

impl KernelSpec {
    /// Counts to measure, ascending and without duplicates.
    pub fn counts(&self) -> Vec<u64> {
        let mut counts = self
            .repetition_counts
            .clone()
            .unwrap_or_else(|| self.complexity.repetition_counts());
        counts.sort_unstable();
        counts.dedup();
        counts
    }
}

fn default_binary_pattern() -> String {
    "{name}_native_r{reps}".to_string()
}

/// Build script plus `[[kernel]]` tables.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KernelManifest {
    /// Invoked as `<build_script> <name> <repetitions>`.
    pub build_script: PathBuf,
    /// Working directory of the script and location of its output;
    /// the manifest's directory when omitted.
    #[serde(default)]
    pub build_dir: Option<PathBuf>,
    #[serde(default = "default_binary_pattern")]
    pub binary_pattern: String,
    #[serde(default, rename = "kernel")]
    pub kernels: Vec<KernelSpec>,
}

impl KernelManifest {
    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let mut manifest = Self::from_toml(&fs::read_to_string(path)?)?;
        // Absolute, because the script runs with `build_dir` as its working directory.
        let base = std::env::current_dir()?.join(path.parent().unwrap_or_else(|| Path::new("")));
        if manifest.build_script.is_relative() {
            manifest.build_script = base.join(&manifest.build_script);
        }
        manifest.build_dir = Some(match manifest.build_dir.take() {
            Some(dir) if dir.is_relative() => base.join(dir),
            Some(dir) => dir,
            None => base.to_path_buf(),
        });
        Ok(manifest)
    }

    pub fn build_dir(&self) -> &Path {
        self.build_dir.as_deref().unwrap_or_else(|| Path::new("."))
    }

    /// Restrict to the named kernels; an empty selection keeps all of them.
    pub fn select<S: AsRef<str>>(&self, names: &[S]) -> Result<Vec<&KernelSpec>> {
        if names.is_empty() {
            return Ok(self.kernels.iter().collect());
        }
        names
            .iter()
            .map(|n| {
                let n = n.as_ref();
                self.kernels
                    .iter()
                    .find(|k| k.name == n)
                    .ok_or_else(|| CalibrationError::UnknownTemplate {
                        name: n.to_string(),
                    })
            })
            .collect()
    }
}
