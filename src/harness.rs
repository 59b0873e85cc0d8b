use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::build::ExecutableArtifact;
use crate::error::{CalibrationError, Result};
use crate::process::{ExitOutcome, Runner};

/// Fraction of samples dropped from each end before averaging.
pub const DEFAULT_TRIM_FRACTION: f64 = 0.2;

/// Fewest samples a trimmed subset may keep; below this the whole sample is used.
pub const MIN_TRIMMED_SAMPLES: usize = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Profile {
    Quick,
    Full,
}

impl Profile {
    pub fn as_str(&self) -> &'static str {
        match self {
            Profile::Quick => "quick",
            Profile::Full => "full",
        }
    }

    pub fn warmup_runs(&self) -> u32 {
        match self {
            Profile::Quick => 2,
            Profile::Full => 3,
        }
    }

    pub fn runs(&self) -> u32 {
        match self {
            Profile::Quick => 5,
            Profile::Full => 15,
        }
    }

    /// Repetition counts for one calibration series, doubling from the base.
    pub fn repetition_counts(&self) -> Vec<u64> {
        let base: u64 = match self {
            Profile::Quick => 100_000,
            Profile::Full => 1_000_000,
        };
        (0..6).map(|i| base << i).collect()
    }

    /// Measured runs for a fixed-size workload's coarse timing sample.
    pub fn fixed_runs(&self) -> u32 {
        match self {
            Profile::Quick => 1_000,
            Profile::Full => 10_000,
        }
    }

    pub fn run_timeout(&self) -> Duration {
        match self {
            Profile::Quick => Duration::from_secs(30),
            Profile::Full => Duration::from_secs(120),
        }
    }
}

/// Parameters of one measurement call.
#[derive(Clone, Debug)]
pub struct HarnessConfig {
    pub runs: u32,
    pub warmup_runs: u32,
    pub trim_fraction: f64,
    /// Limit for each individual run.
    pub timeout: Duration,
}

impl HarnessConfig {
    pub fn for_profile(profile: Profile) -> Self {
        Self {
            runs: profile.runs(),
            warmup_runs: profile.warmup_runs(),
            trim_fraction: DEFAULT_TRIM_FRACTION,
            timeout: profile.run_timeout(),
        }
    }
}

/// One timed execution.
#[derive(Clone, Copy, Debug)]
pub struct TimingSample {
    pub elapsed: Duration,
    pub exit: ExitOutcome,
}

impl TimingSample {
    pub fn millis(&self) -> f64 {
        self.elapsed.as_secs_f64() * 1_000.0
    }
}

/// Central estimate and dispersion of a sample.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SampleSummary {
    pub mean: f64,
    pub std_dev: f64,
    /// Samples that contributed after trimming.
    pub used: usize,
    pub total: usize,
}

/// Reduced timing of one workload instance.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TimingObservation {
    pub work_units: u64,
    pub time_ms: f64,
    pub std_ms: f64,
    pub runs_used: usize,
}

/// Trimmed mean and the population standard deviation of the same subset.
///
/// Sorts, drops `floor(n * trim_fraction)` samples from each end and averages
/// the rest. When fewer than [`MIN_TRIMMED_SAMPLES`] would remain, every
/// sample is used instead.
pub fn trimmed_stats(samples: &[f64], trim_fraction: f64) -> Result<SampleSummary> {
    if samples.is_empty() {
        return Err(CalibrationError::NoSamples);
    }

    let mut sorted = samples.to_vec();
    sorted.sort_by(f64::total_cmp);

    let n = sorted.len();
    let fraction = if trim_fraction.is_finite() {
        trim_fraction.clamp(0.0, 0.5)
    } else {
        0.0
    };
    let cut = (n as f64 * fraction).floor() as usize;
    let kept = if n.saturating_sub(2 * cut) >= MIN_TRIMMED_SAMPLES {
        &sorted[cut..n - cut]
    } else {
        &sorted[..]
    };

    let len = kept.len() as f64;
    let mean = kept.iter().sum::<f64>() / len;
    let var = kept.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / len;

    Ok(SampleSummary {
        mean,
        std_dev: var.sqrt(),
        used: kept.len(),
        total: n,
    })
}

pub fn trimmed_mean(samples: &[f64], trim_fraction: f64) -> Result<f64> {
    trimmed_stats(samples, trim_fraction).map(|s| s.mean)
}

/// Time `cfg.runs` executions of `artifact` after `cfg.warmup_runs` discarded ones.
///
/// Warmup runs are not checked against `expected_exit`; any measured run that
/// disagrees fails the whole measurement.
pub fn measure<R: Runner + ?Sized>(
    runner: &R,
    artifact: &ExecutableArtifact,
    expected_exit: Option<i32>,
    work_units: u64,
    cfg: &HarnessConfig,
) -> Result<TimingObservation> {
    if cfg.runs == 0 {
        return Err(CalibrationError::NoSamples);
    }

    for _ in 0..cfg.warmup_runs {
        runner.run(artifact.path(), cfg.timeout)?;
    }

    let mut times_ms = Vec::with_capacity(cfg.runs as usize);
    for i in 0..cfg.runs {
        let start = Instant::now();
        let exit = runner.run(artifact.path(), cfg.timeout)?;
        let sample = TimingSample {
            elapsed: start.elapsed(),
            exit,
        };

        if let Some(expected) = expected_exit {
            if !sample.exit.matches(expected) {
                return Err(CalibrationError::UnexpectedExitCode {
                    expected,
                    actual: sample.exit.code,
                });
            }
        }
        trace!(run = i, ms = sample.millis(), "harness.sample");
        times_ms.push(sample.millis());
    }

    let summary = trimmed_stats(&times_ms, cfg.trim_fraction)?;
    debug!(
        work_units,
        mean_ms = summary.mean,
        std_ms = summary.std_dev,
        used = summary.used,
        total = summary.total,
        "harness.reduced"
    );

    Ok(TimingObservation {
        work_units,
        time_ms: summary.mean,
        std_ms: summary.std_dev,
        runs_used: summary.used,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::path::Path;

    /// Returns the scripted exit codes in order, repeating the last one.
    struct ScriptedRunner {
        codes: Vec<i32>,
        calls: RefCell<usize>,
    }

    impl ScriptedRunner {
        fn new(codes: Vec<i32>) -> Self {
            Self {
                codes,
                calls: RefCell::new(0),
            }
        }
    }

    impl Runner for ScriptedRunner {
        fn run(&self, _program: &Path, _timeout: Duration) -> Result<ExitOutcome> {
            let mut calls = self.calls.borrow_mut();
            let code = self.codes[(*calls).min(self.codes.len() - 1)];
            *calls += 1;
            Ok(ExitOutcome { code: Some(code) })
        }
    }

    fn cfg(runs: u32, warmup_runs: u32) -> HarnessConfig {
        HarnessConfig {
            runs,
            warmup_runs,
            trim_fraction: DEFAULT_TRIM_FRACTION,
            timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn constant_sample_is_its_own_mean() {
        let samples = vec![4.25; 11];
        for frac in [0.0, 0.1, 0.2, 0.45] {
            let s = trimmed_stats(&samples, frac).unwrap();
            assert_eq!(s.mean, 4.25);
            assert_eq!(s.std_dev, 0.0);
        }
    }

    #[test]
    fn small_samples_use_plain_mean() {
        assert_eq!(trimmed_mean(&[2.0, 4.0], 0.2).unwrap(), 3.0);
        assert_eq!(trimmed_mean(&[7.0], 0.4).unwrap(), 7.0);
    }

    #[test]
    fn trims_both_tails() {
        let samples = [100.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0];
        let s = trimmed_stats(&samples, 0.1).unwrap();
        assert_eq!(s.used, 8);
        assert_eq!(s.total, 10);
        assert!((s.mean - 5.5).abs() < 1e-12);
        assert!((s.std_dev - 5.25f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn over_trimming_falls_back_to_all_samples() {
        // 4 samples at 40% would keep only 2.
        let s = trimmed_stats(&[1.0, 2.0, 3.0, 10.0], 0.4).unwrap();
        assert_eq!(s.used, 4);
        assert_eq!(s.mean, 4.0);
    }

    #[test]
    fn empty_sample_is_an_error() {
        assert!(matches!(
            trimmed_stats(&[], 0.2),
            Err(CalibrationError::NoSamples)
        ));
    }

    #[test]
    fn warmup_runs_skip_exit_check() {
        // Two failing warmups, then clean measured runs.
        let runner = ScriptedRunner::new(vec![1, 1, 0]);
        let art = ExecutableArtifact::prebuilt("/bin/true");
        let obs = measure(&runner, &art, Some(0), 1_000, &cfg(5, 2)).unwrap();
        assert_eq!(*runner.calls.borrow(), 7);
        assert_eq!(obs.work_units, 1_000);
        assert_eq!(obs.runs_used, 3);
        assert!(obs.time_ms >= 0.0);
    }

    #[test]
    fn measured_exit_mismatch_fails() {
        let runner = ScriptedRunner::new(vec![0, 0, 0, 9]);
        let art = ExecutableArtifact::prebuilt("/bin/true");
        let err = measure(&runner, &art, Some(0), 10, &cfg(5, 1)).unwrap_err();
        assert!(matches!(
            err,
            CalibrationError::UnexpectedExitCode {
                expected: 0,
                actual: Some(9)
            }
        ));
    }

    #[test]
    fn no_expected_code_accepts_anything() {
        let runner = ScriptedRunner::new(vec![42]);
        let art = ExecutableArtifact::prebuilt("/bin/true");
        assert!(measure(&runner, &art, None, 10, &cfg(3, 0)).is_ok());
    }

    #[test]
    fn zero_runs_is_rejected() {
        let runner = ScriptedRunner::new(vec![0]);
        let art = ExecutableArtifact::prebuilt("/bin/true");
        assert!(matches!(
            measure(&runner, &art, None, 10, &cfg(0, 3)),
            Err(CalibrationError::NoSamples)
        ));
    }

    #[test]
    fn profile_counts_double() {
        let counts = Profile::Full.repetition_counts();
        assert_eq!(counts.first(), Some(&1_000_000));
        assert_eq!(counts.last(), Some(&32_000_000));
        assert!(counts.windows(2).all(|w| w[1] == 2 * w[0]));
    }
}
