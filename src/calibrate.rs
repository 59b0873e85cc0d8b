//! Per-benchmark calibration and suite orchestration.
//!
//! A calibration series is measured one size at a time in ascending order.
//! Measurement failures and timeouts drop that size and are recorded; any
//! other build failure ends a template benchmark. A benchmark left with fewer than
//! [`CalibrationConfig::min_points`] distinct sizes fails on its own without
//! stopping the suite.

use tracing::{info, warn};

use crate::build::{Builder, ExecutableArtifact, KernelBuilder};
use crate::config::{CalibrationConfig, FixedWorkload, FixedWorkloadManifest, KernelSpec};
use crate::counter::InstructionCounter;
use crate::error::{CalibrationError, Result};
use crate::harness::{measure, TimingObservation};
use crate::metrics::{
    derive_from_analytical_estimate, derive_from_fit, DerivedMetric, EmpiricalSample, TimeUnit,
};
use crate::process::Runner;
use crate::regression::{CalibrationSeries, FitResult, MIN_DISTINCT_POINTS};
use crate::schema::{
    BenchmarkFailure, CalibrationRecord, CalibrationSummary, DataPoint, SkippedPoint,
    ANALYTICAL_R_SQUARED,
};
use crate::workload::{WorkloadInstance, WorkloadKind, WorkloadRegistry};

/// Generated workloads exit with this code.
pub const GENERATED_EXIT_CODE: i32 = 0;

/// Records and failures of a suite run.
#[derive(Clone, Debug, Default)]
pub struct SuiteOutcome {
    pub records: Vec<CalibrationRecord>,
    pub failures: Vec<BenchmarkFailure>,
}

impl SuiteOutcome {
    fn push(&mut self, name: &str, result: Result<CalibrationRecord>) {
        match result {
            Ok(record) => self.records.push(record),
            Err(e) => {
                warn!(benchmark = name, error = %e, "benchmark.failed");
                self.failures.push(BenchmarkFailure {
                    name: name.to_string(),
                    reason: e.to_string(),
                });
            }
        }
    }

    pub fn extend(&mut self, other: SuiteOutcome) {
        self.records.extend(other.records);
        self.failures.extend(other.failures);
    }

    pub fn summary(&self) -> CalibrationSummary {
        CalibrationSummary::tally(&self.records, &self.failures)
    }
}

fn skip(skipped: &mut Vec<SkippedPoint>, name: &str, repetitions: u64, error: &CalibrationError) {
    warn!(benchmark = name, repetitions, error = %error, "point.skipped");
    skipped.push(SkippedPoint {
        repetitions,
        reason: error.to_string(),
    });
}

/// Drives generation, build, measurement and fitting with the given collaborators.
pub struct Calibrator<'a, B: ?Sized, R: ?Sized> {
    builder: &'a B,
    runner: &'a R,
    config: &'a CalibrationConfig,
}

impl<'a, B: Builder + ?Sized, R: Runner + ?Sized> Calibrator<'a, B, R> {
    pub fn new(builder: &'a B, runner: &'a R, config: &'a CalibrationConfig) -> Self {
        Self {
            builder,
            runner,
            config,
        }
    }

    pub fn config(&self) -> &CalibrationConfig {
        self.config
    }

    /// Build the instance. The artifact and its temporary directory are
    /// released when the returned value is dropped.
    fn build(&self, instance: &WorkloadInstance) -> Result<(ExecutableArtifact, String)> {
        let source = instance.source()?;
        let sha = crate::workload::sha256_hex(source.as_bytes());
        Ok((self.builder.build(&source)?, sha))
    }

    fn time(&self, artifact: &ExecutableArtifact, work_units: u64) -> Result<TimingObservation> {
        measure(
            self.runner,
            artifact,
            Some(GENERATED_EXIT_CODE),
            work_units,
            &self.config.harness,
        )
    }

    /// Fit a series once it has enough distinct sizes.
    fn fit(&self, name: &str, series: &CalibrationSeries) -> Result<(FitResult, DerivedMetric)> {
        let required = self.config.min_points.max(MIN_DISTINCT_POINTS);
        let distinct = series.distinct_work_units();
        if distinct < required {
            return Err(CalibrationError::InsufficientDataPoints { distinct, required });
        }

        let fit = self.config.backend.fitter().fit(series)?;
        let metric = derive_from_fit(
            &fit,
            TimeUnit::Milliseconds,
            self.config.reference_frequency_ghz,
        )?;
        info!(
            benchmark = name,
            latency_ns = metric.latency_ns,
            cpi = metric.cycles_per_unit,
            r_squared = fit.r_squared,
            backend = self.config.backend.as_str(),
            "benchmark.calibrated"
        );
        Ok((fit, metric))
    }

    /// Measure every configured size of `kind` and fit the series.
    pub fn calibrate(&self, kind: WorkloadKind) -> Result<CalibrationRecord> {
        let name = kind.name();
        let mut series = CalibrationSeries::new();
        let mut data_points = Vec::new();
        let mut skipped_points = Vec::new();

        let mut counts = self.config.repetition_counts.clone();
        counts.sort_unstable();
        counts.dedup();

        for repetitions in counts {
            let instance = match WorkloadInstance::new(kind, repetitions, self.config.abi) {
                Ok(i) => i,
                Err(e) => {
                    skip(&mut skipped_points, name, repetitions, &e);
                    continue;
                }
            };
            let work_units = instance.total_work()?;
            let (artifact, source_sha256) = match self.build(&instance) {
                Ok(built) => built,
                Err(e @ CalibrationError::Timeout { .. }) => {
                    skip(&mut skipped_points, name, repetitions, &e);
                    continue;
                }
                Err(e) => return Err(e),
            };

            match self.time(&artifact, work_units) {
                Ok(obs) => {
                    info!(
                        benchmark = name,
                        repetitions,
                        instructions = work_units,
                        time_ms = obs.time_ms,
                        "point.measured"
                    );
                    data_points.push(DataPoint {
                        instructions: work_units,
                        repetitions,
                        time_ms: obs.time_ms,
                        std_ms: obs.std_ms,
                        source_sha256: Some(source_sha256),
                    });
                    series.push(obs);
                }
                Err(e) => skip(&mut skipped_points, name, repetitions, &e),
            }
        }

        let (fit, metric) = self.fit(name, &series)?;

        Ok(CalibrationRecord {
            name: name.to_string(),
            description: kind.description().to_string(),
            instructions_per_iteration: kind.instructions_per_iteration(),
            latency_ns_per_instruction: metric.latency_ns,
            overhead_ms: Some(fit.intercept),
            cpi: metric.cycles_per_unit,
            ipc: metric.units_per_cycle,
            r_squared: fit.r_squared,
            reference_frequency_ghz: metric.reference_frequency_ghz,
            estimation_method: metric.method,
            calibrated: metric.method.is_calibrated(),
            empirical_cpi: None,
            data_points,
            skipped_points,
        })
    }

    /// Calibrate an externally built kernel.
    ///
    /// Work per size is the retired-instruction count of the built binary.
    /// Any failure at one size (build, count or timing) only drops that size.
    pub fn calibrate_kernel<K, C>(
        &self,
        kernels: &K,
        counter: &C,
        spec: &KernelSpec,
    ) -> Result<CalibrationRecord>
    where
        K: KernelBuilder + ?Sized,
        C: InstructionCounter + ?Sized,
    {
        let name = spec.name.as_str();
        let mut series = CalibrationSeries::new();
        let mut data_points: Vec<DataPoint> = Vec::new();
        let mut skipped_points = Vec::new();

        for repetitions in spec.counts() {
            let point = kernels.build_kernel(name, repetitions).and_then(|artifact| {
                let instructions = counter.count(artifact.path())?;
                let obs = measure(
                    self.runner,
                    &artifact,
                    Some(spec.expected_exit_code),
                    instructions,
                    &self.config.harness,
                )?;
                Ok((instructions, obs))
            });
            match point {
                Ok((instructions, obs)) => {
                    info!(
                        benchmark = name,
                        repetitions,
                        instructions,
                        time_ms = obs.time_ms,
                        "point.measured"
                    );
                    data_points.push(DataPoint {
                        instructions,
                        repetitions,
                        time_ms: obs.time_ms,
                        std_ms: obs.std_ms,
                        source_sha256: None,
                    });
                    series.push(obs);
                }
                Err(e) => skip(&mut skipped_points, name, repetitions, &e),
            }
        }

        let (fit, metric) = self.fit(name, &series)?;
        // Instructions retired by one kernel call, from the largest size.
        let per_call = data_points
            .last()
            .map_or(0, |p| p.instructions / p.repetitions.max(1));

        Ok(CalibrationRecord {
            name: spec.name.clone(),
            description: spec.description.clone(),
            instructions_per_iteration: per_call,
            latency_ns_per_instruction: metric.latency_ns,
            overhead_ms: Some(fit.intercept),
            cpi: metric.cycles_per_unit,
            ipc: metric.units_per_cycle,
            r_squared: fit.r_squared,
            reference_frequency_ghz: metric.reference_frequency_ghz,
            estimation_method: metric.method,
            calibrated: metric.method.is_calibrated(),
            empirical_cpi: None,
            data_points,
            skipped_points,
        })
    }

    pub fn calibrate_kernels<K, C>(
        &self,
        kernels: &K,
        counter: &C,
        specs: &[&KernelSpec],
    ) -> SuiteOutcome
    where
        K: KernelBuilder + ?Sized,
        C: InstructionCounter + ?Sized,
    {
        let mut outcome = SuiteOutcome::default();
        for spec in specs {
            outcome.push(&spec.name, self.calibrate_kernel(kernels, counter, spec));
        }
        outcome
    }

    /// Calibrate the named templates, or every template in `registry` when
    /// `names` is empty. Unknown names fail individually.
    pub fn calibrate_suite<S: AsRef<str>>(
        &self,
        registry: &WorkloadRegistry,
        names: &[S],
    ) -> SuiteOutcome {
        let mut outcome = SuiteOutcome::default();
        if names.is_empty() {
            for &kind in registry.templates() {
                outcome.push(kind.name(), self.calibrate(kind));
            }
        } else {
            for name in names {
                let name = name.as_ref();
                outcome.push(name, registry.lookup(name).and_then(|k| self.calibrate(k)));
            }
        }
        outcome
    }

    /// Analytical record for a prebuilt fixed-size workload.
    ///
    /// The coarse timing only feeds the cross-check; when it fails the
    /// analytical value is still reported.
    pub fn estimate_fixed(&self, workload: &FixedWorkload) -> Result<CalibrationRecord> {
        let name = workload.name.as_str();
        let artifact = ExecutableArtifact::prebuilt(&workload.executable);
        let sample = match measure(
            self.runner,
            &artifact,
            Some(workload.expected_exit_code),
            workload.instructions_per_iteration,
            &self.config.fixed_harness(),
        ) {
            Ok(obs) => Some(EmpiricalSample {
                time_per_run_ms: obs.time_ms,
                instructions_per_run: workload.instructions_per_iteration,
            }),
            Err(e) => {
                warn!(benchmark = name, error = %e, "analytical.timing_failed");
                None
            }
        };

        let estimate = derive_from_analytical_estimate(
            workload.expected_cpi,
            self.config.reference_frequency_ghz,
            sample.as_ref(),
        )?;
        let metric = estimate.metric;

        Ok(CalibrationRecord {
            name: workload.name.clone(),
            description: workload.description.clone(),
            instructions_per_iteration: workload.instructions_per_iteration,
            latency_ns_per_instruction: metric.latency_ns,
            overhead_ms: None,
            cpi: metric.cycles_per_unit,
            ipc: metric.units_per_cycle,
            r_squared: ANALYTICAL_R_SQUARED,
            reference_frequency_ghz: metric.reference_frequency_ghz,
            estimation_method: metric.method,
            calibrated: false,
            empirical_cpi: estimate.cross_check.map(|c| c.empirical_cpi),
            data_points: Vec::new(),
            skipped_points: Vec::new(),
        })
    }

    pub fn estimate_suite(&self, manifest: &FixedWorkloadManifest) -> SuiteOutcome {
        let mut outcome = SuiteOutcome::default();
        for workload in &manifest.workloads {
            outcome.push(&workload.name, self.estimate_fixed(workload));
        }
        outcome
    }
}
