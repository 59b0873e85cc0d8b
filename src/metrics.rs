//! Hardware metrics derived from a fitted slope or an analytical estimate.
//!
//! Regression output is authoritative for calibrated workloads: the slope
//! has the launch overhead separated out. For fixed-size workloads only a
//! single coarse timing exists, which cannot separate overhead from cost, so
//! the supplied analytical CPI is used and the timing is only compared
//! against it for diagnostics.

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{CalibrationError, Result};
use crate::regression::FitResult;

/// Clock used to express latencies as cycles.
pub const DEFAULT_REFERENCE_FREQUENCY_GHZ: f64 = 3.5;

/// Empirical and analytical CPI disagreeing by more than this factor is reported.
pub const CROSS_CHECK_TOLERANCE: f64 = 2.0;

/// Time unit of the observations a slope was fitted on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Seconds,
    #[default]
    Milliseconds,
    Microseconds,
    Nanoseconds,
}

impl TimeUnit {
    pub fn nanos(&self) -> f64 {
        match self {
            TimeUnit::Seconds => 1e9,
            TimeUnit::Milliseconds => 1e6,
            TimeUnit::Microseconds => 1e3,
            TimeUnit::Nanoseconds => 1.0,
        }
    }
}

/// Where a metric came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimationMethod {
    /// Slope of a multi-point regression.
    LinearRegression,
    /// Supplied cycles-per-instruction for a workload that cannot be regressed.
    Analytical,
    /// Prediction of the simulator under validation.
    Simulated,
}

impl EstimationMethod {
    pub fn is_calibrated(&self) -> bool {
        matches!(self, EstimationMethod::LinearRegression)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct DerivedMetric {
    /// Nanoseconds per instruction.
    pub latency_ns: f64,
    /// Cycles per instruction at `reference_frequency_ghz`.
    pub cycles_per_unit: f64,
    /// Instructions per cycle; `None` when `cycles_per_unit` is zero.
    pub units_per_cycle: Option<f64>,
    pub reference_frequency_ghz: f64,
    pub method: EstimationMethod,
}

impl DerivedMetric {
    fn from_latency(latency_ns: f64, frequency_ghz: f64, method: EstimationMethod) -> Self {
        Self::from_parts(latency_ns, latency_ns * frequency_ghz, frequency_ghz, method)
    }

    fn from_parts(
        latency_ns: f64,
        cycles_per_unit: f64,
        frequency_ghz: f64,
        method: EstimationMethod,
    ) -> Self {
        let units_per_cycle = if cycles_per_unit == 0.0 {
            warn!(latency_ns, "metric.throughput_undefined");
            None
        } else {
            Some(1.0 / cycles_per_unit)
        };
        Self {
            latency_ns,
            cycles_per_unit,
            units_per_cycle,
            reference_frequency_ghz: frequency_ghz,
            method,
        }
    }

    /// Metric for a known CPI at `frequency_ghz`.
    pub fn from_cpi(cpi: f64, frequency_ghz: f64, method: EstimationMethod) -> Result<Self> {
        check_frequency(frequency_ghz)?;
        if !cpi.is_finite() {
            return Err(CalibrationError::invalid_metric("CPI", cpi));
        }
        Ok(Self::from_parts(cpi / frequency_ghz, cpi, frequency_ghz, method))
    }

    /// Metric for a known per-instruction latency at `frequency_ghz`.
    pub fn from_latency_ns(latency_ns: f64, frequency_ghz: f64, method: EstimationMethod) -> Result<Self> {
        check_frequency(frequency_ghz)?;
        if !latency_ns.is_finite() {
            return Err(CalibrationError::invalid_metric("latency (ns)", latency_ns));
        }
        Ok(Self::from_latency(latency_ns, frequency_ghz, method))
    }

    pub fn throughput_defined(&self) -> bool {
        self.units_per_cycle.is_some()
    }
}

fn check_frequency(frequency_ghz: f64) -> Result<()> {
    if frequency_ghz.is_finite() && frequency_ghz > 0.0 {
        Ok(())
    } else {
        Err(CalibrationError::invalid_metric(
            "reference frequency (GHz)",
            frequency_ghz,
        ))
    }
}

/// Convert a fitted slope (time per instruction in `unit`) to per-instruction
/// latency, CPI and IPC.
///
/// A zero or negative slope is not rejected here; it yields a metric the
/// accuracy comparator will refuse.
pub fn derive_from_fit(fit: &FitResult, unit: TimeUnit, frequency_ghz: f64) -> Result<DerivedMetric> {
    check_frequency(frequency_ghz)?;
    if !fit.slope.is_finite() {
        return Err(CalibrationError::invalid_metric("slope", fit.slope));
    }
    let latency_ns = fit.slope * unit.nanos();
    if latency_ns <= 0.0 {
        warn!(latency_ns, "metric.non_positive_latency");
    }
    Ok(DerivedMetric::from_latency(
        latency_ns,
        frequency_ghz,
        EstimationMethod::LinearRegression,
    ))
}

/// One coarse timing of a fixed-size workload.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EmpiricalSample {
    pub time_per_run_ms: f64,
    pub instructions_per_run: u64,
}

impl EmpiricalSample {
    /// CPI implied by attributing the whole run time to the instructions.
    pub fn cpi(&self, frequency_ghz: f64) -> Option<f64> {
        if self.instructions_per_run == 0 || !self.time_per_run_ms.is_finite() {
            return None;
        }
        let ns_per_insn = self.time_per_run_ms * TimeUnit::Milliseconds.nanos()
            / self.instructions_per_run as f64;
        Some(ns_per_insn * frequency_ghz)
    }
}

/// Diagnostic comparison of an empirical CPI with the analytical one.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CrossCheck {
    pub empirical_cpi: f64,
    /// empirical / analytical
    pub ratio: f64,
    pub agrees: bool,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AnalyticalEstimate {
    pub metric: DerivedMetric,
    pub cross_check: Option<CrossCheck>,
}

/// Build a metric from a supplied CPI.
///
/// When `empirical` is given, its implied CPI is compared and any mismatch
/// logged. The analytical CPI is returned regardless.
pub fn derive_from_analytical_estimate(
    expected_cpi: f64,
    frequency_ghz: f64,
    empirical: Option<&EmpiricalSample>,
) -> Result<AnalyticalEstimate> {
    check_frequency(frequency_ghz)?;
    if !(expected_cpi.is_finite() && expected_cpi > 0.0) {
        return Err(CalibrationError::invalid_metric("expected CPI", expected_cpi));
    }

    let metric = DerivedMetric::from_cpi(expected_cpi, frequency_ghz, EstimationMethod::Analytical)?;

    let cross_check = empirical
        .and_then(|s| s.cpi(frequency_ghz))
        .map(|empirical_cpi| {
            let ratio = empirical_cpi / expected_cpi;
            let agrees = (1.0 / CROSS_CHECK_TOLERANCE..=CROSS_CHECK_TOLERANCE).contains(&ratio);
            if agrees {
                info!(empirical_cpi, expected_cpi, ratio, "analytical.cross_check");
            } else {
                warn!(empirical_cpi, expected_cpi, ratio, "analytical.cross_check_mismatch");
            }
            CrossCheck {
                empirical_cpi,
                ratio,
                agrees,
            }
        });

    Ok(AnalyticalEstimate {
        metric,
        cross_check,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fit(slope: f64) -> FitResult {
        FitResult {
            slope,
            intercept: 20.0,
            r_squared: 0.999,
            points: 6,
        }
    }

    #[test]
    fn slope_in_ms_becomes_latency_in_ns() {
        let m = derive_from_fit(&fit(0.005), TimeUnit::Milliseconds, 3.5).unwrap();
        assert!((m.latency_ns - 5_000.0).abs() < 1e-6);
        assert!((m.cycles_per_unit - 17_500.0).abs() < 1e-6);
        assert!((m.units_per_cycle.unwrap() - 1.0 / 17_500.0).abs() < 1e-15);
        assert_eq!(m.method, EstimationMethod::LinearRegression);
        assert!(m.method.is_calibrated());
    }

    #[test]
    fn sub_nanosecond_latency() {
        let m = derive_from_fit(&fit(3.0e-7), TimeUnit::Milliseconds, 3.5).unwrap();
        assert!((m.latency_ns - 0.3).abs() < 1e-12);
        assert!((m.cycles_per_unit - 1.05).abs() < 1e-12);

        let s = derive_from_fit(&fit(3.0e-10), TimeUnit::Seconds, 3.5).unwrap();
        assert!((s.latency_ns - 0.3).abs() < 1e-12);
    }

    #[test]
    fn zero_slope_flags_throughput() {
        let m = derive_from_fit(&fit(0.0), TimeUnit::Milliseconds, 3.5).unwrap();
        assert_eq!(m.cycles_per_unit, 0.0);
        assert!(!m.throughput_defined());
    }

    #[test]
    fn bad_frequency_is_rejected() {
        assert!(matches!(
            derive_from_fit(&fit(1e-6), TimeUnit::Milliseconds, 0.0),
            Err(CalibrationError::InvalidMetric { .. })
        ));
    }

    #[test]
    fn analytical_value_wins_over_sample() {
        // 20 instructions in 1 ms is wildly slower than CPI 0.5.
        let sample = EmpiricalSample {
            time_per_run_ms: 1.0,
            instructions_per_run: 20,
        };
        let est = derive_from_analytical_estimate(0.5, 3.5, Some(&sample)).unwrap();
        assert_eq!(est.metric.cycles_per_unit, 0.5);
        assert!((est.metric.latency_ns - 0.5 / 3.5).abs() < 1e-12);
        assert_eq!(est.metric.units_per_cycle, Some(2.0));
        assert_eq!(est.metric.method, EstimationMethod::Analytical);

        let check = est.cross_check.unwrap();
        assert!(!check.agrees);
        assert!((check.empirical_cpi - 175_000.0).abs() < 1e-6);
    }

    #[test]
    fn agreeing_sample_is_marked() {
        // 1e6 instructions at CPI 0.7 and 3.5 GHz = 0.2 ms.
        let sample = EmpiricalSample {
            time_per_run_ms: 0.2,
            instructions_per_run: 1_000_000,
        };
        let est = derive_from_analytical_estimate(0.7, 3.5, Some(&sample)).unwrap();
        let check = est.cross_check.unwrap();
        assert!(check.agrees);
        assert!((check.ratio - 1.0).abs() < 1e-9);
    }

    #[test]
    fn metric_from_cpi_and_latency_agree() {
        let a = DerivedMetric::from_cpi(1.4, 3.5, EstimationMethod::Simulated).unwrap();
        let b = DerivedMetric::from_latency_ns(0.4, 3.5, EstimationMethod::Simulated).unwrap();
        assert!((a.latency_ns - b.latency_ns).abs() < 1e-12);
        assert!((a.cycles_per_unit - b.cycles_per_unit).abs() < 1e-12);
        assert!(DerivedMetric::from_cpi(f64::NAN, 3.5, EstimationMethod::Simulated).is_err());
    }

    #[test]
    fn analytical_without_sample() {
        let est = derive_from_analytical_estimate(1.0, 3.5, None).unwrap();
        assert!(est.cross_check.is_none());
        assert!(matches!(
            derive_from_analytical_estimate(0.0, 3.5, None),
            Err(CalibrationError::InvalidMetric { .. })
        ));
    }
}
