//! Ordinary least squares over (work units, time) observations.
//!
//! `time = slope * work + intercept`: the slope isolates the per-unit cost,
//! the intercept absorbs process launch and other constant overhead. Two
//! interchangeable backends compute the same estimator:
//!
//! - [`ClosedForm`]: centered sums, no dependencies beyond `std`.
//! - [`Linalg`]: SVD least-squares solve through `nalgebra`.
//!
//! The backend is chosen explicitly through [`RegressionBackend`].

use clap::ValueEnum;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CalibrationError, Result};
use crate::harness::TimingObservation;

/// Fewest distinct work-unit values that determine a line.
pub const MIN_DISTINCT_POINTS: usize = 2;

/// Singular values below this are treated as zero by the SVD solve.
const SVD_EPS: f64 = 1e-12;

/// Fitted line and goodness of fit.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct FitResult {
    /// Time per work unit.
    pub slope: f64,
    /// Fixed overhead, same time unit as the observations.
    pub intercept: f64,
    /// Coefficient of determination in [0, 1]; 0 when time has no variance.
    pub r_squared: f64,
    /// Number of observations fitted.
    pub points: usize,
}

/// Observations of one template across repetition counts, kept ordered by
/// increasing work units.
#[derive(Clone, Debug, Default)]
pub struct CalibrationSeries {
    observations: Vec<TimingObservation>,
}

impl CalibrationSeries {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, obs: TimingObservation) {
        let at = self
            .observations
            .partition_point(|o| o.work_units <= obs.work_units);
        self.observations.insert(at, obs);
    }

    pub fn observations(&self) -> &[TimingObservation] {
        &self.observations
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    pub fn distinct_work_units(&self) -> usize {
        let mut units: Vec<u64> = self.observations.iter().map(|o| o.work_units).collect();
        units.dedup();
        units.len()
    }

    fn xy(&self) -> (Vec<f64>, Vec<f64>) {
        self.observations
            .iter()
            .map(|o| (o.work_units as f64, o.time_ms))
            .unzip()
    }
}

impl FromIterator<TimingObservation> for CalibrationSeries {
    fn from_iter<I: IntoIterator<Item = TimingObservation>>(iter: I) -> Self {
        let mut series = Self::new();
        for obs in iter {
            series.push(obs);
        }
        series
    }
}

/// A least-squares line fitter.
pub trait LinearFit {
    fn name(&self) -> &'static str;

    /// Fit `y = slope * x + intercept`.
    fn fit_xy(&self, x: &[f64], y: &[f64]) -> Result<FitResult>;

    fn fit(&self, series: &CalibrationSeries) -> Result<FitResult> {
        let (x, y) = series.xy();
        self.fit_xy(&x, &y)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ClosedForm;

#[derive(Clone, Copy, Debug, Default)]
pub struct Linalg;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RegressionBackend {
    /// Dependency-free centered-sums formula.
    #[default]
    ClosedForm,
    /// SVD least squares via nalgebra.
    Linalg,
}

impl RegressionBackend {
    pub fn fitter(&self) -> &'static dyn LinearFit {
        match self {
            RegressionBackend::ClosedForm => &ClosedForm,
            RegressionBackend::Linalg => &Linalg,
        }
    }

    pub fn as_str(&self) -> &'static str {
        self.fitter().name()
    }
}

/// Check shapes and that at least two distinct x values exist.
fn validate(x: &[f64], y: &[f64]) -> Result<()> {
    if x.len() != y.len() {
        return Err(CalibrationError::Solver {
            detail: format!("length mismatch: {} x vs {} y", x.len(), y.len()),
        });
    }
    for (what, v) in x.iter().map(|v| ("work units", *v)).chain(y.iter().map(|v| ("time", *v))) {
        if !v.is_finite() {
            return Err(CalibrationError::invalid_metric(what, v));
        }
    }

    let mut distinct: Vec<f64> = x.to_vec();
    distinct.sort_by(f64::total_cmp);
    distinct.dedup();
    if distinct.len() < MIN_DISTINCT_POINTS {
        return Err(CalibrationError::InsufficientDataPoints {
            distinct: distinct.len(),
            required: MIN_DISTINCT_POINTS,
        });
    }
    Ok(())
}

fn mean(v: &[f64]) -> f64 {
    v.iter().sum::<f64>() / v.len() as f64
}

/// `1 - ss_res / ss_tot`, or 0 when every y is identical.
fn r_squared(y: &[f64], ss_res: f64, ss_tot: f64) -> f64 {
    let constant = y.iter().all(|v| *v == y[0]);
    if constant || ss_tot == 0.0 {
        debug!("regression.no_variance");
        return 0.0;
    }
    (1.0 - ss_res / ss_tot).clamp(0.0, 1.0)
}

impl LinearFit for ClosedForm {
    fn name(&self) -> &'static str {
        "closed-form"
    }

    fn fit_xy(&self, x: &[f64], y: &[f64]) -> Result<FitResult> {
        validate(x, y)?;
        let mx = mean(x);
        let my = mean(y);

        let mut sxx = 0.0;
        let mut sxy = 0.0;
        let mut ss_tot = 0.0;
        for (xi, yi) in x.iter().zip(y) {
            let dx = xi - mx;
            let dy = yi - my;
            sxx += dx * dx;
            sxy += dx * dy;
            ss_tot += dy * dy;
        }

        let slope = sxy / sxx;
        let intercept = my - slope * mx;
        let ss_res: f64 = x
            .iter()
            .zip(y)
            .map(|(xi, yi)| (yi - (slope * xi + intercept)).powi(2))
            .sum();

        Ok(FitResult {
            slope,
            intercept,
            r_squared: r_squared(y, ss_res, ss_tot),
            points: x.len(),
        })
    }
}

impl LinearFit for Linalg {
    fn name(&self) -> &'static str {
        "linalg"
    }

    fn fit_xy(&self, x: &[f64], y: &[f64]) -> Result<FitResult> {
        validate(x, y)?;
        let n = x.len();
        let design = DMatrix::from_fn(n, 2, |i, j| if j == 0 { x[i] } else { 1.0 });
        let target = DVector::from_column_slice(y);

        let beta = design
            .clone()
            .svd(true, true)
            .solve(&target, SVD_EPS)
            .map_err(|detail| CalibrationError::Solver {
                detail: detail.to_string(),
            })?;
        let slope = beta[0];
        let intercept = beta[1];

        let residual = &target - &design * &beta;
        let centered = target.add_scalar(-target.mean());

        Ok(FitResult {
            slope,
            intercept,
            r_squared: r_squared(y, residual.norm_squared(), centered.norm_squared()),
            points: n,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BACKENDS: [RegressionBackend; 2] = [RegressionBackend::ClosedForm, RegressionBackend::Linalg];

    fn obs(work_units: u64, time_ms: f64) -> TimingObservation {
        TimingObservation {
            work_units,
            time_ms,
            std_ms: 0.0,
            runs_used: 1,
        }
    }

    fn assert_sig_digits(a: f64, b: f64, digits: i32) {
        let scale = a.abs().max(b.abs()).max(f64::MIN_POSITIVE);
        assert!(
            (a - b).abs() / scale < 10f64.powi(-digits),
            "{a} vs {b} differ beyond {digits} significant digits"
        );
    }

    #[test]
    fn perfect_line_is_recovered() {
        let x: Vec<f64> = (1..=6).map(|i| (i * 1_000) as f64).collect();
        let y: Vec<f64> = x.iter().map(|v| 2.0 * v + 5.0).collect();
        for backend in BACKENDS {
            let fit = backend.fitter().fit_xy(&x, &y).unwrap();
            assert!((fit.slope - 2.0).abs() < 1e-6, "{}", backend.as_str());
            assert!((fit.intercept - 5.0).abs() < 1e-6, "{}", backend.as_str());
            assert!((fit.r_squared - 1.0).abs() < 1e-6, "{}", backend.as_str());
            assert_eq!(fit.points, 6);
        }
    }

    #[test]
    fn three_point_series_matches_hand_computation() {
        // mean x = 7000/3, mean y = 50/3, Sxy = 70000/3, Sxx = 14_000_000/3.
        let series: CalibrationSeries = [obs(4_000, 25.0), obs(1_000, 10.0), obs(2_000, 15.0)]
            .into_iter()
            .collect();
        assert_eq!(
            series
                .observations()
                .iter()
                .map(|o| o.work_units)
                .collect::<Vec<_>>(),
            vec![1_000, 2_000, 4_000]
        );
        for backend in BACKENDS {
            let fit = backend.fitter().fit(&series).unwrap();
            assert!((fit.slope - 0.005).abs() < 1e-9);
            assert!((fit.intercept - 5.0).abs() < 1e-6);
            assert!((fit.r_squared - 1.0).abs() < 1e-9);
            // ms per unit -> ns per unit
            assert!((fit.slope * 1e6 - 5_000.0).abs() < 1e-3);
        }
    }

    #[test]
    fn flat_series_has_zero_r_squared() {
        let x = [1_000.0, 2_000.0, 4_000.0];
        let y = [0.1, 0.1, 0.1];
        for backend in BACKENDS {
            let fit = backend.fitter().fit_xy(&x, &y).unwrap();
            assert_eq!(fit.r_squared, 0.0);
            assert!(fit.slope.abs() < 1e-12);
        }
    }

    #[test]
    fn single_distinct_work_value_is_rejected() {
        let x = [500.0, 500.0, 500.0];
        let y = [1.0, 2.0, 3.0];
        for backend in BACKENDS {
            let err = backend.fitter().fit_xy(&x, &y).unwrap_err();
            assert!(matches!(
                err,
                CalibrationError::InsufficientDataPoints {
                    distinct: 1,
                    required: 2
                }
            ));
        }
        assert!(matches!(
            ClosedForm.fit(&CalibrationSeries::new()),
            Err(CalibrationError::InsufficientDataPoints { distinct: 0, .. })
        ));
    }

    #[test]
    fn backends_agree_on_noisy_data() {
        // Calibration-scale magnitudes: 20M..640M instructions, ~20ms overhead.
        let x: Vec<f64> = (0..6).map(|i| (20_000_000u64 << i) as f64).collect();
        let jitter = [0.31, -0.12, 0.44, -0.27, 0.05, -0.38];
        let y: Vec<f64> = x
            .iter()
            .zip(jitter)
            .map(|(xi, j)| 3.1e-7 * xi + 21.7 + j)
            .collect();

        let a = ClosedForm.fit_xy(&x, &y).unwrap();
        let b = Linalg.fit_xy(&x, &y).unwrap();
        assert_sig_digits(a.slope, b.slope, 4);
        assert_sig_digits(a.intercept, b.intercept, 4);
        assert_sig_digits(a.r_squared, b.r_squared, 4);
        assert!(a.r_squared > 0.99);
    }

    #[test]
    fn non_finite_input_is_rejected() {
        let err = ClosedForm
            .fit_xy(&[1.0, 2.0], &[1.0, f64::NAN])
            .unwrap_err();
        assert!(matches!(err, CalibrationError::InvalidMetric { .. }));
    }

    #[test]
    fn series_counts_distinct_units() {
        let series: CalibrationSeries = [obs(10, 1.0), obs(10, 1.1), obs(20, 2.0)]
            .into_iter()
            .collect();
        assert_eq!(series.len(), 3);
        assert_eq!(series.distinct_work_units(), 2);
    }
}
