//! Deterministic synthetic calibration series.
//!
//! Used by `self-check` and the benches to exercise the regression backends
//! without an assembler or the target hardware.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::harness::TimingObservation;
use crate::regression::CalibrationSeries;

/// Parameters of a synthetic series.
#[derive(Clone, Debug)]
pub struct SyntheticSpec {
    /// Milliseconds per work unit.
    pub slope: f64,
    /// Fixed overhead in milliseconds.
    pub intercept: f64,
    /// Half-width of the uniform jitter added to each point.
    pub noise_ms: f64,
    pub work_units: Vec<u64>,
    pub seed: u64,
}

impl Default for SyntheticSpec {
    fn default() -> Self {
        // Roughly a 0.3 ns instruction with 20 ms of launch overhead.
        Self {
            slope: 3.0e-7,
            intercept: 20.0,
            noise_ms: 0.5,
            work_units: (0..6).map(|i| 20_000_000u64 << i).collect(),
            seed: 42,
        }
    }
}

/// Per-point seed so one point's values do not depend on how many came before.
fn per_point_seed(seed: u64, work_units: u64) -> u64 {
    seed ^ work_units.wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

/// `time = slope * work + intercept + U(-noise, noise)` for each work value.
pub fn generate_series(
    slope: f64,
    intercept: f64,
    noise_ms: f64,
    work_units: &[u64],
    seed: u64,
) -> CalibrationSeries {
    let noise = if noise_ms.is_finite() { noise_ms.abs() } else { 0.0 };
    work_units
        .iter()
        .map(|&w| {
            let mut rng = ChaCha8Rng::seed_from_u64(per_point_seed(seed, w));
            let jitter = if noise > 0.0 {
                rng.gen_range(-noise..=noise)
            } else {
                0.0
            };
            TimingObservation {
                work_units: w,
                time_ms: slope * w as f64 + intercept + jitter,
                std_ms: noise / 3f64.sqrt(),
                runs_used: 1,
            }
        })
        .collect()
}

impl SyntheticSpec {
    pub fn generate(&self) -> CalibrationSeries {
        generate_series(
            self.slope,
            self.intercept,
            self.noise_ms,
            &self.work_units,
            self.seed,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regression::{ClosedForm, LinearFit};

    #[test]
    fn same_seed_same_series() {
        let spec = SyntheticSpec::default();
        let a = spec.generate();
        let b = spec.generate();
        assert_eq!(a.observations(), b.observations());

        let other = SyntheticSpec {
            seed: 7,
            ..SyntheticSpec::default()
        }
        .generate();
        assert_ne!(a.observations(), other.observations());
    }

    #[test]
    fn noiseless_series_is_exact() {
        let series = generate_series(0.005, 5.0, 0.0, &[1_000, 2_000, 4_000], 1);
        let times: Vec<f64> = series.observations().iter().map(|o| o.time_ms).collect();
        assert_eq!(times, vec![10.0, 15.0, 25.0]);
    }

    #[test]
    fn fit_recovers_slope_through_noise() {
        let spec = SyntheticSpec::default();
        let fit = ClosedForm.fit(&spec.generate()).unwrap();
        assert!((fit.slope - spec.slope).abs() / spec.slope < 0.01);
        assert!((fit.intercept - spec.intercept).abs() < 2.0);
        assert!(fit.r_squared > 0.99);
    }
}
