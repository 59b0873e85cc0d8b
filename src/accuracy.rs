//! Simulator accuracy against calibrated hardware metrics.
//!
//! Error is `|sim - real| / min(sim, real)`, so a 2x overshoot and a 2x
//! undershoot both score 1.0.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{CalibrationError, Result};
use crate::metrics::{DerivedMetric, EstimationMethod};

/// Relative error between two strictly positive values.
pub fn relative_error(simulated: f64, real: f64) -> Result<f64> {
    for (what, v) in [("simulated", simulated), ("real", real)] {
        if !(v.is_finite() && v > 0.0) {
            return Err(CalibrationError::invalid_metric(what, v));
        }
    }
    Ok((simulated - real).abs() / simulated.min(real))
}

/// Simulated vs real metric for one benchmark.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AccuracyRecord {
    pub name: String,
    pub sim_cpi: Option<f64>,
    pub real_cpi: Option<f64>,
    pub sim_latency_ns: Option<f64>,
    pub real_latency_ns: Option<f64>,
    /// `None` when the error could not be computed.
    pub error: Option<f64>,
    /// Whether the real value came from regression rather than an analytical estimate.
    pub calibrated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl AccuracyRecord {
    /// A record without a defined error, kept so it is counted in the summary.
    pub fn undefined(
        name: &str,
        simulated: Option<&DerivedMetric>,
        real: Option<&DerivedMetric>,
        note: impl Into<String>,
    ) -> Self {
        Self {
            name: name.to_string(),
            sim_cpi: simulated.map(|m| m.cycles_per_unit),
            real_cpi: real.map(|m| m.cycles_per_unit),
            sim_latency_ns: simulated.map(|m| m.latency_ns),
            real_latency_ns: real.map(|m| m.latency_ns),
            error: None,
            calibrated: real.is_some_and(|m| m.method.is_calibrated()),
            note: Some(note.into()),
        }
    }
}

/// Compare a simulator prediction with a real metric.
///
/// Latencies are compared, which keeps the result independent of the
/// reference frequency each side was expressed at.
pub fn compare(name: &str, simulated: &DerivedMetric, real: &DerivedMetric) -> Result<AccuracyRecord> {
    let error = relative_error(simulated.latency_ns, real.latency_ns)?;
    Ok(AccuracyRecord {
        name: name.to_string(),
        sim_cpi: Some(simulated.cycles_per_unit),
        real_cpi: Some(real.cycles_per_unit),
        sim_latency_ns: Some(simulated.latency_ns),
        real_latency_ns: Some(real.latency_ns),
        error: Some(error),
        calibrated: real.method.is_calibrated(),
        note: None,
    })
}

/// Aggregate over a benchmark suite.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SuiteSummary {
    /// Records with a defined error.
    pub count: usize,
    /// Records whose error could not be computed.
    pub undefined: usize,
    /// Defined records whose real value came from regression.
    pub calibrated_count: usize,
    pub mean_error: Option<f64>,
    pub max_error: Option<f64>,
    pub min_error: Option<f64>,
}

pub fn summarize(records: &[AccuracyRecord]) -> SuiteSummary {
    let mut summary = SuiteSummary::default();
    let mut sum = 0.0;
    for record in records {
        let Some(err) = record.error else {
            summary.undefined += 1;
            continue;
        };
        summary.count += 1;
        if record.calibrated {
            summary.calibrated_count += 1;
        }
        sum += err;
        summary.max_error = Some(summary.max_error.map_or(err, |m| m.max(err)));
        summary.min_error = Some(summary.min_error.map_or(err, |m| m.min(err)));
    }
    if summary.count > 0 {
        summary.mean_error = Some(sum / summary.count as f64);
    }
    summary
}

/// One simulator prediction. At least one of `cpi` / `latency_ns` must be set.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SimulatedEntry {
    pub name: String,
    #[serde(default)]
    pub cpi: Option<f64>,
    #[serde(default)]
    pub latency_ns: Option<f64>,
    /// Clock the CPI refers to; defaults to the comparison's reference frequency.
    #[serde(default)]
    pub frequency_ghz: Option<f64>,
}

/// Simulator output, read from `{"benchmarks": [...]}`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SimulatorPredictions {
    pub benchmarks: Vec<SimulatedEntry>,
}

impl SimulatorPredictions {
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::from_json(&fs::read_to_string(path)?)
    }

    /// The prediction for `entry` as a metric.
    pub fn metric(entry: &SimulatedEntry, default_frequency_ghz: f64) -> Result<DerivedMetric> {
        let freq = entry.frequency_ghz.unwrap_or(default_frequency_ghz);
        match (entry.cpi, entry.latency_ns) {
            (Some(cpi), _) => DerivedMetric::from_cpi(cpi, freq, EstimationMethod::Simulated),
            (None, Some(ns)) => {
                DerivedMetric::from_latency_ns(ns, freq, EstimationMethod::Simulated)
            }
            (None, None) => Err(CalibrationError::invalid_metric("simulated CPI (missing)", f64::NAN)),
        }
    }
}

/// Compare every simulator prediction with the real metric of the same name.
///
/// Predictions with no real counterpart, and pairs the comparator rejects,
/// become undefined records rather than being dropped.
pub fn evaluate(
    real: &BTreeMap<String, DerivedMetric>,
    predictions: &SimulatorPredictions,
    default_frequency_ghz: f64,
) -> Vec<AccuracyRecord> {
    predictions
        .benchmarks
        .iter()
        .map(|entry| {
            let name = entry.name.as_str();
            let real_metric = real.get(name);
            let simulated = match SimulatorPredictions::metric(entry, default_frequency_ghz) {
                Ok(m) => m,
                Err(e) => {
                    warn!(benchmark = name, error = %e, "accuracy.bad_prediction");
                    return AccuracyRecord::undefined(name, None, real_metric, e.to_string());
                }
            };
            let Some(real_metric) = real_metric else {
                warn!(benchmark = name, "accuracy.no_real_metric");
                return AccuracyRecord::undefined(
                    name,
                    Some(&simulated),
                    None,
                    "no calibration record",
                );
            };
            compare(name, &simulated, real_metric).unwrap_or_else(|e| {
                warn!(benchmark = name, error = %e, "accuracy.compare_failed");
                AccuracyRecord::undefined(name, Some(&simulated), Some(real_metric), e.to_string())
            })
        })
        .collect()
}
