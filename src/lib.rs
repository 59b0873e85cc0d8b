//! Calibration of per-instruction latency and CPI on real hardware.
//!
//! Synthetic AArch64 workloads are generated at several repetition counts,
//! built, timed, and fitted with a least-squares line whose slope is the
//! per-instruction cost. The resulting metrics can then be compared with a
//! cycle-level simulator's predictions.

pub mod accuracy;
pub mod build;
pub mod calibrate;
pub mod config;
pub mod counter;
pub mod encoder;
pub mod error;
pub mod harness;
pub mod metrics;
pub mod process;
pub mod regression;
pub mod schema;
pub mod synthetic;
pub mod workload;

pub use error::{CalibrationError, Result};
