use clap::{Parser, Subcommand, ValueEnum};
use cpi_calibration_bench::accuracy::{self, SimulatorPredictions};
use cpi_calibration_bench::build::{NativeToolchain, ScriptKernelBuilder};
use cpi_calibration_bench::calibrate::{Calibrator, SuiteOutcome};
use cpi_calibration_bench::config::{CalibrationConfig, FixedWorkloadManifest, KernelManifest};
use cpi_calibration_bench::counter::HardwareCounter;
use cpi_calibration_bench::harness::Profile;
use cpi_calibration_bench::process::ProcessRunner;
use cpi_calibration_bench::regression::{ClosedForm, LinearFit, Linalg, RegressionBackend};
use cpi_calibration_bench::schema::{
    AccuracyReport, CalibrationReport, RunMeta, FORMULA, METHODOLOGY, SCHEMA_VERSION,
};
use cpi_calibration_bench::synthetic::SyntheticSpec;
use cpi_calibration_bench::workload::{TargetAbi, WorkloadRegistry};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ProfileArg {
    Quick,
    Full,
}

impl From<ProfileArg> for Profile {
    fn from(v: ProfileArg) -> Self {
        match v {
            ProfileArg::Quick => Profile::Quick,
            ProfileArg::Full => Profile::Full,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the workload templates.
    Templates,

    /// Print the generated assembly for one template and repetition count.
    Generate {
        #[arg(long, short = 'b')]
        benchmark: String,

        #[arg(long, short = 'n', default_value_t = 1_000_000)]
        count: u64,

        #[arg(long, value_enum)]
        abi: Option<TargetAbi>,
    },

    /// Calibrate templates by regression over repetition counts.
    Calibrate {
        /// Template to calibrate. Can be provided multiple times; defaults to all.
        #[arg(short, long, value_name = "NAME", action = clap::ArgAction::Append)]
        benchmark: Vec<String>,

        /// Measured runs per size (overrides the profile).
        #[arg(long)]
        runs: Option<u32>,

        /// Discarded runs before measuring (overrides the profile).
        #[arg(long)]
        warmup: Option<u32>,

        /// Comma-separated repetition counts (overrides the profile).
        #[arg(long, value_delimiter = ',')]
        counts: Vec<u64>,

        #[arg(long, value_enum, default_value_t = RegressionBackend::ClosedForm)]
        backend: RegressionBackend,

        #[arg(long, value_enum)]
        abi: Option<TargetAbi>,

        /// Fixed-size workloads to add as analytical entries.
        #[arg(long, value_name = "FILE")]
        manifest: Option<PathBuf>,

        /// Parent of the per-build scratch directories (defaults to the system temp dir).
        #[arg(long, value_name = "DIR")]
        temp_dir: Option<PathBuf>,
    },

    /// Calibrate externally built kernels by regression over instruction counts.
    CalibrateKernels {
        /// TOML manifest with the build script and `[[kernel]]` tables.
        #[arg(long, value_name = "FILE")]
        manifest: PathBuf,

        /// Kernel to calibrate. Can be provided multiple times; defaults to all.
        #[arg(short, long, value_name = "NAME", action = clap::ArgAction::Append)]
        kernel: Vec<String>,

        #[arg(long)]
        runs: Option<u32>,

        #[arg(long)]
        warmup: Option<u32>,

        #[arg(long, value_enum, default_value_t = RegressionBackend::ClosedForm)]
        backend: RegressionBackend,

        /// Existing calibration report to fold the results into.
        #[arg(long, value_name = "FILE")]
        merge_into: Option<PathBuf>,
    },

    /// Analytical entries for the fixed-size workloads of a TOML manifest.
    Estimate {
        #[arg(long, value_name = "FILE")]
        manifest: PathBuf,
    },

    /// Score simulator predictions against a calibration report.
    Compare {
        #[arg(long, value_name = "FILE")]
        calibration: PathBuf,

        #[arg(long, value_name = "FILE")]
        simulator: PathBuf,
    },

    /// Fit a seeded synthetic series with both regression backends.
    SelfCheck,
}

#[derive(Parser, Debug)]
#[command(name = "cpi-calibration-bench")]
#[command(about = "Per-instruction latency/CPI calibration and simulator accuracy (JSON output)")]
struct Args {
    #[arg(long, value_enum, default_value_t = ProfileArg::Quick, global = true)]
    profile: ProfileArg,

    #[arg(long, default_value_t = 0, global = true)]
    seed: u64,

    /// Clock used to convert latency to cycles.
    #[arg(long, default_value_t = 3.5, global = true)]
    frequency_ghz: f64,

    /// Where to write the JSON report. If omitted, prints to stdout.
    #[arg(long, global = true)]
    out: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    cmd: Command,
}

fn now_unix_stamp() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    format!("unix:{secs}")
}

fn git_sha_short() -> Option<String> {
    std::env::var("GIT_SHA")
        .ok()
        .or_else(|| std::env::var("GITHUB_SHA").ok())
        .map(|s| s.chars().take(12).collect())
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,cpi_calibration_bench={level}")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn run_meta(cfg: &CalibrationConfig) -> RunMeta {
    RunMeta {
        schema_version: SCHEMA_VERSION,
        tool_version: env!("CARGO_PKG_VERSION").to_string(),
        profile: cfg.profile.as_str().to_string(),
        seed: cfg.seed,
        timestamp_utc: now_unix_stamp(),
        git_sha: git_sha_short(),
    }
}

fn emit<T: Serialize>(value: &T, out: Option<&Path>) -> io::Result<()> {
    let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
    if let Some(out) = out {
        fs::write(out, json)?;
    } else {
        println!("{json}");
    }
    Ok(())
}

fn print_calibration_summary(report: &CalibrationReport) {
    eprintln!(
        "{:<16} {:>12} {:>8} {:>8} {:>8}  method",
        "benchmark", "latency_ns", "cpi", "ipc", "r2"
    );
    for r in &report.results {
        let ipc = r.ipc.map_or_else(|| "-".to_string(), |v| format!("{v:.3}"));
        eprintln!(
            "{:<16} {:>12.4} {:>8.3} {:>8} {:>8.4}  {:?}",
            r.name, r.latency_ns_per_instruction, r.cpi, ipc, r.r_squared, r.estimation_method
        );
        for s in &r.skipped_points {
            eprintln!("  skipped {} repetitions: {}", s.repetitions, s.reason);
        }
    }
    for f in &report.failures {
        eprintln!("{:<16} FAILED: {}", f.name, f.reason);
    }
    let s = &report.summary;
    eprintln!(
        "\n{} calibrated, {} analytical, {} failed",
        s.calibrated, s.analytical, s.failed
    );
}

fn print_accuracy_summary(report: &AccuracyReport) {
    eprintln!(
        "{:<16} {:>9} {:>9} {:>9}  source",
        "benchmark", "sim_cpi", "real_cpi", "error"
    );
    let fmt = |v: Option<f64>| v.map_or_else(|| "-".to_string(), |v| format!("{v:.3}"));
    for b in &report.benchmarks {
        let source = if b.calibrated { "calibrated" } else { "analytical" };
        let error = b
            .error
            .map_or_else(|| "n/a".to_string(), |e| format!("{:.1}%", e * 100.0));
        eprintln!(
            "{:<16} {:>9} {:>9} {:>9}  {source}",
            b.name,
            fmt(b.sim_cpi),
            fmt(b.real_cpi),
            error
        );
        if let Some(note) = &b.note {
            eprintln!("  {note}");
        }
    }
    let s = &report.summary;
    eprintln!(
        "\n{} compared ({} calibrated), {} undefined; mean error {}%, max {}%, min {}%",
        s.count,
        s.calibrated_count,
        s.undefined,
        fmt(s.mean_error.map(|e| e * 100.0)),
        fmt(s.max_error.map(|e| e * 100.0)),
        fmt(s.min_error.map(|e| e * 100.0)),
    );
}

fn calibration_report(cfg: &CalibrationConfig, outcome: SuiteOutcome) -> CalibrationReport {
    let summary = outcome.summary();
    CalibrationReport {
        run: run_meta(cfg),
        methodology: METHODOLOGY.to_string(),
        formula: FORMULA.to_string(),
        reference_frequency_ghz: cfg.reference_frequency_ghz,
        results: outcome.records,
        summary,
        failures: outcome.failures,
    }
}

fn main() -> io::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let mut cfg = CalibrationConfig::for_profile(args.profile.into());
    cfg.seed = args.seed;
    cfg.reference_frequency_ghz = args.frequency_ghz;
    let registry = WorkloadRegistry::standard();
    let runner = ProcessRunner::default();

    match args.cmd {
        Command::Templates => {
            for kind in registry.templates() {
                println!(
                    "{:<16} {:>3} insn/iter  {}",
                    kind.name(),
                    kind.instructions_per_iteration(),
                    kind.description()
                );
            }
        }
        Command::Generate {
            benchmark,
            count,
            abi,
        } => {
            let source = registry
                .generate(&benchmark, count, abi.unwrap_or(cfg.abi))
                .map_err(io::Error::other)?;
            match &args.out {
                Some(out) => fs::write(out, source)?,
                None => print!("{source}"),
            }
        }
        Command::Calibrate {
            benchmark,
            runs,
            warmup,
            counts,
            backend,
            abi,
            manifest,
            temp_dir,
        } => {
            if let Some(runs) = runs {
                cfg.harness.runs = runs;
            }
            if let Some(warmup) = warmup {
                cfg.harness.warmup_runs = warmup;
            }
            if !counts.is_empty() {
                cfg = cfg.with_repetition_counts(counts);
            }
            cfg.backend = backend;
            if let Some(abi) = abi {
                cfg.abi = abi;
            }

            let mut toolchain = NativeToolchain::for_abi(cfg.abi, cfg.build_timeout);
            if let Some(dir) = temp_dir {
                toolchain = toolchain.with_temp_root(dir);
            }
            let calibrator = Calibrator::new(&toolchain, &runner, &cfg);
            let mut outcome = calibrator.calibrate_suite(&registry, &benchmark);
            if let Some(path) = manifest {
                let fixed = FixedWorkloadManifest::load(&path).map_err(io::Error::other)?;
                outcome.extend(calibrator.estimate_suite(&fixed));
            }

            let report = calibration_report(&cfg, outcome);
            print_calibration_summary(&report);
            emit(&report, args.out.as_deref())?;
        }
        Command::CalibrateKernels {
            manifest,
            kernel,
            runs,
            warmup,
            backend,
            merge_into,
        } => {
            if let Some(runs) = runs {
                cfg.harness.runs = runs;
            }
            if let Some(warmup) = warmup {
                cfg.harness.warmup_runs = warmup;
            }
            cfg.backend = backend;

            let kernels = KernelManifest::load(&manifest).map_err(io::Error::other)?;
            let selected = kernels.select(&kernel).map_err(io::Error::other)?;
            let builder = ScriptKernelBuilder {
                script: kernels.build_script.clone(),
                workdir: kernels.build_dir().to_path_buf(),
                binary_pattern: kernels.binary_pattern.clone(),
                timeout: cfg.build_timeout,
            };
            let counter = HardwareCounter::for_host(cfg.harness.timeout);
            let toolchain = NativeToolchain::for_abi(cfg.abi, cfg.build_timeout);
            let outcome = Calibrator::new(&toolchain, &runner, &cfg).calibrate_kernels(
                &builder,
                &counter,
                &selected,
            );

            let report = match merge_into {
                Some(path) => {
                    let text = fs::read_to_string(&path)?;
                    let mut combined: CalibrationReport =
                        serde_json::from_str(&text).map_err(io::Error::other)?;
                    combined.merge(outcome.records, outcome.failures);
                    combined
                }
                None => calibration_report(&cfg, outcome),
            };
            print_calibration_summary(&report);
            emit(&report, args.out.as_deref())?;
        }
        Command::Estimate { manifest } => {
            let fixed = FixedWorkloadManifest::load(&manifest).map_err(io::Error::other)?;
            let toolchain = NativeToolchain::for_abi(cfg.abi, cfg.build_timeout);
            let outcome = Calibrator::new(&toolchain, &runner, &cfg).estimate_suite(&fixed);

            let report = calibration_report(&cfg, outcome);
            print_calibration_summary(&report);
            emit(&report, args.out.as_deref())?;
        }
        Command::Compare {
            calibration,
            simulator,
        } => {
            let text = fs::read_to_string(&calibration)?;
            let calibration: CalibrationReport =
                serde_json::from_str(&text).map_err(io::Error::other)?;
            let predictions = SimulatorPredictions::load(&simulator).map_err(io::Error::other)?;

            let real: BTreeMap<String, _> = calibration
                .results
                .iter()
                .map(|r| (r.name.clone(), r.metric()))
                .collect();
            let benchmarks = accuracy::evaluate(&real, &predictions, cfg.reference_frequency_ghz);
            let report = AccuracyReport {
                run: run_meta(&cfg),
                reference_frequency_ghz: cfg.reference_frequency_ghz,
                summary: accuracy::summarize(&benchmarks),
                benchmarks,
            };
            print_accuracy_summary(&report);
            emit(&report, args.out.as_deref())?;
        }
        Command::SelfCheck => {
            let spec = SyntheticSpec {
                seed: cfg.seed,
                ..SyntheticSpec::default()
            };
            let series = spec.generate();
            let fits = [
                ClosedForm.fit(&series).map_err(io::Error::other)?,
                Linalg.fit(&series).map_err(io::Error::other)?,
            ];
            let slope_rel_diff =
                (fits[0].slope - fits[1].slope).abs() / fits[0].slope.abs().max(f64::MIN_POSITIVE);
            let agrees = slope_rel_diff < 1e-4;

            eprintln!("{:<12} {:>14} {:>12} {:>10}", "backend", "slope", "intercept", "r2");
            for (name, fit) in [(ClosedForm.name(), &fits[0]), (Linalg.name(), &fits[1])] {
                eprintln!(
                    "{name:<12} {:>14.6e} {:>12.4} {:>10.6}",
                    fit.slope, fit.intercept, fit.r_squared
                );
            }
            eprintln!("expected slope {:.6e}; backends agree: {agrees}", spec.slope);

            emit(
                &serde_json::json!({
                    "run": run_meta(&cfg),
                    "expected_slope": spec.slope,
                    "expected_intercept": spec.intercept,
                    "closed_form": fits[0],
                    "linalg": fits[1],
                    "slope_relative_difference": slope_rel_diff,
                    "agrees": agrees,
                }),
                args.out.as_deref(),
            )?;
            if !agrees {
                return Err(io::Error::other("regression backends disagree"));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stamp_is_unix_seconds() {
        let stamp = now_unix_stamp();
        let secs: u64 = stamp.strip_prefix("unix:").unwrap().parse().unwrap();
        assert!(secs > 1_600_000_000);
    }
}
