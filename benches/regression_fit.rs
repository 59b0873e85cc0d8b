//! Closed-form vs SVD least-squares on calibration-sized series.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use cpi_calibration_bench::regression::RegressionBackend;
use cpi_calibration_bench::synthetic::generate_series;

fn bench_fit(c: &mut Criterion) {
    let mut group = c.benchmark_group("regression_fit");

    for points in [6usize, 64, 1_024] {
        let work: Vec<u64> = (1..=points as u64).map(|i| i * 1_000_000).collect();
        let series = generate_series(3.0e-7, 20.0, 0.5, &work, 7);

        for backend in [RegressionBackend::ClosedForm, RegressionBackend::Linalg] {
            group.bench_with_input(
                BenchmarkId::new(backend.as_str(), points),
                &series,
                |b, series| b.iter(|| backend.fitter().fit(black_box(series))),
            );
        }
    }

    group.finish();
}

criterion_group!(benches, bench_fit);
criterion_main!(benches);
