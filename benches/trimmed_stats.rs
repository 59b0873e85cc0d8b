//! Trimmed-mean reduction over per-run timing samples.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use cpi_calibration_bench::harness::{trimmed_stats, DEFAULT_TRIM_FRACTION};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

fn samples(n: usize) -> Vec<f64> {
    let mut rng = ChaCha8Rng::seed_from_u64(0xC0FFEE);
    (0..n).map(|_| 20.0 + rng.gen_range(0.0..2.0)).collect()
}

fn bench_trimmed_stats(c: &mut Criterion) {
    let mut group = c.benchmark_group("trimmed_stats");

    // Profile run counts plus the fixed-workload sample sizes.
    for n in [5usize, 15, 1_000, 10_000] {
        let data = samples(n);
        group.bench_with_input(BenchmarkId::from_parameter(n), &data, |b, data| {
            b.iter(|| trimmed_stats(black_box(data), DEFAULT_TRIM_FRACTION))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_trimmed_stats);
criterion_main!(benches);
