// ========================================================================================
//
//                 Iterative hard thresholding kernel benchmarks
//
// ========================================================================================
//
// Measures the two kernels that dominate an IHT iteration on genotype data: the
// transpose product that forms the gradient over every variant, and the top-k
// projection of the gradient step.
//
// ========================================================================================

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use hardthresh::DesignMatrix;
use hardthresh::genotype::PackedGenotypes;
use hardthresh::project::top_k_indices;
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const NUM_SAMPLES: usize = 2_000;
const VARIANT_COUNTS: [usize; 3] = [1_000, 5_000, 20_000];
const SPARSITY: usize = 50;

fn random_dosages(n: usize, p: usize, rng: &mut StdRng) -> Array2<f64> {
    Array2::from_shape_fn((n, p), |_| {
        let draw: f64 = rng.r#gen();
        if draw < 0.5 {
            0.0
        } else if draw < 0.85 {
            1.0
        } else {
            2.0
        }
    })
}

fn benchmark_gradient(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(42);
    let mut group = c.benchmark_group("packed_matvec_transpose");
    for &p in &VARIANT_COUNTS {
        let genotypes = PackedGenotypes::from_dosages(random_dosages(NUM_SAMPLES, p, &mut rng).view())
            .expect("valid dosages");
        let residuals = Array1::from_shape_fn(NUM_SAMPLES, |_| rng.r#gen::<f64>() - 0.5);
        let mut gradient = Array1::zeros(p);
        group.throughput(Throughput::Elements((NUM_SAMPLES * p) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(p), &genotypes, |b, x| {
            b.iter(|| {
                x.matvec_transpose(black_box(residuals.view()), gradient.view_mut());
                black_box(&gradient);
            });
        });
    }
    group.finish();
}

fn benchmark_projection(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(7);
    let mut group = c.benchmark_group("top_k_projection");
    for &p in &VARIANT_COUNTS {
        let scores = Array1::from_shape_fn(p, |_| rng.r#gen::<f64>() - 0.5);
        let weights = Array1::from_shape_fn(p, |_| 1.0 + rng.r#gen::<f64>());
        group.throughput(Throughput::Elements(p as u64));
        group.bench_with_input(BenchmarkId::new("unweighted", p), &scores, |b, v| {
            b.iter(|| black_box(top_k_indices(black_box(v.view()), None, SPARSITY)));
        });
        group.bench_with_input(BenchmarkId::new("weighted", p), &scores, |b, v| {
            b.iter(|| {
                black_box(top_k_indices(
                    black_box(v.view()),
                    Some(weights.view()),
                    SPARSITY,
                ))
            });
        });
    }
    group.finish();
}

criterion_group!(iht_kernels, benchmark_gradient, benchmark_projection);
criterion_main!(iht_kernels);
