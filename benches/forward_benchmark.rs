// ========================================================================================
//
//                 Forward model and likelihood throughput benchmark
//
// ========================================================================================
//
// Measures the cost of one year-long forward solve per discrepancy formulation and the
// throughput of a parallel likelihood batch over random draws.
//
// ========================================================================================

use arbo::config::ModelConfig;
use arbo::data::{InitialConditions, ObservedData};
use arbo::discrepancy::DiscrepancyFormulation;
use arbo::forward::ForwardModel;
use arbo::likelihood::Likelihood;
use arbo::propagate::batch_log_likelihood;
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const WEEKS: usize = 52;
const BATCH_DRAWS: usize = 64;

fn weekly_times() -> Vec<f64> {
    (1..=WEEKS).map(|w| 7.0 * w as f64).collect()
}

fn benchmark_forward_solve(c: &mut Criterion) {
    let initial = InitialConditions::default().state(1.0);
    let times = weekly_times();

    let mut group = c.benchmark_group("Forward solve, one year");
    for formulation in DiscrepancyFormulation::ALL {
        let config = ModelConfig::new(7, WEEKS, formulation).unwrap();
        let model = ForwardModel::new(config).unwrap();
        let params = config.zero_params();
        group.bench_with_input(
            BenchmarkId::from_parameter(formulation.describe()),
            &params,
            |b, params| {
                b.iter(|| {
                    model
                        .solve(black_box(&initial), black_box(&times), black_box(params))
                        .unwrap()
                });
            },
        );
    }
    group.finish();
}

fn benchmark_likelihood_batch(c: &mut Criterion) {
    let config = ModelConfig::new(7, WEEKS, DiscrepancyFormulation::Linear).unwrap();
    let model = ForwardModel::new(config).unwrap();
    let weeks: Vec<f64> = (1..=WEEKS).map(|w| w as f64).collect();
    let observed = ObservedData::from_weekly_counts(&weeks, &vec![2000.0; WEEKS], 1.0).unwrap();
    let likelihood = Likelihood::new(
        model,
        InitialConditions::default().state(1.0),
        observed,
        25.0e6,
    )
    .unwrap();

    // Small negative draws stay well inside the runaway bound.
    let mut rng = StdRng::seed_from_u64(7);
    let draws: Vec<Vec<f64>> = (0..BATCH_DRAWS)
        .map(|_| (0..14).map(|_| rng.gen_range(-0.01..0.0)).collect())
        .collect();

    let mut group = c.benchmark_group("Likelihood batch");
    group.throughput(Throughput::Elements(BATCH_DRAWS as u64));
    group.sample_size(10);
    group.bench_function("linear, parallel", |b| {
        b.iter(|| batch_log_likelihood(black_box(&likelihood), black_box(&draws), || {}).unwrap());
    });
    group.finish();
}

criterion_group!(benches, benchmark_forward_solve, benchmark_likelihood_batch);
criterion_main!(benches);
