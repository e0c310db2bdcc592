//! Performance benchmarks for consensus rounds
//!
//! Targets:
//! - Local solve: <5ms for 1000 instances of 20 features
//! - Train + merge round: <10ms on the in-memory store

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use mantis_core::solver::{LocalSolver, SvmDual};
use mantis_core::storage::test_utils::create_test_store;
use mantis_core::{Context, Entity, Hyperparameters, MantisConfig, SessionManager, SparseVector};
use rand::Rng;

fn random_features(rng: &mut impl Rng, dims: u64, nnz: usize) -> SparseVector {
    (0..nnz)
        .map(|_| (rng.gen_range(0..dims), rng.gen_range(-1.0f64..1.0)))
        .collect()
}

/// Benchmark 1: Local solve
fn bench_local_solve(c: &mut Criterion) {
    let mut group = c.benchmark_group("local_solve");
    let mut rng = rand::thread_rng();

    for instances in [100usize, 1000] {
        let params = Hyperparameters {
            max_num_instances: instances,
            gamma: 0.1,
            ..Default::default()
        };
        let mut solver = SvmDual::new(SparseVector::new(), &params).unwrap();
        for slot in 0..instances {
            let x = random_features(&mut rng, 500, 20);
            let label = if rng.gen_bool(0.5) { 1.0 } else { -1.0 };
            solver.set_data(&x, label, 1.0, slot).unwrap();
        }
        solver.set_num_instances(instances);
        let z = SparseVector::new();
        let mu = SparseVector::new();

        group.bench_with_input(BenchmarkId::from_parameter(instances), &instances, |b, _| {
            b.iter(|| {
                solver.set_model(black_box(&z), black_box(&mu));
                black_box(solver.train_model())
            })
        });
    }

    group.finish();
}

/// Benchmark 2: Train and merge round through the session manager
fn bench_round(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let mut rng = rand::thread_rng();

    let manager = runtime.block_on(async {
        let ctx = Context::new(create_test_store(), MantisConfig::default());
        let manager = SessionManager::create(ctx, "bench", "alice").await.unwrap();
        manager.add_one("alice").await.unwrap();
        for _ in 0..200 {
            let entity = Entity::new(random_features(&mut rng, 500, 20));
            let label = if rng.gen_bool(0.5) { 1.0 } else { -1.0 };
            manager.add_data("alice", &entity, label, 1.0).await.unwrap();
        }
        manager
    });

    c.bench_function("train_merge_round", |b| {
        b.iter(|| {
            runtime.block_on(async {
                manager.train("alice", None).await.unwrap();
                manager.merge("alice", 0).await.unwrap();
            })
        })
    });
}

criterion_group!(benches, bench_local_solve, bench_round);
criterion_main!(benches);
