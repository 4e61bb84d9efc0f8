//! Evaluation benchmarks for snap-eval

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use snap_core::{
    MemoryRecipeStore, Op, OptimizerConfig, OwnerId, PathMatcher, Recipe, RecipeStore, RecipeTag,
    SnapshotId,
};
use snap_eval::{cost, Materializer, Optimizer};
use std::sync::Arc;
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;

const OWNER: OwnerId = OwnerId(1);

/// A chain of `len` writes spread over 16 files
fn edit_chain(rt: &Runtime, len: usize) -> (Arc<MemoryRecipeStore>, SnapshotId) {
    let store = Arc::new(MemoryRecipeStore::new());
    let head = rt.block_on(async {
        let mut head = SnapshotId::Empty;
        for i in 0..len {
            let op = Op::write(format!("src/f{}.rs", i % 16), format!("rev {}", i));
            let (id, _) = store
                .create(Recipe::on(op, head), Some(OWNER), RecipeTag::Temp)
                .await
                .unwrap();
            head = id;
        }
        head
    });
    (store, head)
}

fn bench_materialize(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("materialize");
    for len in [100usize, 1_000, 10_000] {
        let (store, head) = edit_chain(&rt, len);
        group.bench_with_input(BenchmarkId::new("chain", len), &len, |b, _| {
            b.iter(|| {
                let mat = Materializer::new(store.clone());
                let cancel = CancellationToken::new();
                let tree = rt.block_on(mat.materialize_all(&head, &cancel)).unwrap();
                black_box(tree.len())
            });
        });
    }
    group.finish();
}

fn bench_cost(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let (store, head) = edit_chain(&rt, 10_000);
    let mat = Materializer::new(store);
    let matcher = PathMatcher::from_paths(["src/f3.rs"]);
    c.bench_function("cost_single_path", |b| {
        b.iter(|| {
            let cancel = CancellationToken::new();
            let result = rt
                .block_on(cost(mat.evaluator(), &head, RecipeTag::Optimal, &matcher, &cancel))
                .unwrap();
            black_box(result.ops)
        });
    });
}

fn bench_optimize(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    c.bench_function("optimize_chain_1000", |b| {
        b.iter_batched(
            || edit_chain(&rt, 1_000),
            |(store, head)| {
                let optimizer = Optimizer::new(Materializer::new(store), OptimizerConfig::default());
                let cancel = CancellationToken::new();
                black_box(rt.block_on(optimizer.optimize(&head, &cancel)).unwrap())
            },
            criterion::BatchSize::SmallInput,
        );
    });
}

criterion_group!(benches, bench_materialize, bench_cost, bench_optimize);
criterion_main!(benches);
