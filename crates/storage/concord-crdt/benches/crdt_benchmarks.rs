use concord_crdt::{ActorId, Mergeable, OrSet, PnCounter};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

fn counter_replicas(actors: usize) -> Vec<PnCounter> {
    (0..actors)
        .map(|i| {
            let mut c = PnCounter::new();
            c.increment(&ActorId::new(format!("agent-{i}")), i as u64 + 1);
            c
        })
        .collect()
}

fn bench_counter_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("pn_counter_merge");
    for actors in [8usize, 64, 512] {
        let replicas = counter_replicas(actors);
        group.bench_with_input(BenchmarkId::from_parameter(actors), &replicas, |b, replicas| {
            b.iter(|| {
                let mut acc = PnCounter::new();
                for r in replicas {
                    acc.merge(black_box(r));
                }
                acc.value()
            })
        });
    }
    group.finish();
}

fn bench_or_set_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("or_set_merge");
    for size in [16usize, 256, 2048] {
        let mut left = OrSet::new();
        let mut right = OrSet::new();
        let (a, b) = (ActorId::from("a"), ActorId::from("b"));
        for i in 0..size {
            left.add(&a, format!("item-{i}"));
            right.add(&b, format!("item-{}", i + size / 2));
        }
        for i in (0..size).step_by(3) {
            right.remove(&format!("item-{}", i + size / 2));
        }
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |bench, _| {
            bench.iter(|| black_box(left.merged(&right)).len())
        });
    }
    group.finish();
}

criterion_group!(benches, bench_counter_merge, bench_or_set_merge);
criterion_main!(benches);
