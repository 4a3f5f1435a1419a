use criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};

use standby_replica::store::DefaultStoreFactory;
use standby_replica::{Partition, Record, StateManager, StoreSpec, TaskId, Topology};

fn batch(len: u64) -> Vec<Record> {
    (0..len)
        .map(|offset| Record::upsert(offset, format!("key{}", offset % 512), offset.to_be_bytes()))
        .collect()
}

fn build(root: &std::path::Path, spec: StoreSpec) -> StateManager {
    let topo = Topology::new(vec![spec]).unwrap();
    let task = TaskId::new(0, 0);
    let dir = standby_replica::state_dir::TaskDir::lock(root, task).unwrap();
    let mut context = standby_replica::context::ProcessorContext::new(
        task,
        dir.path(),
        standby_replica::context::ContextKind::Standby,
        &topo,
    );
    StateManager::new(
        dir,
        &[Partition::new("counts-changelog", 0)],
        &topo,
        &DefaultStoreFactory,
        &mut context,
    )
    .unwrap()
}

pub fn criterion_benchmark(c: &mut Criterion) {
    let part = Partition::new("counts-changelog", 0);

    let mut group = c.benchmark_group("update_standby_states");
    for (name, spec) in [
        ("in_mem", StoreSpec::new("counts", "counts-changelog").in_memory()),
        ("sqlite", StoreSpec::new("counts", "counts-changelog")),
    ] {
        let root = tempfile::tempdir().unwrap();
        let mut mgr = build(root.path(), spec);
        // Half of every batch is held back at the limit.
        mgr.put_offset_limit(&part, 5_000).unwrap();

        group.bench_function(BenchmarkId::new(name, 10_000), |b| {
            b.iter_batched(
                || batch(10_000),
                |records| mgr.update_standby_states(&part, records).unwrap(),
                BatchSize::LargeInput,
            );
        });
        group.bench_function(BenchmarkId::new(format!("{name}_flush"), 5_000), |b| {
            b.iter_batched(
                || batch(5_000),
                |records| {
                    mgr.update_standby_states(&part, records).unwrap();
                    mgr.flush().unwrap();
                },
                BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
