//! Benchmarks for `seenlog::idlog`.
#![allow(missing_docs)]

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use seenlog::storage::{Directory, FsDirectory, MemoryDirectory};
use seenlog::{EntityId, IdLog, LoadLimit, MetadataStore};
use std::sync::Arc;

fn ids(n: usize) -> Vec<String> {
    // Snowflake-sized IDs.
    (0..n).map(|i| format!("{}", 1_600_000_000_000_000_000u64 + i as u64)).collect()
}

fn filled(dir: Arc<dyn Directory>, n: usize) -> (MetadataStore, IdLog) {
    let mut meta = MetadataStore::new(dir.clone());
    let log = IdLog::new(dir);
    let e = EntityId::new("bench").unwrap();
    log.append(&mut meta, &e, &ids(n), None).unwrap();
    (meta, log)
}

fn bench_idlog(c: &mut Criterion) {
    let e = EntityId::new("bench").unwrap();
    let batch = ids(10_000);

    let mut group = c.benchmark_group("idlog");

    group.bench_function("append_10k_memory", |b| {
        b.iter_batched(
            || {
                let dir: Arc<dyn Directory> = Arc::new(MemoryDirectory::new());
                (MetadataStore::new(dir.clone()), IdLog::new(dir))
            },
            |(mut meta, log)| {
                log.append(&mut meta, &e, &batch, None).unwrap();
            },
            BatchSize::SmallInput,
        );
    });

    group.bench_function("append_10k_fs", |b| {
        b.iter_batched(
            || {
                let tmp = tempfile::tempdir().unwrap();
                let dir: Arc<dyn Directory> = Arc::new(FsDirectory::new(tmp.path()).unwrap());
                (tmp, MetadataStore::new(dir.clone()), IdLog::new(dir))
            },
            |(_tmp, mut meta, log)| {
                log.append(&mut meta, &e, &batch, None).unwrap();
            },
            BatchSize::SmallInput,
        );
    });

    // Newest-first reads should not depend on total history size.
    for history in [10_000usize, 100_000] {
        let tmp = tempfile::tempdir().unwrap();
        let dir: Arc<dyn Directory> = Arc::new(FsDirectory::new(tmp.path()).unwrap());
        let (mut meta, log) = filled(dir, history);
        group.bench_function(format!("load_newest_3000_of_{history}_fs"), |b| {
            b.iter(|| {
                let xs = log
                    .load(&mut meta, &e, LoadLimit::default(), None)
                    .unwrap();
                std::hint::black_box(xs);
            });
        });
    }

    group.bench_function("stage_and_consolidate_10x1k_memory", |b| {
        b.iter_batched(
            || {
                let dir: Arc<dyn Directory> = Arc::new(MemoryDirectory::new());
                (MetadataStore::new(dir.clone()), IdLog::new(dir))
            },
            |(mut meta, log)| {
                for chunk in batch.chunks(1000) {
                    log.stage(&mut meta, &e, chunk).unwrap();
                }
                log.consolidate(&mut meta, &e, None).unwrap();
            },
            BatchSize::SmallInput,
        );
    });

    group.finish();
}

criterion_group!(benches, bench_idlog);
criterion_main!(benches);
