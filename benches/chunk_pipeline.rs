use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use csv_loader::{
    Dialect, LoadOptions, MemoryStore, Orchestrator, SchemaPolicy, pipeline::ChunkStream,
    reconcile::Reconciler, scan_file,
};
use tempfile::TempDir;

const ROWS: usize = 50_000;

fn generate_orders(dir: &Path, name: &str, rows: usize, with_region: bool) -> PathBuf {
    let csv_path = dir.join(name);
    let mut file = File::create(&csv_path).expect("create csv");
    if with_region {
        writeln!(file, "id,ordered_at,amount,status,region").expect("header");
    } else {
        writeln!(file, "status,id,amount,ordered_at").expect("header");
    }
    for i in 0..rows {
        let status = match i % 3 {
            0 => "shipped",
            1 => "pending",
            _ => "processing",
        };
        let day = (i % 28) + 1;
        let amount = (i % 1000) as f64 / 10.0;
        if with_region {
            writeln!(file, "{i},2024-01-{day:02},{amount},{status},r{}", i % 7).expect("row");
        } else {
            writeln!(file, "{status},{i},{amount},2024-01-{day:02}").expect("row");
        }
    }
    csv_path
}

fn bench_chunk_stream(c: &mut Criterion) {
    let temp_dir = TempDir::new().expect("temp dir");
    let a = generate_orders(temp_dir.path(), "a.csv", ROWS, true);
    let b = generate_orders(temp_dir.path(), "b.csv", ROWS, false);
    let dialect = Dialect::default();
    let files = vec![
        scan_file(&a, &dialect, 2000).expect("scan a"),
        scan_file(&b, &dialect, 2000).expect("scan b"),
    ];
    let reconciliation = Reconciler::new(&files)
        .reconcile(&SchemaPolicy::Union)
        .expect("reconcile");
    let schema = Arc::new(reconciliation.schema.clone());

    let mut group = c.benchmark_group("chunk_stream");
    for chunk_size in [1_000usize, 10_000, 50_000] {
        group.bench_with_input(
            BenchmarkId::new("reordered_file", chunk_size),
            &chunk_size,
            |bench, &chunk_size| {
                bench.iter(|| {
                    let rows: usize = ChunkStream::open(
                        &b,
                        &dialect,
                        &reconciliation.plans[1],
                        Arc::clone(&schema),
                        Arc::clone(&schema),
                        None,
                        chunk_size,
                    )
                    .expect("open stream")
                    .map(|chunk| chunk.expect("chunk").len())
                    .sum();
                    assert_eq!(rows, ROWS);
                });
            },
        );
    }
    group.finish();
}

fn bench_memory_load(c: &mut Criterion) {
    let temp_dir = TempDir::new().expect("temp dir");
    let paths = vec![
        generate_orders(temp_dir.path(), "a.csv", ROWS, true),
        generate_orders(temp_dir.path(), "b.csv", ROWS, false),
    ];

    let mut group = c.benchmark_group("memory_load");
    group.sample_size(10);
    for workers in [1usize, 2] {
        group.bench_with_input(BenchmarkId::new("workers", workers), &workers, |bench, &workers| {
            bench.iter(|| {
                let store = MemoryStore::new();
                let options = LoadOptions {
                    workers,
                    ..LoadOptions::new("orders")
                };
                let report = Orchestrator::new(Arc::new(store.clone()), options)
                    .load(&paths)
                    .expect("load");
                assert_eq!(report.total_rows, (ROWS * 2) as u64);
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_chunk_stream, bench_memory_load);
criterion_main!(benches);
