//! Benchmarks for partition loading.
//!
//! Measures a cold load (every record inserted) against a warm re-load
//! (every record already present) of one partition into an in-memory
//! database.

use std::sync::Arc;

use chrono::NaiveDate;
use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use serde_json::json;

use harvest_core::types::{RawPartition, RawRecord};
use harvest_ingest::IngestionLoader;
use harvest_storage::{Database, MessageRepository};

/// Records per benchmark partition.
const RECORDS_PER_PARTITION: usize = 1_000;

fn build_partition() -> RawPartition {
    let records = (1..=RECORDS_PER_PARTITION)
        .map(|i| {
            RawRecord::from_payload(
                "chemedA",
                json!({
                    "id": i,
                    "date": "2025-07-10T08:15:00+00:00",
                    "message": format!("Paracetamol 500mg, pack {} in stock", i),
                    "views": i * 3,
                }),
            )
        })
        .collect();
    RawPartition {
        date: NaiveDate::from_ymd_opt(2025, 7, 10).expect("valid date"),
        channel: "chemedA".to_string(),
        records,
    }
}

fn fresh_loader() -> IngestionLoader {
    let db = Arc::new(Database::in_memory().expect("in-memory database"));
    IngestionLoader::new(MessageRepository::new(db), 1)
}

fn bench_cold_load(c: &mut Criterion) {
    let partition = build_partition();
    c.bench_function("load_partition_cold", |b| {
        b.iter_batched(
            fresh_loader,
            |loader| loader.load_partition(&partition),
            BatchSize::SmallInput,
        )
    });
}

fn bench_warm_reload(c: &mut Criterion) {
    let partition = build_partition();
    let loader = fresh_loader();
    loader.load_partition(&partition);
    c.bench_function("load_partition_all_present", |b| {
        b.iter(|| loader.load_partition(&partition))
    });
}

criterion_group!(benches, bench_cold_load, bench_warm_reload);
criterion_main!(benches);
