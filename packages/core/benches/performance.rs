//! Performance benchmarks for ContextSpace core operations
//!
//! Run with: `cargo bench -p contextspace-core`
//!
//! These benchmarks measure critical path performance:
//! - Forced path rebuild of a populated tree (nested categories, courses, cohorts)
//! - Single-node resolve, cold (database) and warm (instance cache)
//! - Batched preload of many nodes

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use contextspace_core::{ContextConfig, ContextLevel, ContextService, HandlerCatalog};
use tempfile::TempDir;
use tokio::runtime::Runtime;

/// Setup a service with a fresh database
async fn setup_service() -> (ContextService, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let config = ContextConfig::with_database(temp_dir.path().join("bench.db"));
    let service = ContextService::open(config, &HandlerCatalog::builtin(), None)
        .await
        .unwrap();
    (service, temp_dir)
}

/// Insert `categories` nested five deep, one course and one cohort per category
async fn populate(service: &ContextService, categories: i64) {
    let conn = service.database().connect_with_timeout().await.unwrap();
    conn.execute("BEGIN", ()).await.unwrap();
    for id in 1..=categories {
        let parent = if id % 5 == 1 { 0 } else { id - 1 };
        conn.execute(
            "INSERT INTO course_categories (id, name, parent) VALUES (?, ?, ?)",
            (id, format!("Category {}", id), parent),
        )
        .await
        .unwrap();
        conn.execute(
            "INSERT INTO course (id, fullname, shortname, category) VALUES (?, ?, ?, ?)",
            (id, format!("Course {}", id), format!("C{}", id), id),
        )
        .await
        .unwrap();
        conn.execute(
            "INSERT INTO cohort (id, name, contextid) VALUES (?, ?, 0)",
            (id, format!("Cohort {}", id)),
        )
        .await
        .unwrap();
    }
    conn.execute("COMMIT", ()).await.unwrap();

    service.create_missing_instances(None).await.unwrap();
}

/// Benchmark forced rebuild of every level
fn bench_rebuild_all(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("rebuild_all_force");
    group.sample_size(10);

    for size in [100i64, 500] {
        let (service, _temp) = rt.block_on(async {
            let (service, temp) = setup_service().await;
            populate(&service, size).await;
            (service, temp)
        });

        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| {
                rt.block_on(async {
                    black_box(service.rebuild_all(true).await.unwrap());
                })
            })
        });
    }

    group.finish();
}

/// Benchmark resolve_or_create with and without the instance cache
fn bench_resolve(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let (service, _temp) = rt.block_on(async {
        let (service, temp) = setup_service().await;
        populate(&service, 200).await;
        (service, temp)
    });

    c.bench_function("resolve_or_create_cold", |b| {
        b.iter(|| {
            rt.block_on(async {
                service.instance_cache().invalidate_all().await;
                black_box(
                    service
                        .resolve_or_create(ContextLevel::COURSE, 150)
                        .await
                        .unwrap(),
                );
            })
        })
    });

    c.bench_function("resolve_or_create_warm", |b| {
        rt.block_on(async {
            service
                .resolve_or_create(ContextLevel::COURSE, 150)
                .await
                .unwrap();
        });
        b.iter(|| {
            rt.block_on(async {
                black_box(
                    service
                        .resolve_or_create(ContextLevel::COURSE, 150)
                        .await
                        .unwrap(),
                );
            })
        })
    });

    let ids: Vec<i64> = (1..=400).collect();
    c.bench_function("preload_400", |b| {
        b.iter(|| {
            rt.block_on(async {
                service.instance_cache().invalidate_all().await;
                black_box(service.preload(&ids).await.unwrap());
            })
        })
    });
}

criterion_group!(benches, bench_rebuild_all, bench_resolve);
criterion_main!(benches);
