//! Counting Hot Path Benchmarks
//!
//! Benchmarks for the per-object accumulation paths: counter arithmetic,
//! class lookup, and the frequency-promoted child-edge scan.
//!
//! # Benchmark Categories
//!
//! 1. **Counter Arithmetic**: `inc` and bulk `add` throughput
//! 2. **Class Lookup**: registry find and snapshot class-map find
//! 3. **Child Scan**: LFU-promoted list probe at realistic fan-out

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use heapscope::{
    ClassKind, ClassRegistry, HostPtr, ObjectCounter, ProvisionalClass, SnapshotContainer,
};
use std::sync::Arc;

// =============================================================================
// Benchmark Helpers
// =============================================================================

fn provisional(name: &str) -> ProvisionalClass {
    ProvisionalClass {
        name: name.as_bytes().to_vec(),
        loader_id: 0,
        loader_tag: 0,
        instance_size: 24,
        kind: ClassKind::Instance,
    }
}

/// Intern `n` classes at distinct host pointers.
fn intern_classes(registry: &ClassRegistry, n: usize) -> Vec<Arc<heapscope::ClassRecord>> {
    (0..n)
        .map(|i| registry.intern(HostPtr(0x10000 + i * 0x40), provisional(&format!("K{}", i))))
        .collect()
}

// =============================================================================
// Counter Arithmetic
// =============================================================================

fn bench_counter_arithmetic(c: &mut Criterion) {
    let mut group = c.benchmark_group("counter");
    group.throughput(Throughput::Elements(1));

    group.bench_function("inc", |b| {
        let counter = ObjectCounter::new();
        b.iter(|| counter.inc(black_box(24)))
    });

    group.bench_function("bulk_add", |b| {
        let counter = ObjectCounter::new();
        let local = ObjectCounter::new();
        for _ in 0..1000 {
            local.inc(24);
        }
        b.iter(|| counter.add(black_box(&local)))
    });

    group.finish();
}

// =============================================================================
// Class Lookup
// =============================================================================

fn bench_class_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("class_lookup");

    for &classes in &[64usize, 1024] {
        group.bench_with_input(
            BenchmarkId::new("registry_find", classes),
            &classes,
            |b, &classes| {
                let registry = ClassRegistry::new();
                let records = intern_classes(&registry, classes);
                let probe = records[classes / 2].host_ptr();
                b.iter(|| black_box(registry.find(probe)))
            },
        );

        group.bench_with_input(
            BenchmarkId::new("snapshot_find_class", classes),
            &classes,
            |b, &classes| {
                let registry = ClassRegistry::new();
                let records = intern_classes(&registry, classes);
                let container = SnapshotContainer::new(false);
                for record in &records {
                    container.push_class(record);
                }
                let probe = &records[classes / 2];
                b.iter(|| black_box(container.find_class(probe)))
            },
        );
    }

    group.finish();
}

// =============================================================================
// Child Scan
// =============================================================================

fn bench_child_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("child_scan");
    group.throughput(Throughput::Elements(1));

    // A parent with typical fan-out whose hot child starts at the tail;
    // promotion pulls it to the head after a few probes.
    group.bench_function("find_child_hot", |b| {
        let registry = ClassRegistry::new();
        let records = intern_classes(&registry, 8);
        let container = SnapshotContainer::new(true);
        let parent = container.push_class(&records[0]);
        for record in &records {
            container.push_child(parent, record);
        }
        let hot = records[7].host_ptr();
        b.iter(|| black_box(parent.find_child(hot)))
    });

    group.bench_function("find_child_miss", |b| {
        let registry = ClassRegistry::new();
        let records = intern_classes(&registry, 8);
        let container = SnapshotContainer::new(true);
        let parent = container.push_class(&records[0]);
        for record in &records {
            container.push_child(parent, record);
        }
        b.iter(|| black_box(parent.find_child(HostPtr(0xdead))))
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_counter_arithmetic,
    bench_class_lookup,
    bench_child_scan
);
criterion_main!(benches);
