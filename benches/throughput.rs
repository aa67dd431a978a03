//! Throughput benchmarks for the broadcast hub.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use murmur::{BroadcastHub, HubConfig};
use tempfile::TempDir;

fn create_hub(dir: &TempDir) -> BroadcastHub {
    BroadcastHub::create(HubConfig {
        path: dir.path().join("hub"),
        channel_capacity: 1 << 20,
        ..Default::default()
    })
    .unwrap()
}

fn memory_hub() -> BroadcastHub {
    BroadcastHub::in_memory(HubConfig {
        channel_capacity: 1 << 20,
        ..Default::default()
    })
    .unwrap()
}

/// Durable submit with varying numbers of subscribers
fn bench_submit_fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("submit_fan_out");

    for subscribers in [0, 1, 10, 100] {
        group.bench_with_input(
            BenchmarkId::new("subscribers", subscribers),
            &subscribers,
            |b, &n| {
                let hub = memory_hub();
                let handles: Vec<_> = (0..n).map(|_| hub.subscribe()).collect();

                b.iter(|| {
                    let seq = hub.submit("alice", "hello, world", None).unwrap();
                    for handle in &handles {
                        black_box(handle.try_recv().ok());
                    }
                    black_box(seq)
                });
            },
        );
    }

    group.finish();
}

/// Submit against the file backend (includes fsync)
fn bench_submit_durable(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let hub = create_hub(&dir);

    c.bench_function("submit_durable", |b| {
        b.iter(|| black_box(hub.submit("alice", "hello, world", None).unwrap()))
    });
}

/// History pages served from the tail cache versus the log
fn bench_fetch_history(c: &mut Criterion) {
    let mut group = c.benchmark_group("fetch_history");

    let hub = memory_hub();
    for i in 0..10_000 {
        hub.submit("alice", &format!("message {}", i), None).unwrap();
    }

    for (label, from) in [("cached_tail", 9_900i64), ("cold_head", 1)] {
        group.bench_function(label, |b| {
            b.iter(|| black_box(hub.fetch_history(from, 100).unwrap()))
        });
    }

    group.finish();
}

/// Attachment upload of new content and of duplicates
fn bench_upload(c: &mut Criterion) {
    let mut group = c.benchmark_group("upload_attachment");

    for size in [1024usize, 64 * 1024] {
        let hub = memory_hub();
        let content = vec![42u8; size];
        hub.upload_attachment(&content, "image/png").unwrap();

        group.bench_with_input(BenchmarkId::new("duplicate", size), &content, |b, content| {
            b.iter(|| black_box(hub.upload_attachment(content, "image/png").unwrap()))
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_submit_fan_out,
    bench_submit_durable,
    bench_fetch_history,
    bench_upload
);
criterion_main!(benches);
