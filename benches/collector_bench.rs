//! Collector hot-path benchmarks

use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use perfwatch_engine::{MetricKind, MetricsCollector, Sample, StatisticalFunctions, Timestamp};

fn bench_record_latency(c: &mut Criterion) {
    let collector = MetricsCollector::with_capacity(10_000, 1_000);
    let mut value = 0.0f64;

    c.bench_function("record_latency", |b| {
        b.iter(|| {
            value = (value + 0.37) % 50.0;
            collector.record_latency(black_box(value), "bench");
        })
    });
}

fn bench_latency_stats(c: &mut Criterion) {
    let mut group = c.benchmark_group("current_latency_stats");

    for window in [100usize, 1_000, 10_000] {
        let collector = MetricsCollector::with_capacity(10_000, window);
        for i in 0..window {
            collector.record_latency((i % 97) as f64, "bench");
        }

        group.throughput(Throughput::Elements(window as u64));
        group.bench_with_input(BenchmarkId::from_parameter(window), &collector, |b, collector| {
            b.iter(|| black_box(collector.current_latency_stats()))
        });
    }

    group.finish();
}

fn bench_metrics_in_range(c: &mut Criterion) {
    let collector = MetricsCollector::with_capacity(10_000, 1_000);
    for secs in 0..10_000i64 {
        collector.record(Sample::new(MetricKind::CpuUsage, (secs % 100) as f64).at(Timestamp::from_secs(secs)));
    }

    c.bench_function("metrics_in_range_10pct", |b| {
        b.iter(|| {
            black_box(collector.metrics_in_range(
                black_box(Timestamp::from_secs(4_500)),
                black_box(Timestamp::from_secs(5_499)),
            ))
        })
    });

    c.bench_function("recent_metrics_1m", |b| {
        b.iter(|| black_box(collector.recent_metrics(Duration::from_secs(60))))
    });
}

fn bench_percentile(c: &mut Criterion) {
    let values: Vec<f64> = (0..1_000).map(|i| ((i * 7919) % 1_000) as f64).collect();

    c.bench_function("percentile_p95_1k", |b| {
        b.iter(|| black_box(StatisticalFunctions::percentile(black_box(&values), 95.0)))
    });
}

criterion_group!(
    benches,
    bench_record_latency,
    bench_latency_stats,
    bench_metrics_in_range,
    bench_percentile
);
criterion_main!(benches);
