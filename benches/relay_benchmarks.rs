//! Performance benchmarks for the relay hot paths.
//!
//! Covers admission-to-completion latency through a full relay, fan-out
//! across several destinations, route resolution and payload signing.

use std::{
    hint::black_box,
    sync::Arc,
    time::{Duration, Instant},
};

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use hermes_core::{signature, Destination, Event, TransportKind};
use hermes_delivery::{Route, RoutingConfig, RoutingTable};
use hermes_testing::{test_event, RelayHarness};
use tokio::runtime::Runtime;
use uuid::Uuid;

/// Benchmarks a single event from submit to completion record.
fn bench_relay_delivery(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("relay");
    group.sample_size(50);
    group.measurement_time(Duration::from_secs(10));
    group.throughput(Throughput::Elements(1));

    for destinations in [1usize, 4, 16] {
        group.bench_with_input(
            BenchmarkId::new("fan_out", destinations),
            &destinations,
            |b, &count| {
                b.iter_custom(|iters| {
                    rt.block_on(async {
                        let harness = harness(count);

                        let start = Instant::now();
                        for _ in 0..iters {
                            let record = harness.deliver(test_event("bench")).await;
                            black_box(record);
                        }
                        let elapsed = start.elapsed();

                        harness.relay.shutdown(Duration::from_secs(5)).await.unwrap();
                        elapsed
                    })
                });
            },
        );
    }

    group.finish();
}

/// Benchmarks admission alone: dedupe, validation, routing and enqueue.
fn bench_admission(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("admission");
    group.throughput(Throughput::Elements(1));

    for payload_size in [100usize, 10_000, 1_000_000] {
        group.bench_with_input(
            BenchmarkId::new("payload_size", payload_size),
            &payload_size,
            |b, &size| {
                let payload = "x".repeat(size);
                b.iter_custom(|iters| {
                    rt.block_on(async {
                        let harness = harness(1);

                        let start = Instant::now();
                        for _ in 0..iters {
                            let event =
                                Event::builder("bench", Uuid::new_v4().to_string(), payload.clone())
                                    .build();
                            black_box(harness.relay.submit(event).await.ok());
                        }
                        let elapsed = start.elapsed();

                        harness.relay.shutdown(Duration::from_secs(30)).await.unwrap();
                        elapsed
                    })
                });
            },
        );
    }

    group.finish();
}

/// Benchmarks route resolution against tables of growing size.
fn bench_routing(c: &mut Criterion) {
    let mut group = c.benchmark_group("routing");

    for routes in [10usize, 100, 1000] {
        let table = routing_table(routes);
        let event = Event::builder("source-last", "k", "p")
            .attribute("branch", "main")
            .build();

        group.bench_with_input(BenchmarkId::new("resolve", routes), &table, |b, table| {
            b.iter(|| black_box(table.resolve(black_box(&event)).unwrap()));
        });
    }

    group.finish();
}

/// Benchmarks HMAC signing and verification.
fn bench_signature(c: &mut Criterion) {
    let mut group = c.benchmark_group("signature");

    for size in [1_024usize, 65_536, 1_048_576] {
        let payload = vec![0x5a; size];
        let header = signature::sign(&payload, "bench-secret").unwrap();
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("sign", size), &payload, |b, payload| {
            b.iter(|| black_box(signature::sign(black_box(payload), "bench-secret").unwrap()));
        });

        group.bench_with_input(BenchmarkId::new("verify", size), &payload, |b, payload| {
            b.iter(|| signature::verify(black_box(payload), &header, "bench-secret").unwrap());
        });
    }

    group.finish();
}

fn harness(destinations: usize) -> RelayHarness {
    let builder = RelayHarness::builder().max_in_flight(100_000).queue_depth(100_000);
    (0..destinations)
        .fold(builder, |builder, i| builder.https(&format!("d{i}")))
        .build()
        .unwrap()
}

/// Builds a table where only the last route matches `source-last`.
fn routing_table(routes: usize) -> Arc<RoutingTable> {
    let destinations = (0..8)
        .map(|i| {
            Destination::new(
                format!("d{i}"),
                TransportKind::Https,
                format!("https://d{i}.hermes.test/hooks"),
            )
        })
        .collect();

    let routes = (0..routes)
        .map(|i| {
            let source = if i + 1 == routes { "source-last".to_string() } else { format!("source-{i}") };
            Route::for_source(source).when("branch", "main").to(format!("d{}", i % 8))
        })
        .collect();

    Arc::new(RoutingTable::build(RoutingConfig { destinations, routes }).unwrap())
}

criterion_group!(benches, bench_relay_delivery, bench_admission, bench_routing, bench_signature);
criterion_main!(benches);
