//! Performance benchmarks for DHT22 edge decoding.
//!
//! A real sensor delivers a frame in about 5 ms; edge callbacks run on the
//! backend's delivery thread, so the per-edge cost has to stay far below the
//! shortest pulse (~20 µs).
//!
//! Run benchmarks with:
//! ```sh
//! cargo bench --bench capture_bench
//! ```

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use pinwire_core::{Level, LineId};
use pinwire_hardware::mock::MockBackend;
use pinwire_hardware::{Backend, Pin, PinConfig, PinRegistry};
use pinwire_protocol::capture::EdgeTimingCapture;
use pinwire_protocol::decoder::{CaptureProfile, EdgeDecoder, Feed};
use pinwire_protocol::dht22::{Frame, decode_frame};
use std::hint::black_box;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

const FRAME: Frame = [0x02, 0x8C, 0x01, 0x5F, 0xEE];

/// Edges of `frame` as a sensor produces them after the start signal.
fn frame_edges(frame: &Frame) -> Vec<(Level, Duration)> {
    let us = Duration::from_micros;
    let mut edges = vec![
        (Level::Low, us(20)),
        (Level::High, us(80)),
        (Level::Low, us(80)),
    ];
    for byte in frame {
        for bit in (0..8).rev() {
            let high = if (byte >> bit) & 1 == 1 { 70 } else { 26 };
            edges.push((Level::High, us(50)));
            edges.push((Level::Low, us(high)));
        }
    }
    edges.push((Level::High, us(50)));
    edges
}

/// Benchmark the bare decoder over a full frame.
fn bench_decoder_frame(c: &mut Criterion) {
    let mut group = c.benchmark_group("decoder");
    let edges = frame_edges(&FRAME);
    group.throughput(Throughput::Elements(edges.len() as u64));

    group.bench_function("feed_dht22_frame", |b| {
        b.iter(|| {
            let mut decoder = EdgeDecoder::new(CaptureProfile::dht22());
            for (level, elapsed) in &edges {
                if let Feed::Complete(buffer) = decoder.feed(*level, *elapsed) {
                    black_box(buffer);
                }
            }
        });
    });

    group.finish();
}

/// Benchmark decoding with leading line noise the preamble must skip.
fn bench_decoder_noise(c: &mut Criterion) {
    let mut group = c.benchmark_group("decoder_noise");

    for glitches in [0usize, 8, 32] {
        let mut edges = Vec::with_capacity(glitches * 2 + 84);
        for _ in 0..glitches {
            edges.push((Level::Low, Duration::from_micros(3)));
            edges.push((Level::High, Duration::from_micros(3)));
        }
        edges.extend(frame_edges(&FRAME));
        group.throughput(Throughput::Elements(edges.len() as u64));

        group.bench_with_input(BenchmarkId::from_parameter(glitches), &edges, |b, edges| {
            b.iter(|| {
                let mut decoder = EdgeDecoder::new(CaptureProfile::dht22());
                for (level, elapsed) in edges {
                    black_box(decoder.feed(*level, *elapsed));
                }
            });
        });
    }

    group.finish();
}

/// Benchmark frame decoding.
fn bench_decode_frame(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_frame");
    group.throughput(Throughput::Elements(1));

    group.bench_function("decode_dht22_frame", |b| {
        b.iter(|| black_box(decode_frame(black_box(FRAME))));
    });

    group.finish();
}

/// Benchmark a full capture through a pin on the mock backend.
fn bench_capture_session(c: &mut Criterion) {
    let mut group = c.benchmark_group("capture_session");
    let edges = frame_edges(&FRAME);
    group.throughput(Throughput::Elements(edges.len() as u64));

    let line = LineId::new(4);
    let (mock, handle) = MockBackend::new();
    let registry = Arc::new(PinRegistry::new());
    let pin = Pin::open_in(&registry, &Backend::from(mock), PinConfig::input(line)).unwrap();
    let capture = EdgeTimingCapture::new(CaptureProfile::dht22()).unwrap();
    let frames = Arc::new(AtomicUsize::new(0));

    group.bench_function("capture_dht22_frame", |b| {
        b.iter(|| {
            let frames = Arc::clone(&frames);
            let session = capture
                .start(&pin, move |result| {
                    if result.is_ok() {
                        frames.fetch_add(1, Ordering::Relaxed);
                    }
                })
                .unwrap();
            handle.emit_all(line, &edges);
            black_box(session);
        });
    });

    group.finish();
    assert!(frames.load(Ordering::Relaxed) > 0);
}

criterion_group!(
    benches,
    bench_decoder_frame,
    bench_decoder_noise,
    bench_decode_frame,
    bench_capture_session
);
criterion_main!(benches);
