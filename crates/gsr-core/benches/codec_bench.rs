//! Criterion benchmarks for the envelope JSON codec.
//!
//! `GSR_DATA` is the highest-volume message type, so batches of several sizes
//! are measured alongside the small control messages.
//!
//! Run with:
//! ```bash
//! cargo bench --package gsr-core --bench codec_bench
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use gsr_core::protocol::codec::{decode_envelope, encode_envelope};
use gsr_core::protocol::messages::{
    Envelope, GsrDataPayload, HelloPayload, Payload, Sample, StartPayload, SyncMarkPayload,
};

// ── Message fixtures ──────────────────────────────────────────────────────────

fn make_hello() -> Envelope {
    Envelope::new(
        "bench-device",
        Payload::Hello(HelloPayload {
            device_name: "Shimmer3 GSR+".to_string(),
            capabilities: vec!["GSR".to_string(), "TEMP".to_string()],
            battery_level: 80,
            version: "1.0".to_string(),
        }),
    )
}

fn make_start() -> Envelope {
    Envelope::new(
        "bench-device",
        Payload::Start(StartPayload {
            session_name: "bench".to_string(),
            participant_id: Some("P01".to_string()),
            metadata: None,
        }),
    )
}

fn make_sync_mark() -> Envelope {
    Envelope::new(
        "bench-device",
        Payload::SyncMark(SyncMarkPayload {
            mark_id: "stimulus-1".to_string(),
            description: "auditory cue".to_string(),
        }),
    )
}

fn make_gsr_batch(n: u64) -> Envelope {
    let samples = (0..n)
        .map(|seq| Sample {
            t_mono_ns: seq as i64 * 7_812_500,
            t_utc_ns: 1_700_000_000_000_000_000 + seq as i64 * 7_812_500,
            seq,
            gsr_raw: 4.2 + seq as f64 * 0.001,
            gsr_filt: 4.1,
            temp: 33.4,
            flag_spike: false,
            flag_sat: false,
            flag_dropout: seq % 97 == 0,
        })
        .collect();
    Envelope::new("bench-device", Payload::GsrData(GsrDataPayload { samples }))
}

// ── Benchmark groups ──────────────────────────────────────────────────────────

fn fixtures() -> Vec<(&'static str, Envelope)> {
    vec![
        ("Ping", Envelope::new("bench-device", Payload::Ping)),
        ("Hello", make_hello()),
        ("Start", make_start()),
        ("SyncMark", make_sync_mark()),
        ("GsrData(10)", make_gsr_batch(10)),
        ("GsrData(128)", make_gsr_batch(128)),
    ]
}

/// Benchmarks `encode_envelope` for representative message types.
fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode_envelope");
    for (name, env) in fixtures() {
        group.bench_with_input(BenchmarkId::new("msg", name), &env, |b, env| {
            b.iter(|| encode_envelope(black_box(env)).expect("encode must succeed"))
        });
    }
    group.finish();
}

/// Benchmarks `decode_envelope` from pre-encoded text.
fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_envelope");
    for (name, env) in fixtures() {
        let text = encode_envelope(&env).expect("encode must succeed for benchmark setup");
        group.bench_with_input(BenchmarkId::new("msg", name), &text, |b, text| {
            b.iter(|| decode_envelope(black_box(text)).expect("decode must succeed"))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
