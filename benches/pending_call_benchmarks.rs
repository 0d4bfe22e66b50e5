use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::json;
use tasker_rpc::coordinator::PendingCallTable;
use tasker_rpc::messaging::{InboundMessage, RequestEnvelope};

fn benchmark_register_resolve(c: &mut Criterion) {
    let table = PendingCallTable::new();
    let mut n: u64 = 0;
    c.bench_function("pending_register_resolve", |b| {
        b.iter(|| {
            n += 1;
            let id = n.to_string();
            let rx = table
                .register(&id, "crawl", Duration::from_secs(30))
                .unwrap();
            black_box(table.resolve(&id, Ok(json!({"ok": true}))));
            black_box(rx);
        })
    });
}

fn benchmark_sweep_with_live_calls(c: &mut Criterion) {
    let table = PendingCallTable::new();
    let _receivers: Vec<_> = (0..1_000)
        .map(|i| {
            table
                .register(&format!("live-{i}"), "infer", Duration::from_secs(300))
                .unwrap()
        })
        .collect();

    c.bench_function("pending_sweep_1000_live", |b| {
        b.iter(|| black_box(table.sweep_expired(Duration::from_secs(300))))
    });
}

fn benchmark_envelope(c: &mut Criterion) {
    c.bench_function("request_envelope_encode", |b| {
        b.iter(|| {
            RequestEnvelope::new("corr-1", "crawl", json!({"action": "crawl_store", "storeId": 42}))
                .unwrap()
                .to_bytes()
                .unwrap()
        })
    });

    let reply = br#"{"correlationId":"corr-1","stores":[{"id":1},{"id":2}]}"#;
    c.bench_function("inbound_reply_decode", |b| {
        b.iter(|| {
            let message = InboundMessage::decode(black_box(reply)).unwrap();
            black_box(message.correlation_id())
        })
    });
}

criterion_group!(
    benches,
    benchmark_register_resolve,
    benchmark_sweep_with_live_calls,
    benchmark_envelope
);
criterion_main!(benches);
