// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Benchmarks for the wire codec and config parsing.
//!
//! These sit on the per-call hot path: every tool call is one encode and at
//! least one decode.
//!
//! Run with: `cargo bench --bench protocol`

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;

use toolbus::protocol::{decode, encode, parse_tool_list, WireMessage};
use toolbus::DispatchConfig;

/// Benchmark message encoding.
fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("protocol_encode");

    let small = WireMessage::request("1", "rag/search", serde_json::json!({"query": "totals"}));
    group.bench_function("small_request", |b| {
        b.iter(|| black_box(encode(&small).unwrap()));
    });

    for size in [1usize, 64, 1024] {
        let rows: Vec<serde_json::Value> = (0..size)
            .map(|i| serde_json::json!({"cell": format!("A{}", i), "value": i as f64 * 1.5}))
            .collect();
        let msg = WireMessage::response("1", serde_json::json!({"rows": rows}));
        let bytes = encode(&msg).unwrap().len() as u64;

        group.throughput(Throughput::Bytes(bytes));
        group.bench_with_input(BenchmarkId::new("response_rows", size), &msg, |b, msg| {
            b.iter(|| black_box(encode(msg).unwrap()));
        });
    }

    group.finish();
}

/// Benchmark message decoding.
fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("protocol_decode");

    let request = encode(&WireMessage::request(
        "42",
        "spreadsheet/calculate_cell",
        serde_json::json!({"sheet": "Q3", "cell": "B7"}),
    ))
    .unwrap();
    group.bench_function("request", |b| {
        b.iter(|| black_box(decode(&request).unwrap()));
    });

    let error = r#"{"id": "42", "error": {"code": "TOOL_NOT_FOUND", "message": "no such tool"}}"#;
    group.bench_function("error_response", |b| {
        b.iter(|| black_box(decode(error).unwrap()));
    });

    let rows: Vec<serde_json::Value> = (0..256)
        .map(|i| serde_json::json!({"cell": format!("A{}", i), "value": i}))
        .collect();
    let large = encode(&WireMessage::response("1", serde_json::json!({"rows": rows}))).unwrap();
    group.throughput(Throughput::Bytes(large.len() as u64));
    group.bench_function("large_response", |b| {
        b.iter(|| black_box(decode(&large).unwrap()));
    });

    group.finish();
}

/// Benchmark handshake result parsing.
fn bench_tool_list(c: &mut Criterion) {
    let mut group = c.benchmark_group("protocol_tool_list");

    for size in [4usize, 32] {
        let tools: Vec<serde_json::Value> = (0..size)
            .map(|i| {
                serde_json::json!({
                    "name": format!("tool_{}", i),
                    "description": "a tool",
                    "inputSchema": {"type": "object"}
                })
            })
            .collect();
        let result = serde_json::json!({"tools": tools});

        group.bench_with_input(BenchmarkId::new("parse", size), &result, |b, result| {
            b.iter(|| black_box(parse_tool_list(result, "bench")));
        });
    }

    group.finish();
}

/// Benchmark config parsing.
fn bench_config(c: &mut Criterion) {
    let mut group = c.benchmark_group("config_parse");

    let json = r#"
    {
        "defaults": {"default_timeout_ms": 5000, "retry_count": 1},
        "providers": [
            {"id": "spreadsheet", "command": "python3", "args": ["server.py"]},
            {"id": "workbook-rag", "priority": 1, "command": "python3",
             "args": ["rag.py"], "env": {"PYTHONUNBUFFERED": "1"}}
        ]
    }
    "#;
    group.bench_function("full", |b| {
        b.iter(|| black_box(DispatchConfig::from_json(json).unwrap()));
    });

    group.bench_function("empty", |b| {
        b.iter(|| black_box(DispatchConfig::from_json("{}").unwrap()));
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_encode,
    bench_decode,
    bench_tool_list,
    bench_config
);
criterion_main!(benches);
