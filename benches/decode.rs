//! Compile + decode hot path of the acquisition cycle.

use std::hint::black_box;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::{json, Map, Value};
use voltage_gateway::device_map::compile_measurement_map;
use voltage_gateway::field::CycleFrame;
use voltage_gateway::{MapLibrary, RegisterMap};

fn push(data: &mut Map<String, Value>, offset: &mut u16, name: String, size: u16, format: &str, s_f: Value) {
    data.insert(
        name,
        json!({"offset": *offset, "size": size, "format": format, "s_f": s_f}),
    );
    *offset += size;
}

/// One inverter-like map: a scale-factor block, three phases, `strings`
/// PV strings and the usual aggregates as 32-bit values.
fn inverter_map(strings: usize) -> Arc<RegisterMap> {
    let mut ac = Map::new();
    let mut ac_len = 0u16;
    for phase in 1..=3 {
        for qty in ["voltage", "current", "power"] {
            let name = format!("L{}_{}", phase, qty);
            push(&mut ac, &mut ac_len, name, 1, "decode_16bit_int", json!("ac_sf"));
        }
    }
    for name in ["total_power", "total_energy", "frequency", "power_factor"] {
        push(&mut ac, &mut ac_len, name.to_string(), 2, "decode_32bit_int", json!(-1));
    }

    let mut pv = Map::new();
    let mut pv_len = 0u16;
    for string in 1..=strings {
        for qty in ["voltage", "current"] {
            let name = format!("string{}_{}", string, qty);
            push(&mut pv, &mut pv_len, name, 1, "decode_16bit_uint", json!(-2));
        }
    }

    let maps = json!({
        "BENCH": {
            "sf": {"start_address": 0, "Length": 1, "registers": "hr", "data": {
                "ac_sf": {"offset": 0, "size": 1, "format": "decode_16bit_int"}}},
            "ac": {"start_address": 100, "Length": ac_len, "registers": "hr", "data": ac},
            "pv": {"start_address": 1000, "Length": pv_len, "registers": "hr", "data": pv}
        }
    });
    let library = MapLibrary::from_json_str(&maps.to_string()).expect("bench map");
    Arc::new(library.get("BENCH").expect("bench part"))
}

fn frame_for(schema: &RegisterMap, cycle: u64) -> CycleFrame {
    let blocks = schema
        .blocks
        .iter()
        .enumerate()
        .map(|(i, block)| {
            if i == 0 {
                vec![0xFFFF; usize::from(block.length)]
            } else {
                (0..block.length).map(|r| r.wrapping_mul(37)).collect()
            }
        })
        .collect();
    CycleFrame::new(cycle, blocks)
}

fn bench_compile(c: &mut Criterion) {
    let mut group = c.benchmark_group("compile_measurement_map");
    for strings in [4usize, 24] {
        let schema = inverter_map(strings);
        group.bench_with_input(BenchmarkId::from_parameter(strings), &schema, |b, schema| {
            b.iter(|| compile_measurement_map(black_box(schema.clone()), 3))
        });
    }
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_frame");
    for strings in [4usize, 24] {
        let schema = inverter_map(strings);
        let frame = frame_for(&schema, 1);
        let mut map = compile_measurement_map(schema.clone(), 3);
        group.throughput(Throughput::Elements(map.field_count() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(strings), &frame, |b, frame| {
            b.iter(|| map.decode_frame(black_box(frame)))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_compile, bench_decode);
criterion_main!(benches);
