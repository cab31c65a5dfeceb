//! Throughput benchmarks

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use std::hint::black_box;
use fieldlink_core::core::decoder::{EmlDecoder, FrameDecoder, GpsDecoder};
use fieldlink_core::core::protocol::{parse_eml, parse_gga, JsonStreamParser, DEFAULT_MAX_BUFFER};

const GGA: &str = "$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47";
const EML: &str = "F03,0073,ACTIVE,200000Hz,140,---,L,P,cm,152,mA,34,dB,-60";

fn nmea_benchmark(c: &mut Criterion) {
    let stream: Vec<u8> = format!("{GGA}\r\n").repeat(64).into_bytes();

    let mut group = c.benchmark_group("nmea");

    group.bench_function("parse_gga", |b| {
        b.iter(|| black_box(parse_gga(black_box(GGA))))
    });

    group.throughput(Throughput::Bytes(stream.len() as u64));
    group.bench_function("decode_stream", |b| {
        let mut decoder = GpsDecoder::default();
        b.iter(|| {
            // Uneven chunks, like a BLE link delivers them
            for chunk in black_box(&stream).chunks(20) {
                black_box(decoder.decode(chunk));
            }
        })
    });

    group.finish();
}

fn eml_benchmark(c: &mut Criterion) {
    let stream: Vec<u8> = format!("{EML}\n").repeat(64).into_bytes();

    let mut group = c.benchmark_group("eml");

    group.bench_function("parse_eml", |b| {
        b.iter(|| black_box(parse_eml(black_box(EML))))
    });

    group.throughput(Throughput::Bytes(stream.len() as u64));
    group.bench_function("decode_stream", |b| {
        let mut decoder = EmlDecoder::default();
        b.iter(|| {
            for chunk in black_box(&stream).chunks(32) {
                black_box(decoder.decode(chunk));
            }
        })
    });

    group.finish();
}

fn json_benchmark(c: &mut Criterion) {
    let clean: Vec<u8> = r#"{"type":"scan","range":12.5,"samples":[1,2,3,4],"meta":{"ok":true}}"#
        .repeat(100)
        .into_bytes();

    // Garbage between objects and a truncated tail
    let mut corrupted = Vec::new();
    for i in 0..100u8 {
        corrupted.extend_from_slice(br#"{"id":1,"v":"a\"b"}"#);
        corrupted.extend_from_slice(&[0xff, i, b'}', b'{', b'x']);
    }
    corrupted.extend_from_slice(br#"{"partial":"#);

    let parser = JsonStreamParser::new(DEFAULT_MAX_BUFFER);
    let mut group = c.benchmark_group("json_stream");

    group.throughput(Throughput::Bytes(clean.len() as u64));
    group.bench_function("clean", |b| {
        b.iter(|| black_box(parser.parse(black_box(&clean))))
    });

    group.throughput(Throughput::Bytes(corrupted.len() as u64));
    group.bench_function("corrupted", |b| {
        b.iter(|| black_box(parser.parse(black_box(&corrupted))))
    });

    group.finish();
}

criterion_group!(benches, nmea_benchmark, eml_benchmark, json_benchmark);
criterion_main!(benches);
