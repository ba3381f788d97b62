//! Benchmarks for the two frame decoders and the store merge that follows them.

use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use mijia_logger::{ReadingStore, decode_advertisement, decode_notification};
use std::time::SystemTime;

/// Temperature + humidity sub-record (1.0 °C, 90.00 %)
const ADVERT_TEMP_HUMIDITY: [u8; 12] = [
    0x30, 0x50, 0x5B, 0x01, 0x07, 0x0D, 0x10, 0x04, 0x64, 0x00, 0x28, 0x23,
];

/// Temperature, humidity and battery percentage (`0x100A`, skipped) in one frame
const ADVERT_MULTI: [u8; 20] = [
    0x30, 0x50, 0x5B, 0x02, 0x07, 0x04, 0x10, 0x02, 0xF7, 0x08, 0x06, 0x10, 0x02, 0x28, 0x23,
    0x0A, 0x10, 0x02, 0x55, 0x00,
];

/// Frame-control bit 3 set
const ADVERT_ENCRYPTED: [u8; 10] = [0x58, 0x50, 0x5B, 0x03, 0x07, 0x01, 0x02, 0x03, 0x04, 0x05];

const NOTIFICATION: [u8; 5] = [0xE8, 0x03, 0x2D, 0x58, 0x02];

fn bench_decode_advertisement(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_advertisement");
    group.throughput(Throughput::Elements(1));

    for (name, frame) in [
        ("temp_humidity", &ADVERT_TEMP_HUMIDITY[..]),
        ("multi_record", &ADVERT_MULTI[..]),
        ("encrypted", &ADVERT_ENCRYPTED[..]),
    ] {
        group.bench_function(name, |b| {
            b.iter(|| decode_advertisement(black_box(frame), SystemTime::UNIX_EPOCH))
        });
    }

    group.finish();
}

fn bench_decode_notification(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_notification");
    group.throughput(Throughput::Elements(1));

    group.bench_function("reference_frame", |b| {
        b.iter(|| decode_notification(black_box(&NOTIFICATION), 1.70, SystemTime::UNIX_EPOCH))
    });

    group.finish();
}

fn bench_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("store_merge");
    group.throughput(Throughput::Elements(1));

    let reading = decode_notification(&NOTIFICATION, 1.70, SystemTime::UNIX_EPOCH);
    group.bench_function("unchanged", |b| {
        let mut store = ReadingStore::new();
        store.merge(&reading);
        b.iter(|| store.merge(black_box(&reading)))
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_decode_advertisement,
    bench_decode_notification,
    bench_merge
);
criterion_main!(benches);
