//! Benchmarks for packet-buffer hot paths.
//!
//! - Allocate and release (free list round trip)
//! - Append across segment boundaries
//! - Fragment then reassemble one datagram
//!
//! Run with: cargo bench -p packet-buffer --bench pool

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use packet_buffer::{PacketPool, Reassembler};
use std::time::Instant;

fn make_payload(size: usize) -> Vec<u8> {
    vec![0xAB; size]
}

fn bench_allocate(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool/allocate");
    let pool = PacketPool::builder().segment_count(256).build().unwrap();

    for len in [64, 1492, 3000, 9000] {
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(len), &len, |b, &len| {
            b.iter(|| {
                let packet = pool.allocate(black_box(len)).unwrap();
                black_box(packet.segment_count());
            });
        });
    }

    group.finish();
}

fn bench_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool/append");
    let pool = PacketPool::builder().segment_count(256).build().unwrap();

    for len in [64, 1500, 9000] {
        let payload = make_payload(len);
        group.throughput(Throughput::Bytes(len as u64));
        group.bench_with_input(BenchmarkId::from_parameter(len), &payload, |b, payload| {
            b.iter(|| {
                let mut packet = pool.allocate(0).unwrap();
                packet.append(black_box(payload)).unwrap();
                black_box(packet.len());
            });
        });
    }

    group.finish();
}

fn bench_fragment_reassemble(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool/fragment_reassemble");
    let pool = PacketPool::builder().segment_count(512).build().unwrap();

    for (len, mtu) in [(4000, 1500), (9000, 576), (64_000, 1500)] {
        let packet = pool.packet_from(&make_payload(len)).unwrap();
        group.throughput(Throughput::Bytes(len as u64));
        group.bench_with_input(
            BenchmarkId::new("mtu", format!("{len}B_{mtu}")),
            &mtu,
            |b, &mtu| {
                let mut reassembler = Reassembler::new(pool.clone());
                b.iter(|| {
                    let now = Instant::now();
                    let mut whole = None;
                    for fragment in pool.fragment_for_link(&packet, mtu).unwrap() {
                        whole = reassembler.push(fragment.unwrap(), now).unwrap();
                    }
                    black_box(whole.map(|p| p.len()));
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_allocate,
    bench_append,
    bench_fragment_reassemble
);
criterion_main!(benches);
