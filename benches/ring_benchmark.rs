/*!
 * Ring and Transport Benchmarks
 *
 * Single-slot vs burst enqueue, and a full send/receive cycle through the pool
 */

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ringlink::ring::SLOT_SIZE;
use ringlink::{Datapath, Family, LinkConfig, LocalRegistry, MessageHeader, Ring, Transport};

fn bench_ring_burst(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_burst");
    let registry = LocalRegistry::new();

    for burst in [1usize, 8, 32, 256] {
        let ring = Ring::create(&registry, &format!("bench_{burst}"), 1024, SLOT_SIZE).unwrap();
        let mut producer = ring.into_producer();
        let mut consumer = Ring::attach(&registry, &format!("bench_{burst}"))
            .unwrap()
            .into_consumer();
        let items: Vec<u64> = (0..burst as u64).collect();

        group.throughput(Throughput::Elements(burst as u64));
        group.bench_with_input(BenchmarkId::from_parameter(burst), &items, |b, items| {
            b.iter(|| {
                producer.enqueue_bulk(black_box(items)).unwrap();
                for _ in 0..items.len() {
                    black_box(consumer.try_dequeue());
                }
            });
        });
    }

    group.finish();
}

fn bench_transport_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("transport_round_trip");
    let registry = LocalRegistry::new();
    let mut datapath = Datapath::create(&registry, &LinkConfig::default()).unwrap();
    let mut transport = Transport::init(&registry, 0).unwrap();

    for size in [64usize, 512, 1500] {
        let packet = vec![0x5Au8; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("packet", size), &packet, |b, packet| {
            b.iter(|| {
                transport.send(&MessageHeader::packet(1), packet).unwrap();
                black_box(datapath.recv_request().unwrap());
            });
        });
    }

    let mut reply = Vec::new();
    group.bench_function("control_reply", |b| {
        let request = MessageHeader::control(Family::FLOW, 1);
        b.iter(|| {
            transport.send(&request, &[]).unwrap();
            let received = datapath.recv_request().unwrap();
            datapath.send_reply(received.ring_id, &received.header, b"ok").unwrap();
            black_box(transport.recv_reply(&mut reply).unwrap());
        });
    });

    group.finish();
}

criterion_group!(benches, bench_ring_burst, bench_transport_round_trip);
criterion_main!(benches);
