use criterion::{Criterion, criterion_group, criterion_main};
use rf_protocol::{Packet, Routing};
use rf_sensor::scheduler::TdmaScheduler;
use rf_sensor::sensor::measurement::{Position, ground_station_packet};
use std::hint::black_box;

// Hot path on every received packet: realign our slot from the sender's timestamp
fn bench_synchronize(c: &mut Criterion) {
    c.bench_function("synchronize_10_nodes", |b| {
        let mut scheduler = TdmaScheduler::new(3, 10, 0.1);
        let mut ts = 0.0;
        b.iter(|| {
            ts += 0.05;
            let sender = (ts * 100.0) as u8 % 10;
            black_box(scheduler.synchronize(black_box(ts), sender));
        });
    });

    c.bench_function("next_timestamp_and_advance", |b| {
        let mut scheduler = TdmaScheduler::new(1, 4, 0.1);
        let mut now = 0.0;
        b.iter(|| {
            now += 0.4;
            black_box(scheduler.next_timestamp(now));
            scheduler.advance(now);
        });
    });
}

fn measurement() -> Packet {
    let from = Position { latitude: 52.0, longitude: 4.37, valid: true };
    let to = Position { latitude: 52.001, longitude: 4.371, valid: true };
    let mut packet = ground_station_packet(2, 1, from, to, -47.0).expect("measurement packet");
    packet.stamp_routing(Routing { from: 2, to: Some(0), timestamp: 1_700_000_000.25 });
    packet
}

// Every slot serializes its measurement reports and the ground station parses them
fn bench_packet_codec(c: &mut Criterion) {
    let packet = measurement();
    let bytes = packet.serialize().expect("serialize");

    c.bench_function("measurement_serialize", |b| {
        b.iter(|| black_box(packet.serialize()));
    });

    c.bench_function("measurement_deserialize", |b| {
        b.iter(|| black_box(Packet::deserialize(black_box(&bytes))));
    });
}

criterion_group!(benches, bench_synchronize, bench_packet_codec);
criterion_main!(benches);
