use criterion::{criterion_group, criterion_main, Criterion};
use ipc_latency::transport::{SharedBufferTransport, Transport, WorkerChannel};
use ipc_latency::{BenchmarkConfig, Clock};
use std::hint::black_box;
use std::thread;

fn bench_clock(c: &mut Criterion) {
    let clock = Clock::select().unwrap();
    c.bench_function("clock_now", |b| b.iter(|| black_box(clock.now())));
}

fn bench_shared_buffer(c: &mut Criterion) {
    let config = BenchmarkConfig::new(1, 1, 0).with_namespace("ipc_latency_bench_shm");
    let transport = SharedBufferTransport::create(&config).unwrap();
    let mut worker = transport.worker(0).unwrap();

    thread::scope(|s| {
        s.spawn(move || {
            let mut buf = [0u8; 256];
            loop {
                let n = worker.receive(&mut buf).unwrap();
                worker.send(b"Pong").unwrap();
                if &buf[..n] == b"stop" {
                    break;
                }
            }
        });

        let mut buf = [0u8; 256];
        c.bench_function("shared_buffer_round_trip", |b| {
            b.iter(|| {
                transport.send(0, b"Ping").unwrap();
                transport.receive(0, &mut buf, None).unwrap()
            })
        });

        transport.send(0, b"stop").unwrap();
        transport.receive(0, &mut buf, None).unwrap();
    });
}

criterion_group!(benches, bench_clock, bench_shared_buffer);
criterion_main!(benches);
