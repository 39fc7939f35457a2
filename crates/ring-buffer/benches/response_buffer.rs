use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ring_buffer::{Record, RecordStatus, ResponseBuffer};

fn sample(channel_id: u8, seq: u64) -> Record {
    Record {
        channel_id,
        status: RecordStatus::Ok,
        timestamp_us: Some(seq * 625),
        data: vec![0x5A; 12],
    }
}

fn bench_push_saturated(c: &mut Criterion) {
    let mut buffer = ResponseBuffer::new(64 * 1024);
    let mut seq = 0u64;
    c.bench_function("push_saturated_12b", |b| {
        b.iter(|| {
            seq += 1;
            black_box(buffer.push(&sample((seq % 3) as u8, seq)).ok());
        })
    });
}

fn bench_drain_filtered(c: &mut Criterion) {
    c.bench_function("drain_filtered_100", |b| {
        b.iter_batched(
            || {
                let mut buffer = ResponseBuffer::new(256 * 1024);
                for seq in 0..300 {
                    let _ = buffer.push(&sample((seq % 3) as u8, seq));
                }
                buffer
            },
            |mut buffer| black_box(buffer.read(Some(1), 100).ok()),
            criterion::BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, bench_push_saturated, bench_drain_filtered);
criterion_main!(benches);
