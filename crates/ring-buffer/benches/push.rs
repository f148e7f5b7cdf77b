use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ring_buffer::RingBuffer;

fn bench_push(c: &mut Criterion) {
    let buffer = RingBuffer::with_default_capacity();
    let mut i = 0u64;
    c.bench_function("push_overwrite", |b| {
        b.iter(|| {
            i = i.wrapping_add(1);
            buffer.push(black_box(i));
        })
    });

    for n in 0..3000u64 {
        buffer.push(n);
    }
    c.bench_function("read_last_100", |b| b.iter(|| buffer.read_last(black_box(100))));
}

criterion_group!(benches, bench_push);
criterion_main!(benches);
