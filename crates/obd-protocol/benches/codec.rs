use criterion::{black_box, criterion_group, criterion_main, Criterion};
use obd_protocol::codec::{isotp, kwp, KLineFrame, KLineStyle};
use obd_protocol::{decode_dtc_pairs, decode_pid, format_dtc};

fn bench_isotp(c: &mut Criterion) {
    let message: Vec<u8> = (0..=255u8).cycle().take(512).collect();
    c.bench_function("isotp_segment_512", |b| {
        b.iter(|| isotp::segment(black_box(&message)))
    });

    let frames = isotp::segment(&message).unwrap();
    c.bench_function("isotp_reassemble_512", |b| {
        b.iter(|| isotp::reassemble(black_box(&frames)))
    });
}

fn bench_kline(c: &mut Criterion) {
    let bytes = KLineFrame::request(KLineStyle::Iso9141, &[0x41, 0x0C, 0x1A, 0xF8])
        .unwrap()
        .to_bytes();
    c.bench_function("kline_decode", |b| {
        b.iter(|| KLineFrame::decode(KLineStyle::Iso9141, black_box(&bytes)))
    });
    c.bench_function("kline_checksum", |b| b.iter(|| kwp::checksum(black_box(&bytes))));
}

fn bench_decode(c: &mut Criterion) {
    let payload = [0x01, 0x23, 0x41, 0x00, 0x81, 0x11, 0xC1, 0x00];
    c.bench_function("dtc_pairs_format", |b| {
        b.iter(|| {
            decode_dtc_pairs(black_box(&payload))
                .map(|codes| codes.into_iter().map(format_dtc).collect::<Vec<_>>())
        })
    });
    c.bench_function("pid_rpm", |b| b.iter(|| decode_pid(0x0C, black_box(&[0x1A, 0xF8]))));
}

criterion_group!(benches, bench_isotp, bench_kline, bench_decode);
criterion_main!(benches);
