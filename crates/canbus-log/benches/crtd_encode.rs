//! CRTD 编解码性能基准
//!
//! Logger 写线程每条日志编码一次，再扇出到所有连接；这里测单条编码和批量解码的开销。

use canbus_log::{CrtdCodec, FormatCodec};
use canbus_protocol::{BusStatus, CanFrame, LogMessage, LogType};
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("CrtdEncode");
    let codec = CrtdCodec::new();

    let rx = LogMessage::frame(
        LogType::Rx,
        CanFrame::new_standard(0x7E8, &[0x03, 0x41, 0x0D, 0x32, 0, 0, 0, 0]).with_origin(1),
    );
    let ext = LogMessage::frame(
        LogType::Tx,
        CanFrame::new_extended(0x18DAF110, &[0x02, 0x10, 0x03]).with_origin(2),
    );
    let status = LogMessage::status(
        LogType::Statistics,
        1,
        BusStatus {
            interrupts: 12_345,
            packets_rx: 12_000,
            error_flags: 0x0008_0200,
            ..Default::default()
        },
    );

    group.bench_function("rx_standard", |b| b.iter(|| codec.encode(black_box(&rx))));
    group.bench_function("tx_extended", |b| b.iter(|| codec.encode(black_box(&ext))));
    group.bench_function("status", |b| b.iter(|| codec.encode(black_box(&status))));
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("CrtdDecode");

    for lines in [1usize, 64, 1024] {
        let input: Vec<u8> = (0..lines)
            .map(|i| format!("1700000000.{:06} 1R11 {:03X} 01 02 03 04\n", i, i % 0x800))
            .collect::<String>()
            .into_bytes();
        group.throughput(Throughput::Bytes(input.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(lines), &input, |b, input| {
            let mut codec = CrtdCodec::new();
            let mut out = Vec::with_capacity(lines);
            b.iter(|| {
                out.clear();
                codec.decode(black_box(input), &mut out)
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
