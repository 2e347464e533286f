use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use protocol::framing::{encode_frame, FrameParser};
use protocol::secretstream::{Decryptor, Encryptor};

fn bench_parser(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_parser");
    for size in [64usize, 4096, 65536] {
        let frames: Vec<u8> = (0..64).flat_map(|_| encode_frame(&vec![1u8; size]).unwrap()).collect();
        let data = Bytes::from(frames);
        group.throughput(Throughput::Bytes(data.len() as u64));

        group.bench_with_input(BenchmarkId::new("whole", size), &data, |b, data| {
            b.iter(|| {
                let mut parser = FrameParser::new();
                black_box(parser.push(data.clone()).unwrap())
            })
        });

        group.bench_with_input(BenchmarkId::new("chunked_1500", size), &data, |b, data| {
            b.iter(|| {
                let mut parser = FrameParser::new();
                let mut count = 0;
                let mut offset = 0;
                while offset < data.len() {
                    let end = (offset + 1500).min(data.len());
                    count += parser.push(data.slice(offset..end)).unwrap().len();
                    offset = end;
                }
                black_box(count)
            })
        });
    }
    group.finish();
}

fn bench_stream_cipher(c: &mut Criterion) {
    let mut group = c.benchmark_group("stream_cipher");
    let key = [3u8; 32];
    for size in [64usize, 16384] {
        let plaintext = vec![0u8; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(BenchmarkId::new("seal_open", size), |b| {
            let mut enc = Encryptor::new(&key);
            let mut dec = Decryptor::new(&key);
            dec.init(*enc.header());
            b.iter(|| {
                let ct = enc.encrypt(&plaintext).unwrap();
                black_box(dec.decrypt(&ct).unwrap())
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_parser, bench_stream_cipher);
criterion_main!(benches);
