use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use schemastream::codec::{frame_record, message_index_path, strip_framing};
use schemastream::MemoryBroker;
use schemastream::Record;

fn bench_frame(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_record");
    let index_path = message_index_path(0, &[]);
    for size in [128usize, 1024usize, 4096usize] {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let payload = vec![7u8; size];
            b.iter(|| frame_record(black_box(42), &index_path, black_box(&payload)).unwrap());
        });
    }
    group.finish();
}

fn bench_strip(c: &mut Criterion) {
    let mut group = c.benchmark_group("strip_framing");
    for depth in [0usize, 2usize, 8usize] {
        let ancestors: Vec<usize> = (0..depth).collect();
        let index_path = message_index_path(1, &ancestors);
        let framed = frame_record(42, &index_path, &[7u8; 1024]).unwrap();
        group.throughput(Throughput::Bytes(framed.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, _| {
            b.iter(|| strip_framing(black_box(&framed), index_path.len()).unwrap().len());
        });
    }
    group.finish();
}

fn bench_memory_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("memory_append");
    let broker = MemoryBroker::with_partitions(4);
    let framed = frame_record(42, &message_index_path(0, &[]), &[7u8; 256]).unwrap();
    group.throughput(Throughput::Elements(1));
    group.bench_function("framed_256b", |b| {
        b.iter(|| {
            broker
                .append(Record::new("bench", framed.clone()).with_key(b"k".to_vec()))
                .unwrap()
        });
    });
    group.finish();
}

criterion_group!(benches, bench_frame, bench_strip, bench_memory_append);
criterion_main!(benches);
