use criterion::{black_box, criterion_group, criterion_main, Criterion};
use fdrlog::logger::WriteBuffer;
use fdrlog::reader::FileParser;
use fdrlog::storage::telemetry::{
    encode_metadata, push_sample, sample_block_len, TelemetryHeader, VarDesc, VarType,
};
use fdrlog::storage::{push_entry, FileHeader, LogData, FILE_MAGIC, FILE_VERSION, ID_SOURCE_DESC};

const SOURCE_ID: u32 = 300;

fn vars() -> Vec<VarDesc> {
    vec![
        VarDesc::new("altitude", VarType::F32, 4, 1),
        VarDesc::new("attitude", VarType::F64, 8, 3),
        VarDesc::new("motors", VarType::U16, 2, 4),
    ]
}

/// One telemetry entry: header block then `count` samples
fn telemetry_entry(count: u32) -> Vec<u8> {
    let metadata = encode_metadata(&vars());
    let sample = vec![0x5au8; 4 + 24 + 8];
    let header = TelemetryHeader {
        sample_count: count,
        sample_size: sample.len() as u32,
        sample_rate: 10_000,
        metadata_size: metadata.len() as u32,
    };

    let mut payload = vec![0u8; header.block_len() + count as usize * sample_block_len(sample.len())];
    let mut data = LogData::new(&mut payload);
    assert!(header.push(&mut data, &metadata));
    for i in 0..count {
        assert!(push_sample(&mut data, i / 100, (i % 100) * 10_000_000, i, &sample));
    }
    let len = data.used();

    let mut entry = Vec::new();
    push_entry(&mut entry, SOURCE_ID, &payload[..len]);
    entry
}

fn source_desc() -> Vec<u8> {
    let mut buf = vec![0u8; 64];
    let mut data = LogData::new(&mut buf);
    assert!(data.push_u32(SOURCE_ID) && data.push_u32(1));
    assert!(data.push_string("telemetry") && data.push_string("bench"));
    let len = data.used();

    let mut entry = Vec::new();
    push_entry(&mut entry, ID_SOURCE_DESC, &buf[..len]);
    entry
}

fn bench_compress_block(c: &mut Criterion) {
    let entry = telemetry_entry(1000);

    c.bench_function("flush_lz4_block", |b| {
        let mut buffer = WriteBuffer::new(256 * 1024, 64 * 1024);
        let mut sink = Vec::with_capacity(128 * 1024);
        b.iter(|| {
            sink.clear();
            assert!(buffer.push_bytes(black_box(&entry), &mut sink));
            buffer.flush(&mut sink);
            black_box(sink.len());
        });
    });
}

fn bench_parse_file(c: &mut Criterion) {
    let mut file = FileHeader::new(FILE_MAGIC, FILE_VERSION).as_bytes().to_vec();
    let mut block = WriteBuffer::new(1024 * 1024, 256 * 1024);
    assert!(block.push_bytes(&source_desc(), &mut file));
    assert!(block.push_bytes(&telemetry_entry(5000), &mut file));
    block.flush(&mut file);

    c.bench_function("parse_5000_samples", |b| {
        b.iter(|| {
            let mut parser = FileParser::new();
            parser.parse(black_box(&file)).unwrap();
            black_box(parser.into_model());
        });
    });
}

criterion_group!(benches, bench_compress_block, bench_parse_file);
criterion_main!(benches);
