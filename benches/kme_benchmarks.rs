use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use qkd014_client::{
    protocol::decode_key_container,
    secure_memory::SecureKeyBuffer,
    security::{buffers_equal, bytes_equal},
    session::Session,
    transport::{KmeRequest, KmeResponse, KmeTransport},
    KmeResult,
};

fn container(count: usize, key_len: usize) -> String {
    let key = base64::encode(vec![0xa5u8; key_len]);
    let entries: Vec<String> = (0..count)
        .map(|i| format!(r#"{{"key_ID":"00000000-0000-4000-8000-{:012}","key":"{}"}}"#, i, key))
        .collect();
    format!(r#"{{"keys":[{}]}}"#, entries.join(","))
}

/// Answers every request with the same key container
struct CannedKme {
    body: String,
}

impl KmeTransport for CannedKme {
    fn execute(&mut self, _request: &KmeRequest) -> KmeResult<KmeResponse> {
        Ok(KmeResponse::new(200, self.body.clone()))
    }

    fn endpoint(&self) -> &str {
        "canned-kme:443"
    }
}

fn secure_memory_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("secure_memory");

    for size in [32usize, 256, 4096].iter() {
        let bytes = vec![0x42u8; *size];
        group.bench_with_input(BenchmarkId::new("allocate_release", size), size, |b, _| {
            b.iter(|| SecureKeyBuffer::from_slice(&bytes).map(SecureKeyBuffer::release))
        });

        let buffer = SecureKeyBuffer::from_slice(&bytes).unwrap();
        group.bench_with_input(BenchmarkId::new("borrow_return", size), size, |b, _| {
            b.iter(|| buffer.borrow().map(|view| view.return_borrow()))
        });
    }

    group.finish();
}

fn comparison_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("constant_time");

    let a = vec![7u8; 32];
    let mut b_bytes = a.clone();
    b_bytes[31] ^= 1;
    group.bench_function("bytes_equal_32", |b| b.iter(|| bytes_equal(&a, &b_bytes)));

    let left = SecureKeyBuffer::from_slice(&a).unwrap();
    let right = SecureKeyBuffer::from_slice(&b_bytes).unwrap();
    group.bench_function("buffers_equal_32", |b| b.iter(|| buffers_equal(&left, &right)));

    group.finish();
}

fn protocol_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("protocol");

    for count in [1usize, 16, 128].iter() {
        let body = container(*count, 32);
        group.bench_with_input(BenchmarkId::new("decode_key_container", count), count, |b, _| {
            b.iter(|| decode_key_container(&body, Some(32)))
        });

        let mut session = Session::with_transport(CannedKme { body: body.clone() });
        group.bench_with_input(BenchmarkId::new("get_keys", count), count, |b, &count| {
            b.iter(|| session.get_keys(256, "sae-b", None, count as u32))
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    secure_memory_benchmarks,
    comparison_benchmarks,
    protocol_benchmarks
);
criterion_main!(benches);
