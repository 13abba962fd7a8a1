use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use kdbsafe::crypto::{derive_composite_key, transform_key};

fn bench_transform_key(c: &mut Criterion) {
    let composite = derive_composite_key("correct horse battery staple", None)
        .expect("composite key");
    let seed = [7u8; 32];

    let mut group = c.benchmark_group("transform_key");
    for rounds in [1_000u32, 10_000, 50_000] {
        group.bench_with_input(BenchmarkId::from_parameter(rounds), &rounds, |b, &rounds| {
            b.iter(|| transform_key(black_box(&composite), black_box(&seed), rounds))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_transform_key);
criterion_main!(benches);
