use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tessera::index::manager::route;
use tessera::DocId;

fn bench_routing(c: &mut Criterion) {
    let ids: Vec<DocId> = (0..10_000)
        .map(|i| DocId::new(format!("document-{:08}", i)))
        .collect();

    c.bench_function("route_10k_ids_8_shards", |b| {
        b.iter(|| {
            for id in &ids {
                black_box(route(id, 8));
            }
        })
    });

    c.bench_function("route_10k_ids_64_shards", |b| {
        b.iter(|| {
            for id in &ids {
                black_box(route(id, 64));
            }
        })
    });
}

criterion_group!(benches, bench_routing);
criterion_main!(benches);
