use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tote::chunk::{load_chunk, save_chunk};
use tote::fold::fold_with_size;
use tote::item::{Item, NamedItem};
use tote::store::FileStore;

fn bench_chunk_codec(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::attach(dir.path());
    let data = vec![0u8; 1024 * 1024];

    c.bench_function("save_chunk_1mb", |b| {
        b.iter(|| save_chunk(black_box(&data), &store))
    });

    let part = save_chunk(&data, &store).unwrap();
    c.bench_function("load_chunk_1mb", |b| {
        b.iter(|| load_chunk(black_box(&part), &store))
    });
}

fn bench_fold(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::attach(dir.path());
    let items: Vec<Item> = (0..1000)
        .map(|i| Item::Missing(NamedItem::new(format!("bench/item{i:04}"))))
        .collect();

    c.bench_function("fold_1000_items", |b| {
        b.iter(|| {
            fold_with_size(items.clone().into_iter().map(Ok), &store, 16 * 1024)
                .collect::<tote::Result<Vec<_>>>()
        })
    });
}

criterion_group!(benches, bench_chunk_codec, bench_fold);
criterion_main!(benches);
