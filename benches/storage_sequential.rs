use bytes::Bytes;
use criterion::{
    black_box, criterion_group, criterion_main, BatchSize, Bencher, Criterion, Throughput,
};
use cuckoodb::{Config, CuckooDb, KeyValueStorage};
use rand::prelude::*;
use tempfile::TempDir;

const ITER: usize = 1000;
const KEY_SIZE: usize = 64;
const VAL_SIZE: usize = 512;

fn get_cuckoo() -> (CuckooDb, TempDir) {
    let tmpdir = TempDir::new().unwrap();
    let db = Config::default().open(tmpdir.path()).unwrap();
    (db, tmpdir)
}

fn prebuilt_kv_pairs(size: usize, key_size: usize, val_size: usize) -> Vec<(Bytes, Bytes)> {
    let mut rng = StdRng::seed_from_u64(69);
    (0..size)
        .map(|_| {
            let key: Vec<u8> = (0..key_size).map(|_| rng.gen()).collect();
            let val: Vec<u8> = (0..val_size).map(|_| rng.gen()).collect();
            (Bytes::from(key), Bytes::from(val))
        })
        .collect()
}

/// Call set on the same store instance for every benchmark iteration, the
/// key and value will be randomly generated bytes sequences with size of
/// `KEY_SIZE` and `VAL_SIZE`.
pub fn bench_write(c: &mut Criterion) {
    let kv_pairs = prebuilt_kv_pairs(ITER, KEY_SIZE, VAL_SIZE);
    let nbytes: usize = kv_pairs.iter().map(|(k, v)| k.len() + v.len()).sum();

    let mut g = c.benchmark_group("cuckoo_sequential_write");
    g.throughput(Throughput::Bytes(nbytes as u64));
    g.bench_with_input("cuckoo", &kv_pairs, sequential_write_bulk_bench);
    g.finish();
}

fn sequential_write_bulk_bench(b: &mut Bencher, kv_pairs: &Vec<(Bytes, Bytes)>) {
    b.iter_batched(
        || {
            let (db, tmpdir) = get_cuckoo();
            (db, kv_pairs.clone(), tmpdir)
        },
        sequential_write_bulk_bench_iter,
        BatchSize::SmallInput,
    );
}

fn sequential_write_bulk_bench_iter<E>((db, kv_pairs, _tmpdir): (E, Vec<(Bytes, Bytes)>, TempDir))
where
    E: KeyValueStorage,
{
    kv_pairs.into_iter().for_each(|(k, v)| {
        db.set(black_box(k), black_box(v)).unwrap();
    });
}

/// Call get on a pre-populated store instance for every benchmark
/// iteration, with the key order shuffled between iterations.
pub fn bench_read(c: &mut Criterion) {
    let kv_pairs = prebuilt_kv_pairs(ITER, KEY_SIZE, VAL_SIZE);
    let nbytes: usize = kv_pairs.iter().map(|(k, v)| k.len() + v.len()).sum();

    let mut g = c.benchmark_group("cuckoo_sequential_read");
    g.throughput(Throughput::Bytes(nbytes as u64));
    {
        let (db, _tmpdir) = get_cuckoo();
        kv_pairs.iter().for_each(|(k, v)| {
            db.set(k.clone(), v.clone()).unwrap();
        });
        db.flush().unwrap();
        g.bench_with_input("cuckoo", &(db, kv_pairs), sequential_read_bulk_bench);
    }
    g.finish();
}

fn sequential_read_bulk_bench<E>(b: &mut Bencher, (db, kv_pairs): &(E, Vec<(Bytes, Bytes)>))
where
    E: KeyValueStorage,
{
    b.iter_batched(
        || {
            let mut kv_pairs = kv_pairs.clone();
            kv_pairs.shuffle(&mut rand::thread_rng());
            kv_pairs
        },
        |kv_pairs| {
            kv_pairs.into_iter().for_each(|(k, v)| {
                let value = db.get(black_box(&k)).unwrap();
                assert_eq!(Some(v), value);
            });
        },
        BatchSize::SmallInput,
    );
}

criterion_group!(benches, bench_write, bench_read);
criterion_main!(benches);
