//! Hot-path benchmarks for the storage engine: put/get throughput.

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use nexadb::config::StorageConfig;
use nexadb::storage::{Durability, StorageEngine};
use tempfile::tempdir;

const N_KEYS: usize = 5_000;
const VALUE_SIZE: usize = 128;

fn config(dir: &std::path::Path) -> StorageConfig {
    StorageConfig {
        data_dir: dir.to_path_buf(),
        memtable_size_bytes: 8 * 1024 * 1024,
        ..StorageConfig::default()
    }
}

fn put_throughput(c: &mut Criterion) {
    c.bench_function("storage_put_5k_grouped", |b| {
        b.iter_batched(
            || {
                let dir = tempdir().unwrap();
                let engine = StorageEngine::open(config(dir.path())).unwrap();
                (dir, engine)
            },
            |(_dir, engine)| {
                for i in 0..N_KEYS {
                    engine
                        .put(
                            format!("db:default:col:bench:doc:{i:06}").into_bytes(),
                            vec![0u8; VALUE_SIZE],
                            Durability::Grouped,
                        )
                        .unwrap();
                }
            },
            BatchSize::SmallInput,
        );
    });
}

fn get_hit_throughput(c: &mut Criterion) {
    c.bench_function("storage_get_hit_5k", |b| {
        b.iter_batched(
            || {
                let dir = tempdir().unwrap();
                let engine = StorageEngine::open(config(dir.path())).unwrap();
                for i in 0..N_KEYS {
                    engine
                        .put(
                            format!("db:default:col:bench:doc:{i:06}").into_bytes(),
                            vec![0u8; VALUE_SIZE],
                            Durability::Grouped,
                        )
                        .unwrap();
                }
                std::thread::sleep(std::time::Duration::from_millis(300));
                (dir, engine)
            },
            |(_dir, engine)| {
                for i in 0..N_KEYS {
                    let key = format!("db:default:col:bench:doc:{i:06}").into_bytes();
                    assert!(engine.get(&key).unwrap().is_some());
                }
            },
            BatchSize::LargeInput,
        );
    });
}

fn get_miss_throughput(c: &mut Criterion) {
    c.bench_function("storage_get_miss_5k", |b| {
        b.iter_batched(
            || {
                let dir = tempdir().unwrap();
                let engine = StorageEngine::open(config(dir.path())).unwrap();
                for i in 0..N_KEYS {
                    engine
                        .put(
                            format!("db:default:col:bench:doc:{i:06}").into_bytes(),
                            vec![0u8; VALUE_SIZE],
                            Durability::Grouped,
                        )
                        .unwrap();
                }
                std::thread::sleep(std::time::Duration::from_millis(300));
                (dir, engine)
            },
            |(_dir, engine)| {
                for i in 0..N_KEYS {
                    let key = format!("db:default:col:bench:missing:{i:06}").into_bytes();
                    assert!(engine.get(&key).unwrap().is_none());
                }
            },
            BatchSize::LargeInput,
        );
    });
}

criterion_group!(benches, put_throughput, get_hit_throughput, get_miss_throughput);
criterion_main!(benches);
