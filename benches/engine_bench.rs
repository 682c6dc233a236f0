use criterion::{criterion_group, criterion_main, Criterion};

use emberdb::config::LsmConfig;
use emberdb::tmpfs::TempDir;
use emberdb::Lsm;

fn bench_engine(c: &mut Criterion) {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let store = Lsm::open(LsmConfig::new(dir.path())).expect("Failed to open store");

    let mut n = 0u64;
    c.bench_function("put", |b| {
        b.iter(|| {
            n += 1;
            let key = format!("key{:08}", n % 100_000);
            store
                .put(key.as_bytes(), b"value-payload-0123456789")
                .expect("put");
        })
    });

    c.bench_function("get_hit", |b| {
        b.iter(|| {
            n += 1;
            let key = format!("key{:08}", n % 100_000);
            store.get(key.as_bytes()).expect("get");
        })
    });

    c.bench_function("get_miss", |b| {
        b.iter(|| {
            n += 1;
            let key = format!("absent{:08}", n);
            store.get(key.as_bytes()).expect("get");
        })
    });

    store.flush_all().expect("flush");
    c.bench_function("scan_1k", |b| {
        b.iter(|| {
            let mut taken = 0;
            for item in store.scan_all(0).expect("scan") {
                item.expect("item");
                taken += 1;
                if taken == 1000 {
                    break;
                }
            }
        })
    });
}

criterion_group!(benches, bench_engine);
criterion_main!(benches);
