//! Multi-threaded behavior: the engine is shared across threads with no
//! internal event loop, so writers and readers may interleave freely.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use emberdb::config::LsmConfig;
use emberdb::engine::LsmEngine;
use emberdb::tmpfs::TempDir;
use emberdb::tran::IsolationLevel;
use emberdb::Lsm;

fn config(dir: &TempDir) -> LsmConfig {
    LsmConfig::new(dir.path())
        .per_memtable_limit(8 * 1024)
        .total_memtable_limit(32 * 1024)
        .block_size(1024)
        .wal_clean_interval(Duration::from_secs(3600))
}

#[test]
fn test_parallel_writers_distinct_keys() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let store = Arc::new(Lsm::open(config(&dir)).expect("Failed to open store"));

    const WRITERS: usize = 4;
    const PER_WRITER: usize = 250;

    let mut handles = Vec::new();
    for writer in 0..WRITERS {
        let store = store.clone();
        handles.push(thread::spawn(move || {
            for i in 0..PER_WRITER {
                let key = format!("w{writer}_{i:04}");
                let value = format!("value_{writer}_{i}");
                store.put(key.as_bytes(), value.as_bytes()).expect("put");
            }
        }));
    }
    for handle in handles {
        handle.join().expect("writer thread panicked");
    }

    for writer in 0..WRITERS {
        for i in 0..PER_WRITER {
            let key = format!("w{writer}_{i:04}");
            assert_eq!(
                store.get(key.as_bytes()).expect("get"),
                Some(format!("value_{writer}_{i}").into_bytes()),
                "missing {key}"
            );
        }
    }
    let count = store.scan_all(0).expect("scan").count();
    assert_eq!(count, WRITERS * PER_WRITER);
}

#[test]
fn test_same_key_highest_tid_wins() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let engine = LsmEngine::open(config(&dir)).expect("Failed to open engine");

    const THREADS: u64 = 4;
    const WRITES: u64 = 100;

    let mut handles = Vec::new();
    for t in 0..THREADS {
        let engine = engine.clone();
        handles.push(thread::spawn(move || {
            for i in 0..WRITES {
                let tid = t * WRITES + i + 1;
                engine
                    .put(b"contended", format!("tid-{tid}").as_bytes(), tid)
                    .expect("put");
            }
        }));
    }
    for handle in handles {
        handle.join().expect("writer thread panicked");
    }

    // Writes to the same key are ordered by tid regardless of arrival
    // order across threads.
    let max_tid = THREADS * WRITES;
    let (value, tid) = engine
        .get(b"contended", 0)
        .expect("get")
        .expect("key present");
    assert_eq!(tid, max_tid);
    assert_eq!(value, format!("tid-{max_tid}").into_bytes());

    // Every intermediate version remains reachable under its view.
    for view in [1u64, max_tid / 2, max_tid - 1] {
        let (_, tid) = engine.get(b"contended", view).expect("get").expect("hit");
        assert_eq!(tid, view);
    }
}

#[test]
fn test_readers_run_alongside_writers() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let store = Arc::new(Lsm::open(config(&dir)).expect("Failed to open store"));

    for i in 0..500u32 {
        store
            .put(format!("stable{i:03}").as_bytes(), b"fixed")
            .expect("put");
    }
    store.flush_all().expect("flush");

    let writer = {
        let store = store.clone();
        thread::spawn(move || {
            for i in 0..2000u32 {
                store
                    .put(format!("hot{i:04}").as_bytes(), b"fresh")
                    .expect("put");
            }
        })
    };

    // Readers must always see the stable set while the writer churns.
    let mut readers = Vec::new();
    for _ in 0..3 {
        let store = store.clone();
        readers.push(thread::spawn(move || {
            for i in 0..500u32 {
                assert_eq!(
                    store.get(format!("stable{i:03}").as_bytes()).expect("get"),
                    Some(b"fixed".to_vec()),
                );
            }
        }));
    }

    writer.join().expect("writer panicked");
    for reader in readers {
        reader.join().expect("reader panicked");
    }
}

#[test]
fn test_concurrent_transactions_on_disjoint_keys() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let store = Arc::new(Lsm::open(config(&dir)).expect("Failed to open store"));

    let mut handles = Vec::new();
    for t in 0..4 {
        let store = store.clone();
        handles.push(thread::spawn(move || {
            let tx = store
                .begin_tran(IsolationLevel::RepeatableRead)
                .expect("begin");
            tx.put(format!("tx{t}_a").as_bytes(), b"1").expect("put");
            tx.put(format!("tx{t}_b").as_bytes(), b"2").expect("put");
            tx.commit(false).expect("disjoint keys must not conflict");
        }));
    }
    for handle in handles {
        handle.join().expect("transaction thread panicked");
    }

    for t in 0..4 {
        assert_eq!(
            store.get(format!("tx{t}_a").as_bytes()).expect("get"),
            Some(b"1".to_vec())
        );
        assert_eq!(
            store.get(format!("tx{t}_b").as_bytes()).expect("get"),
            Some(b"2".to_vec())
        );
    }
}
