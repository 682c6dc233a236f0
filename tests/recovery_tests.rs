//! Durability: reopening a store, WAL replay after a simulated crash, and
//! checkpoint handling.

use std::time::Duration;

use emberdb::config::LsmConfig;
use emberdb::tmpfs::TempDir;
use emberdb::tran::IsolationLevel;
use emberdb::Lsm;

fn config(dir: &TempDir) -> LsmConfig {
    LsmConfig::new(dir.path())
        .per_memtable_limit(16 * 1024)
        .total_memtable_limit(64 * 1024)
        .block_size(1024)
        .wal_clean_interval(Duration::from_secs(3600))
}

#[test]
fn test_reopen_preserves_flushed_data() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    {
        let store = Lsm::open(config(&dir)).expect("Failed to open store");
        for i in 0..100u32 {
            store
                .put(format!("k{i:03}").as_bytes(), format!("v{i}").as_bytes())
                .expect("put");
        }
        store.flush_all().expect("flush");
    }

    let store = Lsm::open(config(&dir)).expect("Failed to reopen store");
    for i in 0..100u32 {
        assert_eq!(
            store.get(format!("k{i:03}").as_bytes()).expect("get"),
            Some(format!("v{i}").into_bytes()),
        );
    }
}

#[test]
fn test_unflushed_data_survives_via_close_flush() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    {
        let store = Lsm::open(config(&dir)).expect("Failed to open store");
        store.put(b"memory-only", b"value").expect("put");
        // No explicit flush; closing the store drains the memtable.
    }
    let store = Lsm::open(config(&dir)).expect("Failed to reopen store");
    assert_eq!(
        store.get(b"memory-only").expect("get"),
        Some(b"value".to_vec())
    );
}

#[test]
fn test_wal_replay_after_crashed_commit() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    {
        let store = Lsm::open(config(&dir)).expect("Failed to open store");
        let tx = store
            .begin_tran(IsolationLevel::RepeatableRead)
            .expect("begin");
        tx.put(b"a", b"1").expect("put");
        tx.put(b"b", b"2").expect("put");
        // Crash after the WAL write, before the memtable apply.
        tx.commit(true).expect("commit");

        assert_eq!(store.get(b"a").expect("get"), None, "apply was skipped");
    }

    let store = Lsm::open(config(&dir)).expect("Failed to reopen store");
    assert_eq!(store.get(b"a").expect("get"), Some(b"1".to_vec()));
    assert_eq!(store.get(b"b").expect("get"), Some(b"2".to_vec()));
}

#[test]
fn test_replay_is_idempotent_across_reopens() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    {
        let store = Lsm::open(config(&dir)).expect("Failed to open store");
        let tx = store
            .begin_tran(IsolationLevel::RepeatableRead)
            .expect("begin");
        tx.put(b"k", b"crashed").expect("put");
        tx.commit(true).expect("commit");
    }
    // First reopen replays and, on close, flushes the replayed data.
    {
        let store = Lsm::open(config(&dir)).expect("Failed to reopen store");
        assert_eq!(store.get(b"k").expect("get"), Some(b"crashed".to_vec()));
    }
    // Second reopen must see exactly the same state, not a duplicate or
    // a loss.
    let store = Lsm::open(config(&dir)).expect("Failed to reopen store");
    assert_eq!(store.get(b"k").expect("get"), Some(b"crashed".to_vec()));
    let count = store
        .scan_all(0)
        .expect("scan")
        .filter(|r| r.as_ref().expect("item").0 == b"k".to_vec())
        .count();
    assert_eq!(count, 1);
}

#[test]
fn test_rolled_back_transaction_is_not_replayed() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    {
        let store = Lsm::open(config(&dir)).expect("Failed to open store");
        let tx = store
            .begin_tran(IsolationLevel::ReadCommitted)
            .expect("begin");
        tx.put(b"ghost", b"boo").expect("put");
        tx.rollback().expect("rollback");
    }
    let store = Lsm::open(config(&dir)).expect("Failed to reopen store");
    assert_eq!(store.get(b"ghost").expect("get"), None);
}

#[test]
fn test_empty_key_is_rejected() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let store = Lsm::open(config(&dir)).expect("Failed to open store");

    assert!(store.put(b"", b"v").is_err());
    assert!(store.remove(b"").is_err());
    assert!(store
        .put_batch(&[(b"ok".to_vec(), b"v".to_vec()), (Vec::new(), b"v".to_vec())])
        .is_err());
    // Nothing was applied.
    assert_eq!(store.get(b"ok").expect("get"), None);
}

#[test]
fn test_second_open_is_locked_out() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let store = Lsm::open(config(&dir)).expect("Failed to open store");
    store.put(b"k", b"v").expect("put");

    let second = Lsm::open(config(&dir));
    assert!(second.is_err(), "the data directory must be exclusive");
    drop(store);

    let store = Lsm::open(config(&dir)).expect("Failed to reopen after close");
    assert_eq!(store.get(b"k").expect("get"), Some(b"v".to_vec()));
}

#[test]
fn test_tids_keep_growing_across_reopens() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    {
        let store = Lsm::open(config(&dir)).expect("Failed to open store");
        store.put(b"old", b"1").expect("put");
        store.flush_all().expect("flush");
    }
    {
        let store = Lsm::open(config(&dir)).expect("Failed to reopen store");
        store.put(b"old", b"2").expect("put");
        store.flush_all().expect("flush");
    }
    // The second generation must shadow the first.
    let store = Lsm::open(config(&dir)).expect("Failed to reopen store");
    assert_eq!(store.get(b"old").expect("get"), Some(b"2".to_vec()));
}
