//! Transactions: id allocation, per-context buffering, isolation-level
//! semantics, conflict detection and the durable checkpoint sidecar.
//!
//! The manager owns the WAL and the `tranc_id` checkpoint file
//! (`next_tid (u64) | count (u64) | count x committed-unflushed tid`,
//! little-endian). A context is shared between the caller and the
//! manager's active map; commit and rollback remove it from the map.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use tracing::{debug, info, warn};

use crate::engine::LsmEngine;
use crate::error::{Error, Result};
use crate::{errdata, errinput};
use crate::wal::{Record, RecordPayload, Wal};

const CHECKPOINT_FILE: &str = "tranc_id";
const WAL_DIR: &str = "wal";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranState {
    Init,
    Running,
    Committed,
    Aborted,
}

pub struct TranManager {
    data_dir: PathBuf,
    next_tid: AtomicU64,
    max_flushed_tid: AtomicU64,
    committed_unflushed: Mutex<BTreeSet<u64>>,
    /// Weak handles so an abandoned context unregisters itself on drop.
    active: Mutex<HashMap<u64, Weak<TranContext>>>,
    wal: Wal,
    recovered: Mutex<BTreeMap<u64, Vec<Record>>>,
}

impl TranManager {
    /// Reads the checkpoint, scans the WAL for committed-but-unflushed
    /// transactions and opens the active log. `max_flushed_tid` is derived
    /// from the SSTs the engine loaded; the checkpoint only persists the
    /// id counter and the unflushed set.
    pub fn open(engine: &Arc<LsmEngine>) -> Result<Arc<Self>> {
        let data_dir = engine.data_dir().to_path_buf();
        let config = &engine.config;
        let checkpoint = read_checkpoint(&data_dir.join(CHECKPOINT_FILE))?;
        let (mut next_tid, mut committed_unflushed) = checkpoint.unwrap_or((1, BTreeSet::new()));

        let max_flushed_tid = engine.max_disk_tid()?;
        committed_unflushed.retain(|tid| *tid > max_flushed_tid);

        let wal_dir = data_dir.join(WAL_DIR);
        let recovered = Wal::recover(&wal_dir, max_flushed_tid)?;
        for tid in recovered.keys() {
            committed_unflushed.insert(*tid);
            next_tid = next_tid.max(tid + 1);
        }

        let boundary = finished_flushed_boundary(max_flushed_tid, &committed_unflushed);
        let wal = Wal::open(
            &wal_dir,
            config.wal_buffer_records,
            config.wal_file_size_limit,
            config.wal_clean_interval,
            boundary,
        )?;

        let manager = Arc::new(Self {
            data_dir,
            next_tid: AtomicU64::new(next_tid.max(1)),
            max_flushed_tid: AtomicU64::new(max_flushed_tid),
            committed_unflushed: Mutex::new(committed_unflushed),
            active: Mutex::new(HashMap::new()),
            wal,
            recovered: Mutex::new(recovered),
        });
        manager.persist()?;
        Ok(manager)
    }

    /// Replays recovered committed transactions into the memtable under
    /// their original tids, ascending so write order is preserved.
    pub fn replay_recovered(&self, engine: &Arc<LsmEngine>) -> Result<()> {
        let groups = std::mem::take(&mut *self.recovered.lock()?);
        for (tid, records) in groups {
            for record in &records {
                match &record.payload {
                    RecordPayload::Put { key, value } => {
                        engine.memtable.put(key, value, tid)?;
                    }
                    RecordPayload::Delete { key } => {
                        engine.memtable.remove(key, tid)?;
                    }
                    RecordPayload::Create | RecordPayload::Commit | RecordPayload::Rollback => {}
                }
            }
            // Re-establish the commit boundary marker the crash wiped out.
            engine.memtable.put(b"", b"", tid)?;
            info!(tid, records = records.len(), "replayed committed transaction");
        }
        Ok(())
    }

    /// Claims a fresh monotone transaction id.
    pub fn allocate_tid(&self) -> u64 {
        self.next_tid.fetch_add(1, Ordering::SeqCst)
    }

    /// View tid for auto-allocated reads: everything allocated so far is
    /// visible.
    pub fn read_view(&self) -> u64 {
        self.next_tid.load(Ordering::SeqCst)
    }

    pub fn max_flushed_tid(&self) -> u64 {
        self.max_flushed_tid.load(Ordering::SeqCst)
    }

    /// Registers a new context under the internal mutex.
    pub fn begin_tran(
        self: &Arc<Self>,
        engine: &Arc<LsmEngine>,
        isolation: IsolationLevel,
    ) -> Result<Arc<TranContext>> {
        let tid = self.allocate_tid();
        let context = Arc::new(TranContext {
            tid,
            isolation,
            engine: engine.clone(),
            manager: self.clone(),
            inner: Mutex::new(TranInner {
                state: TranState::Init,
                operations: vec![Record::create(tid)],
                write_map: BTreeMap::new(),
                read_map: BTreeMap::new(),
                rollback_map: BTreeMap::new(),
            }),
        });
        self.active.lock()?.insert(tid, Arc::downgrade(&context));
        debug!(tid, ?isolation, "transaction started");
        Ok(context)
    }

    /// Raises the flush checkpoint and releases every tid now covered by
    /// it, then persists and lets the WAL cleaner advance.
    pub fn update_max_flushed_tid(&self, tid: u64) -> Result<()> {
        self.max_flushed_tid.fetch_max(tid, Ordering::SeqCst);
        let max_flushed = self.max_flushed_tid();
        let boundary = {
            let mut unflushed = self.committed_unflushed.lock()?;
            unflushed.retain(|t| *t > max_flushed);
            finished_flushed_boundary(max_flushed, &unflushed)
        };
        self.wal.set_max_finished_flushed_tid(boundary);
        self.persist()
    }

    fn mark_committed_unflushed(&self, tid: u64) -> Result<()> {
        let boundary = {
            let mut unflushed = self.committed_unflushed.lock()?;
            unflushed.insert(tid);
            finished_flushed_boundary(self.max_flushed_tid(), &unflushed)
        };
        self.wal.set_max_finished_flushed_tid(boundary);
        self.persist()
    }

    fn finish(&self, tid: u64) {
        if let Ok(mut active) = self.active.lock() {
            active.remove(&tid);
        }
    }

    fn write_wal(&self, records: &[Record]) -> Result<()> {
        self.wal.log(records, true)
    }

    /// Persists `next_tid` and the committed-unflushed set. The set lock
    /// is held across the write so concurrent commits serialize here and
    /// the file is never interleaved.
    pub fn persist(&self) -> Result<()> {
        let unflushed = self.committed_unflushed.lock()?;
        let mut buf = Vec::with_capacity(16 + unflushed.len() * 8);
        buf.write_u64::<LittleEndian>(self.next_tid.load(Ordering::SeqCst))
            .unwrap();
        buf.write_u64::<LittleEndian>(unflushed.len() as u64).unwrap();
        for tid in unflushed.iter() {
            buf.write_u64::<LittleEndian>(*tid).unwrap();
        }

        let mut file = File::create(self.data_dir.join(CHECKPOINT_FILE))?;
        file.write_all(&buf)?;
        file.sync_all()?;
        Ok(())
    }

    pub fn active_count(&self) -> usize {
        self.active
            .lock()
            .map(|a| a.values().filter(|w| w.upgrade().is_some()).count())
            .unwrap_or(0)
    }
}

/// Largest tid T such that every committed tid <= T has been flushed.
fn finished_flushed_boundary(max_flushed: u64, unflushed: &BTreeSet<u64>) -> u64 {
    match unflushed.first() {
        Some(min_unflushed) => max_flushed.min(min_unflushed.saturating_sub(1)),
        None => max_flushed,
    }
}

/// Rejects files whose length disagrees with their own count field rather
/// than guessing at a different layout.
fn read_checkpoint(path: &Path) -> Result<Option<(u64, BTreeSet<u64>)>> {
    if !path.exists() {
        return Ok(None);
    }
    let bytes = std::fs::read(path)?;
    if bytes.len() < 16 {
        return Err(errdata!("checkpoint file too short: {} bytes", bytes.len()));
    }
    let next_tid = LittleEndian::read_u64(&bytes[0..8]);
    let count = LittleEndian::read_u64(&bytes[8..16]) as usize;
    if bytes.len() != 16 + count * 8 {
        return Err(errdata!(
            "checkpoint file length {} does not match count {count}",
            bytes.len()
        ));
    }
    let mut unflushed = BTreeSet::new();
    for i in 0..count {
        unflushed.insert(LittleEndian::read_u64(&bytes[16 + i * 8..24 + i * 8]));
    }
    Ok(Some((next_tid, unflushed)))
}

struct TranInner {
    state: TranState,
    operations: Vec<Record>,
    /// Buffered writes for the buffering isolation levels; an empty value
    /// is a pending delete.
    write_map: BTreeMap<Vec<u8>, Vec<u8>>,
    /// Keys read by REPEATABLE_READ and SERIALIZABLE, with the values they
    /// observed; repeat reads answer from here.
    read_map: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    /// READ_UNCOMMITTED pre-images for rollback, captured on first write.
    rollback_map: BTreeMap<Vec<u8>, Option<(Vec<u8>, u64)>>,
}

/// One in-flight transaction. Shared between the caller and the manager's
/// active map; terminal states are final.
pub struct TranContext {
    tid: u64,
    isolation: IsolationLevel,
    engine: Arc<LsmEngine>,
    manager: Arc<TranManager>,
    inner: Mutex<TranInner>,
}

impl TranContext {
    pub fn tid(&self) -> u64 {
        self.tid
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation
    }

    pub fn state(&self) -> TranState {
        self.inner.lock().map(|i| i.state).unwrap_or(TranState::Aborted)
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(errinput!("the empty key is reserved for internal markers"));
        }
        let mut inner = self.inner.lock()?;
        ensure_running(&mut inner)?;
        match self.isolation {
            IsolationLevel::ReadUncommitted => {
                // Write-through, remembering what to restore on rollback.
                if !inner.rollback_map.contains_key(key) {
                    let pre_image = self.engine.get(key, 0)?;
                    inner.rollback_map.insert(key.to_vec(), pre_image);
                }
                self.engine.memtable.put(key, value, self.tid)?;
            }
            _ => {
                inner.write_map.insert(key.to_vec(), value.to_vec());
            }
        }
        inner.operations.push(Record::put(self.tid, key, value));
        Ok(())
    }

    pub fn remove(&self, key: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(errinput!("the empty key is reserved for internal markers"));
        }
        let mut inner = self.inner.lock()?;
        ensure_running(&mut inner)?;
        match self.isolation {
            IsolationLevel::ReadUncommitted => {
                if !inner.rollback_map.contains_key(key) {
                    let pre_image = self.engine.get(key, 0)?;
                    inner.rollback_map.insert(key.to_vec(), pre_image);
                }
                self.engine.memtable.remove(key, self.tid)?;
            }
            _ => {
                inner.write_map.insert(key.to_vec(), Vec::new());
            }
        }
        inner.operations.push(Record::delete(self.tid, key));
        Ok(())
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut inner = self.inner.lock()?;
        ensure_running(&mut inner)?;
        match self.isolation {
            IsolationLevel::ReadUncommitted => {
                Ok(self.read_live_memtable(key)?)
            }
            IsolationLevel::ReadCommitted => {
                if let Some(value) = inner.write_map.get(key) {
                    return Ok(non_tombstone(value));
                }
                Ok(self.read_live_memtable(key)?)
            }
            IsolationLevel::RepeatableRead | IsolationLevel::Serializable => {
                if let Some(value) = inner.write_map.get(key) {
                    return Ok(non_tombstone(value));
                }
                if let Some(cached) = inner.read_map.get(key) {
                    return Ok(cached.clone());
                }
                let result = self.read_live_memtable(key)?;
                inner.read_map.insert(key.to_vec(), result.clone());
                Ok(result)
            }
        }
    }

    fn read_live_memtable(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self
            .engine
            .memtable
            .get(key, self.tid)?
            .and_then(|(value, _)| non_tombstone(&value)))
    }

    /// Commits the transaction. `test_fail` skips the memtable apply after
    /// the WAL write to simulate a crash for recovery testing.
    pub fn commit(&self, test_fail: bool) -> Result<()> {
        let mut inner = self.inner.lock()?;
        if matches!(inner.state, TranState::Committed | TranState::Aborted) {
            return Err(Error::InvalidOperation(format!(
                "commit on finished transaction {}",
                self.tid
            )));
        }

        if self.isolation == IsolationLevel::ReadUncommitted {
            inner.operations.push(Record::commit(self.tid));
            self.manager.write_wal(&inner.operations)?;
            inner.state = TranState::Committed;
            self.manager.mark_committed_unflushed(self.tid)?;
            self.manager.finish(self.tid);
            return Ok(());
        }

        // Index lock before memtable locks, per the engine lock hierarchy;
        // holding both keeps the flush checkpoint and the tree stable for
        // the duration of the conflict check and apply.
        let index = self.engine.index.read()?;
        let mut memtable = self.engine.memtable.exclusive()?;

        if matches!(
            self.isolation,
            IsolationLevel::RepeatableRead | IsolationLevel::Serializable
        ) {
            let check_keys: Vec<Vec<u8>> = inner
                .write_map
                .keys()
                .chain(inner.read_map.keys())
                .cloned()
                .collect();
            for key in &check_keys {
                if let Some((_, tid)) = memtable.get(key, 0) {
                    if tid > self.tid {
                        return self.abort_for_conflict(&mut inner, key, tid);
                    }
                }
            }
            if self.isolation == IsolationLevel::Serializable
                && self.manager.max_flushed_tid() >= self.tid
            {
                // Flushed data may hold newer versions; probe with
                // visibility off.
                let write_keys: Vec<Vec<u8>> = inner.write_map.keys().cloned().collect();
                for key in &write_keys {
                    if let Some((_, tid)) = self.engine.probe_ssts(&index, key, 0)? {
                        if tid > self.tid {
                            return self.abort_for_conflict(&mut inner, key, tid);
                        }
                    }
                }
            }
        }

        inner.operations.push(Record::commit(self.tid));
        self.manager.write_wal(&inner.operations)?;

        if !test_fail {
            let writes: Vec<(Vec<u8>, Vec<u8>)> = inner
                .write_map
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            for (key, value) in writes {
                memtable.put(&key, &value, self.tid);
            }
            // Boundary marker isolating this transaction's entries in
            // later memtable scans.
            memtable.put(b"", b"", self.tid);
        }
        drop(memtable);
        drop(index);

        inner.state = TranState::Committed;
        self.manager.mark_committed_unflushed(self.tid)?;
        self.manager.finish(self.tid);
        debug!(tid = self.tid, "transaction committed");
        Ok(())
    }

    fn abort_for_conflict(
        &self,
        inner: &mut TranInner,
        key: &[u8],
        newer_tid: u64,
    ) -> Result<()> {
        warn!(
            tid = self.tid,
            key = %String::from_utf8_lossy(key),
            newer_tid,
            "commit conflict, aborting transaction"
        );
        inner.state = TranState::Aborted;
        self.manager.finish(self.tid);
        Err(Error::Conflict)
    }

    /// Rolls the transaction back. READ_UNCOMMITTED restores pre-images;
    /// the buffering levels just drop their write buffer.
    pub fn rollback(&self) -> Result<()> {
        let mut inner = self.inner.lock()?;
        match inner.state {
            TranState::Aborted => return Ok(()),
            TranState::Committed => {
                return Err(Error::InvalidOperation(format!(
                    "rollback on committed transaction {}",
                    self.tid
                )));
            }
            _ => {}
        }

        if self.isolation == IsolationLevel::ReadUncommitted {
            let pre_images: Vec<(Vec<u8>, Option<(Vec<u8>, u64)>)> = inner
                .rollback_map
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            for (key, pre_image) in pre_images {
                // The dirty write sits at self.tid, the newest version of
                // the key; the restore must land on that same version or
                // reads keep resolving to the dirty value.
                match pre_image {
                    Some((value, _)) => self.engine.memtable.put(&key, &value, self.tid)?,
                    // The key did not exist: restore absence.
                    None => self.engine.memtable.remove(&key, self.tid)?,
                }
            }
        } else {
            inner.write_map.clear();
        }

        inner.operations.push(Record::rollback(self.tid));
        self.manager.write_wal(&[Record::rollback(self.tid)])?;
        inner.state = TranState::Aborted;
        self.manager.finish(self.tid);
        debug!(tid = self.tid, "transaction rolled back");
        Ok(())
    }
}

impl Drop for TranContext {
    fn drop(&mut self) {
        // Commit and rollback already unregister; this covers contexts the
        // caller abandoned.
        self.manager.finish(self.tid);
    }
}

fn ensure_running(inner: &mut TranInner) -> Result<()> {
    match inner.state {
        TranState::Init => {
            inner.state = TranState::Running;
            Ok(())
        }
        TranState::Running => Ok(()),
        TranState::Committed | TranState::Aborted => Err(Error::InvalidOperation(
            "operation on finished transaction".to_string(),
        )),
    }
}

fn non_tombstone(value: &[u8]) -> Option<Vec<u8>> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_vec())
    }
}
