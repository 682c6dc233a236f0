//! Write-ahead log.
//!
//! One active file, `wal/wal.log`, receives encoded records appended from
//! an in-memory buffer. The buffer drains when it fills or when a caller
//! passes `force_flush` (every transactional commit does); draining writes
//! the bytes, syncs the file and rotates it to `wal.log.<seq>` once it
//! exceeds the size limit. A background thread wakes on an interval and
//! deletes rotated files whose records are all reflected in
//! `max_finished_flushed_tid` — it never reclaims anything newer.

pub mod record;
pub mod recovery;

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{Error, Result};
pub use self::record::{Record, RecordPayload};

pub const ACTIVE_LOG: &str = "wal.log";

struct WalState {
    buffer: Vec<Record>,
    active: File,
    active_size: u64,
    next_rotation: u64,
}

struct WalInner {
    log_dir: PathBuf,
    state: Mutex<WalState>,
    buffer_capacity: usize,
    file_size_limit: u64,
    max_finished_flushed_tid: AtomicU64,
    stop: Mutex<bool>,
    stop_cv: Condvar,
}

pub struct Wal {
    inner: Arc<WalInner>,
    cleaner: Option<JoinHandle<()>>,
}

impl Wal {
    pub fn open(
        log_dir: &Path,
        buffer_capacity: usize,
        file_size_limit: u64,
        clean_interval: Duration,
        max_finished_flushed_tid: u64,
    ) -> Result<Self> {
        std::fs::create_dir_all(log_dir)?;

        let next_rotation = rotated_logs(log_dir)?
            .last()
            .map(|(seq, _)| seq + 1)
            .unwrap_or(1);
        let active_path = log_dir.join(ACTIVE_LOG);
        let active = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&active_path)?;
        let active_size = active.metadata()?.len();

        let inner = Arc::new(WalInner {
            log_dir: log_dir.to_path_buf(),
            state: Mutex::new(WalState {
                buffer: Vec::new(),
                active,
                active_size,
                next_rotation,
            }),
            buffer_capacity: buffer_capacity.max(1),
            file_size_limit,
            max_finished_flushed_tid: AtomicU64::new(max_finished_flushed_tid),
            stop: Mutex::new(false),
            stop_cv: Condvar::new(),
        });

        let cleaner_inner = inner.clone();
        let cleaner = std::thread::Builder::new()
            .name("wal-cleaner".to_string())
            .spawn(move || cleaner_loop(cleaner_inner, clean_interval))?;

        Ok(Self {
            inner,
            cleaner: Some(cleaner),
        })
    }

    /// Buffers records; with `force_flush` (or a full buffer) they are
    /// encoded, written and synced before this returns. Without
    /// `force_flush` a buffer that cannot take the records fails with
    /// [`Error::WalBufferFull`] and nothing is enqueued.
    pub fn log(&self, records: &[Record], force_flush: bool) -> Result<()> {
        let mut state = self.inner.state.lock()?;
        if !force_flush && state.buffer.len() + records.len() > self.inner.buffer_capacity {
            return Err(Error::WalBufferFull);
        }
        state.buffer.extend_from_slice(records);
        if force_flush || state.buffer.len() >= self.inner.buffer_capacity {
            self.inner.flush_state(&mut state)?;
        }
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        let mut state = self.inner.state.lock()?;
        self.inner.flush_state(&mut state)
    }

    /// Raises the cleaner's truncation boundary: every record with
    /// tid <= `tid` is both committed and flushed to an SST.
    pub fn set_max_finished_flushed_tid(&self, tid: u64) {
        self.inner
            .max_finished_flushed_tid
            .store(tid, Ordering::SeqCst);
    }

    /// Replays the log directory. See [`recovery::recover`].
    pub fn recover(log_dir: &Path, max_flushed_tid: u64) -> Result<BTreeMap<u64, Vec<Record>>> {
        recovery::recover(log_dir, max_flushed_tid)
    }
}

impl Drop for Wal {
    fn drop(&mut self) {
        {
            let mut stop = self.inner.stop.lock().unwrap();
            *stop = true;
            self.inner.stop_cv.notify_all();
        }
        if let Some(cleaner) = self.cleaner.take() {
            let _ = cleaner.join();
        }
        if let Ok(mut state) = self.inner.state.lock() {
            if let Err(e) = self.inner.flush_state(&mut state) {
                warn!("final wal flush failed: {e}");
            }
        }
    }
}

impl WalInner {
    fn flush_state(&self, state: &mut WalState) -> Result<()> {
        if state.buffer.is_empty() {
            return Ok(());
        }
        let mut bytes = Vec::new();
        for record in &state.buffer {
            record.encode_into(&mut bytes);
        }
        state.active.write_all(&bytes)?;
        state.active.sync_all()?;
        state.active_size += bytes.len() as u64;
        state.buffer.clear();

        if state.active_size > self.file_size_limit {
            self.rotate(state)?;
        }
        Ok(())
    }

    fn rotate(&self, state: &mut WalState) -> Result<()> {
        let from = self.log_dir.join(ACTIVE_LOG);
        let to = self.log_dir.join(format!("{ACTIVE_LOG}.{}", state.next_rotation));
        std::fs::rename(&from, &to)?;
        debug!(to = %to.display(), size = state.active_size, "rotated wal file");
        state.next_rotation += 1;
        state.active = OpenOptions::new().create(true).append(true).open(&from)?;
        state.active_size = 0;
        Ok(())
    }

    /// Deletes rotated files fully covered by the truncation boundary.
    fn clean(&self) -> Result<()> {
        let boundary = self.max_finished_flushed_tid.load(Ordering::SeqCst);
        for (seq, path) in rotated_logs(&self.log_dir)? {
            let bytes = std::fs::read(&path)?;
            let records = match Record::decode_stream(&bytes) {
                Ok(records) => records,
                Err(e) => {
                    warn!(seq, "skipping undecodable rotated wal file: {e}");
                    continue;
                }
            };
            if !records.is_empty() && records.iter().all(|r| r.tid <= boundary) {
                std::fs::remove_file(&path)?;
                debug!(seq, boundary, "reclaimed rotated wal file");
            }
        }
        Ok(())
    }
}

fn cleaner_loop(inner: Arc<WalInner>, interval: Duration) {
    loop {
        let stop = inner.stop.lock().unwrap();
        let (stop, _) = inner.stop_cv.wait_timeout(stop, interval).unwrap();
        if *stop {
            return;
        }
        drop(stop);
        if let Err(e) = inner.clean() {
            warn!("wal cleaner pass failed: {e}");
        }
    }
}

/// Rotated log files as (sequence, path), sequence ascending.
fn rotated_logs(log_dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let mut logs = Vec::new();
    if !log_dir.exists() {
        return Ok(logs);
    }
    for entry in std::fs::read_dir(log_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(seq) = name
            .strip_prefix("wal.log.")
            .and_then(|s| s.parse::<u64>().ok())
        {
            logs.push((seq, entry.path()));
        }
    }
    logs.sort_by_key(|(seq, _)| *seq);
    Ok(logs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    fn open_wal(dir: &Path, buffer: usize, size_limit: u64) -> Wal {
        Wal::open(dir, buffer, size_limit, Duration::from_secs(3600), 0)
            .expect("Failed to open wal")
    }

    #[test]
    fn test_log_and_reread() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let wal = open_wal(dir.path(), 16, 1024 * 1024);

        wal.log(
            &[
                Record::create(1),
                Record::put(1, b"a", b"1"),
                Record::commit(1),
            ],
            true,
        )
        .expect("Failed to log");
        drop(wal);

        let bytes = std::fs::read(dir.path().join(ACTIVE_LOG)).expect("read");
        let records = Record::decode_stream(&bytes).expect("decode");
        assert_eq!(records.len(), 3);
        assert_eq!(records[1], Record::put(1, b"a", b"1"));
    }

    #[test]
    fn test_buffer_full_without_force() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let wal = open_wal(dir.path(), 2, 1024 * 1024);

        wal.log(&[Record::create(1)], false).expect("first fits");
        assert!(matches!(
            wal.log(&[Record::create(2), Record::create(3)], false),
            Err(Error::WalBufferFull)
        ));
        // Forcing bypasses the capacity check.
        wal.log(&[Record::create(2), Record::create(3)], true)
            .expect("forced append flushes");
    }

    #[test]
    fn test_buffer_flushes_when_capacity_reached() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let wal = open_wal(dir.path(), 2, 1024 * 1024);

        wal.log(&[Record::create(1)], false).expect("log");
        assert_eq!(
            std::fs::metadata(dir.path().join(ACTIVE_LOG)).unwrap().len(),
            0,
            "buffered record must not be on disk yet"
        );
        wal.log(&[Record::create(2)], false).expect("log");
        assert!(std::fs::metadata(dir.path().join(ACTIVE_LOG)).unwrap().len() > 0);
    }

    #[test]
    fn test_rotation() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        // A tiny size limit so every flush rotates.
        let wal = open_wal(dir.path(), 16, 8);

        wal.log(&[Record::put(1, b"key", b"value")], true).expect("log");
        wal.log(&[Record::put(2, b"key", b"value")], true).expect("log");

        let rotated = rotated_logs(dir.path()).expect("list");
        assert_eq!(rotated.len(), 2);
        assert_eq!(rotated[0].0, 1);
        assert_eq!(rotated[1].0, 2);
    }

    #[test]
    fn test_cleaner_respects_boundary() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let wal = open_wal(dir.path(), 16, 8);

        wal.log(&[Record::put(1, b"a", b"1"), Record::commit(1)], true)
            .expect("log");
        wal.log(&[Record::put(9, b"b", b"2"), Record::commit(9)], true)
            .expect("log");
        assert_eq!(rotated_logs(dir.path()).unwrap().len(), 2);

        // Only tid 1 is finished and flushed.
        wal.set_max_finished_flushed_tid(1);
        wal.inner.clean().expect("clean");
        let remaining = rotated_logs(dir.path()).expect("list");
        assert_eq!(remaining.len(), 1, "the tid-9 file must survive");
        assert_eq!(remaining[0].0, 2);
    }
}
