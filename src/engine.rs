//! The LSM engine and the public store facade.
//!
//! ```text
//! Client
//!   |
//!   v
//! +-----------------------------------------------+
//! |                   Lsm                         |
//! |  tid allocation, transactions, WAL, recovery  |
//! +-----------------------+-----------------------+
//!                         |
//! +-----------------------v-----------------------+
//! |                 LsmEngine                     |
//! |                                               |
//! | put/remove -> MemTable insert                 |
//! |      |  (tier over total_memtable_limit?)     |
//! |      v            yes                         |
//! |   flush() -> new level-0 SST                  |
//! |      |  (level over level_ratio tables?)      |
//! |      v            yes                         |
//! |   full_compact() -> merged SSTs one level down|
//! |                                               |
//! | get -> MemTable -> L0 (newest first) -> L1..  |
//! |         (first hit wins, empty value = gone)  |
//! +-----------------------------------------------+
//! ```
//!
//! `LsmEngine` works with caller-supplied transaction ids; `Lsm` binds it
//! to the transaction manager, which allocates ids, persists the
//! checkpoint and replays the WAL on open.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tracing::{debug, info, trace, warn};

use crate::block::iterator::View;
use crate::cache::BlockCache;
use crate::compaction;
use crate::config::LsmConfig;
use crate::errinput;
use crate::error::Result;
use crate::flock::FileLock;
use crate::iterator::{
    HeapIterator, LevelIterator, LsmIterator, LsmScanIterator, ScanBound, SearchItem,
};
use crate::logger;
use crate::memtable::MemTable;
use crate::sstable::builder::SstBuilder;
use crate::sstable::concat::ConcatIterator;
use crate::sstable::iterator::SstIterator;
use crate::sstable::{parse_sst_name, sst_path, Sst};
use crate::tran::{IsolationLevel, TranContext, TranManager};

const LOCK_FILE: &str = "LOCK";

/// Per-level membership of the SST tree. Level 0 is ordered newest-first
/// by id; levels >= 1 are ordered by first_key with disjoint ranges.
pub(crate) struct SstIndex {
    pub(crate) ssts: HashMap<u64, Arc<Sst>>,
    pub(crate) levels: BTreeMap<usize, VecDeque<u64>>,
    pub(crate) max_level: usize,
}

impl SstIndex {
    fn new() -> Self {
        Self {
            ssts: HashMap::new(),
            levels: BTreeMap::new(),
            max_level: 0,
        }
    }

    pub(crate) fn level_ids(&self, level: usize) -> Vec<u64> {
        self.levels
            .get(&level)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    pub(crate) fn level_ssts(&self, level: usize) -> Vec<Arc<Sst>> {
        self.level_ids(level)
            .iter()
            .map(|id| self.ssts[id].clone())
            .collect()
    }

    /// Deepest level currently holding any table.
    pub(crate) fn deepest_level(&self) -> usize {
        self.levels
            .iter()
            .filter(|(_, ids)| !ids.is_empty())
            .map(|(level, _)| *level)
            .max()
            .unwrap_or(0)
    }
}

pub struct LsmEngine {
    pub(crate) config: LsmConfig,
    data_dir: PathBuf,
    pub(crate) memtable: MemTable,
    pub(crate) index: RwLock<SstIndex>,
    pub(crate) block_cache: Arc<BlockCache>,
    pub(crate) next_sst_id: AtomicU64,
    _lock: FileLock,
}

impl LsmEngine {
    /// Opens the data directory, loading every `sst_<id>.<level>` file
    /// into the level index.
    pub fn open(config: LsmConfig) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&config.dir)?;
        let lock = FileLock::lock(config.dir.join(LOCK_FILE))?;
        let block_cache = Arc::new(BlockCache::new(
            config.block_cache_capacity,
            config.block_cache_k,
        ));

        let mut index = SstIndex::new();
        let mut max_sst_id = 0;
        for entry in std::fs::read_dir(&config.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some((id, level)) = name.to_str().and_then(parse_sst_name) else {
                continue;
            };
            let sst = Sst::open(id, &entry.path(), block_cache.clone())?;
            if export_enabled() {
                export_sst(&config.dir, &sst, level);
            }
            max_sst_id = max_sst_id.max(id);
            index.max_level = index.max_level.max(level);
            index.ssts.insert(id, sst);
            index.levels.entry(level).or_default().push_back(id);
            info!(id, level, "loaded sst");
        }

        // Level 0 newest-first by id; deeper levels by ascending first key.
        let ssts = &index.ssts;
        for (level, ids) in index.levels.iter_mut() {
            let mut sorted: Vec<u64> = ids.iter().copied().collect();
            if *level == 0 {
                sorted.sort_unstable_by(|a, b| b.cmp(a));
            } else {
                sorted.sort_by(|a, b| ssts[a].first_key().cmp(ssts[b].first_key()));
            }
            *ids = sorted.into();
        }

        let data_dir = config.dir.clone();
        let memtable = MemTable::new(config.per_memtable_limit);
        Ok(Arc::new(Self {
            config,
            data_dir,
            memtable,
            index: RwLock::new(index),
            block_cache,
            next_sst_id: AtomicU64::new(max_sst_id + 1),
            _lock: lock,
        }))
    }

    pub(crate) fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Writes one entry under the given tid. Returns the max tid of a
    /// flushed SST when the write pushed the memtable tier over its limit,
    /// 0 otherwise.
    pub fn put(&self, key: &[u8], value: &[u8], tid: u64) -> Result<u64> {
        self.memtable.put(key, value, tid)?;
        trace!(key = %String::from_utf8_lossy(key), tid, "put into memtable");
        self.maybe_flush()
    }

    pub fn put_batch(&self, kvs: &[(Vec<u8>, Vec<u8>)], tid: u64) -> Result<u64> {
        self.memtable.put_batch(kvs, tid)?;
        trace!(keys = kvs.len(), tid, "batch put into memtable");
        self.maybe_flush()
    }

    /// Deletion is a put of the empty-value tombstone.
    pub fn remove(&self, key: &[u8], tid: u64) -> Result<u64> {
        self.memtable.remove(key, tid)?;
        trace!(key = %String::from_utf8_lossy(key), tid, "tombstoned in memtable");
        self.maybe_flush()
    }

    pub fn remove_batch(&self, keys: &[Vec<u8>], tid: u64) -> Result<u64> {
        self.memtable.remove_batch(keys, tid)?;
        self.maybe_flush()
    }

    fn maybe_flush(&self) -> Result<u64> {
        if self.memtable.total_size() >= self.config.total_memtable_limit {
            self.flush()
        } else {
            Ok(0)
        }
    }

    /// Newest version of `key` visible at `view_tid`. A tombstone hit
    /// resolves to `None` without consulting older tiers.
    pub fn get(&self, key: &[u8], view_tid: u64) -> Result<Option<(Vec<u8>, u64)>> {
        if let Some((value, tid)) = self.memtable.get(key, view_tid)? {
            if value.is_empty() {
                trace!(key = %String::from_utf8_lossy(key), "deleted in memtable");
                return Ok(None);
            }
            return Ok(Some((value, tid)));
        }
        let index = self.index.read()?;
        Ok(self
            .probe_ssts(&index, key, view_tid)?
            .filter(|(value, _)| !value.is_empty()))
    }

    /// Batched lookup: one pass over the memtable, then per-key SST
    /// probes for the misses. Per-key results match point lookups.
    pub fn get_batch(
        &self,
        keys: &[Vec<u8>],
        view_tid: u64,
    ) -> Result<Vec<Option<(Vec<u8>, u64)>>> {
        let mem_hits = self.memtable.get_batch(keys, view_tid)?;
        let mut results = Vec::with_capacity(keys.len());
        let index = self.index.read()?;
        for (key, mem_hit) in keys.iter().zip(mem_hits) {
            let raw = match mem_hit {
                Some(entry) => Some(entry),
                None => self.probe_ssts(&index, key, view_tid)?,
            };
            results.push(raw.filter(|(value, _)| !value.is_empty()));
        }
        Ok(results)
    }

    /// Raw SST probe: newest visible version including tombstones. L0 is
    /// scanned newest-first; deeper levels are binary-searched by range.
    pub(crate) fn probe_ssts(
        &self,
        index: &SstIndex,
        key: &[u8],
        view_tid: u64,
    ) -> Result<Option<(Vec<u8>, u64)>> {
        for id in index.level_ids(0) {
            let sst = &index.ssts[&id];
            let iter = sst.get(key, view_tid)?;
            if let Some((_, value, tid)) = iter.peek() {
                trace!(key = %String::from_utf8_lossy(key), sst = id, "hit in level 0");
                return Ok(Some((value, tid)));
            }
        }

        for level in 1..=index.max_level {
            let ids = index.level_ids(level);
            let mut left = 0;
            let mut right = ids.len();
            while left < right {
                let mid = left + (right - left) / 2;
                let sst = &index.ssts[&ids[mid]];
                if sst.first_key() <= key && key <= sst.last_key() {
                    let iter = sst.get(key, view_tid)?;
                    if let Some((_, value, tid)) = iter.peek() {
                        trace!(key = %String::from_utf8_lossy(key), sst = ids[mid], level, "hit");
                        return Ok(Some((value, tid)));
                    }
                    break;
                } else if sst.last_key() < key {
                    left = mid + 1;
                } else {
                    right = mid;
                }
            }
        }
        Ok(None)
    }

    /// Full scan at the given view.
    pub fn scan_all(&self, view_tid: u64) -> Result<LsmScanIterator> {
        let sources = self.scan_sources(view_tid, None)?;
        Ok(LsmScanIterator::new(
            LevelIterator::new(sources)?,
            ScanBound::All,
        ))
    }

    /// Scan of all keys starting with `prefix`.
    pub fn scan_prefix(&self, prefix: &[u8], view_tid: u64) -> Result<LsmScanIterator> {
        let sources = self.scan_sources(view_tid, Some(prefix))?;
        Ok(LsmScanIterator::new(
            LevelIterator::new(sources)?,
            ScanBound::Prefix(prefix.to_vec()),
        ))
    }

    /// Scan of the contiguous window where the monotone `predicate`
    /// returns 0.
    pub fn scan_predicate<F>(&self, predicate: F, view_tid: u64) -> Result<LsmScanIterator>
    where
        F: Fn(&[u8]) -> i32 + Send + 'static,
    {
        let mut sources: Vec<Box<dyn LsmIterator + Send>> = Vec::new();
        sources.push(Box::new(HeapIterator::new(
            self.memtable.predicate_search_items(&predicate, view_tid)?,
            view_tid,
            false,
        )));
        let index = self.index.read()?;
        let mut l0_items = Vec::new();
        for id in index.level_ids(0) {
            collect_window_items(&index.ssts[&id], &predicate, view_tid, &mut l0_items)?;
        }
        sources.push(Box::new(HeapIterator::new(l0_items, view_tid, false)));
        for level in 1..=index.max_level {
            let ssts = index.level_ssts(level);
            sources.push(Box::new(ConcatIterator::new(ssts, View::Visible(view_tid))?));
        }
        drop(index);
        Ok(LsmScanIterator::new(
            LevelIterator::new(sources)?,
            ScanBound::Predicate(Box::new(predicate)),
        ))
    }

    fn scan_sources(
        &self,
        view_tid: u64,
        prefix: Option<&[u8]>,
    ) -> Result<Vec<Box<dyn LsmIterator + Send>>> {
        let mut sources: Vec<Box<dyn LsmIterator + Send>> = Vec::new();

        let mem_items = match prefix {
            Some(prefix) => self.memtable.prefix_search_items(prefix, view_tid)?,
            None => self.memtable.search_items(view_tid)?,
        };
        sources.push(Box::new(HeapIterator::new(mem_items, view_tid, false)));

        let index = self.index.read()?;
        let mut l0_items = Vec::new();
        for id in index.level_ids(0) {
            let sst = &index.ssts[&id];
            let mut iter = match prefix {
                Some(prefix) => SstIterator::seek(sst.clone(), prefix, View::Raw)?,
                None => sst.begin(View::Raw)?,
            };
            while iter.is_valid() {
                if let Some(prefix) = prefix {
                    if !iter.key().starts_with(prefix) {
                        break;
                    }
                }
                push_visible_item(&mut l0_items, &iter, -(id as i64), view_tid);
                iter.next_entry()?;
            }
        }
        sources.push(Box::new(HeapIterator::new(l0_items, view_tid, false)));

        for level in 1..=index.max_level {
            let ssts = index.level_ssts(level);
            let concat = match prefix {
                Some(prefix) => ConcatIterator::seek(ssts, prefix, View::Visible(view_tid))?,
                None => ConcatIterator::new(ssts, View::Visible(view_tid))?,
            };
            sources.push(Box::new(concat));
        }
        Ok(sources)
    }

    /// Drains the oldest frozen memtable into a level-0 SST, compacting
    /// level 0 first if it is over threshold. Returns the max tid flushed,
    /// 0 when there was nothing to do.
    pub fn flush(&self) -> Result<u64> {
        if self.memtable.total_size() == 0 {
            return Ok(0);
        }
        let mut index = self.index.write()?;

        // Compact the lowest over-threshold level before admitting a new
        // table; the recursion inside makes room further down first.
        let over_threshold = (0..=index.max_level)
            .find(|level| index.level_ids(*level).len() >= self.config.level_ratio);
        if let Some(level) = over_threshold {
            compaction::full_compact(self, &mut index, level)?;
        }

        let id = self.next_sst_id.fetch_add(1, Ordering::SeqCst);
        let builder = self.new_sst_builder();
        let path = sst_path(&self.data_dir, id, 0);
        let Some(sst) = self
            .memtable
            .flush_last(builder, &path, id, self.block_cache.clone())?
        else {
            return Ok(0);
        };
        if export_enabled() {
            export_sst(&self.data_dir, &sst, 0);
        }
        let max_tid = sst.tid_range().1;
        index.ssts.insert(id, sst);
        index.levels.entry(0).or_default().push_front(id);
        info!(id, max_tid, "flushed memtable to new level-0 sst");
        Ok(max_tid)
    }

    /// Flushes until the memtable tier is empty; returns the largest tid
    /// that reached disk.
    pub fn flush_all(&self) -> Result<u64> {
        let mut max_tid = 0;
        // A flush can legitimately report 0 (a table holding only boundary
        // markers), but it always drains one table, so this terminates.
        while self.memtable.total_size() > 0 {
            max_tid = max_tid.max(self.flush()?);
        }
        Ok(max_tid)
    }

    /// Drops all in-memory state and deletes every SST file.
    pub fn clear(&self) -> Result<()> {
        self.memtable.clear()?;
        let mut index = self.index.write()?;
        for (_, sst) in index.ssts.drain() {
            if let Err(e) = sst.del() {
                warn!(id = sst.id(), "failed to delete sst file: {e}");
            }
        }
        index.levels.clear();
        index.max_level = 0;
        info!("cleared engine state");
        Ok(())
    }

    /// Largest tid present in any on-disk table; the flush checkpoint a
    /// fresh manager starts from.
    pub(crate) fn max_disk_tid(&self) -> Result<u64> {
        let index = self.index.read()?;
        Ok(index
            .ssts
            .values()
            .map(|sst| sst.tid_range().1)
            .max()
            .unwrap_or(0))
    }

    pub(crate) fn new_sst_builder(&self) -> SstBuilder {
        SstBuilder::new(
            self.config.block_size,
            self.config.bloom_expected_entries,
            self.config.bloom_fp_rate,
        )
    }

    /// Allocates an id and finalizes a compaction output table.
    pub(crate) fn finish_sst(&self, builder: SstBuilder, level: usize) -> Result<Arc<Sst>> {
        let id = self.next_sst_id.fetch_add(1, Ordering::SeqCst);
        let path = sst_path(&self.data_dir, id, level);
        let sst = builder.build(id, &path, self.block_cache.clone())?;
        if export_enabled() {
            export_sst(&self.data_dir, &sst, level);
        }
        debug!(id, level, "wrote compaction output sst");
        Ok(sst)
    }
}

fn push_visible_item(items: &mut Vec<SearchItem>, iter: &SstIterator, source: i64, view_tid: u64) {
    let tid = iter.tid();
    if view_tid != 0 && tid > view_tid {
        return;
    }
    items.push(SearchItem::new(
        iter.key().to_vec(),
        iter.value().to_vec(),
        tid,
        0,
        source,
    ));
}

fn collect_window_items<F>(
    sst: &Arc<Sst>,
    predicate: &F,
    view_tid: u64,
    items: &mut Vec<SearchItem>,
) -> Result<()>
where
    F: Fn(&[u8]) -> i32,
{
    let mut iter = sst.begin(View::Raw)?;
    while iter.is_valid() {
        match predicate(iter.key()) {
            0 => push_visible_item(items, &iter, -(sst.id() as i64), view_tid),
            d if d < 0 => break,
            _ => {}
        }
        iter.next_entry()?;
    }
    Ok(())
}

fn export_enabled() -> bool {
    std::env::var_os("LSM_EXPORT_SST").is_some()
}

fn export_sst(data_dir: &Path, sst: &Arc<Sst>, level: usize) {
    let exports = data_dir
        .parent()
        .unwrap_or(data_dir)
        .join("exports");
    if let Err(e) = sst.export_debug(&exports, level) {
        warn!(id = sst.id(), "failed to export sst dump: {e}");
    }
}

/// The embeddable store: the engine plus transactions, WAL durability and
/// crash recovery.
pub struct Lsm {
    engine: Arc<LsmEngine>,
    tran_manager: Arc<TranManager>,
}

impl Lsm {
    pub fn open(config: LsmConfig) -> Result<Self> {
        logger::init();
        let engine = LsmEngine::open(config)?;
        let tran_manager = TranManager::open(&engine)?;
        tran_manager.replay_recovered(&engine)?;
        Ok(Self {
            engine,
            tran_manager,
        })
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        reject_reserved_key(key)?;
        let tid = self.tran_manager.allocate_tid();
        let flushed = self.engine.put(key, value, tid)?;
        self.note_flush(flushed)
    }

    pub fn put_batch(&self, kvs: &[(Vec<u8>, Vec<u8>)]) -> Result<()> {
        for (key, _) in kvs {
            reject_reserved_key(key)?;
        }
        let tid = self.tran_manager.allocate_tid();
        let flushed = self.engine.put_batch(kvs, tid)?;
        self.note_flush(flushed)
    }

    pub fn remove(&self, key: &[u8]) -> Result<()> {
        reject_reserved_key(key)?;
        let tid = self.tran_manager.allocate_tid();
        let flushed = self.engine.remove(key, tid)?;
        self.note_flush(flushed)
    }

    pub fn remove_batch(&self, keys: &[Vec<u8>]) -> Result<()> {
        for key in keys {
            reject_reserved_key(key)?;
        }
        let tid = self.tran_manager.allocate_tid();
        let flushed = self.engine.remove_batch(keys, tid)?;
        self.note_flush(flushed)
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let view = self.tran_manager.read_view();
        Ok(self.engine.get(key, view)?.map(|(value, _)| value))
    }

    pub fn get_batch(&self, keys: &[Vec<u8>]) -> Result<Vec<Option<Vec<u8>>>> {
        let view = self.tran_manager.read_view();
        Ok(self
            .engine
            .get_batch(keys, view)?
            .into_iter()
            .map(|hit| hit.map(|(value, _)| value))
            .collect())
    }

    pub fn scan_all(&self, view_tid: u64) -> Result<LsmScanIterator> {
        self.engine.scan_all(view_tid)
    }

    pub fn scan_prefix(&self, prefix: &[u8], view_tid: u64) -> Result<LsmScanIterator> {
        self.engine.scan_prefix(prefix, view_tid)
    }

    pub fn scan_predicate<F>(&self, predicate: F, view_tid: u64) -> Result<LsmScanIterator>
    where
        F: Fn(&[u8]) -> i32 + Send + 'static,
    {
        self.engine.scan_predicate(predicate, view_tid)
    }

    pub fn flush(&self) -> Result<()> {
        let flushed = self.engine.flush()?;
        self.note_flush(flushed)
    }

    pub fn flush_all(&self) -> Result<()> {
        let flushed = self.engine.flush_all()?;
        self.note_flush(flushed)
    }

    pub fn clear(&self) -> Result<()> {
        self.engine.clear()
    }

    pub fn begin_tran(&self, isolation: IsolationLevel) -> Result<Arc<TranContext>> {
        self.tran_manager.begin_tran(&self.engine, isolation)
    }

    pub fn set_log_level(&self, level: &str) -> Result<()> {
        logger::set_log_level(level)
    }

    fn note_flush(&self, flushed_max_tid: u64) -> Result<()> {
        if flushed_max_tid > 0 {
            self.tran_manager.update_max_flushed_tid(flushed_max_tid)?;
        }
        Ok(())
    }

    /// The engine underneath, for callers that manage tids themselves.
    pub fn engine(&self) -> &Arc<LsmEngine> {
        &self.engine
    }
}

impl Drop for Lsm {
    fn drop(&mut self) {
        match self.engine.flush_all() {
            Ok(flushed) if flushed > 0 => {
                if let Err(e) = self.tran_manager.update_max_flushed_tid(flushed) {
                    warn!("failed to persist flush checkpoint on close: {e}");
                }
            }
            Ok(_) => {}
            Err(e) => warn!("final flush failed on close: {e}"),
        }
        if let Err(e) = self.tran_manager.persist() {
            warn!("failed to persist transaction checkpoint on close: {e}");
        }
    }
}

fn reject_reserved_key(key: &[u8]) -> Result<()> {
    if key.is_empty() {
        return Err(errinput!("the empty key is reserved for internal markers"));
    }
    Ok(())
}
