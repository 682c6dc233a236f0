//! The mutable tier: one active skip list plus a FIFO of frozen ones.
//!
//! Writes land in the active list; when it outgrows `per_memtable_limit`
//! it is frozen onto the front of the deque and a fresh list installed.
//! Flushing drains the deque from the back, oldest first, so tid order is
//! preserved on the way to level 0.
//!
//! Lock order follows the engine-wide hierarchy: the frozen-deque lock is
//! always taken before the active-list lock when both are held.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, RwLockWriteGuard};

use tracing::debug;

use crate::cache::BlockCache;
use crate::error::Result;
use crate::iterator::{HeapIterator, SearchItem};
use crate::skiplist::SkipList;
use crate::sstable::builder::SstBuilder;
use crate::sstable::Sst;

pub struct MemTable {
    frozen: RwLock<VecDeque<Arc<SkipList>>>,
    active: RwLock<SkipList>,
    frozen_bytes: AtomicUsize,
    per_table_limit: usize,
}

impl MemTable {
    pub fn new(per_table_limit: usize) -> Self {
        Self {
            frozen: RwLock::new(VecDeque::new()),
            active: RwLock::new(SkipList::new()),
            frozen_bytes: AtomicUsize::new(0),
            per_table_limit,
        }
    }

    pub fn put(&self, key: &[u8], value: &[u8], tid: u64) -> Result<()> {
        let exceeded = {
            let mut active = self.active.write()?;
            active.put(key, value, tid);
            active.size_bytes() > self.per_table_limit
        };
        if exceeded {
            self.freeze_active()?;
        }
        Ok(())
    }

    pub fn put_batch(&self, kvs: &[(Vec<u8>, Vec<u8>)], tid: u64) -> Result<()> {
        let exceeded = {
            let mut active = self.active.write()?;
            for (key, value) in kvs {
                active.put(key, value, tid);
            }
            active.size_bytes() > self.per_table_limit
        };
        if exceeded {
            self.freeze_active()?;
        }
        Ok(())
    }

    /// Engine-level deletion: a put with the empty-value tombstone.
    pub fn remove(&self, key: &[u8], tid: u64) -> Result<()> {
        self.put(key, b"", tid)
    }

    pub fn remove_batch(&self, keys: &[Vec<u8>], tid: u64) -> Result<()> {
        let kvs: Vec<(Vec<u8>, Vec<u8>)> =
            keys.iter().map(|k| (k.clone(), Vec::new())).collect();
        self.put_batch(&kvs, tid)
    }

    /// Newest entry visible at `view_tid`, active first, then frozen lists
    /// newest-first. An empty value means the key is deleted; the caller
    /// stops searching older tiers on any hit.
    pub fn get(&self, key: &[u8], view_tid: u64) -> Result<Option<(Vec<u8>, u64)>> {
        let frozen = self.frozen.read()?;
        let active = self.active.read()?;
        if let Some((value, tid)) = active.get(key, view_tid) {
            return Ok(Some((value.to_vec(), tid)));
        }
        for table in frozen.iter() {
            if let Some((value, tid)) = table.get(key, view_tid) {
                return Ok(Some((value.to_vec(), tid)));
            }
        }
        Ok(None)
    }

    /// Batched lookup over a single pass of the tier.
    pub fn get_batch(
        &self,
        keys: &[Vec<u8>],
        view_tid: u64,
    ) -> Result<Vec<Option<(Vec<u8>, u64)>>> {
        let frozen = self.frozen.read()?;
        let active = self.active.read()?;
        let mut results = Vec::with_capacity(keys.len());
        for key in keys {
            let mut hit = active.get(key, view_tid).map(|(v, t)| (v.to_vec(), t));
            if hit.is_none() {
                for table in frozen.iter() {
                    if let Some((value, tid)) = table.get(key, view_tid) {
                        hit = Some((value.to_vec(), tid));
                        break;
                    }
                }
            }
            results.push(hit);
        }
        Ok(results)
    }

    fn freeze_active(&self) -> Result<()> {
        let mut frozen = self.frozen.write()?;
        let mut active = self.active.write()?;
        // Another writer may have frozen the list while we waited.
        if active.size_bytes() <= self.per_table_limit {
            return Ok(());
        }
        let old = std::mem::replace(&mut *active, SkipList::new());
        debug!(
            size = old.size_bytes(),
            entries = old.len(),
            "freezing active memtable"
        );
        self.frozen_bytes.fetch_add(old.size_bytes(), Ordering::SeqCst);
        frozen.push_front(Arc::new(old));
        Ok(())
    }

    /// Drains the oldest frozen list into an SST. If nothing is frozen yet
    /// the active list is frozen first; an empty tier yields `None`.
    /// Commit-boundary markers never reach the file.
    pub fn flush_last(
        &self,
        mut builder: SstBuilder,
        path: &Path,
        id: u64,
        cache: Arc<BlockCache>,
    ) -> Result<Option<Arc<Sst>>> {
        let table = {
            let mut frozen = self.frozen.write()?;
            if frozen.is_empty() {
                let mut active = self.active.write()?;
                if active.is_empty() {
                    return Ok(None);
                }
                let old = std::mem::replace(&mut *active, SkipList::new());
                self.frozen_bytes.fetch_add(old.size_bytes(), Ordering::SeqCst);
                frozen.push_front(Arc::new(old));
            }
            let table = frozen.pop_back().expect("frozen deque cannot be empty here");
            self.frozen_bytes.fetch_sub(table.size_bytes(), Ordering::SeqCst);
            table
        };

        for (key, value, tid) in table.entries() {
            if key.is_empty() {
                continue;
            }
            builder.add(&key, &value, tid)?;
        }
        if builder.is_empty() {
            debug!(id, "memtable held only boundary markers, no sst written");
            return Ok(None);
        }
        let sst = builder.build(id, path, cache)?;
        debug!(id, entries = table.len(), "flushed memtable to level-0 sst");
        Ok(Some(sst))
    }

    /// Materializes heap-merge items for a full scan. The active list is
    /// source 0, frozen lists 1, 2, ... so newer sources win ties.
    pub fn search_items(&self, view_tid: u64) -> Result<Vec<SearchItem>> {
        self.collect_items(|table, items, source| {
            for (key, value, tid) in table.iter() {
                push_item(items, key, value, tid, source, view_tid);
            }
        })
    }

    /// Heap items for keys starting with `prefix`.
    pub fn prefix_search_items(&self, prefix: &[u8], view_tid: u64) -> Result<Vec<SearchItem>> {
        self.collect_items(|table, items, source| {
            for (key, value, tid) in table.iter_prefix(prefix) {
                push_item(items, key, value, tid, source, view_tid);
            }
        })
    }

    /// Heap items for the contiguous window where `predicate` returns 0.
    pub fn predicate_search_items<F>(&self, predicate: F, view_tid: u64) -> Result<Vec<SearchItem>>
    where
        F: Fn(&[u8]) -> i32,
    {
        self.collect_items(|table, items, source| {
            if let Some(range) = table.iter_predicate(&predicate) {
                for (key, value, tid) in range {
                    push_item(items, key, value, tid, source, view_tid);
                }
            }
        })
    }

    fn collect_items<F>(&self, collect: F) -> Result<Vec<SearchItem>>
    where
        F: Fn(&SkipList, &mut Vec<SearchItem>, i64),
    {
        let frozen = self.frozen.read()?;
        let active = self.active.read()?;
        let mut items = Vec::new();
        collect(&active, &mut items, 0);
        for (i, table) in frozen.iter().enumerate() {
            collect(table, &mut items, i as i64 + 1);
        }
        Ok(items)
    }

    /// Heap merge over the whole tier, newest visible version per key,
    /// tombstoned keys suppressed.
    pub fn iter(&self, view_tid: u64) -> Result<HeapIterator> {
        Ok(HeapIterator::new(self.search_items(view_tid)?, view_tid, true))
    }

    /// Heap merge limited to keys starting with `prefix`.
    pub fn iter_prefix(&self, prefix: &[u8], view_tid: u64) -> Result<HeapIterator> {
        Ok(HeapIterator::new(
            self.prefix_search_items(prefix, view_tid)?,
            view_tid,
            true,
        ))
    }

    /// Heap merge over the monotone-predicate window.
    pub fn iter_predicate<F>(&self, predicate: F, view_tid: u64) -> Result<HeapIterator>
    where
        F: Fn(&[u8]) -> i32,
    {
        Ok(HeapIterator::new(
            self.predicate_search_items(predicate, view_tid)?,
            view_tid,
            true,
        ))
    }

    /// Exclusive access to the whole tier for transactional commit.
    pub fn exclusive(&self) -> Result<MemTableGuard<'_>> {
        let frozen = self.frozen.write()?;
        let active = self.active.write()?;
        Ok(MemTableGuard { frozen, active })
    }

    pub fn clear(&self) -> Result<()> {
        let mut frozen = self.frozen.write()?;
        let mut active = self.active.write()?;
        frozen.clear();
        active.clear();
        self.frozen_bytes.store(0, Ordering::SeqCst);
        Ok(())
    }

    pub fn cur_size(&self) -> usize {
        self.active.read().map(|a| a.size_bytes()).unwrap_or(0)
    }

    pub fn frozen_size(&self) -> usize {
        self.frozen_bytes.load(Ordering::SeqCst)
    }

    pub fn total_size(&self) -> usize {
        self.frozen_size() + self.cur_size()
    }

    pub fn frozen_count(&self) -> usize {
        self.frozen.read().map(|f| f.len()).unwrap_or(0)
    }
}

fn push_item(
    items: &mut Vec<SearchItem>,
    key: &[u8],
    value: &[u8],
    tid: u64,
    source: i64,
    view_tid: u64,
) {
    if key.is_empty() {
        return;
    }
    if view_tid != 0 && tid > view_tid {
        return;
    }
    items.push(SearchItem::new(
        key.to_vec(),
        value.to_vec(),
        tid,
        0,
        source,
    ));
}

/// Both tier locks held exclusively; used by transactional commit to
/// conflict-check and apply atomically.
pub struct MemTableGuard<'a> {
    frozen: RwLockWriteGuard<'a, VecDeque<Arc<SkipList>>>,
    active: RwLockWriteGuard<'a, SkipList>,
}

impl MemTableGuard<'_> {
    pub fn get(&self, key: &[u8], view_tid: u64) -> Option<(Vec<u8>, u64)> {
        if let Some((value, tid)) = self.active.get(key, view_tid) {
            return Some((value.to_vec(), tid));
        }
        for table in self.frozen.iter() {
            if let Some((value, tid)) = table.get(key, view_tid) {
                return Some((value.to_vec(), tid));
            }
        }
        None
    }

    /// Writes without freeze checks; the next regular put rebalances.
    pub fn put(&mut self, key: &[u8], value: &[u8], tid: u64) {
        self.active.put(key, value, tid);
    }
}
