//! Shared LRU-K block cache.
//!
//! Maps (sst_id, block_idx) to decoded blocks, bounded by a block count.
//! Entries with fewer than k recorded accesses live in a "junior" recency
//! list; once an entry reaches k accesses it is promoted to the "senior"
//! list. Eviction takes the least-recently-used junior entry first, so
//! blocks touched once by a scan cannot push out the hot set.
//!
//! A single mutex guards both lists and the map; block reads dominate the
//! surrounding work, so contention here is acceptable.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use crate::block::Block;

type BlockKey = (u64, usize);

struct CacheEntry {
    block: Arc<Block>,
    access_count: usize,
}

struct CacheInner {
    map: HashMap<BlockKey, CacheEntry>,
    /// Most-recent-first recency list of entries with access_count < k.
    junior: VecDeque<BlockKey>,
    /// Most-recent-first recency list of entries with access_count >= k.
    senior: VecDeque<BlockKey>,
    hits: u64,
    total: u64,
}

pub struct BlockCache {
    capacity: usize,
    k: usize,
    inner: Mutex<CacheInner>,
}

impl BlockCache {
    pub fn new(capacity: usize, k: usize) -> Self {
        Self {
            capacity,
            k: k.max(1),
            inner: Mutex::new(CacheInner {
                map: HashMap::new(),
                junior: VecDeque::new(),
                senior: VecDeque::new(),
                hits: 0,
                total: 0,
            }),
        }
    }

    pub fn get(&self, sst_id: u64, block_idx: usize) -> Option<Arc<Block>> {
        let key = (sst_id, block_idx);
        let mut inner = self.inner.lock().unwrap();
        inner.total += 1;
        if !inner.map.contains_key(&key) {
            return None;
        }
        inner.hits += 1;
        self.touch(&mut inner, key);
        inner.map.get(&key).map(|e| e.block.clone())
    }

    pub fn put(&self, sst_id: u64, block_idx: usize, block: Arc<Block>) {
        if self.capacity == 0 {
            return;
        }
        let key = (sst_id, block_idx);
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.map.get_mut(&key) {
            entry.block = block;
            self.touch(&mut inner, key);
            return;
        }

        if inner.map.len() >= self.capacity {
            let victim = inner.junior.pop_back().or_else(|| inner.senior.pop_back());
            if let Some(victim) = victim {
                inner.map.remove(&victim);
            }
        }

        // With k = 1 the insert itself is already the k-th access.
        if self.k > 1 {
            inner.junior.push_front(key);
        } else {
            inner.senior.push_front(key);
        }
        inner.map.insert(
            key,
            CacheEntry {
                block,
                access_count: 1,
            },
        );
    }

    /// Records an access: bump the count, promote at k, and move the entry
    /// to the front of its list.
    fn touch(&self, inner: &mut CacheInner, key: BlockKey) {
        let count = {
            let entry = inner.map.get_mut(&key).unwrap();
            entry.access_count += 1;
            entry.access_count
        };
        if count < self.k {
            move_to_front(&mut inner.junior, key);
        } else if count == self.k {
            remove_key(&mut inner.junior, key);
            inner.senior.push_front(key);
        } else {
            move_to_front(&mut inner.senior, key);
        }
    }

    pub fn hit_rate(&self) -> f64 {
        let inner = self.inner.lock().unwrap();
        if inner.total == 0 {
            0.0
        } else {
            inner.hits as f64 / inner.total as f64
        }
    }

    /// (hits, total) request counters.
    pub fn counters(&self) -> (u64, u64) {
        let inner = self.inner.lock().unwrap();
        (inner.hits, inner.total)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn remove_key(list: &mut VecDeque<BlockKey>, key: BlockKey) {
    if let Some(pos) = list.iter().position(|k| *k == key) {
        list.remove(pos);
    }
}

fn move_to_front(list: &mut VecDeque<BlockKey>, key: BlockKey) {
    remove_key(list, key);
    list.push_front(key);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockBuilder;

    fn block(tag: u8) -> Arc<Block> {
        let mut builder = BlockBuilder::new(4096);
        builder.add(&[tag], b"v", 1, false);
        Arc::new(builder.build())
    }

    #[test]
    fn test_miss_then_hit() {
        let cache = BlockCache::new(4, 2);
        assert!(cache.get(1, 0).is_none());
        cache.put(1, 0, block(1));
        assert!(cache.get(1, 0).is_some());

        let (hits, total) = cache.counters();
        assert_eq!((hits, total), (1, 2));
        assert!((cache.hit_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_junior_evicted_before_senior() {
        let cache = BlockCache::new(2, 2);
        cache.put(1, 0, block(1));
        cache.put(1, 1, block(2));

        // Two more accesses push (1, 0) to the senior list.
        cache.get(1, 0);
        cache.get(1, 0);

        // Inserting a third block evicts the junior (1, 1), not the hot (1, 0).
        cache.put(1, 2, block(3));
        assert!(cache.get(1, 0).is_some());
        assert!(cache.get(1, 1).is_none());
        assert!(cache.get(1, 2).is_some());
    }

    #[test]
    fn test_senior_evicted_when_no_junior_left() {
        let cache = BlockCache::new(2, 1);
        // With k = 1 the initial insert already counts as the k-th access,
        // so everything promotes straight to senior.
        cache.put(1, 0, block(1));
        cache.put(1, 1, block(2));
        cache.get(1, 0);
        cache.put(1, 2, block(3));

        // (1, 1) was the least recently used senior entry.
        assert!(cache.get(1, 1).is_none());
        assert!(cache.get(1, 0).is_some());
    }

    #[test]
    fn test_reinsert_replaces_block() {
        let cache = BlockCache::new(2, 2);
        cache.put(1, 0, block(1));
        cache.put(1, 0, block(9));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(1, 0).unwrap().key_at(0), &[9u8]);
    }

    #[test]
    fn test_zero_capacity_caches_nothing() {
        let cache = BlockCache::new(0, 2);
        cache.put(1, 0, block(1));
        assert!(cache.get(1, 0).is_none());
        assert!(cache.is_empty());
    }
}
