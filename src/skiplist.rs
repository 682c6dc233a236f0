//! Ordered in-memory store backing the memtable tier.
//!
//! Entries are (key, value, tid) triples ordered by key ascending and, for
//! equal keys, by tid descending, so the newest version of a key is always
//! the first one reached in scan order. Every iterator and search routine
//! in the crate relies on that secondary order.
//!
//! The list is built on an arena: nodes live in a `Vec` and links are plain
//! indices with a `NIL` sentinel, which gives us back-links (needed by the
//! monotone-predicate window search) without reference cycles. The list is
//! not internally synchronized; the memtable serializes access.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Maximum tower height. With p = 1/2 this comfortably covers memtables of
/// tens of millions of entries.
pub const MAX_LEVEL: usize = 16;

const NIL: usize = usize::MAX;
const HEAD: usize = 0;

struct Node {
    key: Vec<u8>,
    value: Vec<u8>,
    tid: u64,
    forward: Vec<usize>,
    backward: Vec<usize>,
}

impl Node {
    fn height(&self) -> usize {
        self.forward.len()
    }
}

pub struct SkipList {
    nodes: Vec<Node>,
    level: usize,
    len: usize,
    size_bytes: usize,
    rng: StdRng,
}

impl SkipList {
    pub fn new() -> Self {
        let head = Node {
            key: Vec::new(),
            value: Vec::new(),
            tid: 0,
            forward: vec![NIL; MAX_LEVEL],
            backward: vec![NIL; MAX_LEVEL],
        };
        Self {
            nodes: vec![head],
            level: 1,
            len: 0,
            size_bytes: 0,
            rng: StdRng::from_entropy(),
        }
    }

    /// Coin-flip tower height: each additional level with probability 1/2.
    fn random_level(&mut self) -> usize {
        let mut level = 1;
        while level < MAX_LEVEL && self.rng.gen_bool(0.5) {
            level += 1;
        }
        level
    }

    /// True if `(key, tid)` sorts strictly before the node.
    fn node_after(&self, idx: usize, key: &[u8], tid: u64) -> bool {
        let n = &self.nodes[idx];
        match n.key.as_slice().cmp(key) {
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Equal => n.tid < tid,
        }
    }

    /// Inserts or, if an identical (key, tid) node exists, updates the value
    /// in place. Callers guarantee tid monotonicity across transactions; the
    /// list itself only maintains the (key asc, tid desc) order.
    pub fn put(&mut self, key: &[u8], value: &[u8], tid: u64) {
        let mut update = [HEAD; MAX_LEVEL];
        let mut x = HEAD;
        for i in (0..self.level).rev() {
            loop {
                let f = self.nodes[x].forward[i];
                if f == NIL || self.node_after(f, key, tid) {
                    break;
                }
                // Equal (key, tid) stops the walk so the in-place update below
                // sees it as the next node.
                if self.nodes[f].key == key && self.nodes[f].tid == tid {
                    break;
                }
                x = f;
            }
            update[i] = x;
        }

        let next = self.nodes[update[0]].forward[0];
        if next != NIL && self.nodes[next].key == key && self.nodes[next].tid == tid {
            let old_len = self.nodes[next].value.len();
            self.size_bytes = self.size_bytes - old_len + value.len();
            self.nodes[next].value = value.to_vec();
            return;
        }

        let height = self.random_level();
        if height > self.level {
            for slot in update.iter_mut().take(height).skip(self.level) {
                *slot = HEAD;
            }
            self.level = height;
        }

        let idx = self.nodes.len();
        let mut forward = vec![NIL; height];
        let mut backward = vec![NIL; height];
        for i in 0..height {
            forward[i] = self.nodes[update[i]].forward[i];
            backward[i] = update[i];
        }
        self.nodes.push(Node {
            key: key.to_vec(),
            value: value.to_vec(),
            tid,
            forward,
            backward,
        });
        for i in 0..height {
            let next = self.nodes[idx].forward[i];
            if next != NIL {
                self.nodes[next].backward[i] = idx;
            }
            self.nodes[update[i]].forward[i] = idx;
        }

        self.size_bytes += key.len() + value.len() + 8;
        self.len += 1;
    }

    /// Returns the newest version of `key` visible at `view_tid`
    /// (`view_tid == 0` ignores MVCC and takes the newest outright).
    pub fn get(&self, key: &[u8], view_tid: u64) -> Option<(&[u8], u64)> {
        let mut x = HEAD;
        for i in (0..self.level).rev() {
            loop {
                let f = self.nodes[x].forward[i];
                if f == NIL || self.nodes[f].key.as_slice() >= key {
                    break;
                }
                x = f;
            }
        }
        let mut cur = self.nodes[x].forward[0];
        while cur != NIL && self.nodes[cur].key == key {
            let n = &self.nodes[cur];
            if view_tid == 0 || n.tid <= view_tid {
                return Some((n.value.as_slice(), n.tid));
            }
            cur = n.forward[0];
        }
        None
    }

    /// Physically unlinks a node. With `tid == 0` the newest version of the
    /// key is removed, otherwise exactly the (key, tid) version. Engine-level
    /// deletion never uses this; it writes an empty-value tombstone instead.
    pub fn remove(&mut self, key: &[u8], tid: u64) {
        let mut update = [HEAD; MAX_LEVEL];
        let mut x = HEAD;
        for i in (0..self.level).rev() {
            loop {
                let f = self.nodes[x].forward[i];
                if f == NIL {
                    break;
                }
                let n = &self.nodes[f];
                let before_target = match n.key.as_slice().cmp(key) {
                    std::cmp::Ordering::Less => true,
                    std::cmp::Ordering::Equal => tid != 0 && n.tid > tid,
                    std::cmp::Ordering::Greater => false,
                };
                if !before_target {
                    break;
                }
                x = f;
            }
            update[i] = x;
        }

        let target = self.nodes[update[0]].forward[0];
        if target == NIL || self.nodes[target].key != key {
            return;
        }
        if tid != 0 && self.nodes[target].tid != tid {
            // The requested version does not exist; versions are ordered by
            // tid descending, so the walk would have landed on it.
            return;
        }

        for i in 0..self.nodes[target].height() {
            if self.nodes[update[i]].forward[i] != target {
                break;
            }
            let next = self.nodes[target].forward[i];
            self.nodes[update[i]].forward[i] = next;
            if next != NIL {
                self.nodes[next].backward[i] = update[i];
            }
        }

        self.size_bytes -= self.nodes[target].key.len() + self.nodes[target].value.len() + 8;
        self.len -= 1;
        // The arena slot is left behind; removal only serves tests and
        // internals, so slot reuse is not worth the bookkeeping.

        while self.level > 1 && self.nodes[HEAD].forward[self.level - 1] == NIL {
            self.level -= 1;
        }
    }

    /// Drops every entry and releases the arena.
    pub fn clear(&mut self) {
        let head = Node {
            key: Vec::new(),
            value: Vec::new(),
            tid: 0,
            forward: vec![NIL; MAX_LEVEL],
            backward: vec![NIL; MAX_LEVEL],
        };
        self.nodes = vec![head];
        self.level = 1;
        self.len = 0;
        self.size_bytes = 0;
    }

    /// Byte footprint: sum of key + value + 8 bytes per entry.
    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bottom-chain snapshot in scan order, the flush source.
    pub fn entries(&self) -> Vec<(Vec<u8>, Vec<u8>, u64)> {
        let mut out = Vec::with_capacity(self.len);
        let mut cur = self.nodes[HEAD].forward[0];
        while cur != NIL {
            let n = &self.nodes[cur];
            out.push((n.key.clone(), n.value.clone(), n.tid));
            cur = n.forward[0];
        }
        out
    }

    pub fn iter(&self) -> SkipListIter<'_> {
        SkipListIter {
            list: self,
            cur: self.nodes[HEAD].forward[0],
            stop: Stop::None,
        }
    }

    /// Iterator over all entries whose key starts with `prefix`.
    pub fn iter_prefix(&self, prefix: &[u8]) -> SkipListIter<'_> {
        let start = self.seek(prefix);
        SkipListIter {
            list: self,
            cur: start,
            stop: Stop::Prefix(prefix.to_vec()),
        }
    }

    /// Index of the first node with key >= `key` (NIL if none).
    fn seek(&self, key: &[u8]) -> usize {
        let mut x = HEAD;
        for i in (0..self.level).rev() {
            loop {
                let f = self.nodes[x].forward[i];
                if f == NIL || self.nodes[f].key.as_slice() >= key {
                    break;
                }
                x = f;
            }
        }
        self.nodes[x].forward[0]
    }

    /// Bounds the contiguous window where `predicate(key) == 0`.
    ///
    /// The predicate must be monotone: negative right of the window (move
    /// left), positive left of it (move right). The search walks forward at
    /// decreasing levels until it lands inside the window, then follows
    /// back-links to the window start and forward links past its end. If the
    /// contract is violated the first maximal region found is returned.
    pub fn iter_predicate<F>(&self, predicate: F) -> Option<SkipListIter<'_>>
    where
        F: Fn(&[u8]) -> i32,
    {
        let (start, end) = self.predicate_window(&predicate)?;
        Some(SkipListIter {
            list: self,
            cur: start,
            stop: Stop::At(end),
        })
    }

    fn predicate_window<F>(&self, predicate: &F) -> Option<(usize, usize)>
    where
        F: Fn(&[u8]) -> i32,
    {
        let mut x = HEAD;
        let mut found = false;
        for i in (0..self.level).rev() {
            loop {
                let f = self.nodes[x].forward[i];
                if f == NIL {
                    break;
                }
                match predicate(&self.nodes[f].key) {
                    0 => {
                        found = true;
                        x = f;
                        break;
                    }
                    d if d < 0 => break, // right of the window, shorten the step
                    _ => x = f,          // still left of the window
                }
            }
            if found {
                break;
            }
        }
        if !found {
            return None;
        }

        // Back-links may let us jump left across several satisfying nodes at
        // once; descend level by level until no satisfying predecessor is left.
        let mut start = x;
        for i in (0..MAX_LEVEL).rev() {
            loop {
                if i >= self.nodes[start].backward.len() {
                    break;
                }
                let b = self.nodes[start].backward[i];
                if b == NIL || b == HEAD {
                    break;
                }
                match predicate(&self.nodes[b].key) {
                    0 => start = b,
                    _ => break,
                }
            }
        }

        // Symmetric forward extension to the last satisfying node.
        let mut last = x;
        for i in (0..MAX_LEVEL).rev() {
            loop {
                if i >= self.nodes[last].forward.len() {
                    break;
                }
                let f = self.nodes[last].forward[i];
                if f == NIL {
                    break;
                }
                match predicate(&self.nodes[f].key) {
                    0 => last = f,
                    _ => break,
                }
            }
        }

        Some((start, self.nodes[last].forward[0]))
    }
}

impl Default for SkipList {
    fn default() -> Self {
        Self::new()
    }
}

enum Stop {
    None,
    Prefix(Vec<u8>),
    At(usize),
}

pub struct SkipListIter<'a> {
    list: &'a SkipList,
    cur: usize,
    stop: Stop,
}

impl<'a> Iterator for SkipListIter<'a> {
    type Item = (&'a [u8], &'a [u8], u64);

    fn next(&mut self) -> Option<Self::Item> {
        if self.cur == NIL {
            return None;
        }
        match &self.stop {
            Stop::None => {}
            Stop::Prefix(p) => {
                if !self.list.nodes[self.cur].key.starts_with(p) {
                    return None;
                }
            }
            Stop::At(end) => {
                if self.cur == *end {
                    return None;
                }
            }
        }
        let n = &self.list.nodes[self.cur];
        self.cur = n.forward[0];
        Some((n.key.as_slice(), n.value.as_slice(), n.tid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect_keys(list: &SkipList) -> Vec<(Vec<u8>, u64)> {
        list.iter().map(|(k, _, t)| (k.to_vec(), t)).collect()
    }

    #[test]
    fn test_put_and_get() {
        let mut list = SkipList::new();
        list.put(b"beta", b"2", 2);
        list.put(b"alpha", b"1", 1);
        list.put(b"gamma", b"3", 3);

        assert_eq!(list.get(b"alpha", 0), Some((&b"1"[..], 1)));
        assert_eq!(list.get(b"beta", 0), Some((&b"2"[..], 2)));
        assert_eq!(list.get(b"delta", 0), None);
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn test_scan_order_is_key_asc_tid_desc() {
        let mut list = SkipList::new();
        list.put(b"k", b"v1", 1);
        list.put(b"k", b"v3", 3);
        list.put(b"k", b"v2", 2);
        list.put(b"a", b"x", 5);

        assert_eq!(
            collect_keys(&list),
            vec![
                (b"a".to_vec(), 5),
                (b"k".to_vec(), 3),
                (b"k".to_vec(), 2),
                (b"k".to_vec(), 1),
            ]
        );
    }

    #[test]
    fn test_mvcc_visibility() {
        let mut list = SkipList::new();
        list.put(b"k", b"v1", 10);
        list.put(b"k", b"v2", 20);

        assert_eq!(list.get(b"k", 15), Some((&b"v1"[..], 10)));
        assert_eq!(list.get(b"k", 25), Some((&b"v2"[..], 20)));
        assert_eq!(list.get(b"k", 5), None);
        // View 0 ignores MVCC and takes the newest.
        assert_eq!(list.get(b"k", 0), Some((&b"v2"[..], 20)));
    }

    #[test]
    fn test_put_same_key_tid_updates_in_place() {
        let mut list = SkipList::new();
        list.put(b"k", b"first", 7);
        let size = list.size_bytes();
        list.put(b"k", b"second!", 7);

        assert_eq!(list.len(), 1);
        assert_eq!(list.get(b"k", 0), Some((&b"second!"[..], 7)));
        assert_eq!(list.size_bytes(), size + b"second!".len() - b"first".len());
    }

    #[test]
    fn test_size_bytes_accounting() {
        let mut list = SkipList::new();
        assert_eq!(list.size_bytes(), 0);
        list.put(b"ab", b"cde", 1);
        assert_eq!(list.size_bytes(), 2 + 3 + 8);
        list.remove(b"ab", 0);
        assert_eq!(list.size_bytes(), 0);
        assert!(list.is_empty());
    }

    #[test]
    fn test_remove_exact_version() {
        let mut list = SkipList::new();
        list.put(b"k", b"v1", 1);
        list.put(b"k", b"v2", 2);
        list.put(b"k", b"v3", 3);

        list.remove(b"k", 2);
        assert_eq!(
            collect_keys(&list),
            vec![(b"k".to_vec(), 3), (b"k".to_vec(), 1)]
        );

        // Removing a version that does not exist is a no-op.
        list.remove(b"k", 9);
        assert_eq!(list.len(), 2);

        // tid 0 removes the newest.
        list.remove(b"k", 0);
        assert_eq!(collect_keys(&list), vec![(b"k".to_vec(), 1)]);
    }

    #[test]
    fn test_iter_prefix() {
        let mut list = SkipList::new();
        list.put(b"app", b"1", 1);
        list.put(b"apple", b"2", 2);
        list.put(b"apricot", b"3", 3);
        list.put(b"banana", b"4", 4);

        let keys: Vec<_> = list.iter_prefix(b"ap").map(|(k, _, _)| k.to_vec()).collect();
        assert_eq!(
            keys,
            vec![b"app".to_vec(), b"apple".to_vec(), b"apricot".to_vec()]
        );

        assert_eq!(list.iter_prefix(b"zz").count(), 0);
    }

    #[test]
    fn test_iter_predicate_window() {
        let mut list = SkipList::new();
        for i in 0..100u32 {
            let key = format!("key{i:03}");
            list.put(key.as_bytes(), b"v", u64::from(i) + 1);
        }

        // Window: key040 ..= key049.
        let predicate = |key: &[u8]| -> i32 {
            if key < b"key040".as_slice() {
                1
            } else if key > b"key049".as_slice() {
                -1
            } else {
                0
            }
        };
        let found: Vec<_> = list
            .iter_predicate(predicate)
            .expect("window should exist")
            .map(|(k, _, _)| String::from_utf8(k.to_vec()).unwrap())
            .collect();
        assert_eq!(found.len(), 10);
        assert_eq!(found.first().unwrap(), "key040");
        assert_eq!(found.last().unwrap(), "key049");

        // A window left of all keys.
        assert!(list.iter_predicate(|_| -1).is_none());
        // A window right of all keys.
        assert!(list.iter_predicate(|_| 1).is_none());
    }

    #[test]
    fn test_entries_snapshot_matches_iter() {
        let mut list = SkipList::new();
        for i in (0..50u32).rev() {
            list.put(format!("k{i:02}").as_bytes(), b"v", u64::from(i) + 1);
        }
        let entries = list.entries();
        assert_eq!(entries.len(), 50);
        assert!(entries.windows(2).all(|w| w[0].0 < w[1].0));
    }
}
