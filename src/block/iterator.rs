//! Forward cursor over one decoded block with MVCC filtering.

use std::sync::Arc;

use super::Block;

/// MVCC view carried by a cursor. `Raw` yields every stored version and is
/// used by compaction; `Visible(0)` deduplicates each key group down to its
/// newest version; `Visible(v)` skips versions newer than `v`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum View {
    Raw,
    Visible(u64),
}

impl View {
    pub fn view_tid(self) -> u64 {
        match self {
            View::Raw => 0,
            View::Visible(v) => v,
        }
    }
}

#[derive(Debug)]
pub struct BlockIterator {
    block: Arc<Block>,
    idx: usize,
    view: View,
}

impl BlockIterator {
    /// Cursor positioned at the given index.
    pub fn new_at_index(block: Arc<Block>, idx: usize, view: View) -> Self {
        let mut iter = Self { block, idx, view };
        iter.skip_by_tid();
        iter
    }

    /// Cursor positioned at the first visible entry for `key`; ends up
    /// invalid when the block holds no such entry at or after `key`.
    pub fn new_at_key(block: Arc<Block>, key: &[u8], view: View) -> Self {
        let idx = block.partition_point(key);
        Self::new_at_index(block, idx, view)
    }

    pub fn is_valid(&self) -> bool {
        self.idx < self.block.len()
    }

    pub fn key(&self) -> &[u8] {
        self.block.key_at(self.idx)
    }

    pub fn value(&self) -> &[u8] {
        self.block.value_at(self.idx)
    }

    pub fn tid(&self) -> u64 {
        self.block.tid_at(self.idx)
    }

    pub fn index(&self) -> usize {
        self.idx
    }

    pub fn advance(&mut self) {
        if self.is_valid() {
            self.idx += 1;
            self.skip_by_tid();
        }
    }

    /// Re-establishes the view invariant after any position change.
    ///
    /// With `Visible(0)` the cursor must rest on the first occurrence of
    /// each key group (the newest version), skipping the remaining
    /// duplicates. With `Visible(v)` it rests on the first entry of the
    /// current group whose tid is ≤ v; if no version of the group qualifies
    /// the whole group is skipped and the rule re-applied.
    fn skip_by_tid(&mut self) {
        match self.view {
            View::Raw => {}
            View::Visible(0) => {
                while self.is_valid()
                    && self.idx > 0
                    && self.block.key_at(self.idx) == self.block.key_at(self.idx - 1)
                {
                    self.idx += 1;
                }
            }
            View::Visible(v) => loop {
                if !self.is_valid() {
                    break;
                }
                let group_start = self.idx;
                while self.is_valid()
                    && self.block.key_at(self.idx) == self.block.key_at(group_start)
                    && self.block.tid_at(self.idx) > v
                {
                    self.idx += 1;
                }
                if self.is_valid()
                    && self.block.key_at(self.idx) == self.block.key_at(group_start)
                {
                    break;
                }
            },
        }
    }
}

impl PartialEq for BlockIterator {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.block, &other.block) && self.idx == other.idx
    }
}
