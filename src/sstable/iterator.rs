//! Forward cursor across the blocks of one SST.

use std::sync::Arc;

use super::Sst;
use crate::block::iterator::{BlockIterator, View};
use crate::block::Block;
use crate::error::Result;
use crate::iterator::LsmIterator;

pub struct SstIterator {
    sst: Arc<Sst>,
    blk_idx: usize,
    blk_iter: Option<BlockIterator>,
    view: View,
}

impl SstIterator {
    /// Cursor at the first visible entry of the table.
    pub fn begin(sst: Arc<Sst>, view: View) -> Result<Self> {
        let mut iter = Self {
            sst,
            blk_idx: 0,
            blk_iter: None,
            view,
        };
        iter.load_block(0)?;
        iter.roll_forward()?;
        Ok(iter)
    }

    /// Cursor at the first visible entry with key >= `key`.
    pub fn seek(sst: Arc<Sst>, key: &[u8], view: View) -> Result<Self> {
        // First block whose last_key reaches the target.
        let blk_idx = sst.meta_partition_point(key);
        let mut iter = Self {
            sst,
            blk_idx,
            blk_iter: None,
            view,
        };
        if blk_idx < iter.sst.num_blocks() {
            let block = iter.sst.read_block(blk_idx)?;
            iter.blk_iter = Some(BlockIterator::new_at_key(block, key, iter.view));
            iter.roll_forward()?;
        }
        Ok(iter)
    }

    /// Cursor pinned at a known (block, entry) position, used by point
    /// lookups that already located the entry.
    pub(super) fn at(
        sst: Arc<Sst>,
        blk_idx: usize,
        block: Arc<Block>,
        entry_idx: usize,
        view: View,
    ) -> Self {
        Self {
            sst,
            blk_idx,
            blk_iter: Some(BlockIterator::new_at_index(block, entry_idx, view)),
            view,
        }
    }

    pub fn end(sst: Arc<Sst>) -> Self {
        Self {
            blk_idx: sst.num_blocks(),
            sst,
            blk_iter: None,
            view: View::Raw,
        }
    }

    pub fn sst(&self) -> &Arc<Sst> {
        &self.sst
    }

    fn load_block(&mut self, idx: usize) -> Result<()> {
        self.blk_idx = idx;
        if idx >= self.sst.num_blocks() {
            self.blk_iter = None;
            return Ok(());
        }
        let block = self.sst.read_block(idx)?;
        self.blk_iter = Some(BlockIterator::new_at_index(block, 0, self.view));
        Ok(())
    }

    /// Moves to the next block for as long as the current position is
    /// exhausted (a block can come up empty under an MVCC view).
    fn roll_forward(&mut self) -> Result<()> {
        while self.blk_idx < self.sst.num_blocks()
            && !self.blk_iter.as_ref().is_some_and(|b| b.is_valid())
        {
            self.load_block(self.blk_idx + 1)?;
        }
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.blk_iter.as_ref().is_some_and(|b| b.is_valid())
    }

    pub fn next_entry(&mut self) -> Result<()> {
        if let Some(blk_iter) = &mut self.blk_iter {
            blk_iter.advance();
        }
        self.roll_forward()
    }

    pub fn key(&self) -> &[u8] {
        self.blk_iter.as_ref().unwrap().key()
    }

    pub fn value(&self) -> &[u8] {
        self.blk_iter.as_ref().unwrap().value()
    }

    pub fn tid(&self) -> u64 {
        self.blk_iter.as_ref().unwrap().tid()
    }

    /// Current entry as owned data, None at end.
    pub fn peek(&self) -> Option<(Vec<u8>, Vec<u8>, u64)> {
        if self.is_valid() {
            Some((self.key().to_vec(), self.value().to_vec(), self.tid()))
        } else {
            None
        }
    }
}

impl LsmIterator for SstIterator {
    fn is_valid(&self) -> bool {
        SstIterator::is_valid(self)
    }

    fn next_entry(&mut self) -> Result<()> {
        SstIterator::next_entry(self)
    }

    fn key(&self) -> &[u8] {
        SstIterator::key(self)
    }

    fn value(&self) -> &[u8] {
        SstIterator::value(self)
    }

    fn tid(&self) -> u64 {
        SstIterator::tid(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::BlockCache;
    use crate::sstable::builder::SstBuilder;
    use crate::sstable::sst_path;
    use crate::tmpfs::TempDir;

    fn sample_sst(dir: &TempDir) -> Arc<Sst> {
        let cache = Arc::new(BlockCache::new(64, 2));
        let mut builder = SstBuilder::new(64, 256, 0.01);
        for i in 0..50u32 {
            builder
                .add(
                    format!("key_{i:02}").as_bytes(),
                    format!("val_{i:02}").as_bytes(),
                    u64::from(i) + 1,
                )
                .expect("add");
        }
        builder
            .build(1, &sst_path(dir.path(), 1, 0), cache)
            .expect("build")
    }

    #[test]
    fn test_full_scan_crosses_blocks() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let sst = sample_sst(&dir);
        assert!(sst.num_blocks() > 1);

        let mut iter = SstIterator::begin(sst, View::Raw).expect("begin");
        let mut keys = Vec::new();
        while iter.is_valid() {
            keys.push(String::from_utf8(iter.key().to_vec()).unwrap());
            iter.next_entry().expect("advance");
        }
        assert_eq!(keys.len(), 50);
        assert_eq!(keys[0], "key_00");
        assert_eq!(keys[49], "key_49");
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_seek_lands_mid_table() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let sst = sample_sst(&dir);

        let iter = SstIterator::seek(sst.clone(), b"key_30", View::Raw).expect("seek");
        assert!(iter.is_valid());
        assert_eq!(iter.key(), b"key_30");

        // Seeking between keys lands on the next one.
        let iter = SstIterator::seek(sst.clone(), b"key_30a", View::Raw).expect("seek");
        assert_eq!(iter.key(), b"key_31");

        let iter = SstIterator::seek(sst, b"zzz", View::Raw).expect("seek");
        assert!(!iter.is_valid());
    }
}
