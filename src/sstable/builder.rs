//! Streaming SST construction.

use std::fs::{rename, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use byteorder::{LittleEndian, WriteBytesExt};

use super::Sst;
use crate::block::meta::BlockMeta;
use crate::block::BlockBuilder;
use crate::bloom::BloomFilter;
use crate::cache::BlockCache;
use crate::error::{Error, Result};

/// Accepts entries in (key asc, tid desc) order and writes the finished
/// table atomically: temp file, sync, rename.
pub struct SstBuilder {
    block_size: usize,
    block: BlockBuilder,
    data: Vec<u8>,
    metas: Vec<BlockMeta>,
    bloom: Option<BloomFilter>,
    prev_key: Vec<u8>,
    prev_tid: u64,
    entry_count: usize,
    min_tid: u64,
    max_tid: u64,
}

impl SstBuilder {
    /// `bloom_expected_entries == 0` builds the table without a bloom
    /// filter; the footer then points the bloom offset at the meta end.
    pub fn new(block_size: usize, bloom_expected_entries: usize, bloom_fp_rate: f64) -> Self {
        let bloom = if bloom_expected_entries > 0 {
            Some(BloomFilter::new(bloom_expected_entries, bloom_fp_rate))
        } else {
            None
        };
        Self {
            block_size,
            block: BlockBuilder::new(block_size),
            data: Vec::new(),
            metas: Vec::new(),
            bloom,
            prev_key: Vec::new(),
            prev_tid: 0,
            entry_count: 0,
            min_tid: u64::MAX,
            max_tid: 0,
        }
    }

    /// Appends one entry. Out-of-order input is a programming error and is
    /// rejected. Consecutive entries sharing a key are forced into the same
    /// block so an MVCC lookup sees every version of the key contiguously.
    pub fn add(&mut self, key: &[u8], value: &[u8], tid: u64) -> Result<()> {
        let same_key = self.entry_count > 0 && key == self.prev_key.as_slice();
        if self.entry_count > 0
            && (key < self.prev_key.as_slice() || (same_key && tid >= self.prev_tid))
        {
            return Err(Error::InvalidOperation(format!(
                "sst entries out of order: ({:?}, {}) after ({:?}, {})",
                String::from_utf8_lossy(key),
                tid,
                String::from_utf8_lossy(&self.prev_key),
                self.prev_tid,
            )));
        }

        if !self.block.add(key, value, tid, same_key) {
            self.finish_block();
            // A fresh block accepts any single entry regardless of size.
            self.block.add(key, value, tid, true);
        }

        if let Some(bloom) = &mut self.bloom {
            bloom.add(key);
        }
        self.min_tid = self.min_tid.min(tid);
        self.max_tid = self.max_tid.max(tid);
        self.prev_key = key.to_vec();
        self.prev_tid = tid;
        self.entry_count += 1;
        Ok(())
    }

    fn finish_block(&mut self) {
        if self.block.is_empty() {
            return;
        }
        let block = std::mem::replace(&mut self.block, BlockBuilder::new(self.block_size)).build();
        self.metas.push(BlockMeta {
            offset: self.data.len() as u32,
            first_key: block.first_key().to_vec(),
            last_key: block.last_key().to_vec(),
        });
        self.data.extend_from_slice(&block.encode());
    }

    /// Bytes of finished blocks plus the one in progress. Compaction uses
    /// this to decide when to cut over to a new output table.
    pub fn estimated_size(&self) -> usize {
        self.data.len()
            + if self.block.is_empty() {
                0
            } else {
                self.block.encoded_size()
            }
    }

    pub fn is_empty(&self) -> bool {
        self.entry_count == 0
    }

    pub fn entry_count(&self) -> usize {
        self.entry_count
    }

    /// Key of the most recently added entry.
    pub fn last_added_key(&self) -> &[u8] {
        &self.prev_key
    }

    /// Finalizes the table at `path` and returns its in-memory descriptor.
    pub fn build(mut self, id: u64, path: &Path, cache: Arc<BlockCache>) -> Result<Arc<Sst>> {
        self.finish_block();
        if self.metas.is_empty() {
            return Err(Error::InvalidOperation(
                "cannot build an sst with no entries".to_string(),
            ));
        }

        let mut content = self.data;
        let meta_offset = content.len() as u32;
        content.extend_from_slice(&BlockMeta::encode_region(&self.metas));
        let bloom_offset = content.len() as u32;
        if let Some(bloom) = &self.bloom {
            content.extend_from_slice(&bloom.encode());
        }
        content.write_u32::<LittleEndian>(meta_offset).unwrap();
        content.write_u32::<LittleEndian>(bloom_offset).unwrap();
        content.write_u64::<LittleEndian>(self.min_tid).unwrap();
        content.write_u64::<LittleEndian>(self.max_tid).unwrap();

        let tmp_path = PathBuf::from(format!("{}.tmp", path.display()));
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        file.write_all(&content)?;
        file.sync_all()?;
        drop(file);
        rename(&tmp_path, path)?;

        let file = File::open(path)?;
        let first_key = self.metas.first().unwrap().first_key.clone();
        let last_key = self.metas.last().unwrap().last_key.clone();
        Ok(Arc::new(Sst {
            id,
            path: path.to_path_buf(),
            file,
            meta: self.metas,
            meta_offset,
            bloom: self.bloom,
            first_key,
            last_key,
            min_tid: self.min_tid,
            max_tid: self.max_tid,
            cache,
        }))
    }
}
