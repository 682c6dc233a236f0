//! Immutable sorted string tables.
//!
//! ## File layout
//!
//! ```text
//! +---------+---------+-----+------------+--------------+--------+
//! | block 0 | block 1 | ... | meta region| bloom region | footer |
//! +---------+---------+-----+------------+--------------+--------+
//! ```
//!
//! The footer, read backward from the end of the file, is
//! `max_tid (u64) | min_tid (u64) | bloom_offset (u32) | meta_offset (u32)`.
//! A bloom offset equal to the meta region's end means no bloom was written.
//!
//! Filenames encode id and level: `sst_<32-zero-padded-id>.<level>`.

pub mod builder;
pub mod concat;
pub mod iterator;

use std::fs::File;
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};

use crate::block::iterator::View;
use crate::block::meta::BlockMeta;
use crate::block::Block;
use crate::bloom::BloomFilter;
use crate::cache::BlockCache;
use crate::errdata;
use crate::error::Result;
use self::iterator::SstIterator;

/// Footer byte size: two u32 offsets plus the tid range.
pub const FOOTER_SIZE: u64 = 4 + 4 + 8 + 8;

/// Shared descriptor of one on-disk SST. The file handle is owned here
/// exclusively; everything else holds `Arc<Sst>`.
pub struct Sst {
    id: u64,
    path: PathBuf,
    file: File,
    meta: Vec<BlockMeta>,
    meta_offset: u32,
    bloom: Option<BloomFilter>,
    first_key: Vec<u8>,
    last_key: Vec<u8>,
    min_tid: u64,
    max_tid: u64,
    cache: Arc<BlockCache>,
}

impl Sst {
    /// Opens and validates an existing SST file.
    pub fn open(id: u64, path: &Path, cache: Arc<BlockCache>) -> Result<Arc<Self>> {
        let file = File::open(path)?;
        let file_size = file.metadata()?.len();
        if file_size < FOOTER_SIZE {
            return Err(errdata!(
                "sst {id}: file too small for footer ({file_size} bytes)"
            ));
        }

        let mut footer = [0u8; FOOTER_SIZE as usize];
        file.read_exact_at(&mut footer, file_size - FOOTER_SIZE)?;
        let meta_offset = LittleEndian::read_u32(&footer[0..4]);
        let bloom_offset = LittleEndian::read_u32(&footer[4..8]);
        let min_tid = LittleEndian::read_u64(&footer[8..16]);
        let max_tid = LittleEndian::read_u64(&footer[16..24]);

        let regions_end = file_size - FOOTER_SIZE;
        if u64::from(meta_offset) > u64::from(bloom_offset)
            || u64::from(bloom_offset) > regions_end
            || min_tid > max_tid
        {
            return Err(errdata!(
                "sst {id}: impossible footer (meta {meta_offset}, bloom {bloom_offset}, \
                 tids {min_tid}..{max_tid}, file {file_size})"
            ));
        }

        let mut meta_bytes = vec![0u8; (bloom_offset - meta_offset) as usize];
        file.read_exact_at(&mut meta_bytes, u64::from(meta_offset))?;
        let meta = BlockMeta::decode_region(&meta_bytes)?;
        if meta.is_empty() {
            return Err(errdata!("sst {id}: empty block meta"));
        }
        for pair in meta.windows(2) {
            if pair[0].offset >= pair[1].offset {
                return Err(errdata!("sst {id}: block offsets not ascending"));
            }
        }
        if u64::from(meta.last().unwrap().offset) >= u64::from(meta_offset) {
            return Err(errdata!("sst {id}: block offset past meta region"));
        }

        // bloom_offset pointing at the footer means no bloom was written.
        let bloom = if u64::from(bloom_offset) < regions_end {
            let mut bloom_bytes = vec![0u8; (regions_end - u64::from(bloom_offset)) as usize];
            file.read_exact_at(&mut bloom_bytes, u64::from(bloom_offset))?;
            Some(BloomFilter::decode(&bloom_bytes)?)
        } else {
            None
        };

        let first_key = meta.first().unwrap().first_key.clone();
        let last_key = meta.last().unwrap().last_key.clone();

        Ok(Arc::new(Self {
            id,
            path: path.to_path_buf(),
            file,
            meta,
            meta_offset,
            bloom,
            first_key,
            last_key,
            min_tid,
            max_tid,
            cache,
        }))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn first_key(&self) -> &[u8] {
        &self.first_key
    }

    pub fn last_key(&self) -> &[u8] {
        &self.last_key
    }

    /// (min_tid, max_tid) across all entries.
    pub fn tid_range(&self) -> (u64, u64) {
        (self.min_tid, self.max_tid)
    }

    pub fn num_blocks(&self) -> usize {
        self.meta.len()
    }

    /// Reads one block through the shared cache; decoding verifies the
    /// block checksum on every miss.
    pub fn read_block(&self, idx: usize) -> Result<Arc<Block>> {
        if let Some(block) = self.cache.get(self.id, idx) {
            return Ok(block);
        }
        let start = u64::from(self.meta[idx].offset);
        let end = match self.meta.get(idx + 1) {
            Some(next) => u64::from(next.offset),
            None => u64::from(self.meta_offset),
        };
        let mut bytes = vec![0u8; (end - start) as usize];
        self.file.read_exact_at(&mut bytes, start)?;
        let block = Arc::new(Block::decode(&bytes)?);
        self.cache.put(self.id, idx, block.clone());
        Ok(block)
    }

    /// Index of the first block whose last_key reaches `key` (block count
    /// if none), the block a seek starts from.
    pub(crate) fn meta_partition_point(&self, key: &[u8]) -> usize {
        self.meta.partition_point(|m| m.last_key.as_slice() < key)
    }

    /// Index of the block whose [first_key, last_key] range spans `key`:
    /// the block with the largest first_key ≤ key, provided the key does
    /// not fall past its last_key.
    pub fn find_block_idx(&self, key: &[u8]) -> Option<usize> {
        let after = self.meta.partition_point(|m| m.first_key.as_slice() <= key);
        let idx = after.checked_sub(1)?;
        if key <= self.meta[idx].last_key.as_slice() {
            Some(idx)
        } else {
            None
        }
    }

    /// Point lookup: returns a cursor at the newest version of `key`
    /// visible at `view_tid`, or an end cursor. The bloom filter is probed
    /// before any block is read.
    pub fn get(self: &Arc<Self>, key: &[u8], view_tid: u64) -> Result<SstIterator> {
        if let Some(bloom) = &self.bloom {
            if !bloom.may_contain(key) {
                return Ok(SstIterator::end(self.clone()));
            }
        }
        let Some(blk_idx) = self.find_block_idx(key) else {
            return Ok(SstIterator::end(self.clone()));
        };
        let block = self.read_block(blk_idx)?;
        // All versions of a key share one block, so this block is the only
        // candidate.
        match block.find_entry_idx(key, view_tid) {
            Some(entry_idx) => Ok(SstIterator::at(
                self.clone(),
                blk_idx,
                block,
                entry_idx,
                View::Visible(view_tid),
            )),
            None => Ok(SstIterator::end(self.clone())),
        }
    }

    pub fn begin(self: &Arc<Self>, view: View) -> Result<SstIterator> {
        SstIterator::begin(self.clone(), view)
    }

    /// Deletes the backing file. Callers drop the descriptor afterwards.
    pub fn del(&self) -> Result<()> {
        std::fs::remove_file(&self.path)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Text dump of the whole table for offline debugging, written when the
    /// `LSM_EXPORT_SST` environment variable is set.
    pub fn export_debug(&self, exports_dir: &Path, level: usize) -> Result<()> {
        std::fs::create_dir_all(exports_dir)?;
        let name = format!("sst_{:032}.{}.txt", self.id, level);
        let mut out = File::create(exports_dir.join(name))?;
        writeln!(
            out,
            "# sst {} level {} blocks {} tids {}..{}",
            self.id,
            level,
            self.meta.len(),
            self.min_tid,
            self.max_tid
        )?;
        for idx in 0..self.meta.len() {
            let block = self.read_block(idx)?;
            for i in 0..block.len() {
                writeln!(
                    out,
                    "{}\t{}\t{}",
                    String::from_utf8_lossy(block.key_at(i)),
                    block.tid_at(i),
                    String::from_utf8_lossy(block.value_at(i)),
                )?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Sst {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sst")
            .field("id", &self.id)
            .field("blocks", &self.meta.len())
            .field("tid_range", &(self.min_tid, self.max_tid))
            .finish()
    }
}

/// `sst_<32-zero-padded-id>.<level>` under the data directory.
pub fn sst_path(dir: &Path, id: u64, level: usize) -> PathBuf {
    dir.join(format!("sst_{id:032}.{level}"))
}

/// Parses an SST filename back into (id, level).
pub fn parse_sst_name(name: &str) -> Option<(u64, usize)> {
    let rest = name.strip_prefix("sst_")?;
    let (id_str, level_str) = rest.split_once('.')?;
    if id_str.is_empty() || level_str.is_empty() {
        return None;
    }
    Some((id_str.parse().ok()?, level_str.parse().ok()?))
}
