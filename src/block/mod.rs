//! SST data blocks.
//!
//! A block is an immutable sorted run of (key, tid, value) entries followed
//! by an offset table, the entry count and a trailing checksum:
//!
//! ```text
//! +----------------------------+------------------+-----------+----------+
//! | entries                    | offsets (u16 * n)| n (u16)   | crc (u32)|
//! +----------------------------+------------------+-----------+----------+
//! ```
//!
//! Each entry is `key_len (u16) | key | tid (u64) | value_len (u16) | value`,
//! little-endian throughout. Entries follow the global order: key ascending,
//! tid descending within equal keys.

pub mod iterator;
pub mod meta;

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};

use crate::errdata;
use crate::error::Result;

pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Fixed per-entry overhead: key_len + tid + value_len.
const ENTRY_HEADER: usize = 2 + 8 + 2;

#[derive(Debug)]
pub struct Block {
    data: Vec<u8>,
    offsets: Vec<u16>,
}

impl Block {
    /// Serializes the block, checksum included.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf =
            Vec::with_capacity(self.data.len() + self.offsets.len() * 2 + 2 + 4);
        buf.extend_from_slice(&self.data);
        for offset in &self.offsets {
            buf.write_u16::<LittleEndian>(*offset).unwrap();
        }
        buf.write_u16::<LittleEndian>(self.offsets.len() as u16).unwrap();
        let hash = CRC32.checksum(&buf);
        buf.write_u32::<LittleEndian>(hash).unwrap();
        buf
    }

    /// Decodes and verifies a block; a checksum mismatch is a hard error.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 6 {
            return Err(errdata!("block too short"));
        }
        let hash_pos = bytes.len() - 4;
        let stored = LittleEndian::read_u32(&bytes[hash_pos..]);
        let computed = CRC32.checksum(&bytes[..hash_pos]);
        if stored != computed {
            return Err(errdata!(
                "block checksum mismatch: stored {stored:#010x}, computed {computed:#010x}"
            ));
        }

        let count_pos = hash_pos - 2;
        let count = LittleEndian::read_u16(&bytes[count_pos..hash_pos]) as usize;
        let offsets_pos = count_pos
            .checked_sub(count * 2)
            .ok_or_else(|| errdata!("block offset table out of bounds"))?;

        let mut offsets = Vec::with_capacity(count);
        for i in 0..count {
            let at = offsets_pos + i * 2;
            let offset = LittleEndian::read_u16(&bytes[at..at + 2]);
            if offset as usize >= offsets_pos {
                return Err(errdata!("block entry offset {offset} past entry area"));
            }
            offsets.push(offset);
        }

        Ok(Self {
            data: bytes[..offsets_pos].to_vec(),
            offsets,
        })
    }

    /// Entry count.
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Byte offset of entry `idx` within the entry area.
    pub fn offset_at(&self, idx: usize) -> u16 {
        self.offsets[idx]
    }

    fn entry_at(&self, idx: usize) -> (&[u8], u64, &[u8]) {
        let mut pos = self.offsets[idx] as usize;
        let key_len = LittleEndian::read_u16(&self.data[pos..pos + 2]) as usize;
        pos += 2;
        let key = &self.data[pos..pos + key_len];
        pos += key_len;
        let tid = LittleEndian::read_u64(&self.data[pos..pos + 8]);
        pos += 8;
        let value_len = LittleEndian::read_u16(&self.data[pos..pos + 2]) as usize;
        pos += 2;
        let value = &self.data[pos..pos + value_len];
        (key, tid, value)
    }

    pub fn key_at(&self, idx: usize) -> &[u8] {
        self.entry_at(idx).0
    }

    pub fn tid_at(&self, idx: usize) -> u64 {
        self.entry_at(idx).1
    }

    pub fn value_at(&self, idx: usize) -> &[u8] {
        self.entry_at(idx).2
    }

    pub fn first_key(&self) -> &[u8] {
        self.key_at(0)
    }

    pub fn last_key(&self) -> &[u8] {
        self.key_at(self.len() - 1)
    }

    /// Index of the first entry with `key_at == key` and `tid ≤ view_tid`
    /// (`view_tid == 0`: the newest version). Binary search lands on the
    /// first occurrence of the key, then the equal-key run is scanned
    /// linearly for the MVCC-visible version.
    pub fn find_entry_idx(&self, key: &[u8], view_tid: u64) -> Option<usize> {
        let mut idx = self.partition_point(key);
        if idx >= self.len() || self.key_at(idx) != key {
            return None;
        }
        while idx < self.len() && self.key_at(idx) == key {
            if view_tid == 0 || self.tid_at(idx) <= view_tid {
                return Some(idx);
            }
            idx += 1;
        }
        None
    }

    /// First index whose key is >= `key` (the key's first occurrence, since
    /// equal keys are contiguous).
    pub fn partition_point(&self, key: &[u8]) -> usize {
        let mut left = 0;
        let mut right = self.len();
        while left < right {
            let mid = left + (right - left) / 2;
            if self.key_at(mid) < key {
                left = mid + 1;
            } else {
                right = mid;
            }
        }
        left
    }
}

/// Accumulates entries in arrival order up to a target encoded size.
pub struct BlockBuilder {
    data: Vec<u8>,
    offsets: Vec<u16>,
    block_size: usize,
}

impl BlockBuilder {
    pub fn new(block_size: usize) -> Self {
        Self {
            data: Vec::new(),
            offsets: Vec::new(),
            block_size,
        }
    }

    /// Appends an entry unless it would push the encoded block past the
    /// target size. Returns false when the block is full. `force` appends
    /// unconditionally: the SST builder uses it to keep all versions of one
    /// key inside a single block, and the first entry always fits so a block
    /// is never empty.
    pub fn add(&mut self, key: &[u8], value: &[u8], tid: u64, force: bool) -> bool {
        let entry_size = ENTRY_HEADER + key.len() + value.len();
        if !force
            && !self.offsets.is_empty()
            && self.encoded_size() + entry_size + 2 > self.block_size
        {
            return false;
        }

        self.offsets.push(self.data.len() as u16);
        self.data.write_u16::<LittleEndian>(key.len() as u16).unwrap();
        self.data.extend_from_slice(key);
        self.data.write_u64::<LittleEndian>(tid).unwrap();
        self.data.write_u16::<LittleEndian>(value.len() as u16).unwrap();
        self.data.extend_from_slice(value);
        true
    }

    /// Size of the block as `encode` would emit it right now.
    pub fn encoded_size(&self) -> usize {
        self.data.len() + self.offsets.len() * 2 + 2 + 4
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn build(self) -> Block {
        debug_assert!(!self.offsets.is_empty(), "built block must not be empty");
        Block {
            data: self.data,
            offsets: self.offsets,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn sample_block() -> Block {
        let mut builder = BlockBuilder::new(4096);
        assert!(builder.add(b"apple", b"fruit", 3, false));
        assert!(builder.add(b"apple", b"old-fruit", 1, false));
        assert!(builder.add(b"banana", b"fruit", 2, false));
        assert!(builder.add(b"cherry", b"", 4, false));
        builder.build()
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let block = sample_block();
        let encoded = block.encode();
        let decoded = Block::decode(&encoded).expect("Failed to decode block");

        assert_eq!(decoded.len(), 4);
        assert_eq!(decoded.key_at(0), b"apple");
        assert_eq!(decoded.tid_at(0), 3);
        assert_eq!(decoded.value_at(1), b"old-fruit");
        assert_eq!(decoded.key_at(2), b"banana");
        assert_eq!(decoded.value_at(3), b"");
        assert_eq!(decoded.first_key(), b"apple");
        assert_eq!(decoded.last_key(), b"cherry");
    }

    #[test]
    fn test_decode_rejects_corruption() {
        let mut encoded = sample_block().encode();
        encoded[3] ^= 0xff;
        assert!(matches!(
            Block::decode(&encoded),
            Err(Error::InvalidData(_))
        ));
    }

    #[test]
    fn test_find_entry_idx_mvcc() {
        let block = sample_block();

        // View 0 takes the newest version.
        assert_eq!(block.find_entry_idx(b"apple", 0), Some(0));
        // An older view lands on the older version.
        assert_eq!(block.find_entry_idx(b"apple", 2), Some(1));
        assert_eq!(block.find_entry_idx(b"apple", 1), Some(1));
        // No version is visible below the oldest tid.
        assert_eq!(block.find_entry_idx(b"banana", 1), None);
        assert_eq!(block.find_entry_idx(b"durian", 0), None);
    }

    #[test]
    fn test_builder_respects_target_size() {
        let mut builder = BlockBuilder::new(64);
        assert!(builder.add(b"a", b"0123456789", 1, false));
        // The second entry would overflow the 64-byte target.
        assert!(!builder.add(b"b", b"0123456789012345678901234567890123456789", 2, false));
        // Forced appends always land.
        assert!(builder.add(b"b", b"0123456789012345678901234567890123456789", 2, true));
        assert_eq!(builder.len(), 2);
    }

    #[test]
    fn test_single_oversized_entry_is_accepted() {
        let mut builder = BlockBuilder::new(16);
        let value = vec![b'x'; 128];
        assert!(builder.add(b"big", &value, 1, false));
        let block = builder.build();
        assert_eq!(block.value_at(0).len(), 128);
    }

    #[test]
    fn test_encoded_size_matches_encode() {
        let mut builder = BlockBuilder::new(4096);
        builder.add(b"k1", b"v1", 1, false);
        builder.add(b"k2", b"v2", 2, false);
        let predicted = builder.encoded_size();
        assert_eq!(builder.build().encode().len(), predicted);
    }
}
