//! Per-block index entries stored in the SST meta region.
//!
//! Serialized as `count (u32)` followed by one record per block
//! (`offset (u32) | first_key_len (u16) | first_key | last_key_len (u16) |
//! last_key`) and a trailing u32 checksum over the preceding bytes.

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};

use super::CRC32;
use crate::errdata;
use crate::error::Result;

#[derive(Debug, Clone, PartialEq)]
pub struct BlockMeta {
    /// Byte offset of the block within the SST file.
    pub offset: u32,
    pub first_key: Vec<u8>,
    pub last_key: Vec<u8>,
}

impl BlockMeta {
    pub fn encode_region(metas: &[BlockMeta]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.write_u32::<LittleEndian>(metas.len() as u32).unwrap();
        for meta in metas {
            buf.write_u32::<LittleEndian>(meta.offset).unwrap();
            buf.write_u16::<LittleEndian>(meta.first_key.len() as u16).unwrap();
            buf.extend_from_slice(&meta.first_key);
            buf.write_u16::<LittleEndian>(meta.last_key.len() as u16).unwrap();
            buf.extend_from_slice(&meta.last_key);
        }
        let hash = CRC32.checksum(&buf);
        buf.write_u32::<LittleEndian>(hash).unwrap();
        buf
    }

    pub fn decode_region(bytes: &[u8]) -> Result<Vec<BlockMeta>> {
        if bytes.len() < 8 {
            return Err(errdata!("block meta region too short"));
        }
        let hash_pos = bytes.len() - 4;
        let stored = LittleEndian::read_u32(&bytes[hash_pos..]);
        let computed = CRC32.checksum(&bytes[..hash_pos]);
        if stored != computed {
            return Err(errdata!(
                "block meta checksum mismatch: stored {stored:#010x}, computed {computed:#010x}"
            ));
        }

        let count = LittleEndian::read_u32(&bytes[0..4]) as usize;
        let mut metas = Vec::with_capacity(count);
        let mut pos = 4;
        for _ in 0..count {
            let offset = read_u32(bytes, &mut pos, hash_pos)?;
            let first_key = read_key(bytes, &mut pos, hash_pos)?;
            let last_key = read_key(bytes, &mut pos, hash_pos)?;
            metas.push(BlockMeta {
                offset,
                first_key,
                last_key,
            });
        }
        if pos != hash_pos {
            return Err(errdata!("block meta region has trailing bytes"));
        }
        Ok(metas)
    }
}

fn read_u32(bytes: &[u8], pos: &mut usize, end: usize) -> Result<u32> {
    if *pos + 4 > end {
        return Err(errdata!("truncated block meta entry"));
    }
    let v = LittleEndian::read_u32(&bytes[*pos..*pos + 4]);
    *pos += 4;
    Ok(v)
}

fn read_key(bytes: &[u8], pos: &mut usize, end: usize) -> Result<Vec<u8>> {
    if *pos + 2 > end {
        return Err(errdata!("truncated block meta entry"));
    }
    let len = LittleEndian::read_u16(&bytes[*pos..*pos + 2]) as usize;
    *pos += 2;
    if *pos + len > end {
        return Err(errdata!("truncated block meta key"));
    }
    let key = bytes[*pos..*pos + len].to_vec();
    *pos += len;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_region_round_trip() {
        let metas = vec![
            BlockMeta {
                offset: 0,
                first_key: b"alpha".to_vec(),
                last_key: b"gamma".to_vec(),
            },
            BlockMeta {
                offset: 4096,
                first_key: b"hotel".to_vec(),
                last_key: b"zulu".to_vec(),
            },
        ];
        let encoded = BlockMeta::encode_region(&metas);
        let decoded = BlockMeta::decode_region(&encoded).expect("Failed to decode meta");
        assert_eq!(decoded, metas);
    }

    #[test]
    fn test_empty_region_round_trip() {
        let encoded = BlockMeta::encode_region(&[]);
        assert_eq!(BlockMeta::decode_region(&encoded).unwrap(), vec![]);
    }

    #[test]
    fn test_corrupt_region_is_rejected() {
        let metas = vec![BlockMeta {
            offset: 7,
            first_key: b"a".to_vec(),
            last_key: b"b".to_vec(),
        }];
        let mut encoded = BlockMeta::encode_region(&metas);
        encoded[5] ^= 0x01;
        assert!(matches!(
            BlockMeta::decode_region(&encoded),
            Err(Error::InvalidData(_))
        ));
    }
}
