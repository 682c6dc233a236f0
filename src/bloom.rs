//! Per-SST probabilistic membership filter.
//!
//! Sized from the expected entry count n and target false-positive rate p:
//! m = ceil(-n ln p / ln^2 2) bits and k = ceil(m/n ln 2) probes. Probes use
//! double hashing, `h1(key) + i * h2(key) mod m`, with h2 forced to 1 when
//! it hashes to zero. Encoded as `n (u64) | p (f64) | bitmap`.

use std::collections::hash_map::DefaultHasher;
use std::hash::Hasher;

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};

use crate::errdata;
use crate::error::Result;

#[derive(Debug, Clone)]
pub struct BloomFilter {
    expected_entries: u64,
    fp_rate: f64,
    num_bits: usize,
    num_hashes: usize,
    bits: Vec<u8>,
}

impl BloomFilter {
    pub fn new(expected_entries: usize, fp_rate: f64) -> Self {
        let n = expected_entries.max(1) as f64;
        let num_bits = (-(n * fp_rate.ln()) / (2f64.ln() * 2f64.ln())).ceil() as usize;
        let num_bits = num_bits.max(1);
        let num_hashes = ((num_bits as f64 / n) * 2f64.ln()).ceil() as usize;
        let num_hashes = num_hashes.max(1);
        Self {
            expected_entries: expected_entries as u64,
            fp_rate,
            num_bits,
            num_hashes,
            bits: vec![0u8; num_bits.div_ceil(8)],
        }
    }

    pub fn add(&mut self, key: &[u8]) {
        for i in 0..self.num_hashes {
            let idx = self.probe(key, i as u64);
            self.bits[idx / 8] |= 1 << (idx % 8);
        }
    }

    /// Never returns false for a key that was added; false positives are
    /// possible at roughly the configured rate.
    pub fn may_contain(&self, key: &[u8]) -> bool {
        for i in 0..self.num_hashes {
            let idx = self.probe(key, i as u64);
            if self.bits[idx / 8] & (1 << (idx % 8)) == 0 {
                return false;
            }
        }
        true
    }

    fn probe(&self, key: &[u8], i: u64) -> usize {
        let h1 = hash1(key);
        let mut h2 = hash2(key);
        if h2 == 0 {
            h2 = 1;
        }
        (h1.wrapping_add(i.wrapping_mul(h2)) % self.num_bits as u64) as usize
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16 + self.bits.len());
        buf.write_u64::<LittleEndian>(self.expected_entries).unwrap();
        buf.write_f64::<LittleEndian>(self.fp_rate).unwrap();
        buf.extend_from_slice(&self.bits);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 16 {
            return Err(errdata!("bloom filter header too short"));
        }
        let expected_entries = LittleEndian::read_u64(&bytes[0..8]);
        let fp_rate = LittleEndian::read_f64(&bytes[8..16]);
        if !(fp_rate > 0.0 && fp_rate < 1.0) {
            return Err(errdata!(
                "bloom filter false-positive rate out of range: {fp_rate}"
            ));
        }
        let mut filter = Self::new(expected_entries as usize, fp_rate);
        let bitmap = &bytes[16..];
        if bitmap.len() != filter.bits.len() {
            return Err(errdata!(
                "bloom filter bitmap length {} does not match parameters (want {})",
                bitmap.len(),
                filter.bits.len()
            ));
        }
        filter.bits.copy_from_slice(bitmap);
        Ok(filter)
    }
}

// The hash pair must be stable across processes since filters are persisted;
// DefaultHasher::new() is keyed with constants, unlike RandomState.
fn hash1(key: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    hasher.write(key);
    hasher.finish()
}

fn hash2(key: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    hasher.write(key);
    hasher.write(b"salt");
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_no_false_negatives() {
        let mut filter = BloomFilter::new(1000, 0.01);
        for i in 0..1000u32 {
            filter.add(format!("key{i}").as_bytes());
        }
        for i in 0..1000u32 {
            assert!(
                filter.may_contain(format!("key{i}").as_bytes()),
                "false negative for key{i}"
            );
        }
    }

    #[test]
    fn test_false_positive_rate_is_bounded() {
        let mut filter = BloomFilter::new(1000, 0.01);
        for i in 0..1000u32 {
            filter.add(format!("key{i}").as_bytes());
        }
        let mut false_positives = 0;
        let probes = 10_000;
        for i in 0..probes {
            if filter.may_contain(format!("absent{i}").as_bytes()) {
                false_positives += 1;
            }
        }
        // Allow a generous factor over the configured 1% rate.
        let rate = f64::from(false_positives) / f64::from(probes);
        assert!(rate < 0.05, "false positive rate too high: {rate}");
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let mut filter = BloomFilter::new(128, 0.02);
        filter.add(b"alpha");
        filter.add(b"beta");

        let decoded = BloomFilter::decode(&filter.encode()).expect("Failed to decode bloom");
        assert!(decoded.may_contain(b"alpha"));
        assert!(decoded.may_contain(b"beta"));
        assert_eq!(decoded.num_bits, filter.num_bits);
        assert_eq!(decoded.num_hashes, filter.num_hashes);
    }

    #[test]
    fn test_decode_rejects_wrong_bitmap_length() {
        let filter = BloomFilter::new(64, 0.01);
        let mut encoded = filter.encode();
        encoded.pop();
        assert!(matches!(
            BloomFilter::decode(&encoded),
            Err(Error::InvalidData(_))
        ));
    }
}
