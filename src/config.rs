use std::path::PathBuf;
use std::time::Duration;

/// Configuration for an EmberDB store. Loaded once at open and passed down
/// by reference; the only runtime-mutable knob is the log level.
#[derive(Debug, Clone)]
pub struct LsmConfig {
    /// Directory path for the database
    pub dir: PathBuf,

    /// Byte size at which the active skip list is frozen (default: 4MB)
    pub per_memtable_limit: usize,

    /// Byte size of the whole memtable tier (active + frozen) at which a
    /// flush is triggered (default: 16MB)
    pub total_memtable_limit: usize,

    /// Target encoded size of one SST block (default: 4KB)
    pub block_size: usize,

    /// Block cache capacity in blocks (default: 1024)
    pub block_cache_capacity: usize,

    /// LRU-K promotion threshold of the block cache (default: 2)
    pub block_cache_k: usize,

    /// SST count per level that triggers compaction, and the growth factor
    /// of per-level SST sizes (default: 4)
    pub level_ratio: usize,

    /// Expected entries per SST bloom filter; 0 disables blooms
    /// (default: 65536)
    pub bloom_expected_entries: usize,

    /// Bloom filter false-positive rate (default: 0.01)
    pub bloom_fp_rate: f64,

    /// WAL buffer capacity in records (default: 1024)
    pub wal_buffer_records: usize,

    /// Byte size at which the active WAL file is rotated (default: 1MB)
    pub wal_file_size_limit: u64,

    /// How often the WAL cleaner wakes up (default: 30s)
    pub wal_clean_interval: Duration,
}

impl Default for LsmConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./emberdb"),
            per_memtable_limit: 4 * 1024 * 1024,
            total_memtable_limit: 16 * 1024 * 1024,
            block_size: 4096,
            block_cache_capacity: 1024,
            block_cache_k: 2,
            level_ratio: 4,
            bloom_expected_entries: 65536,
            bloom_fp_rate: 0.01,
            wal_buffer_records: 1024,
            wal_file_size_limit: 1024 * 1024,
            wal_clean_interval: Duration::from_secs(30),
        }
    }
}

impl LsmConfig {
    /// Create a new config with the given directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Set the per-memtable freeze limit
    pub fn per_memtable_limit(mut self, bytes: usize) -> Self {
        self.per_memtable_limit = bytes;
        self
    }

    /// Set the whole-tier flush limit
    pub fn total_memtable_limit(mut self, bytes: usize) -> Self {
        self.total_memtable_limit = bytes;
        self
    }

    /// Set the target block size
    pub fn block_size(mut self, bytes: usize) -> Self {
        self.block_size = bytes;
        self
    }

    /// Set the block cache capacity in blocks
    pub fn block_cache_capacity(mut self, blocks: usize) -> Self {
        self.block_cache_capacity = blocks;
        self
    }

    /// Set the LRU-K promotion threshold
    pub fn block_cache_k(mut self, k: usize) -> Self {
        self.block_cache_k = k;
        self
    }

    /// Set the level fanout ratio
    pub fn level_ratio(mut self, ratio: usize) -> Self {
        self.level_ratio = ratio;
        self
    }

    /// Set the expected entry count for SST bloom filters (0 disables them)
    pub fn bloom_expected_entries(mut self, entries: usize) -> Self {
        self.bloom_expected_entries = entries;
        self
    }

    /// Set the bloom filter false-positive rate
    pub fn bloom_fp_rate(mut self, rate: f64) -> Self {
        self.bloom_fp_rate = rate;
        self
    }

    /// Set the WAL buffer capacity in records
    pub fn wal_buffer_records(mut self, records: usize) -> Self {
        self.wal_buffer_records = records;
        self
    }

    /// Set the WAL file rotation threshold
    pub fn wal_file_size_limit(mut self, bytes: u64) -> Self {
        self.wal_file_size_limit = bytes;
        self
    }

    /// Set the WAL cleaner wake interval
    pub fn wal_clean_interval(mut self, interval: Duration) -> Self {
        self.wal_clean_interval = interval;
        self
    }

    /// Target byte size of an SST at the given level:
    /// `per_memtable_limit * level_ratio^level`.
    pub fn sst_target_size(&self, level: usize) -> usize {
        let mut size = self.per_memtable_limit;
        for _ in 0..level {
            size = size.saturating_mul(self.level_ratio);
        }
        size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LsmConfig::default();
        assert_eq!(config.dir, PathBuf::from("./emberdb"));
        assert_eq!(config.per_memtable_limit, 4 * 1024 * 1024);
        assert_eq!(config.block_size, 4096);
        assert_eq!(config.level_ratio, 4);
    }

    #[test]
    fn test_config_builder() {
        let config = LsmConfig::new("/tmp/test")
            .per_memtable_limit(1024)
            .block_size(256)
            .level_ratio(2)
            .wal_clean_interval(Duration::from_millis(500));

        assert_eq!(config.dir, PathBuf::from("/tmp/test"));
        assert_eq!(config.per_memtable_limit, 1024);
        assert_eq!(config.block_size, 256);
        assert_eq!(config.wal_clean_interval, Duration::from_millis(500));
    }

    #[test]
    fn test_sst_target_size_grows_by_ratio() {
        let config = LsmConfig::new("/tmp/test")
            .per_memtable_limit(1000)
            .level_ratio(4);

        assert_eq!(config.sst_target_size(0), 1000);
        assert_eq!(config.sst_target_size(1), 4000);
        assert_eq!(config.sst_target_size(3), 64000);
    }
}
