//! EmberDB: a persistent, embeddable ordered key-value store built on a
//! log-structured merge tree.
//!
//! Byte-string keys map to byte-string values with multi-version
//! concurrency control: every write carries a monotone transaction id and
//! reads pick the newest version visible at their view. Writes land in an
//! in-memory skip-list tier, flush to immutable sorted tables (SSTs) at
//! level 0, and migrate down through leveled compaction. Durability comes
//! from a write-ahead log replayed on open.
//!
//! The [`Lsm`] facade is the intended entry point: it allocates
//! transaction ids, runs crash recovery and exposes point/batch reads and
//! writes, range/prefix/predicate scans, and transactions at four
//! isolation levels. [`LsmEngine`] underneath works with caller-supplied
//! tids.
//!
//! ```no_run
//! use emberdb::{Lsm, LsmConfig};
//!
//! let store = Lsm::open(LsmConfig::new("./data"))?;
//! store.put(b"alpha", b"1")?;
//! assert_eq!(store.get(b"alpha")?, Some(b"1".to_vec()));
//! store.remove(b"alpha")?;
//! # Ok::<(), emberdb::Error>(())
//! ```

pub mod block;
pub mod bloom;
pub mod cache;
mod compaction;
pub mod config;
pub mod engine;
pub mod error;
pub mod flock;
pub mod iterator;
pub mod logger;
pub mod memtable;
pub mod skiplist;
pub mod sstable;
pub mod tmpfs;
pub mod tran;
pub mod wal;

pub use config::LsmConfig;
pub use engine::{Lsm, LsmEngine};
pub use error::{Error, Result};
pub use iterator::LsmScanIterator;
pub use tran::{IsolationLevel, TranContext, TranState};
