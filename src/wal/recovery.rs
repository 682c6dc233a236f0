//! Crash recovery: reconstructing committed-but-unflushed transactions
//! from the log directory.

use std::collections::BTreeMap;
use std::path::Path;

use itertools::Itertools;
use tracing::info;

use super::record::{Record, RecordPayload};
use super::{rotated_logs, ACTIVE_LOG};
use crate::error::Result;

/// Reads every log file in rotation order, groups records by tid and keeps
/// the groups that ran to COMMIT and are newer than the flush checkpoint.
/// Groups that never got past CREATE, or ended in ROLLBACK, are dropped.
/// Returned in ascending tid order so replay preserves write order.
pub fn recover(log_dir: &Path, max_flushed_tid: u64) -> Result<BTreeMap<u64, Vec<Record>>> {
    let mut all = Vec::new();
    for (_, path) in rotated_logs(log_dir)? {
        let bytes = std::fs::read(&path)?;
        all.extend(Record::decode_stream(&bytes)?);
    }
    let active = log_dir.join(ACTIVE_LOG);
    if active.exists() {
        let bytes = std::fs::read(&active)?;
        all.extend(Record::decode_stream(&bytes)?);
    }

    let groups = all.into_iter().map(|r| (r.tid, r)).into_group_map();

    let mut committed = BTreeMap::new();
    for (tid, records) in groups {
        let committed_group = matches!(
            records.last().map(|r| &r.payload),
            Some(RecordPayload::Commit)
        );
        if committed_group && tid > max_flushed_tid {
            committed.insert(tid, records);
        }
    }
    if !committed.is_empty() {
        info!(
            transactions = committed.len(),
            max_flushed_tid, "wal recovery found committed transactions to replay"
        );
    }
    Ok(committed)
}
