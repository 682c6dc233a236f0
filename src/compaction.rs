//! Leveled full compaction: all tables of level L merge with all tables
//! of level L+1 into a fresh set at L+1.
//!
//! The merge runs with no transaction view, so every (key, tid) version
//! streams through and old snapshots read the same data afterwards. The
//! only records allowed to disappear are exact duplicates of a record
//! already emitted and, when the output is the deepest level, tombstones
//! with no older version of their key behind them.

use tracing::{debug, info};

use crate::block::iterator::View;
use crate::engine::{LsmEngine, SstIndex};
use crate::error::Result;
use crate::iterator::{HeapIterator, LsmIterator, SearchItem, TwoMergeIterator};
use crate::sstable::concat::ConcatIterator;
use crate::sstable::builder::SstBuilder;
use crate::sstable::Sst;
use std::sync::Arc;

/// Compacts `level` into `level + 1`, recursing downward first when the
/// destination is itself over threshold so space exists below.
pub(crate) fn full_compact(engine: &LsmEngine, index: &mut SstIndex, level: usize) -> Result<()> {
    let target_level = level + 1;
    if index.level_ids(target_level).len() >= engine.config.level_ratio {
        full_compact(engine, index, target_level)?;
    }

    let src_ids = index.level_ids(level);
    let dst_ids = index.level_ids(target_level);
    if src_ids.is_empty() {
        return Ok(());
    }
    info!(
        level,
        target_level,
        src_tables = src_ids.len(),
        dst_tables = dst_ids.len(),
        "starting full compaction"
    );

    // Tombstones may be reclaimed only when nothing lives below the target.
    let bottom_level = index.deepest_level() <= target_level;
    let dst_ssts = index.level_ssts(target_level);

    let new_ssts = if level == 0 {
        // Level-0 ranges overlap, so the source side is a heap merge.
        let mut items = Vec::new();
        for id in &src_ids {
            let sst = index.ssts[id].clone();
            let mut iter = sst.begin(View::Raw)?;
            while iter.is_valid() {
                items.push(SearchItem::new(
                    iter.key().to_vec(),
                    iter.value().to_vec(),
                    iter.tid(),
                    0,
                    -(*id as i64),
                ));
                iter.next_entry()?;
            }
        }
        let l0 = HeapIterator::new(items, 0, false);
        let deeper = ConcatIterator::new(dst_ssts, View::Raw)?;
        write_merged(engine, TwoMergeIterator::new(l0, deeper)?, target_level, bottom_level)?
    } else {
        let src = ConcatIterator::new(index.level_ssts(level), View::Raw)?;
        let dst = ConcatIterator::new(dst_ssts, View::Raw)?;
        write_merged(engine, TwoMergeIterator::new(src, dst)?, target_level, bottom_level)?
    };

    // Swap the level membership, then delete the replaced files.
    for id in src_ids.iter().chain(dst_ids.iter()) {
        if let Some(sst) = index.ssts.remove(id) {
            sst.del()?;
        }
    }
    if let Some(ids) = index.levels.get_mut(&level) {
        ids.clear();
    }
    let dst_list = index.levels.entry(target_level).or_default();
    dst_list.clear();
    for sst in &new_ssts {
        index.ssts.insert(sst.id(), sst.clone());
        // Outputs are generated in ascending key order, so pushing back
        // keeps the level sorted by first_key.
        dst_list.push_back(sst.id());
    }
    index.max_level = index.max_level.max(target_level);

    info!(
        target_level,
        new_tables = new_ssts.len(),
        "finished full compaction"
    );
    Ok(())
}

/// Streams a merged iterator into SSTs sized for the target level. Output
/// tables cut over only at key boundaries so one key's versions never
/// straddle two tables of the same level.
fn write_merged<I: LsmIterator>(
    engine: &LsmEngine,
    mut iter: I,
    target_level: usize,
    bottom_level: bool,
) -> Result<Vec<Arc<Sst>>> {
    let target_size = engine.config.sst_target_size(target_level);
    let mut out = Vec::new();
    let mut builder = engine.new_sst_builder();
    let mut pending: Option<(Vec<u8>, Vec<u8>, u64)> = None;
    let mut dropped_tombstones = 0u64;

    while iter.is_valid() {
        let entry = (iter.key().to_vec(), iter.value().to_vec(), iter.tid());
        iter.next_entry()?;
        if let Some(prev) = pending.take() {
            // A tombstone at the bottom level dies once no older version
            // of its key can follow it out of this merge.
            if bottom_level && prev.1.is_empty() && prev.0 != entry.0 {
                dropped_tombstones += 1;
            } else {
                write_entry(engine, &mut out, &mut builder, target_size, target_level, &prev)?;
            }
        }
        pending = Some(entry);
    }
    if let Some(prev) = pending.take() {
        if bottom_level && prev.1.is_empty() {
            dropped_tombstones += 1;
        } else {
            write_entry(engine, &mut out, &mut builder, target_size, target_level, &prev)?;
        }
    }

    if !builder.is_empty() {
        out.push(engine.finish_sst(builder, target_level)?);
    }
    if dropped_tombstones > 0 {
        debug!(dropped_tombstones, target_level, "reclaimed tombstones at bottom level");
    }
    Ok(out)
}

fn write_entry(
    engine: &LsmEngine,
    out: &mut Vec<Arc<Sst>>,
    builder: &mut SstBuilder,
    target_size: usize,
    target_level: usize,
    entry: &(Vec<u8>, Vec<u8>, u64),
) -> Result<()> {
    if !builder.is_empty()
        && builder.estimated_size() >= target_size
        && builder.last_added_key() != entry.0.as_slice()
    {
        let full = std::mem::replace(builder, engine.new_sst_builder());
        out.push(engine.finish_sst(full, target_level)?);
    }
    builder.add(&entry.0, &entry.1, entry.2)
}
