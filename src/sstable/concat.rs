//! Cursor across a chain of SSTs with pairwise-disjoint key ranges, the
//! shape of every level >= 1. The chain is consumed in first_key order;
//! only one member table is open at a time.

use std::sync::Arc;

use super::iterator::SstIterator;
use super::Sst;
use crate::block::iterator::View;
use crate::error::Result;
use crate::iterator::LsmIterator;

pub struct ConcatIterator {
    ssts: Vec<Arc<Sst>>,
    cur: Option<SstIterator>,
    next_sst: usize,
    view: View,
}

impl ConcatIterator {
    /// Cursor at the first visible entry of the chain. `ssts` must be
    /// sorted by first_key with disjoint ranges.
    pub fn new(ssts: Vec<Arc<Sst>>, view: View) -> Result<Self> {
        let mut iter = Self {
            ssts,
            cur: None,
            next_sst: 0,
            view,
        };
        iter.roll_forward()?;
        Ok(iter)
    }

    /// Cursor at the first visible entry with key >= `key`.
    pub fn seek(ssts: Vec<Arc<Sst>>, key: &[u8], view: View) -> Result<Self> {
        // Skip tables that end before the target key.
        let start = ssts.partition_point(|sst| sst.last_key() < key);
        let mut iter = Self {
            ssts,
            cur: None,
            next_sst: start,
            view,
        };
        if start < iter.ssts.len() {
            iter.cur = Some(SstIterator::seek(iter.ssts[start].clone(), key, view)?);
            iter.next_sst = start + 1;
        }
        iter.roll_forward()?;
        Ok(iter)
    }

    fn roll_forward(&mut self) -> Result<()> {
        while !self.cur.as_ref().is_some_and(|c| c.is_valid()) {
            if self.next_sst >= self.ssts.len() {
                self.cur = None;
                return Ok(());
            }
            self.cur = Some(SstIterator::begin(
                self.ssts[self.next_sst].clone(),
                self.view,
            )?);
            self.next_sst += 1;
        }
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.cur.as_ref().is_some_and(|c| c.is_valid())
    }

    pub fn next_entry(&mut self) -> Result<()> {
        if let Some(cur) = &mut self.cur {
            cur.next_entry()?;
        }
        self.roll_forward()
    }

    pub fn key(&self) -> &[u8] {
        self.cur.as_ref().unwrap().key()
    }

    pub fn value(&self) -> &[u8] {
        self.cur.as_ref().unwrap().value()
    }

    pub fn tid(&self) -> u64 {
        self.cur.as_ref().unwrap().tid()
    }
}

impl LsmIterator for ConcatIterator {
    fn is_valid(&self) -> bool {
        ConcatIterator::is_valid(self)
    }

    fn next_entry(&mut self) -> Result<()> {
        ConcatIterator::next_entry(self)
    }

    fn key(&self) -> &[u8] {
        ConcatIterator::key(self)
    }

    fn value(&self) -> &[u8] {
        ConcatIterator::value(self)
    }

    fn tid(&self) -> u64 {
        ConcatIterator::tid(self)
    }
}
