//! Run statistics
//!
//! [`RunningTotals`] are the coordinator's accumulators, updated once per
//! aggregated chunk with overflow-checked arithmetic. [`ChunkTimings`] keeps
//! the distribution of chunk processing times.

pub mod histogram;

pub use histogram::{ChunkTimings, TimingSummary};

use crate::error::TaskError;
use crate::worker::ChunkResult;
use crate::Result;
use serde::{Deserialize, Serialize};

/// Coordinator-side accumulators
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningTotals {
    pub table_names: Vec<String>,
    /// Records processed per table
    pub records: Vec<u64>,
    /// Bytes of the chunks aggregated so far
    pub bytes_done: u64,
    pub chunks_done: u64,
    pub chunks_split: u64,
    /// Secondary rows that joined no root row
    pub unmatched: u64,
    /// Root rows skipped for repeating the previous root key
    pub duplicates: u64,
}

impl RunningTotals {
    pub fn new(table_names: Vec<String>) -> Self {
        let records = vec![0; table_names.len()];
        Self {
            table_names,
            records,
            ..Default::default()
        }
    }

    /// Add one finished chunk
    ///
    /// Either every counter is updated or none is. `percent_consumed` is the
    /// share of the database aggregated before this chunk, reported on overflow.
    pub fn add_chunk(&mut self, result: &ChunkResult, percent_consumed: f64) -> Result<()> {
        let overflow = || TaskError::Overflow { percent_consumed };

        let mut updated = self.records.clone();
        if updated.len() < result.records.len() {
            updated.resize(result.records.len(), 0);
        }
        for (total, value) in updated.iter_mut().zip(&result.records) {
            *total = total.checked_add(*value).ok_or_else(overflow)?;
        }
        let bytes_done = self.bytes_done.checked_add(result.bytes).ok_or_else(overflow)?;
        let unmatched = self.unmatched.checked_add(result.unmatched).ok_or_else(overflow)?;
        let duplicates = self.duplicates.checked_add(result.duplicates).ok_or_else(overflow)?;
        let chunks_done = self.chunks_done.checked_add(1).ok_or_else(overflow)?;

        self.records = updated;
        self.bytes_done = bytes_done;
        self.unmatched = unmatched;
        self.duplicates = duplicates;
        self.chunks_done = chunks_done;
        Ok(())
    }

    pub fn record_split(&mut self) {
        self.chunks_split = self.chunks_split.saturating_add(1);
    }

    pub fn total_records(&self) -> u64 {
        self.records.iter().fold(0u64, |sum, r| sum.saturating_add(*r))
    }

    /// Compare per-table records with the counts found by the indexer
    pub fn verify(&self, expected: &[u64]) -> Result<()> {
        for (index, &expected) in expected.iter().enumerate() {
            let actual = self.records.get(index).copied().unwrap_or(0);
            if actual != expected {
                let table = self
                    .table_names
                    .get(index)
                    .cloned()
                    .unwrap_or_else(|| format!("#{}", index));
                return Err(TaskError::TotalsMismatch { table, expected, actual }.into());
            }
        }
        Ok(())
    }

    /// Forget every count, keeping the table names
    pub fn reset(&mut self) {
        *self = Self::new(std::mem::take(&mut self.table_names));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkId;

    fn result(records: &[u64], bytes: u64, unmatched: u64) -> ChunkResult {
        ChunkResult {
            chunk: ChunkId::root(0),
            records: records.to_vec(),
            bytes,
            unmatched,
            duplicates: 0,
            payload: Vec::new(),
            elapsed_us: 0,
        }
    }

    #[test]
    fn test_add_and_verify() {
        let mut totals = RunningTotals::new(vec!["root".into(), "detail".into()]);
        totals.add_chunk(&result(&[10, 30], 400, 1), 40.0).unwrap();
        totals.add_chunk(&result(&[5, 12], 200, 0), 60.0).unwrap();

        assert_eq!(totals.records, vec![15, 42]);
        assert_eq!(totals.chunks_done, 2);
        assert_eq!(totals.bytes_done, 600);
        assert_eq!(totals.total_records(), 57);
        assert_eq!(totals.unmatched, 1);
        totals.verify(&[15, 42]).unwrap();

        let err = totals.verify(&[15, 43]).unwrap_err();
        match err.downcast_ref::<TaskError>() {
            Some(TaskError::TotalsMismatch { table, expected, actual }) => {
                assert_eq!(table, "detail");
                assert_eq!((*expected, *actual), (43, 42));
            }
            other => panic!("Wrong error: {:?}", other),
        }
    }

    #[test]
    fn test_overflow_leaves_totals_untouched() {
        let mut totals = RunningTotals::new(vec!["root".into()]);
        totals.add_chunk(&result(&[u64::MAX - 1], 10, 0), 50.0).unwrap();

        let err = totals.add_chunk(&result(&[2], 10, 0), 75.0).unwrap_err();
        match err.downcast_ref::<TaskError>() {
            Some(TaskError::Overflow { percent_consumed }) => assert_eq!(*percent_consumed, 75.0),
            other => panic!("Wrong error: {:?}", other),
        }
        assert_eq!(totals.records, vec![u64::MAX - 1]);
        assert_eq!(totals.chunks_done, 1);
    }

    #[test]
    fn test_reset() {
        let mut totals = RunningTotals::new(vec!["root".into()]);
        totals.add_chunk(&result(&[3], 10, 0), 100.0).unwrap();
        totals.record_split();
        totals.reset();
        assert_eq!(totals, RunningTotals::new(vec!["root".into()]));
    }
}
