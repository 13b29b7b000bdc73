//! Grouping of micro-chunks into chunks
//!
//! Without a forced maximum, chunk sizes follow a stair schedule: the first
//! `workers` chunks grow from `standard / workers` up to `standard` so workers
//! start staggered, the middle chunks use the standard size, and chunks in the
//! tail shrink toward a floor so every worker finishes at about the same time.

use super::IndexerSettings;
use crate::chunk::{Chunk, ChunkId, TableRange};

/// Size targets derived from the database size and the worker count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    pub total: u64,
    pub workers: u64,
    pub standard: u64,
    pub floor: u64,
}

impl Schedule {
    /// `budget`, when known, caps the standard size
    pub fn new(total: u64, worker_count: usize, budget: Option<u64>, settings: &IndexerSettings) -> Self {
        let workers = worker_count.max(1) as u64;
        let mut standard = settings
            .preferred_chunk_bytes
            .max(total.div_ceil(workers.saturating_mul(3)));
        if let Some(budget) = budget {
            standard = standard.min(budget);
        }
        let standard = standard.max(1);
        let floor = (standard / 8).max(settings.min_chunk_bytes).min(standard);

        Self { total, workers, standard, floor }
    }

    /// Target size of chunk number `index`, starting at byte `position`
    pub fn target(&self, index: usize, position: u64) -> u64 {
        let index = index as u64;
        let stair = if index < self.workers {
            scale(self.standard, index + 1, self.workers)
        } else {
            self.standard
        };

        let remaining = self.total.saturating_sub(position);
        let tail_zone = self.standard.saturating_mul(self.workers + 1) / 2;
        let taper = if remaining < tail_zone {
            self.floor + scale(self.standard - self.floor, remaining, tail_zone)
        } else {
            self.standard
        };

        stair.min(taper).max(self.floor).max(1)
    }
}

/// `value * numerator / denominator` without intermediate overflow
fn scale(value: u64, numerator: u64, denominator: u64) -> u64 {
    let scaled = u128::from(value) * u128::from(numerator) / u128::from(denominator.max(1));
    u64::try_from(scaled).unwrap_or(u64::MAX)
}

/// Group `micro` chunks, in order, into the chunks of the plan
pub fn build_chunks(
    micro: Vec<Chunk>,
    worker_count: usize,
    budget: Option<u64>,
    settings: &IndexerSettings,
) -> Vec<Chunk> {
    let forced = settings.max_chunk_bytes.is_some() || settings.max_chunk_records.is_some();
    let max_bytes = settings.max_chunk_bytes.unwrap_or(u64::MAX);
    let max_records = settings.max_chunk_records.unwrap_or(u64::MAX);

    let total: u64 = micro.iter().map(Chunk::bytes).sum();
    let schedule = Schedule::new(total, worker_count, budget, settings);
    tracing::debug!(
        total,
        standard = schedule.standard,
        floor = schedule.floor,
        forced,
        "chunk schedule"
    );

    let mut chunks = Vec::new();
    let mut group: Vec<Chunk> = Vec::new();
    let mut group_bytes = 0u64;
    let mut group_records = 0u64;
    let mut target = 0u64;
    let mut position = 0u64;

    for piece in micro {
        let bytes = piece.bytes();
        let records = piece.root_records();

        if forced {
            let overflows = group_bytes + bytes > max_bytes || group_records + records > max_records;
            if !group.is_empty() && overflows {
                chunks.push(merge(chunks.len(), std::mem::take(&mut group)));
                group_bytes = 0;
                group_records = 0;
            }
        } else if group.is_empty() {
            target = schedule.target(chunks.len(), position);
        }

        group.push(piece);
        group_bytes += bytes;
        group_records += records;
        position += bytes;

        if !forced && group_bytes >= target {
            chunks.push(merge(chunks.len(), std::mem::take(&mut group)));
            group_bytes = 0;
            group_records = 0;
        }
    }

    if !group.is_empty() {
        chunks.push(merge(chunks.len(), group));
    }
    chunks
}

/// Fuse consecutive micro-chunks into a single chunk
fn merge(index: usize, group: Vec<Chunk>) -> Chunk {
    let first = &group[0];
    let last = &group[group.len() - 1];

    let ranges = (0..first.ranges.len())
        .map(|t| TableRange {
            begin: first.ranges[t].begin,
            end: last.ranges[t].end,
            previous_record_index: first.ranges[t].previous_record_index,
            records: group.iter().map(|c| c.ranges[t].records).sum(),
        })
        .collect();

    Chunk {
        id: ChunkId::root(index as u32),
        ranges,
        previous_root_key: first.previous_root_key.clone(),
        last_root_key: last.last_root_key.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Contiguous single-table micro-chunks of the given byte sizes, 10 records each
    fn micro(sizes: &[u64]) -> Vec<Chunk> {
        let mut begin = 0;
        sizes
            .iter()
            .enumerate()
            .map(|(i, &size)| {
                let chunk = Chunk {
                    id: ChunkId::root(i as u32),
                    ranges: vec![TableRange {
                        begin,
                        end: begin + size,
                        previous_record_index: i as u64 * 10,
                        records: 10,
                    }],
                    previous_root_key: None,
                    last_root_key: None,
                };
                begin += size;
                chunk
            })
            .collect()
    }

    #[test]
    fn test_stair_ramps_up_and_tapers() {
        let settings = IndexerSettings {
            preferred_chunk_bytes: 1000,
            min_chunk_bytes: 100,
            ..Default::default()
        };
        let schedule = Schedule::new(100_000, 4, None, &settings);
        assert_eq!(schedule.standard, 8334);

        assert!(schedule.target(0, 0) < schedule.target(1, 0));
        assert!(schedule.target(2, 0) < schedule.target(3, 0));
        assert_eq!(schedule.target(3, 0), schedule.standard);
        assert_eq!(schedule.target(10, 50_000), schedule.standard);
        assert!(schedule.target(20, 99_000) < schedule.standard);
        assert_eq!(schedule.target(20, 100_000), schedule.floor);
    }

    #[test]
    fn test_budget_caps_standard_size() {
        let settings = IndexerSettings::default();
        let schedule = Schedule::new(1 << 40, 2, Some(4096), &settings);
        assert_eq!(schedule.standard, 4096);
        assert!(schedule.floor <= schedule.standard);
    }

    #[test]
    fn test_zero_budget_is_a_cap() {
        let settings = IndexerSettings { min_chunk_bytes: 0, ..Default::default() };
        let schedule = Schedule::new(1 << 20, 2, Some(0), &settings);
        assert_eq!(schedule.standard, 1);
    }

    #[test]
    fn test_huge_input_tapers_without_overflow() {
        let settings = IndexerSettings::default();
        let total = 1u64 << 62;
        let schedule = Schedule::new(total, 64, None, &settings);
        assert!(schedule.standard > 1 << 50);

        let middle = schedule.target(1000, total / 2);
        assert_eq!(middle, schedule.standard);
        let tail = schedule.target(1000, total - schedule.standard);
        assert!(tail >= schedule.floor && tail < schedule.standard);
        assert_eq!(schedule.target(1000, total), schedule.floor);
    }

    #[test]
    fn test_forced_bytes_never_exceeded() {
        let settings = IndexerSettings { max_chunk_bytes: Some(250), ..Default::default() };
        let chunks = build_chunks(micro(&[100, 100, 100, 40, 300, 10]), 2, None, &settings);

        let sizes: Vec<u64> = chunks.iter().map(Chunk::bytes).collect();
        assert_eq!(sizes, vec![200, 140, 300, 10]);
        assert_eq!(chunks[1].ranges[0].previous_record_index, 20);
        assert_eq!(chunks[1].root_records(), 20);
    }

    #[test]
    fn test_forced_records() {
        let settings = IndexerSettings { max_chunk_records: Some(25), ..Default::default() };
        let chunks = build_chunks(micro(&[10; 9]), 4, None, &settings);
        assert_eq!(chunks.len(), 5);
        assert!(chunks.iter().all(|c| c.root_records() <= 25));
    }

    #[test]
    fn test_chunks_are_contiguous_and_numbered() {
        let settings = IndexerSettings {
            preferred_chunk_bytes: 500,
            min_chunk_bytes: 50,
            ..Default::default()
        };
        let chunks = build_chunks(micro(&[60; 100]), 3, None, &settings);

        assert!(chunks.len() > 3);
        let mut expected = 0;
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.id, ChunkId::root(i as u32));
            assert_eq!(chunk.ranges[0].begin, expected);
            expected = chunk.ranges[0].end;
        }
        assert_eq!(expected, 6000);
        assert_eq!(chunks.iter().map(Chunk::root_records).sum::<u64>(), 1000);
    }
}
