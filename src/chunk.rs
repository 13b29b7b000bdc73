//! Chunks and the chunk plan
//!
//! A chunk is a set of record-aligned byte ranges, one per table, that a
//! single worker streams in one invocation. Chunk ids are hierarchical: a chunk
//! split during rebalancing gives its pieces ids `parent.0`, `parent.1`, ... so
//! ordering by id reproduces database order.

use crate::database::JoinKey;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

/// Hierarchical chunk identifier, ordered lexicographically
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChunkId(pub Vec<u32>);

impl ChunkId {
    pub fn root(index: u32) -> Self {
        ChunkId(vec![index])
    }

    pub fn child(&self, index: u32) -> Self {
        let mut path = self.0.clone();
        path.push(index);
        ChunkId(path)
    }

    /// Nesting depth, 1 for chunks of the initial plan
    pub fn depth(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(u32::to_string).collect();
        write!(f, "{}", parts.join("."))
    }
}

/// Byte range of one table inside a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRange {
    /// First byte, always a line start
    pub begin: u64,
    /// One past the last byte
    pub end: u64,
    /// Records of the table located before `begin`
    pub previous_record_index: u64,
    /// Records inside the range
    pub records: u64,
}

impl TableRange {
    pub fn bytes(&self) -> u64 {
        self.end - self.begin
    }
}

/// Exact size of a chunk per table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkVolume {
    pub bytes: Vec<u64>,
    pub records: Vec<u64>,
}

impl ChunkVolume {
    pub fn total_bytes(&self) -> u64 {
        self.bytes.iter().sum()
    }

    pub fn root_records(&self) -> u64 {
        self.records.first().copied().unwrap_or(0)
    }
}

/// Unit of work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: ChunkId,
    /// One range per table, root first
    pub ranges: Vec<TableRange>,
    /// Last root key before the chunk; `None` for the first chunk
    pub previous_root_key: Option<JoinKey>,
    /// Last root key inside the chunk; `None` for single-table databases
    pub last_root_key: Option<JoinKey>,
}

impl Chunk {
    pub fn root(&self) -> &TableRange {
        &self.ranges[0]
    }

    pub fn bytes(&self) -> u64 {
        self.ranges.iter().map(TableRange::bytes).sum()
    }

    pub fn root_records(&self) -> u64 {
        self.root().records
    }

    pub fn expected_records(&self) -> Vec<u64> {
        self.ranges.iter().map(|r| r.records).collect()
    }

    pub fn volume(&self) -> ChunkVolume {
        ChunkVolume {
            bytes: self.ranges.iter().map(TableRange::bytes).collect(),
            records: self.expected_records(),
        }
    }
}

/// Ordered queue of pending chunks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkPlan {
    queue: VecDeque<Chunk>,
    table_names: Vec<String>,
    /// Records per table over the whole database
    table_records: Vec<u64>,
    /// Bytes per table over the whole database
    table_bytes: Vec<u64>,
}

impl ChunkPlan {
    pub fn new(chunks: Vec<Chunk>, table_names: Vec<String>, table_records: Vec<u64>, table_bytes: Vec<u64>) -> Self {
        Self {
            queue: chunks.into(),
            table_names,
            table_records,
            table_bytes,
        }
    }

    pub fn pop_next(&mut self) -> Option<Chunk> {
        self.queue.pop_front()
    }

    /// Put split pieces at the front of the queue, largest first
    pub fn push_front_split(&mut self, mut pieces: Vec<Chunk>) {
        // Stable sort keeps database order among equal sizes
        pieces.sort_by(|a, b| b.bytes().cmp(&a.bytes()));
        for piece in pieces.into_iter().rev() {
            self.queue.push_front(piece);
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Chunk> {
        self.queue.iter()
    }

    pub fn table_names(&self) -> &[String] {
        &self.table_names
    }

    pub fn table_records(&self) -> &[u64] {
        &self.table_records
    }

    pub fn table_bytes(&self) -> &[u64] {
        &self.table_bytes
    }

    pub fn total_bytes(&self) -> u64 {
        self.table_bytes.iter().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: ChunkId, root_bytes: u64) -> Chunk {
        Chunk {
            id,
            ranges: vec![TableRange { begin: 0, end: root_bytes, previous_record_index: 0, records: 1 }],
            previous_root_key: None,
            last_root_key: None,
        }
    }

    #[test]
    fn test_chunk_id_ordering_follows_database_order() {
        let mut ids = vec![
            ChunkId::root(2),
            ChunkId::root(1).child(1),
            ChunkId::root(1),
            ChunkId::root(1).child(0).child(3),
            ChunkId::root(0),
        ];
        ids.sort();
        let shown: Vec<String> = ids.iter().map(ChunkId::to_string).collect();
        assert_eq!(shown, vec!["0", "1", "1.0.3", "1.1", "2"]);
    }

    #[test]
    fn test_push_front_split_largest_first() {
        let mut plan = ChunkPlan::new(vec![chunk(ChunkId::root(5), 10)], vec!["t".into()], vec![0], vec![0]);
        let parent = ChunkId::root(3);
        plan.push_front_split(vec![
            chunk(parent.child(0), 20),
            chunk(parent.child(1), 50),
            chunk(parent.child(2), 20),
        ]);

        let order: Vec<String> = plan.iter().map(|c| c.id.to_string()).collect();
        assert_eq!(order, vec!["3.1", "3.0", "3.2", "5"]);
        assert_eq!(plan.pop_next().unwrap().id, parent.child(1));
        assert_eq!(plan.len(), 3);
    }

    #[test]
    fn test_volume() {
        let c = Chunk {
            id: ChunkId::root(0),
            ranges: vec![
                TableRange { begin: 0, end: 100, previous_record_index: 0, records: 4 },
                TableRange { begin: 10, end: 40, previous_record_index: 2, records: 3 },
            ],
            previous_root_key: None,
            last_root_key: None,
        };
        let volume = c.volume();
        assert_eq!(volume.total_bytes(), 130);
        assert_eq!(volume.root_records(), 4);
        assert_eq!(c.expected_records(), vec![4, 3]);
    }
}
