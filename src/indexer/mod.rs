//! Database indexing
//!
//! The root table is scanned in fixed-size byte segments (in parallel with
//! rayon) and cut into micro-chunks: record-aligned slices below a size limit.
//! Each secondary table is then scanned once, tables in parallel, to find for
//! every micro-chunk boundary key the first row with a greater key. Micro-chunks
//! are finally grouped into chunks by [`chunk_builder`].
//!
//! The same scanning primitives split a chunk into smaller pieces when a worker
//! finds it too large to process.

pub mod chunk_builder;

use crate::chunk::{Chunk, ChunkId, ChunkPlan, TableRange};
use crate::database::{extract_key, split_fields, CompiledSchema, DatabaseSpec, JoinKey, LineReader};
use crate::error::TaskError;
use crate::resource::MIB;
use crate::Result;
use anyhow::Context;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Root bytes scanned by one parallel indexing task
const SEGMENT_BYTES: u64 = 64 * MIB;
/// Read buffer used by the indexing scans
const INDEX_BUFFER: usize = MIB as usize;

/// Sizing knobs of the indexer and chunk builder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexerSettings {
    /// Target size of the micro-chunks chunks are built from
    pub micro_chunk_bytes: u64,
    /// Forced maximum chunk size in bytes, all tables included
    pub max_chunk_bytes: Option<u64>,
    /// Forced maximum root records per chunk
    pub max_chunk_records: Option<u64>,
    /// Preferred chunk size when nothing is forced
    pub preferred_chunk_bytes: u64,
    /// Floor of the tail chunk sizes
    pub min_chunk_bytes: u64,
}

impl Default for IndexerSettings {
    fn default() -> Self {
        Self {
            micro_chunk_bytes: MIB,
            max_chunk_bytes: None,
            max_chunk_records: None,
            preferred_chunk_bytes: 8 * MIB,
            min_chunk_bytes: 64 * 1024,
        }
    }
}

/// Totals of one table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableIndex {
    pub name: String,
    pub bytes: u64,
    pub records: u64,
}

/// Result of the indexing pre-pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseIndex {
    pub tables: Vec<TableIndex>,
    /// Micro-chunks in database order, ids are their positions
    pub micro_chunks: Vec<Chunk>,
}

/// Record-aligned slice of the root table
#[derive(Debug, Clone, PartialEq, Eq)]
struct RootSlice {
    begin: u64,
    end: u64,
    records: u64,
    first_key: Option<JoinKey>,
    last_key: Option<JoinKey>,
}

#[derive(Debug, Clone, Copy)]
struct SliceLimits {
    bytes: u64,
    records: u64,
}

/// Offsets of the cut points found in a secondary table range
#[derive(Debug, Clone)]
struct Boundaries {
    /// (first byte after the cut, records before the cut) per cut key
    cuts: Vec<(u64, u64)>,
    end: u64,
    total: u64,
}

/// Everything needed to scan one table file
struct TableScan<'a> {
    name: &'a str,
    path: &'a Path,
    header: bool,
    separator: char,
    /// Empty when keys are not tracked
    key_indexes: &'a [usize],
}

impl<'a> TableScan<'a> {
    fn new(db: &'a DatabaseSpec, schema: &'a CompiledSchema, table: usize) -> Self {
        let key_indexes: &[usize] = if db.is_multi_table() {
            &schema.tables[table].key_indexes
        } else {
            &[]
        };
        Self {
            name: &db.tables[table].name,
            path: &db.tables[table].path,
            header: db.header,
            separator: db.separator,
            key_indexes,
        }
    }

    fn key(&self, line: &[u8], offset: u64) -> Result<Option<JoinKey>> {
        if self.key_indexes.is_empty() {
            return Ok(None);
        }
        let text = std::str::from_utf8(line).map_err(|e| {
            TaskError::IndexingFailure(format!("table '{}' byte {}: invalid UTF-8: {}", self.name, offset, e))
        })?;
        let fields = split_fields(text, self.separator);
        extract_key(&fields, self.key_indexes).map(Some).map_err(|missing| {
            TaskError::IndexingFailure(format!(
                "table '{}' byte {}: key field in column {} is missing",
                self.name,
                offset,
                missing + 1
            ))
            .into()
        })
    }

    fn file_len(&self) -> Result<u64> {
        Ok(std::fs::metadata(self.path)
            .with_context(|| format!("Cannot stat table '{}' at {}", self.name, self.path.display()))?
            .len())
    }

    /// Cut the lines starting in `[begin, end)` into slices within `limits`
    ///
    /// `begin` need not be a line start; the scan starts at the next one. The
    /// slices cover every byte from there to the start of the first line at or
    /// after `end`.
    fn slice(&self, begin: u64, end: u64, limits: SliceLimits) -> Result<Vec<RootSlice>> {
        let mut reader = LineReader::open_aligned(self.path, begin, end, INDEX_BUFFER)?;
        let start = reader.position();
        if self.header && start == 0 {
            reader.skip_line()?;
        }

        let mut slices = Vec::new();
        let mut current = RootSlice {
            begin: start,
            end: start,
            records: 0,
            first_key: None,
            last_key: None,
        };

        while let Some(offset) = reader.next_line()? {
            let key = self.key(reader.line(), offset)?;
            if let (Some(key), Some(previous)) = (&key, &current.last_key) {
                if key < previous {
                    return Err(unsorted_root(self.name, offset, key, previous));
                }
            }
            // Rows repeating a root key stay with the first one
            let repeats = key.is_some() && key == current.last_key;

            let line_end = reader.position();
            let over_bytes = line_end - current.begin > limits.bytes;
            let over_records = current.records >= limits.records;
            if current.records > 0 && !repeats && (over_bytes || over_records) {
                current.end = offset;
                let next = RootSlice {
                    begin: offset,
                    end: offset,
                    records: 0,
                    first_key: None,
                    last_key: current.last_key.clone(),
                };
                slices.push(std::mem::replace(&mut current, next));
            }

            if current.records == 0 {
                current.first_key = key.clone();
            }
            current.records += 1;
            current.last_key = key;
        }

        current.end = reader.position();
        if current.records == 0 {
            current.last_key = None;
        }
        slices.push(current);
        Ok(slices)
    }

    /// Locate, for each cut key, the first row in `range` with a greater key
    fn locate_cuts(&self, range: &TableRange, cuts: &[JoinKey]) -> Result<Boundaries> {
        let mut reader = LineReader::open(self.path, range.begin, range.end, INDEX_BUFFER)?;
        if self.header && range.begin == 0 {
            reader.skip_line()?;
        }

        let mut bounds = Vec::with_capacity(cuts.len());
        let mut count = 0u64;
        let mut previous: Option<JoinKey> = None;

        while let Some(offset) = reader.next_line()? {
            let key = self.key(reader.line(), offset)?.ok_or_else(|| {
                TaskError::IndexingFailure(format!("table '{}' has no join key", self.name))
            })?;
            if let Some(previous) = &previous {
                if key < *previous {
                    return Err(TaskError::IndexingFailure(format!(
                        "table '{}' byte {}: key {:?} is lower than the previous key {:?}",
                        self.name, offset, key, previous
                    ))
                    .into());
                }
            }
            while bounds.len() < cuts.len() && key > cuts[bounds.len()] {
                bounds.push((offset, count));
            }
            count += 1;
            previous = Some(key);
        }

        let end = reader.position();
        while bounds.len() < cuts.len() {
            bounds.push((end, count));
        }
        Ok(Boundaries { cuts: bounds, end, total: count })
    }
}

/// Scan the database and cut it into micro-chunks
pub fn index_database(db: &DatabaseSpec, schema: &CompiledSchema, settings: &IndexerSettings) -> Result<DatabaseIndex> {
    let root = TableScan::new(db, schema, 0);
    let root_len = root.file_len()?;

    let limits = SliceLimits {
        bytes: settings
            .max_chunk_bytes
            .map_or(settings.micro_chunk_bytes, |max| max.min(settings.micro_chunk_bytes))
            .max(1),
        records: settings.max_chunk_records.unwrap_or(u64::MAX).max(1),
    };

    let segments = root_len.div_ceil(SEGMENT_BYTES).max(1);
    tracing::debug!(table = root.name, bytes = root_len, segments, "indexing root table");

    let per_segment = (0..segments)
        .into_par_iter()
        .map(|i| {
            let begin = i * SEGMENT_BYTES;
            let end = if i + 1 == segments { root_len } else { (i + 1) * SEGMENT_BYTES };
            root.slice(begin, end, limits)
        })
        .collect::<Result<Vec<_>>>()?;

    let slices = join_slices(merge_empty_slices(per_segment.into_iter().flatten().collect()), root.name)?;

    let cut_keys: Vec<JoinKey> = slices[..slices.len() - 1]
        .iter()
        .filter_map(|s| s.last_key.clone())
        .collect();

    let whole_files = (0..db.tables.len())
        .map(|t| {
            Ok(TableRange {
                begin: 0,
                end: TableScan::new(db, schema, t).file_len()?,
                previous_record_index: 0,
                records: 0,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let secondary = (1..db.tables.len())
        .into_par_iter()
        .map(|t| TableScan::new(db, schema, t).locate_cuts(&whole_files[t], &cut_keys))
        .collect::<Result<Vec<_>>>()?;

    let micro_chunks = assemble(&slices, &secondary, &whole_files, None, &ChunkId(Vec::new()));

    let mut tables = Vec::with_capacity(db.tables.len());
    for (t, table) in db.tables.iter().enumerate() {
        let records = micro_chunks.iter().map(|c| c.ranges[t].records).sum();
        tables.push(TableIndex {
            name: table.name.clone(),
            bytes: whole_files[t].end,
            records,
        });
    }

    tracing::info!(
        micro_chunks = micro_chunks.len(),
        root_records = tables[0].records,
        "database indexed"
    );

    Ok(DatabaseIndex { tables, micro_chunks })
}

/// Index the database and group it into a chunk plan
pub fn build_plan(
    db: &DatabaseSpec,
    schema: &CompiledSchema,
    settings: &IndexerSettings,
    worker_count: usize,
    worker_budget: Option<u64>,
) -> Result<ChunkPlan> {
    let index = index_database(db, schema, settings)?;
    let names = index.tables.iter().map(|t| t.name.clone()).collect();
    let records = index.tables.iter().map(|t| t.records).collect();
    let bytes = index.tables.iter().map(|t| t.bytes).collect();

    let chunks = chunk_builder::build_chunks(index.micro_chunks, worker_count, worker_budget, settings);
    tracing::info!(chunks = chunks.len(), worker_count, "chunk plan built");

    Ok(ChunkPlan::new(chunks, names, records, bytes))
}

/// Split `chunk` into at most `pieces` sub-chunks of near-equal root records
///
/// Returns the chunk unchanged when it holds fewer than two root records.
pub fn split_chunk(db: &DatabaseSpec, schema: &CompiledSchema, chunk: &Chunk, pieces: usize) -> Result<Vec<Chunk>> {
    let records = chunk.root_records();
    let pieces = (pieces as u64).min(records);
    if pieces <= 1 {
        return Ok(vec![chunk.clone()]);
    }

    let root = TableScan::new(db, schema, 0);
    let limits = SliceLimits {
        bytes: u64::MAX,
        records: records.div_ceil(pieces),
    };
    let root_range = chunk.root();
    let slices = merge_empty_slices(root.slice(root_range.begin, root_range.end, limits)?);

    let found: u64 = slices.iter().map(|s| s.records).sum();
    if found != records {
        return Err(TaskError::IndexingFailure(format!(
            "chunk {} holds {} root records, index recorded {}",
            chunk.id, found, records
        ))
        .into());
    }

    let cut_keys: Vec<JoinKey> = slices[..slices.len() - 1]
        .iter()
        .filter_map(|s| s.last_key.clone())
        .collect();
    let secondary = (1..db.tables.len())
        .map(|t| TableScan::new(db, schema, t).locate_cuts(&chunk.ranges[t], &cut_keys))
        .collect::<Result<Vec<_>>>()?;

    Ok(assemble(
        &slices,
        &secondary,
        &chunk.ranges,
        chunk.previous_root_key.clone(),
        &chunk.id,
    ))
}

/// Fold record-less slices into their neighbours
fn merge_empty_slices(slices: Vec<RootSlice>) -> Vec<RootSlice> {
    let mut merged: Vec<RootSlice> = Vec::with_capacity(slices.len());
    for slice in slices {
        match merged.last_mut() {
            Some(last) if slice.records == 0 => last.end = slice.end,
            Some(last) if last.records == 0 => {
                let begin = last.begin;
                *last = slice;
                last.begin = begin;
            }
            _ => merged.push(slice),
        }
    }
    merged
}

/// Check root key order across slices
///
/// Slices are scanned independently, so a run of equal root keys may straddle
/// two of them; such slices are joined.
fn join_slices(slices: Vec<RootSlice>, table: &str) -> Result<Vec<RootSlice>> {
    let mut joined: Vec<RootSlice> = Vec::with_capacity(slices.len());
    for slice in slices {
        if let Some(last) = joined.last_mut() {
            if let (Some(previous), Some(next)) = (&last.last_key, &slice.first_key) {
                if next < previous {
                    return Err(unsorted_root(table, slice.begin, next, previous));
                }
                if next == previous {
                    last.end = slice.end;
                    last.records += slice.records;
                    last.last_key = slice.last_key;
                    continue;
                }
            }
        }
        joined.push(slice);
    }
    Ok(joined)
}

fn unsorted_root(table: &str, offset: u64, key: &JoinKey, previous: &JoinKey) -> anyhow::Error {
    TaskError::IndexingFailure(format!(
        "table '{}' byte {}: root key {:?} is lower than the previous key {:?}",
        table, offset, key, previous
    ))
    .into()
}

/// Combine root slices and secondary cut points into chunks
///
/// `base` holds the enclosing range of every table; ids are children of
/// `parent`, or top-level positions when `parent` is empty.
fn assemble(
    slices: &[RootSlice],
    secondary: &[Boundaries],
    base: &[TableRange],
    first_previous_key: Option<JoinKey>,
    parent: &ChunkId,
) -> Vec<Chunk> {
    let mut chunks = Vec::with_capacity(slices.len());
    let mut root_before = 0u64;
    let last = slices.len() - 1;

    for (i, slice) in slices.iter().enumerate() {
        let mut ranges = Vec::with_capacity(base.len());
        ranges.push(TableRange {
            begin: slice.begin,
            end: slice.end,
            previous_record_index: base[0].previous_record_index + root_before,
            records: slice.records,
        });
        root_before += slice.records;

        for (t, bounds) in secondary.iter().enumerate() {
            let enclosing = &base[t + 1];
            let (begin, before) = if i == 0 { (enclosing.begin, 0) } else { bounds.cuts[i - 1] };
            let (end, upto) = if i == last { (bounds.end, bounds.total) } else { bounds.cuts[i] };
            ranges.push(TableRange {
                begin,
                end,
                previous_record_index: enclosing.previous_record_index + before,
                records: upto - before,
            });
        }

        let id = if parent.0.is_empty() {
            ChunkId::root(i as u32)
        } else {
            parent.child(i as u32)
        };
        chunks.push(Chunk {
            id,
            ranges,
            previous_root_key: if i == 0 {
                first_previous_key.clone()
            } else {
                slices[i - 1].last_key.clone()
            },
            last_root_key: slice.last_key.clone(),
        });
    }

    chunks
}
