//! Logical record sources
//!
//! A logical record is one root row plus, for every secondary table, the rows
//! sharing its key. Tables are merged in key order, so every range is read once,
//! front to back. Secondary rows whose key matches no root row of the chunk are
//! consumed and counted as unmatched. A root row repeating the previous root key
//! is skipped with a warning; its secondary rows joined the first one.

use super::{extract_key, CompiledSchema, DatabaseSpec, JoinKey, Record, TableStream};
use crate::chunk::Chunk;
use crate::error::TaskError;
use crate::Result;
use std::cmp::Ordering;
use std::sync::Arc;

/// Root row with its joined secondary rows
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalRecord {
    pub root: Record,
    /// Joined rows per secondary table, in table order (excluding the root)
    pub secondary: Vec<Vec<Record>>,
    /// Join key of the root row; `None` for single-table databases
    pub key: Option<JoinKey>,
}

/// Reader of logical records over a chunk
pub trait RecordSource: Send {
    /// Position every table stream on its range of `chunk`
    fn open_for_read(&mut self, chunk: &Chunk) -> Result<()>;

    /// Last root key read before the current chunk
    fn set_last_read_join_key(&mut self, key: Option<JoinKey>);

    /// Next logical record, `None` at the end of the chunk
    fn read_next_logical_record(&mut self) -> Result<Option<LogicalRecord>>;

    /// Share of the root range consumed, in percent
    fn percent_read(&self) -> f64;

    /// Rows consumed per table since `open_for_read`
    fn records_read(&self) -> Vec<u64>;

    /// Secondary rows that joined no root row
    fn unmatched(&self) -> u64;

    /// Root rows skipped for repeating the previous root key
    fn duplicates(&self) -> u64;

    fn close(&mut self) -> Result<()>;
}

/// Key-ordered merge of the root table with its secondary tables
pub struct JoinedSource {
    database: Arc<DatabaseSpec>,
    schema: Arc<CompiledSchema>,
    buffer_sizes: Vec<usize>,
    streams: Vec<TableStream>,
    /// Row read ahead per table (index 0 unused)
    lookahead: Vec<Option<(JoinKey, Record)>>,
    last_root_key: Option<JoinKey>,
    last_secondary_keys: Vec<Option<JoinKey>>,
    unmatched: u64,
    duplicates: u64,
    drained: bool,
}

impl JoinedSource {
    pub fn new(database: Arc<DatabaseSpec>, schema: Arc<CompiledSchema>, buffer_sizes: Vec<usize>) -> Self {
        let tables = database.tables.len();
        Self {
            database,
            schema,
            buffer_sizes,
            streams: Vec::new(),
            lookahead: vec![None; tables],
            last_root_key: None,
            last_secondary_keys: vec![None; tables],
            unmatched: 0,
            duplicates: 0,
            drained: false,
        }
    }

    fn key_of(&self, table: usize, record: &Record) -> Result<JoinKey> {
        extract_key(&record.fields, &self.schema.tables[table].key_indexes).map_err(|missing| {
            TaskError::RecordRead {
                table: self.schema.tables[table].name.clone(),
                offset: record.offset,
                message: format!("key field in column {} is missing", missing + 1),
            }
            .into()
        })
    }

    /// Next row of a secondary table, checking key order
    fn next_secondary(&mut self, table: usize) -> Result<Option<(JoinKey, Record)>> {
        if let Some(row) = self.lookahead[table].take() {
            return Ok(Some(row));
        }
        let Some(record) = self.streams[table].next_record()? else {
            return Ok(None);
        };
        let key = self.key_of(table, &record)?;
        if let Some(previous) = &self.last_secondary_keys[table] {
            if key < *previous {
                return Err(TaskError::RecordRead {
                    table: self.schema.tables[table].name.clone(),
                    offset: record.offset,
                    message: format!("key {:?} is lower than the previous key {:?}", key, previous),
                }
                .into());
            }
        }
        self.last_secondary_keys[table] = Some(key.clone());
        Ok(Some((key, record)))
    }

    /// Consume what is left of the secondary ranges once the root is exhausted
    fn drain_secondary(&mut self) -> Result<()> {
        if self.drained {
            return Ok(());
        }
        for table in 1..self.streams.len() {
            while self.next_secondary(table)?.is_some() {
                self.unmatched += 1;
            }
        }
        self.drained = true;
        Ok(())
    }
}

impl RecordSource for JoinedSource {
    fn open_for_read(&mut self, chunk: &Chunk) -> Result<()> {
        if chunk.ranges.len() != self.database.tables.len() {
            return Err(TaskError::Protocol(format!(
                "chunk {} has {} table ranges, database has {} tables",
                chunk.id,
                chunk.ranges.len(),
                self.database.tables.len()
            ))
            .into());
        }

        self.streams.clear();
        for (index, (table, range)) in self.database.tables.iter().zip(&chunk.ranges).enumerate() {
            let buffer = self.buffer_sizes.get(index).copied().unwrap_or(64 * 1024);
            self.streams.push(TableStream::open(
                &table.name,
                &table.path,
                range,
                self.database.header,
                self.database.separator,
                buffer,
            )?);
        }

        self.lookahead.iter_mut().for_each(|row| *row = None);
        self.last_secondary_keys.iter_mut().for_each(|key| *key = None);
        self.last_root_key = None;
        self.unmatched = 0;
        self.duplicates = 0;
        self.drained = false;
        Ok(())
    }

    fn set_last_read_join_key(&mut self, key: Option<JoinKey>) {
        self.last_root_key = key;
    }

    fn read_next_logical_record(&mut self) -> Result<Option<LogicalRecord>> {
        let (root, key) = loop {
            let Some(root) = self.streams.first_mut().map(|s| s.next_record()).transpose()?.flatten() else {
                self.drain_secondary()?;
                return Ok(None);
            };

            if !self.database.is_multi_table() {
                return Ok(Some(LogicalRecord { root, secondary: Vec::new(), key: None }));
            }

            let key = self.key_of(0, &root)?;
            if let Some(previous) = &self.last_root_key {
                match key.cmp(previous) {
                    Ordering::Less => {
                        return Err(TaskError::RecordRead {
                            table: self.schema.root().name.clone(),
                            offset: root.offset,
                            message: format!("root key {:?} is lower than the previous key {:?}", key, previous),
                        }
                        .into());
                    }
                    Ordering::Equal => {
                        tracing::warn!(
                            table = %self.schema.root().name,
                            offset = root.offset,
                            ?key,
                            "ignored record, duplicate root key"
                        );
                        self.duplicates += 1;
                        continue;
                    }
                    Ordering::Greater => {}
                }
            }
            break (root, key);
        };
        self.last_root_key = Some(key.clone());

        let mut secondary = Vec::with_capacity(self.streams.len() - 1);
        for table in 1..self.streams.len() {
            let mut rows = Vec::new();
            while let Some((row_key, record)) = self.next_secondary(table)? {
                match row_key.cmp(&key) {
                    Ordering::Less => self.unmatched += 1,
                    Ordering::Equal => rows.push(record),
                    Ordering::Greater => {
                        self.lookahead[table] = Some((row_key, record));
                        break;
                    }
                }
            }
            secondary.push(rows);
        }

        Ok(Some(LogicalRecord { root, secondary, key: Some(key) }))
    }

    fn percent_read(&self) -> f64 {
        self.streams.first().map(TableStream::percent_read).unwrap_or(0.0)
    }

    fn records_read(&self) -> Vec<u64> {
        self.streams.iter().map(TableStream::records).collect()
    }

    fn unmatched(&self) -> u64 {
        self.unmatched
    }

    fn duplicates(&self) -> u64 {
        self.duplicates
    }

    fn close(&mut self) -> Result<()> {
        self.streams.clear();
        self.lookahead.iter_mut().for_each(|row| *row = None);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{ChunkId, TableRange};
    use crate::database::{Schema, TableSpec};
    use std::path::Path;

    fn write(dir: &Path, name: &str, contents: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn setup(root: &str, detail: &str) -> (tempfile::TempDir, JoinedSource, Chunk) {
        let dir = tempfile::tempdir().unwrap();
        let root_path = write(dir.path(), "root.txt", root);
        let detail_path = write(dir.path(), "detail.txt", detail);
        let db = DatabaseSpec {
            tables: vec![
                TableSpec { name: "root".into(), path: root_path, key_fields: vec!["id".into()] },
                TableSpec { name: "detail".into(), path: detail_path, key_fields: vec!["id".into()] },
            ],
            separator: '\t',
            header: true,
        };
        let schema = Schema::discover(&db).unwrap().compile().unwrap();
        let chunk = Chunk {
            id: ChunkId::root(0),
            ranges: vec![
                TableRange { begin: 0, end: root.len() as u64, previous_record_index: 0, records: 0 },
                TableRange { begin: 0, end: detail.len() as u64, previous_record_index: 0, records: 0 },
            ],
            previous_root_key: None,
            last_root_key: None,
        };
        let source = JoinedSource::new(Arc::new(db), Arc::new(schema), vec![4096, 4096]);
        (dir, source, chunk)
    }

    #[test]
    fn test_join_groups_secondary_rows() {
        let (_dir, mut source, chunk) = setup(
            "id\tname\na\tx\nb\ty\nc\tz\n",
            "id\tv\n0\torphan\na\t1\na\t2\nc\t3\nd\tlate\n",
        );
        source.open_for_read(&chunk).unwrap();

        let a = source.read_next_logical_record().unwrap().unwrap();
        assert_eq!(a.key, Some(vec!["a".to_string()]));
        assert_eq!(a.secondary[0].len(), 2);

        let b = source.read_next_logical_record().unwrap().unwrap();
        assert!(b.secondary[0].is_empty());

        let c = source.read_next_logical_record().unwrap().unwrap();
        assert_eq!(c.secondary[0][0].fields, vec!["c", "3"]);

        assert!(source.read_next_logical_record().unwrap().is_none());
        assert_eq!(source.records_read(), vec![3, 5]);
        assert_eq!(source.unmatched(), 2);
        source.close().unwrap();
    }

    #[test]
    fn test_unsorted_root_is_read_error() {
        let (_dir, mut source, chunk) = setup("id\nb\na\n", "id\nb\n");
        source.open_for_read(&chunk).unwrap();

        source.read_next_logical_record().unwrap();
        let err = source.read_next_logical_record().unwrap_err();
        assert!(matches!(err.downcast_ref::<TaskError>(), Some(TaskError::RecordRead { .. })));
    }

    #[test]
    fn test_unsorted_secondary_is_read_error() {
        let (_dir, mut source, chunk) = setup("id\nz\n", "id\nb\na\n");
        source.open_for_read(&chunk).unwrap();
        assert!(source.read_next_logical_record().is_err());
    }

    #[test]
    fn test_previous_key_rejects_stale_root() {
        let (_dir, mut source, chunk) = setup("id\nb\nc\n", "id\nc\n");
        source.open_for_read(&chunk).unwrap();
        source.set_last_read_join_key(Some(vec!["bb".to_string()]));
        assert!(source.read_next_logical_record().is_err());
    }

    #[test]
    fn test_duplicate_root_rows_are_skipped() {
        let (_dir, mut source, chunk) = setup(
            "id\tname\na\tx\na\ty\na\tz\nb\tw\n",
            "id\tv\na\t1\na\t2\nb\t3\n",
        );
        source.open_for_read(&chunk).unwrap();

        let a = source.read_next_logical_record().unwrap().unwrap();
        assert_eq!(a.root.fields, vec!["a", "x"]);
        assert_eq!(a.secondary[0].len(), 2);

        let b = source.read_next_logical_record().unwrap().unwrap();
        assert_eq!(b.key, Some(vec!["b".to_string()]));
        assert_eq!(b.secondary[0].len(), 1);

        assert!(source.read_next_logical_record().unwrap().is_none());
        assert_eq!(source.records_read(), vec![4, 3]);
        assert_eq!(source.duplicates(), 2);
        assert_eq!(source.unmatched(), 0);
    }

    #[test]
    fn test_previous_key_makes_old_secondary_rows_unmatched() {
        let (_dir, mut source, chunk) = setup("id\nc\n", "id\na\nc\n");
        source.open_for_read(&chunk).unwrap();
        source.set_last_read_join_key(Some(vec!["b".to_string()]));

        let c = source.read_next_logical_record().unwrap().unwrap();
        assert_eq!(c.secondary[0].len(), 1);
        assert!(source.read_next_logical_record().unwrap().is_none());
        assert_eq!(source.unmatched(), 1);
    }
}
