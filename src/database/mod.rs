//! Database description and record access
//!
//! A database is one root table, optionally followed by secondary tables that
//! join to it on a key. Every table is a delimited text file sorted by its key:
//! strictly increasing in the root table, non-decreasing in secondary tables.
//! Keys compare field by field as strings.

pub mod artificial;
pub mod schema;
pub mod source;
pub mod stream;

pub use schema::{CompiledSchema, Schema};
pub use source::{JoinedSource, LogicalRecord, RecordSource};
pub use stream::{LineReader, Record, TableStream};

use crate::error::TaskError;
use crate::resource::{ResourceRange, KIB, MIB};
use crate::Result;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Join key of a record: the values of the key fields in order
pub type JoinKey = Vec<String>;

/// Smallest read buffer a table stream is given
pub const MIN_STREAM_BUFFER: u64 = 64 * KIB;
/// Largest read buffer a table stream is given
pub const MAX_STREAM_BUFFER: u64 = 8 * MIB;
/// Bookkeeping cost of one loaded field
const FIELD_OVERHEAD: u64 = 48;
/// Lines sampled per table when estimating record size
const PROFILE_SAMPLE_LINES: usize = 256;

/// One table file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSpec {
    pub name: String,
    pub path: PathBuf,
    /// Join key fields, required for every table of a multi-table database
    #[serde(default)]
    pub key_fields: Vec<String>,
}

/// Database description: root table first
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseSpec {
    pub tables: Vec<TableSpec>,
    #[serde(default = "default_separator")]
    pub separator: char,
    /// First line of every file names the columns
    #[serde(default = "default_header")]
    pub header: bool,
}

fn default_separator() -> char {
    '\t'
}

fn default_header() -> bool {
    true
}

impl DatabaseSpec {
    /// Single-table database
    pub fn single(name: &str, path: impl Into<PathBuf>) -> Self {
        Self {
            tables: vec![TableSpec {
                name: name.to_string(),
                path: path.into(),
                key_fields: Vec::new(),
            }],
            separator: default_separator(),
            header: default_header(),
        }
    }

    /// Root table; the description must have been validated
    pub fn root(&self) -> &TableSpec {
        &self.tables[0]
    }

    pub fn is_multi_table(&self) -> bool {
        self.tables.len() > 1
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.iter().map(|t| t.name.clone()).collect()
    }

    /// Structural checks that do not touch the files
    pub fn validate(&self) -> Result<()> {
        if self.tables.is_empty() {
            return Err(TaskError::InvalidDatabase("no tables declared".into()).into());
        }
        if self.separator == '\n' || self.separator == '\r' {
            return Err(TaskError::InvalidDatabase("separator cannot be a line terminator".into()).into());
        }

        let mut names = HashSet::new();
        for table in &self.tables {
            if table.name.is_empty() {
                return Err(TaskError::InvalidDatabase("table with an empty name".into()).into());
            }
            if !names.insert(table.name.as_str()) {
                return Err(TaskError::InvalidDatabase(format!("duplicate table name '{}'", table.name)).into());
            }
        }

        if self.is_multi_table() {
            let arity = self.root().key_fields.len();
            if arity == 0 {
                return Err(TaskError::InvalidDatabase(format!(
                    "root table '{}' needs key fields to join secondary tables",
                    self.root().name
                ))
                .into());
            }
            for table in &self.tables[1..] {
                if table.key_fields.len() != arity {
                    return Err(TaskError::InvalidDatabase(format!(
                        "table '{}' has {} key fields, root table has {}",
                        table.name,
                        table.key_fields.len(),
                        arity
                    ))
                    .into());
                }
            }
        }

        Ok(())
    }

    /// Checks that need the files to exist
    pub fn check_files(&self) -> Result<()> {
        for table in &self.tables {
            let meta = std::fs::metadata(&table.path).with_context(|| {
                format!("Cannot access table '{}' at {}", table.name, table.path.display())
            })?;
            if !meta.is_file() {
                return Err(TaskError::InvalidDatabase(format!(
                    "table '{}' path {} is not a regular file",
                    table.name,
                    table.path.display()
                ))
                .into());
            }
        }
        Ok(())
    }

    pub fn table_path(&self, index: usize) -> &Path {
        &self.tables[index].path
    }
}

/// Size and shape measurements used to price opening the record source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseProfile {
    pub tables: Vec<TableProfile>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableProfile {
    pub name: String,
    pub file_bytes: u64,
    /// Columns in the file
    pub width: usize,
    /// Columns kept in memory per record
    pub loaded_width: usize,
    /// Mean bytes per record over the sample
    pub record_bytes: u64,
}

impl TableProfile {
    pub fn estimated_records(&self) -> u64 {
        self.file_bytes / self.record_bytes.max(1)
    }
}

impl DatabaseProfile {
    /// Measure file sizes and sample record sizes
    pub fn measure(db: &DatabaseSpec, schema: &CompiledSchema) -> Result<Self> {
        let mut tables = Vec::with_capacity(db.tables.len());

        for (index, table) in db.tables.iter().enumerate() {
            let file_bytes = std::fs::metadata(&table.path)
                .with_context(|| format!("Cannot stat {}", table.path.display()))?
                .len();

            let mut reader = LineReader::open(&table.path, 0, file_bytes, MIN_STREAM_BUFFER as usize)?;
            if db.header {
                reader.skip_line()?;
            }
            let mut sampled = 0u64;
            let mut bytes = 0u64;
            while sampled < PROFILE_SAMPLE_LINES as u64 {
                match reader.next_line()? {
                    Some(_) => {
                        sampled += 1;
                        bytes += reader.line().len() as u64 + 1;
                    }
                    None => break,
                }
            }

            let compiled = &schema.tables[index];
            tables.push(TableProfile {
                name: table.name.clone(),
                file_bytes,
                width: compiled.width,
                loaded_width: compiled.loaded.len(),
                record_bytes: if sampled == 0 { 1 } else { bytes.div_ceil(sampled) },
            });
        }

        Ok(Self { tables })
    }

    pub fn total_bytes(&self) -> u64 {
        self.tables.iter().map(|t| t.file_bytes).sum()
    }

    /// Memory needed by a worker to open the record source
    ///
    /// Each table costs a read buffer plus the working set of its current
    /// record; secondary tables hold every row joined to one root record, so
    /// their working set grows with the fan-out.
    pub fn open_cost(&self) -> ResourceRange {
        let root_records = self.tables.first().map(|t| t.estimated_records()).unwrap_or(0).max(1);
        let mut cost = ResourceRange::zero();

        for (index, table) in self.tables.iter().enumerate() {
            let fanout = if index == 0 {
                1
            } else {
                table.estimated_records().div_ceil(root_records).max(1)
            };
            let working_set =
                fanout * (2 * table.record_bytes + table.loaded_width as u64 * FIELD_OVERHEAD);
            let buffer_max = MAX_STREAM_BUFFER.min(table.file_bytes.max(MIN_STREAM_BUFFER));
            cost = cost.plus(&ResourceRange::new(
                MIN_STREAM_BUFFER + working_set,
                buffer_max + working_set,
            ));
        }

        cost
    }
}

/// Split a raw line into fields
pub fn split_fields(line: &str, separator: char) -> Vec<String> {
    line.split(separator).map(str::to_string).collect()
}

/// Key of a record, or the index of the first missing key field
pub fn extract_key(fields: &[String], key_indexes: &[usize]) -> std::result::Result<JoinKey, usize> {
    key_indexes
        .iter()
        .map(|&i| fields.get(i).cloned().ok_or(i))
        .collect()
}
