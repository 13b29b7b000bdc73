//! Tasks shipped with the crate
//!
//! `record-count` streams every logical record and counts rows per table.
//! `column-extract` copies selected root columns to an output file: each chunk
//! is written to its own temporary part file, and the coordinator concatenates
//! the parts in chunk id order when the run succeeds.

use super::{DatabaseTask, SharedSpecification, WorkerContext};
use crate::chunk::{Chunk, ChunkId, ChunkVolume};
use crate::database::{LogicalRecord, Schema};
use crate::stats::RunningTotals;
use crate::Result;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

/// Per-chunk counts produced by `record-count`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountPayload {
    /// Root records, then joined rows per secondary table
    pub records: Vec<u64>,
    /// Most secondary rows joined to one root record
    pub max_fanout: u64,
    /// Root records that joined no secondary row
    pub lonely_roots: u64,
}

impl CountPayload {
    fn merge(&mut self, other: &CountPayload) -> Result<()> {
        if self.records.len() < other.records.len() {
            self.records.resize(other.records.len(), 0);
        }
        for (total, value) in self.records.iter_mut().zip(&other.records) {
            *total = total.checked_add(*value).context("record count overflow")?;
        }
        self.max_fanout = self.max_fanout.max(other.max_fanout);
        self.lonely_roots = self
            .lonely_roots
            .checked_add(other.lonely_roots)
            .context("record count overflow")?;
        Ok(())
    }
}

/// Streaming record counter
#[derive(Debug, Default)]
pub struct RecordCount {
    tables: Vec<String>,
    current: CountPayload,
    totals: CountPayload,
    chunks: u64,
}

impl RecordCount {
    pub const NAME: &'static str = "record-count";

    pub fn from_params(_params: &Value) -> Result<Self> {
        Ok(Self::default())
    }

    pub fn totals(&self) -> &CountPayload {
        &self.totals
    }
}

impl DatabaseTask for RecordCount {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn master_init(&mut self, shared: &SharedSpecification) -> Result<()> {
        self.tables = shared.database.table_names();
        self.totals = CountPayload {
            records: vec![0; self.tables.len()],
            ..Default::default()
        };
        Ok(())
    }

    fn aggregate(&mut self, _worker: usize, _chunk: &ChunkId, payload: &[u8]) -> Result<()> {
        let counts: CountPayload = bincode::deserialize(payload).context("Malformed record-count payload")?;
        self.totals.merge(&counts)?;
        self.chunks += 1;
        Ok(())
    }

    fn summary(&self) -> Value {
        let tables: Vec<Value> = self
            .tables
            .iter()
            .zip(&self.totals.records)
            .map(|(name, records)| json!({ "name": name, "records": records }))
            .collect();
        json!({
            "tables": tables,
            "max_fanout": self.totals.max_fanout,
            "lonely_roots": self.totals.lonely_roots,
            "chunks": self.chunks,
        })
    }

    fn start_chunk(&mut self, ctx: &mut WorkerContext, _chunk: &Chunk) -> Result<()> {
        self.current = CountPayload {
            records: vec![0; ctx.schema.tables.len()],
            ..Default::default()
        };
        Ok(())
    }

    fn process_record(&mut self, _ctx: &mut WorkerContext, record: &LogicalRecord) -> Result<()> {
        self.current.records[0] += 1;

        let mut joined = 0u64;
        for (table, rows) in record.secondary.iter().enumerate() {
            self.current.records[table + 1] += rows.len() as u64;
            joined += rows.len() as u64;
        }
        self.current.max_fanout = self.current.max_fanout.max(joined);
        if !record.secondary.is_empty() && joined == 0 {
            self.current.lonely_roots += 1;
        }
        Ok(())
    }

    fn stop_chunk(&mut self, _ctx: &mut WorkerContext, _ok: bool) -> Result<Vec<u8>> {
        let counts = std::mem::take(&mut self.current);
        bincode::serialize(&counts).context("Failed to encode record-count payload")
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ExtractParams {
    output: PathBuf,
    #[serde(default)]
    columns: Vec<String>,
    #[serde(default = "default_true")]
    header: bool,
}

fn default_true() -> bool {
    true
}

/// Part file written for one chunk
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractPayload {
    pub file: Option<PathBuf>,
    pub rows: u64,
}

/// Root column extractor writing per-chunk part files
#[derive(Debug)]
pub struct ColumnExtract {
    params: ExtractParams,
    separator: char,
    // worker side
    selected: Vec<usize>,
    buffer: Vec<u8>,
    rows: u64,
    // coordinator side
    header_names: Vec<String>,
    parts: BTreeMap<ChunkId, PathBuf>,
    written_rows: u64,
}

impl ColumnExtract {
    pub const NAME: &'static str = "column-extract";

    pub fn from_params(params: &Value) -> Result<Self> {
        let params: ExtractParams = serde_json::from_value(params.clone())
            .context("column-extract needs an 'output' path and optional 'columns'")?;
        Ok(Self {
            params,
            separator: '\t',
            selected: Vec::new(),
            buffer: Vec::new(),
            rows: 0,
            header_names: Vec::new(),
            parts: BTreeMap::new(),
            written_rows: 0,
        })
    }

    fn remove_parts(&mut self) {
        for path in std::mem::take(&mut self.parts).into_values() {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %path.display(), error = %e, "failed to remove part file");
                }
            }
        }
    }

    fn assemble(&mut self) -> Result<u64> {
        let file = File::create(&self.params.output)
            .with_context(|| format!("Failed to create {}", self.params.output.display()))?;
        let mut writer = BufWriter::new(file);

        if self.params.header {
            writeln!(writer, "{}", self.header_names.join(&self.separator.to_string()))
                .context("Failed to write output header")?;
        }
        for path in self.parts.values() {
            let mut part = File::open(path).with_context(|| format!("Failed to open part {}", path.display()))?;
            std::io::copy(&mut part, &mut writer)
                .with_context(|| format!("Failed to append part {}", path.display()))?;
        }
        writer.flush().context("Failed to flush output")?;
        Ok(self.written_rows)
    }
}

impl DatabaseTask for ColumnExtract {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn master_init(&mut self, shared: &SharedSpecification) -> Result<()> {
        self.separator = shared.database.separator;
        let schema = Schema::load(&shared.schema_file)?.compile()?;
        let root = schema.root();
        self.header_names = if self.params.columns.is_empty() {
            root.loaded_names.clone()
        } else {
            for column in &self.params.columns {
                if root.index_of(column).is_none() {
                    anyhow::bail!("column '{}' is not loaded in table '{}'", column, root.name);
                }
            }
            self.params.columns.clone()
        };
        Ok(())
    }

    fn aggregate(&mut self, _worker: usize, chunk: &ChunkId, payload: &[u8]) -> Result<()> {
        let part: ExtractPayload = bincode::deserialize(payload).context("Malformed column-extract payload")?;
        self.written_rows += part.rows;
        if let Some(file) = part.file {
            self.parts.insert(chunk.clone(), file);
        }
        Ok(())
    }

    fn master_finalize(&mut self, ok: bool, _totals: &RunningTotals) -> Result<()> {
        if !ok {
            self.remove_parts();
            return Ok(());
        }

        let result = self.assemble();
        if result.is_err() {
            let _ = std::fs::remove_file(&self.params.output);
        }
        self.remove_parts();
        let rows = result?;
        tracing::info!(output = %self.params.output.display(), rows, "extract assembled");
        Ok(())
    }

    fn summary(&self) -> Value {
        json!({
            "output": self.params.output,
            "rows": self.written_rows,
            "columns": self.header_names,
        })
    }

    fn worker_init(&mut self, ctx: &mut WorkerContext) -> Result<()> {
        self.separator = ctx.shared.database.separator;
        let root = ctx.schema.root();
        self.selected = if self.params.columns.is_empty() {
            root.loaded.clone()
        } else {
            self.params
                .columns
                .iter()
                .map(|c| {
                    root.index_of(c)
                        .with_context(|| format!("column '{}' is not loaded in table '{}'", c, root.name))
                })
                .collect::<Result<Vec<_>>>()?
        };
        Ok(())
    }

    fn start_chunk(&mut self, _ctx: &mut WorkerContext, _chunk: &Chunk) -> Result<()> {
        self.buffer.clear();
        self.rows = 0;
        Ok(())
    }

    fn process_record(&mut self, _ctx: &mut WorkerContext, record: &LogicalRecord) -> Result<()> {
        for (i, &index) in self.selected.iter().enumerate() {
            if i > 0 {
                let mut sep = [0u8; 4];
                self.buffer.extend_from_slice(self.separator.encode_utf8(&mut sep).as_bytes());
            }
            self.buffer
                .extend_from_slice(record.root.field(index).unwrap_or_default().as_bytes());
        }
        self.buffer.push(b'\n');
        self.rows += 1;
        Ok(())
    }

    fn stop_chunk(&mut self, ctx: &mut WorkerContext, ok: bool) -> Result<Vec<u8>> {
        let buffer = std::mem::take(&mut self.buffer);
        if !ok {
            return Ok(Vec::new());
        }

        let mut payload = ExtractPayload { file: None, rows: self.rows };
        if !buffer.is_empty() {
            let mut part = tempfile::Builder::new()
                .prefix(&format!("partask-{}-", ctx.shared.run_id))
                .suffix(".part")
                .tempfile_in(ctx.temp_dir())
                .with_context(|| format!("Failed to create part file in {}", ctx.temp_dir().display()))?;
            part.write_all(&buffer).context("Failed to write part file")?;
            let (_, path) = part.keep().map_err(|e| e.error).context("Failed to keep part file")?;
            ctx.register_temp_file(path.clone());
            payload.file = Some(path);
        }
        bincode::serialize(&payload).context("Failed to encode column-extract payload")
    }

    /// Rows are buffered for the whole chunk
    fn chunk_memory(&self, volume: &ChunkVolume) -> u64 {
        volume.bytes.first().copied().unwrap_or(0)
    }
}
