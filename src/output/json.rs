//! JSON output
//!
//! Two documents: the run report written after a job (the [`RunSummary`] plus
//! human-readable durations), and the chunk plan written by a dry run.

use crate::chunk::{ChunkPlan, TableRange};
use crate::coordinator::{PreparedRun, RunSummary};
use crate::resource::{HostResources, ResourceGrant};
use crate::Result;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

/// Duration with both microseconds and human-readable format
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonDuration {
    pub micros: u64,
    pub human: String,
}

impl JsonDuration {
    pub fn from_micros(micros: u64) -> Self {
        Self {
            micros,
            human: super::text::format_micros(micros),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonRunOutput<'a> {
    pub tool: &'static str,
    pub version: &'static str,
    pub elapsed: JsonDuration,
    pub chunk_p50: JsonDuration,
    pub chunk_p99: JsonDuration,
    #[serde(flatten)]
    pub summary: &'a RunSummary,
}

impl<'a> JsonRunOutput<'a> {
    pub fn new(summary: &'a RunSummary) -> Self {
        Self {
            tool: env!("CARGO_PKG_NAME"),
            version: env!("CARGO_PKG_VERSION"),
            elapsed: JsonDuration::from_micros((summary.elapsed_secs * 1_000_000.0) as u64),
            chunk_p50: JsonDuration::from_micros(summary.timings.p50_us),
            chunk_p99: JsonDuration::from_micros(summary.timings.p99_us),
            summary,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonTable {
    pub name: String,
    pub records: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonChunk {
    pub id: String,
    pub bytes: u64,
    pub ranges: Vec<TableRange>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonPlan {
    pub host: HostResources,
    pub grant: ResourceGrant,
    pub task_memory: u64,
    pub tables: Vec<JsonTable>,
    pub chunks: Vec<JsonChunk>,
}

impl JsonPlan {
    pub fn new(prepared: &PreparedRun) -> Self {
        let (_, task_memory) = prepared.budget.split_memory();
        Self {
            host: prepared.host,
            grant: prepared.grant,
            task_memory,
            tables: tables(&prepared.plan),
            chunks: prepared
                .plan
                .iter()
                .map(|chunk| JsonChunk {
                    id: chunk.id.to_string(),
                    bytes: chunk.bytes(),
                    ranges: chunk.ranges.clone(),
                })
                .collect(),
        }
    }
}

fn tables(plan: &ChunkPlan) -> Vec<JsonTable> {
    plan.table_names()
        .iter()
        .zip(plan.table_records())
        .zip(plan.table_bytes())
        .map(|((name, records), bytes)| JsonTable {
            name: name.clone(),
            records: *records,
            bytes: *bytes,
        })
        .collect()
}

/// Write the run report to `output_path`
pub fn write_json_output(output_path: &Path, summary: &RunSummary, pretty: bool) -> Result<()> {
    write_document(output_path, &JsonRunOutput::new(summary), pretty)
}

/// Write a dry-run chunk plan to `output_path`
pub fn write_plan_output(output_path: &Path, prepared: &PreparedRun, pretty: bool) -> Result<()> {
    write_document(output_path, &JsonPlan::new(prepared), pretty)
}

fn write_document<T: Serialize>(output_path: &Path, document: &T, pretty: bool) -> Result<()> {
    let file = File::create(output_path)
        .with_context(|| format!("Failed to create JSON output {}", output_path.display()))?;
    let writer = BufWriter::new(file);

    if pretty {
        serde_json::to_writer_pretty(writer, document)?;
    } else {
        serde_json::to_writer(writer, document)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::{Coordinator, JobSpec};
    use crate::database::artificial::ArtificialDataset;
    use crate::task::TaskRegistry;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_run_report_round_trips_as_json() {
        let dir = tempfile::tempdir().unwrap();
        let db = ArtificialDataset { root_records: 120, ..Default::default() }
            .generate(&dir.path().join("db"))
            .unwrap();
        let job = JobSpec::new(db, "record-count", dir.path().to_path_buf());
        let summary = Coordinator::new(TaskRegistry::with_builtin(), Arc::new(AtomicBool::new(false)))
            .run_simulated(&job, 2)
            .await;

        let path = dir.path().join("report.json");
        write_json_output(&path, &summary, true).unwrap();
        let value: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();

        assert_eq!(value["tool"], "partask");
        assert_eq!(value["outcome"], "completed");
        assert_eq!(value["totals"]["records"][0], 120);
        assert!(value["elapsed"]["human"].is_string());
    }

    #[test]
    fn test_plan_lists_every_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let db = ArtificialDataset { root_records: 1000, ..Default::default() }
            .generate(&dir.path().join("db"))
            .unwrap();
        let mut job = JobSpec::new(db, "record-count", dir.path().to_path_buf());
        job.indexer.max_chunk_records = Some(250);

        let coordinator = Coordinator::new(TaskRegistry::with_builtin(), Arc::new(AtomicBool::new(false)));
        let (_, prepared) = coordinator.prepare(&job, 4).unwrap();
        let plan = JsonPlan::new(&prepared);

        assert_eq!(plan.chunks.len(), 4);
        assert_eq!(plan.tables[0].records, 1000);
        let root_records: u64 = plan.chunks.iter().map(|c| c.ranges[0].records).sum();
        assert_eq!(root_records, 1000);
        prepared.release().unwrap();
    }
}
