//! Task hooks
//!
//! A concrete task is a [`DatabaseTask`]: a set of hooks called by the
//! coordinator (requirements, init, input preparation, aggregation, finalize)
//! and by each worker (init, per-chunk start/stop, per-record processing,
//! finalize). Every hook except [`DatabaseTask::process_record`] has a default,
//! so a task overrides only what it needs.
//!
//! Tasks are created by name from a [`TaskRegistry`]. The coordinator and every
//! worker hold their own instance; they communicate only through the
//! SharedSpecification and the opaque per-chunk payloads.

pub mod builtin;
pub mod registry;
pub mod shared;

pub use registry::{TaskFactory, TaskRegistry};
pub use shared::{RebalanceSettings, SharedSpecification};

use crate::chunk::{Chunk, ChunkId, ChunkPlan, ChunkVolume};
use crate::database::{CompiledSchema, DatabaseProfile, LogicalRecord};
use crate::resource::TaskRequirement;
use crate::stats::RunningTotals;
use crate::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Answer of [`DatabaseTask::prepare_input`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Preparation {
    /// Dispatch this chunk
    Unit(Chunk),
    /// No more input for now
    Done,
    /// Ask the requesting worker to wait
    Park,
}

/// What a worker knows while running task hooks
pub struct WorkerContext {
    pub worker_id: usize,
    pub shared: Arc<SharedSpecification>,
    pub schema: Arc<CompiledSchema>,
    /// Memory left to the task once the record source is paid for
    pub task_memory: u64,
    temp_files: Vec<PathBuf>,
}

impl WorkerContext {
    pub fn new(worker_id: usize, shared: Arc<SharedSpecification>, schema: Arc<CompiledSchema>, task_memory: u64) -> Self {
        Self {
            worker_id,
            shared,
            schema,
            task_memory,
            temp_files: Vec::new(),
        }
    }

    pub fn temp_dir(&self) -> &Path {
        &self.shared.temp_dir
    }

    /// Track a file to delete if the run fails
    pub fn register_temp_file(&mut self, path: PathBuf) {
        self.temp_files.push(path);
    }

    pub fn temp_files(&self) -> &[PathBuf] {
        &self.temp_files
    }

    /// Delete every registered file, returning how many were still present
    pub fn remove_temp_files(&mut self) -> usize {
        let mut removed = 0;
        for path in self.temp_files.drain(..) {
            match std::fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to remove temporary file"),
            }
        }
        removed
    }
}

/// Hook set of a task
#[allow(unused_variables)]
pub trait DatabaseTask: Send {
    fn name(&self) -> &str;

    /// Add the task's own needs to the requirement table
    ///
    /// The record source cost is already in `req.worker` when this runs.
    fn compute_resource_requirements(&self, profile: &DatabaseProfile, req: &mut TaskRequirement) -> Result<()> {
        Ok(())
    }

    fn master_init(&mut self, shared: &SharedSpecification) -> Result<()> {
        Ok(())
    }

    /// Pick the next unit of work for an idle worker
    fn prepare_input(&mut self, plan: &mut ChunkPlan) -> Result<Preparation> {
        Ok(plan.pop_next().map_or(Preparation::Done, Preparation::Unit))
    }

    /// Merge the payload a worker produced for `chunk`
    fn aggregate(&mut self, worker: usize, chunk: &ChunkId, payload: &[u8]) -> Result<()> {
        Ok(())
    }

    /// Called once on the coordinator, also when the run failed
    fn master_finalize(&mut self, ok: bool, totals: &RunningTotals) -> Result<()> {
        Ok(())
    }

    /// Task-specific results for the run summary
    fn summary(&self) -> serde_json::Value {
        serde_json::Value::Null
    }

    fn worker_init(&mut self, ctx: &mut WorkerContext) -> Result<()> {
        Ok(())
    }

    fn start_chunk(&mut self, ctx: &mut WorkerContext, chunk: &Chunk) -> Result<()> {
        Ok(())
    }

    fn process_record(&mut self, ctx: &mut WorkerContext, record: &LogicalRecord) -> Result<()>;

    /// Close the chunk and package its payload; always called after a start
    fn stop_chunk(&mut self, ctx: &mut WorkerContext, ok: bool) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    fn worker_finalize(&mut self, ctx: &mut WorkerContext, ok: bool) -> Result<()> {
        Ok(())
    }

    /// Task memory needed to process a chunk of this exact volume
    ///
    /// Must not decrease when the volume grows. Defaults to the chunk's bytes
    /// over every table.
    fn chunk_memory(&self, volume: &ChunkVolume) -> u64 {
        volume.total_bytes()
    }
}
