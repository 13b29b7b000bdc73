//! Worker lifecycle
//!
//! A worker reacts to coordinator directives:
//!
//! - **Init**: load and compile the staged schema, divide the memory grant
//!   between the record source and the task, size the table stream buffers,
//!   create the task and call its worker init hook.
//! - **Process**: check whether the chunk must be split (rebalancing); if not,
//!   open the record source on the chunk ranges, stream every logical record
//!   through the task, and always close the chunk, packaging the payload.
//! - **Park**: nothing to do until the next directive.
//! - **Shutdown**: call the task's finalize hook; when the run failed, delete
//!   every temporary file the task registered.
//!
//! Failures never escape the driver: they are reported as `ok = false` plus a
//! message, and the worker waits for the next directive.
//!
//! The driver is transport independent. Local threads, the simulated pool and
//! the remote node service all feed it directives and forward its reports.

use crate::chunk::{Chunk, ChunkId};
use crate::database::{
    CompiledSchema, DatabaseSpec, JoinedSource, RecordSource, Schema, MAX_STREAM_BUFFER, MIN_STREAM_BUFFER,
};
use crate::error::{classify, Outcome, TaskError};
use crate::indexer;
use crate::resource::{ResourceRange, WorkerBudget};
use crate::task::{DatabaseTask, SharedSpecification, TaskRegistry, WorkerContext};
use crate::Result;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Coordinator to worker message
#[derive(Debug, Clone)]
pub enum Directive {
    Init {
        shared: Arc<SharedSpecification>,
        budget: WorkerBudget,
    },
    Process(Chunk),
    Park,
    Shutdown {
        ok: bool,
    },
}

/// Outcome of one processed chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkResult {
    pub chunk: ChunkId,
    /// Records read per table
    pub records: Vec<u64>,
    pub bytes: u64,
    pub unmatched: u64,
    /// Root rows skipped for repeating a root key
    pub duplicates: u64,
    /// Opaque task payload
    pub payload: Vec<u8>,
    pub elapsed_us: u64,
}

/// Worker to coordinator message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Report {
    Ready,
    InitFailed {
        message: String,
    },
    ChunkDone(ChunkResult),
    /// The chunk was too large; these pieces replace it
    ChunkSplit {
        parent: ChunkId,
        pieces: Vec<Chunk>,
    },
    ChunkFailed {
        chunk: ChunkId,
        message: String,
        interrupted: bool,
    },
    Finalized {
        ok: bool,
        message: Option<String>,
    },
}

/// Private state of an initialised worker
struct WorkerState {
    task: Box<dyn DatabaseTask>,
    ctx: WorkerContext,
    source: JoinedSource,
    database: Arc<DatabaseSpec>,
    schema: Arc<CompiledSchema>,
    chunks: u64,
}

/// Directive handler of one worker
pub struct WorkerDriver {
    id: usize,
    registry: TaskRegistry,
    cancel: Arc<AtomicBool>,
    state: Option<WorkerState>,
}

impl WorkerDriver {
    pub fn new(id: usize, registry: TaskRegistry, cancel: Arc<AtomicBool>) -> Self {
        Self {
            id,
            registry,
            cancel,
            state: None,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Handle one directive; `None` when the directive expects no reply
    pub fn handle(&mut self, directive: Directive) -> Option<Report> {
        match directive {
            Directive::Init { shared, budget } => Some(match self.init(shared, budget) {
                Ok(()) => Report::Ready,
                Err(e) => {
                    tracing::error!(worker = self.id, error = %format!("{:#}", e), "worker init failed");
                    Report::InitFailed {
                        message: format!("{:#}", e),
                    }
                }
            }),
            Directive::Process(chunk) => Some(self.process(chunk)),
            Directive::Park => {
                tracing::trace!(worker = self.id, "parked");
                None
            }
            Directive::Shutdown { ok } => Some(self.finalize(ok)),
        }
    }

    fn init(&mut self, shared: Arc<SharedSpecification>, budget: WorkerBudget) -> Result<()> {
        let schema = Arc::new(
            Schema::load(&shared.schema_file)
                .and_then(|s| s.compile())
                .context("Failed to load the staged schema")?,
        );
        let database = Arc::new(shared.database.clone());

        let (source_memory, task_memory) = budget.split_memory();
        let buffers = stream_buffers(&database, budget.source_memory, source_memory)?;
        tracing::debug!(
            worker = self.id,
            source_memory,
            task_memory,
            ?buffers,
            "worker budget"
        );

        let mut task = self.registry.create(&shared.task_name, &shared.params)?;
        let mut ctx = WorkerContext::new(self.id, shared, schema.clone(), task_memory);
        task.worker_init(&mut ctx).map_err(hook_error("worker_init"))?;

        self.state = Some(WorkerState {
            task,
            ctx,
            source: JoinedSource::new(database.clone(), schema.clone(), buffers),
            database,
            schema,
            chunks: 0,
        });
        Ok(())
    }

    fn process(&mut self, chunk: Chunk) -> Report {
        let id = chunk.id.clone();
        let Some(state) = self.state.as_mut() else {
            return Report::ChunkFailed {
                chunk: id,
                message: TaskError::Protocol("chunk received before init".to_string()).to_string(),
                interrupted: false,
            };
        };

        if self.cancel.load(Ordering::Relaxed) {
            return failed(id, &TaskError::UserInterruption.into());
        }

        match rebalance(state, &chunk) {
            Ok(Some(pieces)) => {
                tracing::info!(
                    worker = self.id,
                    chunk = %id,
                    pieces = pieces.len(),
                    "chunk split"
                );
                return Report::ChunkSplit { parent: id, pieces };
            }
            Ok(None) => {}
            Err(e) => return failed(id, &e),
        }

        let started = Instant::now();
        match run_chunk(state, &chunk, &self.cancel) {
            Ok(output) => {
                state.chunks += 1;
                let elapsed_us = started.elapsed().as_micros() as u64;
                tracing::debug!(worker = self.id, chunk = %id, records = ?output.records, elapsed_us, "chunk done");
                Report::ChunkDone(ChunkResult {
                    chunk: id,
                    records: output.records,
                    bytes: chunk.bytes(),
                    unmatched: output.unmatched,
                    duplicates: output.duplicates,
                    payload: output.payload,
                    elapsed_us,
                })
            }
            Err(e) => {
                tracing::warn!(worker = self.id, chunk = %id, error = %format!("{:#}", e), "chunk failed");
                failed(id, &e)
            }
        }
    }

    fn finalize(&mut self, ok: bool) -> Report {
        let Some(mut state) = self.state.take() else {
            return Report::Finalized { ok, message: None };
        };

        let _ = state.source.close();
        let result = state
            .task
            .worker_finalize(&mut state.ctx, ok)
            .map_err(hook_error("worker_finalize"));
        let ok = ok && result.is_ok();

        if !ok {
            let removed = state.ctx.remove_temp_files();
            tracing::debug!(worker = self.id, removed, "temporary files removed");
        }
        tracing::debug!(worker = self.id, chunks = state.chunks, ok, "worker finalized");

        Report::Finalized {
            ok,
            message: result.err().map(|e| format!("{:#}", e)),
        }
    }
}

fn failed(chunk: ChunkId, err: &anyhow::Error) -> Report {
    Report::ChunkFailed {
        chunk,
        message: format!("{:#}", err),
        interrupted: classify(err) == Outcome::Interrupted,
    }
}

/// Wrap a task hook error, letting interruptions through unchanged
fn hook_error(hook: &'static str) -> impl Fn(anyhow::Error) -> anyhow::Error {
    move |e| {
        if classify(&e) == Outcome::Interrupted {
            e
        } else {
            TaskError::hook(hook, &e).into()
        }
    }
}

/// Read buffer per table: each buffer range sits at the ratio the source grant
/// reaches inside the source requirement
fn stream_buffers(db: &DatabaseSpec, requirement: ResourceRange, granted: u64) -> Result<Vec<usize>> {
    let ratio = requirement.ratio_of(granted);
    db.tables
        .iter()
        .map(|table| {
            let len = std::fs::metadata(&table.path)
                .with_context(|| format!("Cannot stat {}", table.path.display()))?
                .len();
            let range = ResourceRange::new(MIN_STREAM_BUFFER, MAX_STREAM_BUFFER.min(len.max(MIN_STREAM_BUFFER)));
            Ok(range.at(ratio) as usize)
        })
        .collect()
}

/// Pieces replacing `chunk`, or `None` when it can be processed as is
fn rebalance(state: &WorkerState, chunk: &Chunk) -> Result<Option<Vec<Chunk>>> {
    let settings = &state.ctx.shared.rebalance;
    if chunk.root_records() <= 1 {
        return Ok(None);
    }

    let mut pieces = 1u64;
    if let Some(limit) = settings.force_split_above_records {
        if chunk.root_records() > limit {
            pieces = 2;
        }
    }
    if settings.enabled {
        let cost = state.task.chunk_memory(&chunk.volume());
        let budget = state.ctx.task_memory.max(1);
        if cost > budget {
            pieces = pieces.max(cost.div_ceil(budget));
        }
    }
    if pieces <= 1 {
        return Ok(None);
    }

    let split = indexer::split_chunk(&state.database, &state.schema, chunk, pieces as usize)?;
    Ok((split.len() > 1).then_some(split))
}

/// What reading a chunk through the task produced
struct ChunkOutput {
    records: Vec<u64>,
    unmatched: u64,
    duplicates: u64,
    payload: Vec<u8>,
}

/// Start, exploit and stop one chunk
fn run_chunk(state: &mut WorkerState, chunk: &Chunk, cancel: &AtomicBool) -> Result<ChunkOutput> {
    let WorkerState { task, ctx, source, .. } = state;

    let started = source.open_for_read(chunk).and_then(|()| {
        source.set_last_read_join_key(chunk.previous_root_key.clone());
        task.start_chunk(ctx, chunk).map_err(hook_error("start_chunk"))
    });

    let exploited = started.and_then(|()| {
        loop {
            if cancel.load(Ordering::Relaxed) {
                return Err(TaskError::UserInterruption.into());
            }
            match source.read_next_logical_record()? {
                Some(record) => task
                    .process_record(ctx, &record)
                    .map_err(hook_error("process_record"))?,
                None => return Ok(()),
            }
        }
    });

    let payload = task
        .stop_chunk(ctx, exploited.is_ok())
        .map_err(hook_error("stop_chunk"));
    let records = source.records_read();
    let unmatched = source.unmatched();
    let duplicates = source.duplicates();
    let closed = source.close();

    exploited?;
    closed?;
    check_records(ctx.schema.as_ref(), chunk, &records)?;
    Ok(ChunkOutput {
        records,
        unmatched,
        duplicates,
        payload: payload?,
    })
}

/// Every table must deliver exactly the records the index counted
fn check_records(schema: &CompiledSchema, chunk: &Chunk, records: &[u64]) -> Result<()> {
    for (index, range) in chunk.ranges.iter().enumerate() {
        let actual = records.get(index).copied().unwrap_or(0);
        if actual != range.records {
            return Err(TaskError::TotalsMismatch {
                table: schema.tables[index].name.clone(),
                expected: range.records,
                actual,
            })
            .with_context(|| format!("chunk {}", chunk.id));
        }
    }
    Ok(())
}
