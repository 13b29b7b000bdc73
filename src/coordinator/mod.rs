//! Coordinator lifecycle
//!
//! `Init -> {PrepareInput, Dispatch, Aggregate}* -> Finalize`
//!
//! [`Coordinator::prepare`] covers the first half of Init: it discovers the
//! schema, prices the record source, negotiates a grant, indexes the database
//! into a chunk plan and freezes the [`SharedSpecification`]. The worker pool is
//! then sized from the grant and [`Coordinator::execute`] initialises every
//! worker and runs the request/reply loop:
//!
//! - every idle worker gets the task's answer to PrepareInput: a chunk, a park
//!   directive, or (when the input is exhausted while another worker is still
//!   busy) a park directive as well;
//! - every report is aggregated: results go to the running totals and the
//!   task's aggregate hook, split pieces go back to the front of the plan and
//!   wake the parked workers;
//! - the loop ends once no worker is working, and every worker, parked ones
//!   included, receives an explicit shutdown.
//!
//! Finalize checks per-table totals against the index, calls the task's master
//! finalize hook and deletes the staged schema file, whatever the outcome.

pub mod pool;

pub use pool::{InlinePool, ThreadPool, WorkerPool};

use crate::chunk::{Chunk, ChunkPlan};
use crate::database::{DatabaseProfile, DatabaseSpec, Schema};
use crate::error::{classify, is_interruption_message, Outcome, TaskError};
use crate::indexer::{self, IndexerSettings};
use crate::resource::{
    self, probe_host, AllocationPolicy, HostResources, ResourceGrant, ResourceLimits, ResourceRange, TaskRequirement,
    WorkerBudget,
};
use crate::stats::{ChunkTimings, RunningTotals, TimingSummary};
use crate::task::{DatabaseTask, Preparation, RebalanceSettings, SharedSpecification, TaskRegistry};
use crate::worker::{ChunkResult, Directive, Report};
use crate::Result;
use serde::Serialize;
use std::collections::BTreeSet;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempPath;

/// Everything needed to start a job
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub database: DatabaseSpec,
    pub task_name: String,
    pub params: serde_json::Value,
    /// Columns to load; empty loads every column
    pub loaded_columns: Vec<String>,
    pub indexer: IndexerSettings,
    pub rebalance: RebalanceSettings,
    pub limits: ResourceLimits,
    /// 0 for no bound
    pub max_workers: usize,
    pub memory_policy: AllocationPolicy,
    pub disk_policy: AllocationPolicy,
    pub temp_dir: PathBuf,
}

impl JobSpec {
    pub fn new(database: DatabaseSpec, task_name: &str, temp_dir: PathBuf) -> Self {
        Self {
            database,
            task_name: task_name.to_string(),
            params: serde_json::Value::Null,
            loaded_columns: Vec::new(),
            indexer: IndexerSettings::default(),
            rebalance: RebalanceSettings::default(),
            limits: ResourceLimits::default(),
            max_workers: 0,
            memory_policy: AllocationPolicy::Balanced,
            disk_policy: AllocationPolicy::Balanced,
            temp_dir,
        }
    }
}

/// Receives progress while a job runs
#[allow(unused_variables)]
pub trait ProgressReporter: Send {
    fn progress(&mut self, percent: f64) {}

    fn message(&mut self, text: &str) {}
}

/// Logs progress every ten percent
#[derive(Debug, Default)]
pub struct LogReporter {
    next_step: f64,
}

impl ProgressReporter for LogReporter {
    fn progress(&mut self, percent: f64) {
        if percent >= self.next_step {
            tracing::info!(percent = %format!("{:.1}", percent), "progress");
            self.next_step = (percent / 10.0).floor() * 10.0 + 10.0;
        }
    }

    fn message(&mut self, text: &str) {
        tracing::info!("{}", text);
    }
}

/// State of one worker as seen by the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Working,
    Parked,
    ShuttingDown,
}

#[derive(Debug, Clone)]
struct WorkerSlot {
    status: WorkerStatus,
    chunk: Option<Chunk>,
    alive: bool,
    chunks_done: u64,
}

/// Output of the preparation half of Init
pub struct PreparedRun {
    pub shared: Arc<SharedSpecification>,
    pub requirement: TaskRequirement,
    pub host: HostResources,
    pub grant: ResourceGrant,
    pub budget: WorkerBudget,
    pub profile: DatabaseProfile,
    pub plan: ChunkPlan,
    schema_file: TempPath,
}

impl PreparedRun {
    /// Delete the staged schema file
    pub fn release(self) -> Result<()> {
        self.schema_file.close()?;
        Ok(())
    }
}

/// Final report of a job
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub task: String,
    pub started_at: String,
    pub outcome: Outcome,
    pub message: Option<String>,
    pub worker_count: usize,
    pub grant: Option<ResourceGrant>,
    pub chunks_planned: usize,
    /// Records per table found by the indexer
    pub expected_records: Vec<u64>,
    pub totals: RunningTotals,
    pub timings: TimingSummary,
    pub elapsed_secs: f64,
    pub task_summary: serde_json::Value,
}

impl RunSummary {
    fn before_start(task: &str, started: Instant, err: &anyhow::Error) -> Self {
        Self {
            run_id: String::new(),
            task: task.to_string(),
            started_at: chrono::Utc::now().to_rfc3339(),
            outcome: classify(err),
            message: Some(format!("{:#}", err)),
            worker_count: 0,
            grant: None,
            chunks_planned: 0,
            expected_records: Vec::new(),
            totals: RunningTotals::default(),
            timings: TimingSummary::default(),
            elapsed_secs: started.elapsed().as_secs_f64(),
            task_summary: serde_json::Value::Null,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Completed
    }
}

/// Mutable state of the request/reply loop
struct RunState {
    workers: Vec<WorkerSlot>,
    plan: ChunkPlan,
    totals: RunningTotals,
    timings: ChunkTimings,
    total_bytes: u64,
}

impl RunState {
    fn any_working(&self) -> bool {
        self.workers.iter().any(|w| w.status == WorkerStatus::Working)
    }

    /// Share of the database aggregated so far
    fn percent_done(&self) -> f64 {
        if self.total_bytes == 0 {
            return 100.0;
        }
        self.totals.bytes_done as f64 * 100.0 / self.total_bytes as f64
    }

    /// Fold a finished chunk into the totals; returns the new progress
    fn add_result(&mut self, result: &ChunkResult) -> Result<f64> {
        let consumed = self.percent_done();
        self.totals.add_chunk(result, consumed)?;
        Ok(self.percent_done())
    }
}

pub struct Coordinator {
    registry: TaskRegistry,
    cancel: Arc<AtomicBool>,
    reporter: Box<dyn ProgressReporter>,
}

impl Coordinator {
    pub fn new(registry: TaskRegistry, cancel: Arc<AtomicBool>) -> Self {
        Self {
            registry,
            cancel,
            reporter: Box::new(LogReporter::default()),
        }
    }

    pub fn with_reporter(mut self, reporter: Box<dyn ProgressReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    fn check_cancel(&self) -> Result<()> {
        if self.cancel.load(Ordering::Relaxed) {
            return Err(TaskError::UserInterruption.into());
        }
        Ok(())
    }

    /// Requirements, negotiation, chunk plan and shared specification
    ///
    /// `worker_cap` bounds the worker count (cores, simulated workers or
    /// connected nodes).
    pub fn prepare(&self, job: &JobSpec, worker_cap: usize) -> Result<(Box<dyn DatabaseTask>, PreparedRun)> {
        job.database.validate()?;
        job.database.check_files()?;

        let mut schema = Schema::discover(&job.database)?;
        schema.set_loaded_columns(&job.loaded_columns)?;
        let compiled = schema.compile()?;
        let profile = DatabaseProfile::measure(&job.database, &compiled)?;

        let task = self.registry.create(&job.task_name, &job.params)?;

        let source_cost = profile.open_cost();
        let mut requirement = TaskRequirement {
            max_workers: job.max_workers,
            memory_policy: job.memory_policy,
            disk_policy: job.disk_policy,
            ..TaskRequirement::default()
        };
        requirement.worker.memory = requirement.worker.memory.plus(&source_cost);
        let schema_bytes = schema.to_json()?.len() as u64;
        requirement.shared.memory = ResourceRange::exact(2 * schema_bytes);
        task.compute_resource_requirements(&profile, &mut requirement)
            .map_err(|e| TaskError::hook("compute_resource_requirements", &e))?;

        let host = probe_host(&job.temp_dir, &job.limits)?;
        let grant = resource::negotiate(&requirement, &host, worker_cap)?;
        let budget = WorkerBudget {
            grant: grant.worker,
            requirement: requirement.worker,
            source_memory: source_cost,
        };
        let (_, task_memory) = budget.split_memory();
        tracing::info!(
            workers = grant.worker_count,
            worker_memory = %resource::format_bytes(grant.worker.memory),
            task_memory = %resource::format_bytes(task_memory),
            coordinator_memory = %resource::format_bytes(grant.coordinator.memory),
            "resources negotiated"
        );

        self.check_cancel()?;
        let plan = indexer::build_plan(&job.database, &compiled, &job.indexer, grant.worker_count, Some(task_memory))?;
        self.check_cancel()?;

        let schema_file = schema.stage(&job.temp_dir)?;
        let shared = Arc::new(SharedSpecification {
            run_id: SharedSpecification::new_run_id(),
            task_name: job.task_name.clone(),
            database: job.database.clone(),
            loaded_columns: job.loaded_columns.clone(),
            schema_file: schema_file.to_path_buf(),
            params: job.params.clone(),
            temp_dir: job.temp_dir.clone(),
            rebalance: job.rebalance.clone(),
        });

        Ok((
            task,
            PreparedRun {
                shared,
                requirement,
                host,
                grant,
                budget,
                profile,
                plan,
                schema_file,
            },
        ))
    }

    /// Prepare, build a pool of the granted size with `spawn`, and execute
    pub async fn run_with<P, F, Fut>(&mut self, job: &JobSpec, worker_cap: usize, spawn: F) -> RunSummary
    where
        P: WorkerPool,
        F: FnOnce(usize) -> Fut,
        Fut: Future<Output = Result<P>>,
    {
        let started = Instant::now();
        let (task, prepared) = match self.prepare(job, worker_cap) {
            Ok(prepared) => prepared,
            Err(e) => return self.report_failure(RunSummary::before_start(&job.task_name, started, &e)),
        };

        let mut pool = match spawn(prepared.grant.worker_count).await {
            Ok(pool) => pool,
            Err(e) => {
                let summary = RunSummary::before_start(&job.task_name, started, &e);
                if let Err(e) = prepared.release() {
                    tracing::warn!(error = %e, "failed to remove staged schema");
                }
                return self.report_failure(summary);
            }
        };

        self.execute(task, prepared, &mut pool).await
    }

    /// Run with worker threads in this process
    pub async fn run_local(&mut self, job: &JobSpec, threads: usize) -> RunSummary {
        let registry = self.registry.clone();
        let cancel = self.cancel.clone();
        self.run_with(job, threads, |count| async move { ThreadPool::spawn(count, &registry, cancel) })
            .await
    }

    /// Run with virtual workers executed inline
    pub async fn run_simulated(&mut self, job: &JobSpec, workers: usize) -> RunSummary {
        let registry = self.registry.clone();
        let cancel = self.cancel.clone();
        self.run_with(job, workers, |count| async move { Ok(InlinePool::new(count, &registry, cancel)) })
            .await
    }

    fn report_failure(&mut self, summary: RunSummary) -> RunSummary {
        match summary.outcome {
            Outcome::Interrupted => tracing::warn!(task = %summary.task, "job interrupted before start"),
            _ => tracing::error!(
                task = %summary.task,
                error = summary.message.as_deref().unwrap_or(""),
                "job failed before start"
            ),
        }
        summary
    }

    /// Initialise the workers, run the dispatch loop and finalize
    pub async fn execute<P>(&mut self, mut task: Box<dyn DatabaseTask>, prepared: PreparedRun, pool: &mut P) -> RunSummary
    where
        P: WorkerPool + ?Sized,
    {
        let started = Instant::now();
        let started_at = chrono::Utc::now().to_rfc3339();
        let worker_count = prepared.grant.worker_count.min(pool.size());
        let expected = prepared.plan.table_records().to_vec();
        let chunks_planned = prepared.plan.len();

        let mut state = RunState {
            workers: vec![
                WorkerSlot {
                    status: WorkerStatus::Idle,
                    chunk: None,
                    alive: true,
                    chunks_done: 0,
                };
                worker_count
            ],
            total_bytes: prepared.plan.total_bytes(),
            totals: RunningTotals::new(prepared.plan.table_names().to_vec()),
            plan: prepared.plan.clone(),
            timings: match ChunkTimings::new() {
                Ok(timings) => timings,
                Err(e) => return self.report_failure(RunSummary::before_start(task.name(), started, &e)),
            },
        };

        tracing::info!(
            run_id = %prepared.shared.run_id,
            task = task.name(),
            workers = worker_count,
            chunks = chunks_planned,
            "job started"
        );
        self.reporter.message(&format!(
            "{}: {} chunks on {} workers",
            task.name(),
            chunks_planned,
            worker_count
        ));

        let mut result = match task.master_init(&prepared.shared) {
            Ok(()) => self.drive(task.as_mut(), &prepared, pool, &mut state).await,
            Err(e) => Err(TaskError::hook("master_init", &e).into()),
        };

        let shutdown = self.shutdown_workers(pool, &mut state, result.is_ok()).await;
        result = result.and(shutdown);
        if result.is_ok() {
            result = state.totals.verify(&expected);
        }

        let ok = result.is_ok();
        if let Err(e) = task.master_finalize(ok, &state.totals) {
            let e: anyhow::Error = TaskError::hook("master_finalize", &e).into();
            if result.is_ok() {
                result = Err(e);
            } else {
                tracing::warn!(error = %format!("{:#}", e), "master finalize failed after an earlier error");
            }
        }
        if result.is_err() {
            state.totals.reset();
        }

        let run_id = prepared.shared.run_id.clone();
        let grant = prepared.grant;
        if let Err(e) = prepared.release() {
            tracing::warn!(error = %e, "failed to remove staged schema");
        }
        if let Err(e) = pool.close().await {
            tracing::warn!(error = %e, "failed to close worker pool");
        }

        let timings = state.timings.summary();
        let (outcome, message) = match &result {
            Ok(()) => (Outcome::Completed, None),
            Err(e) => (classify(e), Some(format!("{:#}", e))),
        };
        match outcome {
            Outcome::Completed => {
                self.reporter.progress(100.0);
                let per_worker: Vec<u64> = state.workers.iter().map(|w| w.chunks_done).collect();
                tracing::debug!(?per_worker, "chunks per worker");
                tracing::info!(
                    records = state.totals.total_records(),
                    chunks = state.totals.chunks_done,
                    splits = state.totals.chunks_split,
                    p50_us = timings.p50_us,
                    p99_us = timings.p99_us,
                    "job completed"
                );
            }
            Outcome::Interrupted => tracing::warn!("job interrupted"),
            Outcome::Failed => tracing::error!(error = message.as_deref().unwrap_or(""), "job failed"),
        }

        RunSummary {
            run_id,
            task: task.name().to_string(),
            started_at,
            outcome,
            message,
            worker_count,
            grant: Some(grant),
            chunks_planned,
            expected_records: expected,
            totals: state.totals.clone(),
            timings,
            elapsed_secs: started.elapsed().as_secs_f64(),
            task_summary: task.summary(),
        }
    }

    async fn drive<P>(
        &mut self,
        task: &mut dyn DatabaseTask,
        prepared: &PreparedRun,
        pool: &mut P,
        state: &mut RunState,
    ) -> Result<()>
    where
        P: WorkerPool + ?Sized,
    {
        self.init_workers(prepared, pool, state).await?;

        loop {
            self.check_cancel()?;
            self.dispatch(task, pool, state).await?;

            if !state.any_working() {
                tracing::debug!(pending = state.plan.len(), "no worker busy, dispatch ends");
                return Ok(());
            }

            let (worker, report) = pool.next_report().await?;
            self.aggregate(task, state, worker, report)?;
        }
    }

    async fn init_workers<P>(&mut self, prepared: &PreparedRun, pool: &mut P, state: &mut RunState) -> Result<()>
    where
        P: WorkerPool + ?Sized,
    {
        for worker in 0..state.workers.len() {
            let directive = Directive::Init {
                shared: prepared.shared.clone(),
                budget: prepared.budget,
            };
            if let Err(e) = pool.send(worker, directive).await {
                state.workers[worker].alive = false;
                return Err(e);
            }
        }

        let mut pending: BTreeSet<usize> = (0..state.workers.len()).collect();
        let mut failure: Option<anyhow::Error> = None;
        while !pending.is_empty() {
            let (worker, report) = match pool.next_report().await {
                Ok(event) => event,
                Err(e) => {
                    mark_lost(state, &e, &mut pending);
                    failure.get_or_insert(e);
                    continue;
                }
            };
            pending.remove(&worker);
            match report {
                Report::Ready => {}
                Report::InitFailed { message } => {
                    failure.get_or_insert_with(|| remote_failure(worker, "init", &message));
                }
                other => {
                    failure.get_or_insert_with(|| {
                        TaskError::Protocol(format!("worker {} answered init with {:?}", worker, other)).into()
                    });
                }
            }
        }

        match failure {
            Some(e) => Err(e),
            None => {
                tracing::debug!(workers = state.workers.len(), "workers ready");
                Ok(())
            }
        }
    }

    /// PrepareInput and Dispatch for every idle worker
    async fn dispatch<P>(&mut self, task: &mut dyn DatabaseTask, pool: &mut P, state: &mut RunState) -> Result<()>
    where
        P: WorkerPool + ?Sized,
    {
        for worker in 0..state.workers.len() {
            if state.workers[worker].status != WorkerStatus::Idle {
                continue;
            }

            let preparation = task
                .prepare_input(&mut state.plan)
                .map_err(|e| TaskError::hook("prepare_input", &e))?;

            match preparation {
                Preparation::Unit(chunk) => {
                    tracing::trace!(worker, chunk = %chunk.id, bytes = chunk.bytes(), "dispatch");
                    pool.send(worker, Directive::Process(chunk.clone())).await?;
                    state.workers[worker].status = WorkerStatus::Working;
                    state.workers[worker].chunk = Some(chunk);
                }
                Preparation::Park => {
                    pool.send(worker, Directive::Park).await?;
                    state.workers[worker].status = WorkerStatus::Parked;
                }
                Preparation::Done if state.any_working() => {
                    pool.send(worker, Directive::Park).await?;
                    state.workers[worker].status = WorkerStatus::Parked;
                }
                Preparation::Done => break,
            }
        }
        Ok(())
    }

    fn aggregate(&mut self, task: &mut dyn DatabaseTask, state: &mut RunState, worker: usize, report: Report) -> Result<()> {
        let Some(slot) = state.workers.get_mut(worker) else {
            return Err(TaskError::Protocol(format!("report from unknown worker {}", worker)).into());
        };
        if slot.status != WorkerStatus::Working {
            return Err(TaskError::Protocol(format!("unexpected report from {:?} worker {}: {:?}", slot.status, worker, report)).into());
        }
        let chunk = slot.chunk.take();
        slot.status = WorkerStatus::Idle;

        match report {
            Report::ChunkDone(result) => {
                check_reported_chunk(worker, chunk.as_ref(), &result)?;
                let percent = state.add_result(&result)?;
                task.aggregate(worker, &result.chunk, &result.payload)
                    .map_err(|e| TaskError::hook("aggregate", &e))?;
                state.timings.record(Duration::from_micros(result.elapsed_us));
                state.workers[worker].chunks_done += 1;
                self.reporter.progress(percent);
                Ok(())
            }
            Report::ChunkSplit { parent, pieces } => {
                tracing::debug!(worker, chunk = %parent, pieces = pieces.len(), "chunk split, waking parked workers");
                state.totals.record_split();
                state.plan.push_front_split(pieces);
                for slot in &mut state.workers {
                    if slot.status == WorkerStatus::Parked {
                        slot.status = WorkerStatus::Idle;
                    }
                }
                Ok(())
            }
            Report::ChunkFailed { chunk, message, interrupted } => {
                if interrupted || is_interruption_message(&message) {
                    Err(TaskError::UserInterruption.into())
                } else {
                    Err(remote_failure(worker, &format!("chunk {}", chunk), &message))
                }
            }
            other => Err(TaskError::Protocol(format!("worker {} sent {:?} while working", worker, other)).into()),
        }
    }

    /// Send Shutdown to every live worker and collect their finalization
    async fn shutdown_workers<P>(&mut self, pool: &mut P, state: &mut RunState, ok: bool) -> Result<()>
    where
        P: WorkerPool + ?Sized,
    {
        let mut pending = BTreeSet::new();
        for (worker, slot) in state.workers.iter_mut().enumerate() {
            if !slot.alive {
                continue;
            }
            match pool.send(worker, Directive::Shutdown { ok }).await {
                Ok(()) => {
                    slot.status = WorkerStatus::ShuttingDown;
                    pending.insert(worker);
                }
                Err(e) => {
                    slot.alive = false;
                    tracing::warn!(worker, error = %e, "cannot send shutdown");
                }
            }
        }

        let mut failure: Option<anyhow::Error> = None;
        while !pending.is_empty() {
            match pool.next_report().await {
                Ok((worker, Report::Finalized { ok: worker_ok, message })) => {
                    pending.remove(&worker);
                    if let (false, Some(message)) = (worker_ok, message) {
                        failure.get_or_insert_with(|| remote_failure(worker, "finalize", &message));
                    }
                }
                Ok((worker, report)) => {
                    tracing::debug!(worker, ?report, "report discarded during shutdown");
                }
                Err(e) => {
                    if !mark_lost(state, &e, &mut pending) {
                        failure.get_or_insert(e);
                        break;
                    }
                    failure.get_or_insert(e);
                }
            }
        }

        let parked_left = state
            .workers
            .iter()
            .filter(|w| w.status == WorkerStatus::Parked)
            .count();
        tracing::debug!(parked_left, "workers shut down");

        match failure {
            Some(e) if ok => Err(e),
            Some(e) => {
                tracing::warn!(error = %format!("{:#}", e), "worker shutdown failed after an earlier error");
                Ok(())
            }
            None => Ok(()),
        }
    }
}

/// Record a lost worker; false when the error is not about one
fn mark_lost(state: &mut RunState, err: &anyhow::Error, pending: &mut BTreeSet<usize>) -> bool {
    if let Some(TaskError::WorkerLost { worker, .. }) = err.downcast_ref::<TaskError>() {
        if let Some(slot) = state.workers.get_mut(*worker) {
            slot.alive = false;
        }
        pending.remove(worker);
        return true;
    }
    pending.clear();
    false
}

/// Error for a failure reported across the worker boundary
fn remote_failure(worker: usize, step: &str, message: &str) -> anyhow::Error {
    if is_interruption_message(message) {
        return TaskError::UserInterruption.into();
    }
    anyhow::anyhow!("{}", message).context(format!("worker {} failed during {}", worker, step))
}

fn check_reported_chunk(worker: usize, dispatched: Option<&Chunk>, result: &ChunkResult) -> Result<()> {
    match dispatched {
        Some(chunk) if chunk.id == result.chunk => Ok(()),
        Some(chunk) => Err(TaskError::Protocol(format!(
            "worker {} reported chunk {} but was given {}",
            worker, result.chunk, chunk.id
        ))
        .into()),
        None => Err(TaskError::Protocol(format!("worker {} reported chunk {} it was never given", worker, result.chunk)).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkId;
    use crate::database::artificial::ArtificialDataset;
    use crate::database::LogicalRecord;
    use crate::task::builtin::ColumnExtract;
    use crate::task::WorkerContext;
    use std::path::Path;
    use std::sync::Mutex;

    fn job(dir: &Path, dataset: ArtificialDataset, task: &str) -> JobSpec {
        let db = dataset.generate(&dir.join("db")).unwrap();
        JobSpec::new(db, task, dir.to_path_buf())
    }

    fn staged_files(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with("partask-"))
            .collect()
    }

    fn coordinator() -> Coordinator {
        Coordinator::new(TaskRegistry::with_builtin(), Arc::new(AtomicBool::new(false)))
    }

    fn counted(summary: &RunSummary) -> Vec<u64> {
        summary.task_summary["tables"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["records"].as_u64().unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_simulated_run_conserves_records() {
        let dir = tempfile::tempdir().unwrap();
        let mut job = job(dir.path(), ArtificialDataset { root_records: 2000, secondary_tables: 2, ..Default::default() }, "record-count");
        job.indexer.max_chunk_records = Some(300);

        let summary = coordinator().run_simulated(&job, 3).await;
        assert!(summary.is_success(), "{:?}", summary.message);
        assert_eq!(summary.totals.records, summary.expected_records);
        assert_eq!(summary.totals.records[0], 2000);
        assert_eq!(summary.totals.chunks_done as usize, summary.chunks_planned);
        assert_eq!(summary.totals.unmatched, 0);
        assert!(staged_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_local_run_matches_simulated() {
        let dir = tempfile::tempdir().unwrap();
        let mut job = job(dir.path(), ArtificialDataset { root_records: 1500, ..Default::default() }, "record-count");
        job.indexer.max_chunk_records = Some(100);

        let local = coordinator().run_local(&job, 4).await;
        let simulated = coordinator().run_simulated(&job, 4).await;
        assert!(local.is_success(), "{:?}", local.message);
        assert_eq!(local.totals.records, simulated.totals.records);
        assert_eq!(counted(&local), local.expected_records);
    }

    #[tokio::test]
    async fn test_forced_split_of_every_chunk_terminates() {
        let dir = tempfile::tempdir().unwrap();
        let mut job = job(dir.path(), ArtificialDataset { root_records: 400, ..Default::default() }, "record-count");
        job.indexer.max_chunk_records = Some(100);
        job.rebalance.force_split_above_records = Some(1);

        for summary in [coordinator().run_simulated(&job, 3).await, coordinator().run_local(&job, 3).await] {
            assert!(summary.is_success(), "{:?}", summary.message);
            assert_eq!(summary.totals.records, summary.expected_records);
            assert_eq!(summary.totals.chunks_done, 400);
            assert!(summary.totals.chunks_split >= 4);
        }
    }

    #[tokio::test]
    async fn test_column_extract_assembles_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out").join("extract.tsv");
        std::fs::create_dir_all(output.parent().unwrap()).unwrap();
        let mut job = job(dir.path(), ArtificialDataset { root_records: 500, secondary_tables: 0, ..Default::default() }, "column-extract");
        job.params = serde_json::json!({ "output": output, "columns": ["Key1", "Field2"] });
        job.indexer.max_chunk_records = Some(60);
        job.rebalance.force_split_above_records = Some(40);

        let summary = coordinator().run_local(&job, 3).await;
        assert!(summary.is_success(), "{:?}", summary.message);

        let text = std::fs::read_to_string(&output).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 501);
        assert_eq!(lines[0], "Key1\tField2");
        let keys: Vec<String> = lines[1..].iter().map(|l| l.split('\t').next().unwrap().to_string()).collect();
        let expected: Vec<String> = (0..500).map(ArtificialDataset::key).collect();
        assert_eq!(keys, expected);
        assert!(staged_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_cancellation_is_warning_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("extract.tsv");
        let mut job = job(dir.path(), ArtificialDataset { root_records: 300, secondary_tables: 0, ..Default::default() }, "column-extract");
        job.params = serde_json::json!({ "output": output });
        job.indexer.max_chunk_records = Some(10);

        let cancel = Arc::new(AtomicBool::new(false));
        let flag = cancel.clone();
        let mut registry = TaskRegistry::with_builtin();
        // Extract that raises the cancel flag after a few chunks
        registry.register("cancelling-extract", move |params| {
            Ok(Box::new(CancelAfter {
                inner: ColumnExtract::from_params(params)?,
                flag: flag.clone(),
                chunks: 0,
            }) as Box<dyn DatabaseTask>)
        });
        job.task_name = "cancelling-extract".into();

        let summary = Coordinator::new(registry, cancel).run_local(&job, 2).await;
        assert_eq!(summary.outcome, Outcome::Interrupted);
        assert_eq!(summary.totals.total_records(), 0);
        assert!(staged_files(dir.path()).is_empty(), "{:?}", staged_files(dir.path()));
        assert!(!output.exists());
    }

    struct CancelAfter {
        inner: ColumnExtract,
        flag: Arc<AtomicBool>,
        chunks: u32,
    }

    impl DatabaseTask for CancelAfter {
        fn name(&self) -> &str {
            "cancelling-extract"
        }
        fn master_init(&mut self, shared: &SharedSpecification) -> Result<()> {
            self.inner.master_init(shared)
        }
        fn aggregate(&mut self, worker: usize, chunk: &crate::chunk::ChunkId, payload: &[u8]) -> Result<()> {
            self.chunks += 1;
            if self.chunks == 3 {
                self.flag.store(true, Ordering::Relaxed);
            }
            self.inner.aggregate(worker, chunk, payload)
        }
        fn master_finalize(&mut self, ok: bool, totals: &RunningTotals) -> Result<()> {
            self.inner.master_finalize(ok, totals)
        }
        fn worker_init(&mut self, ctx: &mut WorkerContext) -> Result<()> {
            self.inner.worker_init(ctx)
        }
        fn start_chunk(&mut self, ctx: &mut WorkerContext, chunk: &Chunk) -> Result<()> {
            self.inner.start_chunk(ctx, chunk)
        }
        fn process_record(&mut self, ctx: &mut WorkerContext, record: &LogicalRecord) -> Result<()> {
            self.inner.process_record(ctx, record)
        }
        fn stop_chunk(&mut self, ctx: &mut WorkerContext, ok: bool) -> Result<Vec<u8>> {
            self.inner.stop_chunk(ctx, ok)
        }
    }

    #[tokio::test]
    async fn test_hook_failure_fails_job() {
        struct Failing;
        impl DatabaseTask for Failing {
            fn name(&self) -> &str {
                "failing"
            }
            fn process_record(&mut self, _ctx: &mut WorkerContext, record: &LogicalRecord) -> Result<()> {
                if record.root.offset > 1000 {
                    anyhow::bail!("bad record at {}", record.root.offset);
                }
                Ok(())
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let job = job(dir.path(), ArtificialDataset { root_records: 200, ..Default::default() }, "failing");
        let mut registry = TaskRegistry::with_builtin();
        registry.register("failing", |_| Ok(Box::new(Failing) as Box<dyn DatabaseTask>));

        let summary = Coordinator::new(registry, Arc::new(AtomicBool::new(false)))
            .run_simulated(&job, 2)
            .await;
        assert_eq!(summary.outcome, Outcome::Failed);
        assert!(summary.message.unwrap().contains("bad record"));
        assert_eq!(summary.totals.total_records(), 0);
    }

    #[tokio::test]
    async fn test_unavailable_resources_fail_before_start() {
        let dir = tempfile::tempdir().unwrap();
        let mut job = job(dir.path(), ArtificialDataset { root_records: 10, ..Default::default() }, "record-count");
        job.limits.memory = Some(1024);

        let summary = coordinator().run_simulated(&job, 2).await;
        assert_eq!(summary.outcome, Outcome::Failed);
        assert!(summary.message.unwrap().contains("not enough resources"));
        assert!(staged_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_reporter_sees_progress_up_to_done() {
        #[derive(Clone, Default)]
        struct Recorder(Arc<Mutex<Vec<f64>>>);
        impl ProgressReporter for Recorder {
            fn progress(&mut self, percent: f64) {
                self.0.lock().unwrap().push(percent);
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let mut job = job(dir.path(), ArtificialDataset { root_records: 300, ..Default::default() }, "record-count");
        job.indexer.max_chunk_records = Some(50);
        let recorder = Recorder::default();

        let summary = coordinator()
            .with_reporter(Box::new(recorder.clone()))
            .run_simulated(&job, 2)
            .await;
        assert!(summary.is_success());

        let seen = recorder.0.lock().unwrap().clone();
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert!((seen[seen.len() - 2] - 100.0).abs() < 1e-9);
        assert_eq!(counted(&summary), summary.totals.records);
    }

    #[test]
    fn test_overflow_reports_progress_before_the_chunk() {
        let mut state = RunState {
            workers: Vec::new(),
            plan: ChunkPlan::new(Vec::new(), vec!["root".into()], vec![0], vec![1000]),
            totals: RunningTotals::new(vec!["root".into()]),
            timings: ChunkTimings::new().unwrap(),
            total_bytes: 1000,
        };
        let chunk = |records: u64| ChunkResult {
            chunk: ChunkId::root(0),
            records: vec![records],
            bytes: 250,
            unmatched: 0,
            duplicates: 0,
            payload: Vec::new(),
            elapsed_us: 10,
        };

        assert_eq!(state.add_result(&chunk(u64::MAX - 1)).unwrap(), 25.0);
        let err = state.add_result(&chunk(5)).unwrap_err();
        match err.downcast_ref::<TaskError>() {
            Some(TaskError::Overflow { percent_consumed }) => assert_eq!(*percent_consumed, 25.0),
            other => panic!("Wrong error: {:?}", other),
        }
        assert_eq!(state.percent_done(), 25.0);
    }
}
