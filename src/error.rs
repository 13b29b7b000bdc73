//! Failure taxonomy
//!
//! Every failure that can end a run is one of these variants, carried inside
//! `anyhow::Error` so call sites keep adding context with `.context()`. The
//! coordinator recovers the variant with [`classify`] to decide whether the job
//! ended as an interruption (warning) or a failure (error).

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Typed failures of the task engine
#[derive(Debug, Error)]
pub enum TaskError {
    /// Minimum resource requirements cannot be met by the host
    #[error("not enough resources: {0}")]
    ResourceUnavailable(String),

    /// The database could not be partitioned (unsorted keys, unreadable file)
    #[error("indexing failed: {0}")]
    IndexingFailure(String),

    /// A record could not be read or joined while streaming a chunk
    #[error("read error in table '{table}' at byte {offset}: {message}")]
    RecordRead {
        table: String,
        offset: u64,
        message: String,
    },

    /// A task hook returned an error
    #[error("task hook '{hook}' failed: {message}")]
    HookFailure { hook: String, message: String },

    /// The run was cancelled cooperatively
    #[error("interrupted by user")]
    UserInterruption,

    /// A running total exceeded the counter range
    #[error("counter overflow after {percent_consumed:.1}% of the database")]
    Overflow { percent_consumed: f64 },

    /// Unexpected or malformed coordinator/worker message
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A worker disappeared mid-run
    #[error("worker {worker} lost: {message}")]
    WorkerLost { worker: usize, message: String },

    /// Aggregated per-table totals disagree with the index
    #[error("table '{table}': {actual} records processed, index holds {expected}")]
    TotalsMismatch {
        table: String,
        expected: u64,
        actual: u64,
    },

    /// The database description is unusable
    #[error("invalid database: {0}")]
    InvalidDatabase(String),
}

impl TaskError {
    /// Wrap a hook error, keeping its full context chain in the message
    pub fn hook(hook: &str, err: &anyhow::Error) -> Self {
        TaskError::HookFailure {
            hook: hook.to_string(),
            message: format!("{:#}", err),
        }
    }
}

/// Final state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Completed,
    Interrupted,
    Failed,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Outcome::Completed => write!(f, "completed"),
            Outcome::Interrupted => write!(f, "interrupted"),
            Outcome::Failed => write!(f, "failed"),
        }
    }
}

/// Map an error to the job outcome it implies
pub fn classify(err: &anyhow::Error) -> Outcome {
    let interrupted = err
        .chain()
        .filter_map(|cause| cause.downcast_ref::<TaskError>())
        .any(|e| matches!(e, TaskError::UserInterruption));

    if interrupted {
        Outcome::Interrupted
    } else {
        Outcome::Failed
    }
}

/// Whether an error message produced on the far side of the worker boundary
/// reports an interruption
pub fn is_interruption_message(message: &str) -> bool {
    message.contains(&TaskError::UserInterruption.to_string())
}
