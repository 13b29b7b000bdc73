//! partask - parallel chunked processing of large delimited tables
//!
//! A database is a root table plus optional secondary tables joined to it on a
//! key, each a delimited text file sorted by that key. partask indexes the
//! files into chunks whose byte ranges keep every secondary row next to its
//! root record, then runs a user task over the chunks on a pool of workers.
//!
//! # Architecture
//!
//! - **Resource negotiation**: task requirements are turned into a concrete
//!   grant (worker count, memory and disk per role) against the probed host
//! - **Indexer**: a parallel pre-pass cuts the tables into micro-chunks and the
//!   chunk builder merges them into a plan sized for the grant
//! - **Coordinator**: a request/reply loop hands chunks to idle workers,
//!   aggregates their results and re-queues chunks workers split
//! - **Workers**: stream the logical records of a chunk through the task hooks,
//!   locally on threads, inline (simulated) or on remote node services
//! - **Tasks**: a hook trait with defaults, looked up by name in a registry

pub mod chunk;
pub mod config;
pub mod coordinator;
pub mod database;
pub mod distributed;
pub mod error;
pub mod indexer;
pub mod output;
pub mod resource;
pub mod stats;
pub mod task;
pub mod worker;

// Re-export commonly used types
pub use config::Config;
pub use coordinator::{Coordinator, JobSpec, RunSummary};
pub use error::{Outcome, TaskError};
pub use task::{DatabaseTask, TaskRegistry};

/// Result type used throughout partask
pub type Result<T> = anyhow::Result<T>;
