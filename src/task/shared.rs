//! Frozen run description shared by every worker

use crate::database::DatabaseSpec;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Rebalancing knobs applied by workers before each chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebalanceSettings {
    /// Split chunks whose task cost exceeds the worker budget
    pub enabled: bool,
    /// Split every chunk holding more root records than this, in two
    pub force_split_above_records: Option<u64>,
}

impl Default for RebalanceSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            force_split_above_records: None,
        }
    }
}

/// Immutable snapshot built by the coordinator at init
///
/// Workers receive it once, behind an `Arc`, and never modify it. The staged
/// schema file is owned by the coordinator and deleted when the run ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedSpecification {
    pub run_id: String,
    pub task_name: String,
    pub database: DatabaseSpec,
    /// Loaded column selection, as given to the schema
    pub loaded_columns: Vec<String>,
    pub schema_file: PathBuf,
    /// Task parameters, cloned from the configuration
    pub params: serde_json::Value,
    pub temp_dir: PathBuf,
    pub rebalance: RebalanceSettings,
}

impl SharedSpecification {
    /// Run identifier from the current time and process id
    pub fn new_run_id() -> String {
        format!("{}-{}", chrono::Utc::now().format("%Y%m%dT%H%M%S"), std::process::id())
    }
}
