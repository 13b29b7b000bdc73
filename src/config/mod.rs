//! Configuration module
//!
//! A run is described by a TOML file whose values CLI flags override. The
//! merged [`Config`] is validated, then turned into the coordinator's
//! [`JobSpec`].

pub mod cli;
pub mod toml;
pub mod validator;

use crate::coordinator::JobSpec;
use crate::database::{DatabaseSpec, TableSpec};
use crate::indexer::IndexerSettings;
use crate::resource::{AllocationPolicy, ResourceLimits};
use crate::task::{builtin::RecordCount, RebalanceSettings};
use crate::Result;
use cli::{Cli, ExecutionMode};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::PathBuf;

/// Complete run configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub resources: ResourcesConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub rebalance: RebalanceConfig,
    #[serde(default)]
    pub task: TaskConfig,
    #[serde(default)]
    pub run: RunConfig,
}

/// Tables to process, root table first
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_separator")]
    pub separator: char,
    #[serde(default = "default_true")]
    pub header: bool,
    #[serde(default)]
    pub tables: Vec<TableSpec>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            separator: default_separator(),
            header: true,
            tables: Vec::new(),
        }
    }
}

/// Caps on the probed host and negotiation knobs
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourcesConfig {
    /// Memory cap for the whole run
    #[serde(default, deserialize_with = "deserialize_size")]
    pub memory_limit: Option<u64>,
    /// Disk cap in the temporary directory
    #[serde(default, deserialize_with = "deserialize_size")]
    pub disk_limit: Option<u64>,
    pub cores: Option<usize>,
    /// 0 for no bound
    #[serde(default)]
    pub max_workers: usize,
    #[serde(default)]
    pub memory_policy: AllocationPolicy,
    #[serde(default)]
    pub disk_policy: AllocationPolicy,
    /// Virtual workers of simulated mode
    pub simulated_workers: Option<usize>,
}

/// Chunk sizing; sizes accept suffixes (`64M`) or plain byte counts
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkingConfig {
    #[serde(default, deserialize_with = "deserialize_size")]
    pub micro_chunk: Option<u64>,
    #[serde(default, deserialize_with = "deserialize_size")]
    pub max_chunk_bytes: Option<u64>,
    pub max_chunk_records: Option<u64>,
    #[serde(default, deserialize_with = "deserialize_size")]
    pub preferred_chunk: Option<u64>,
    #[serde(default, deserialize_with = "deserialize_size")]
    pub min_chunk: Option<u64>,
}

impl ChunkingConfig {
    pub fn to_settings(&self) -> IndexerSettings {
        let defaults = IndexerSettings::default();
        IndexerSettings {
            micro_chunk_bytes: self.micro_chunk.unwrap_or(defaults.micro_chunk_bytes),
            max_chunk_bytes: self.max_chunk_bytes,
            max_chunk_records: self.max_chunk_records,
            preferred_chunk_bytes: self.preferred_chunk.unwrap_or(defaults.preferred_chunk_bytes),
            min_chunk_bytes: self.min_chunk.unwrap_or(defaults.min_chunk_bytes),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebalanceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub force_split_above_records: Option<u64>,
}

impl Default for RebalanceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            force_split_above_records: None,
        }
    }
}

/// Task selection; `params` is handed to the task factory as JSON
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    #[serde(default = "default_task")]
    pub name: String,
    /// Columns to load; empty loads every column
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            name: default_task(),
            columns: Vec::new(),
            params: serde_json::Value::Null,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub mode: ExecutionMode,
    /// Staged schema and task part files; defaults to the system temp dir
    pub temp_dir: Option<PathBuf>,
    #[serde(default)]
    pub dry_run: bool,
    pub json_output: Option<PathBuf>,
    /// Node service addresses for coordinator mode
    #[serde(default)]
    pub nodes: Vec<String>,
    #[serde(default = "default_workers_per_node")]
    pub workers_per_node: usize,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::default(),
            temp_dir: None,
            dry_run: false,
            json_output: None,
            nodes: Vec::new(),
            workers_per_node: default_workers_per_node(),
            listen_port: default_listen_port(),
        }
    }
}

fn default_separator() -> char {
    '\t'
}

fn default_true() -> bool {
    true
}

fn default_task() -> String {
    RecordCount::NAME.to_string()
}

fn default_workers_per_node() -> usize {
    1
}

fn default_listen_port() -> u16 {
    9999
}

/// Size given either as a byte count or as a string with a suffix
fn deserialize_size<'de, D>(deserializer: D) -> std::result::Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum SizeValue {
        Bytes(u64),
        Text(String),
    }

    match Option::<SizeValue>::deserialize(deserializer)? {
        None => Ok(None),
        Some(SizeValue::Bytes(bytes)) => Ok(Some(bytes)),
        Some(SizeValue::Text(text)) => toml::parse_size(&text).map(Some).map_err(serde::de::Error::custom),
    }
}

impl Config {
    /// Config file (if any), CLI overrides, then validation
    pub fn load(cli: &Cli) -> Result<Self> {
        let config = match &cli.config {
            Some(path) => toml::parse_toml_file(path)?,
            None => Config::default(),
        };
        let config = toml::merge_cli_with_config(cli, config)?;
        validator::validate_config(&config)?;
        Ok(config)
    }

    pub fn database_spec(&self) -> DatabaseSpec {
        DatabaseSpec {
            tables: self.database.tables.clone(),
            separator: self.database.separator,
            header: self.database.header,
        }
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.run.temp_dir.clone().unwrap_or_else(std::env::temp_dir)
    }

    pub fn to_job(&self) -> JobSpec {
        let mut job = JobSpec::new(self.database_spec(), &self.task.name, self.temp_dir());
        job.params = self.task.params.clone();
        job.loaded_columns = self.task.columns.clone();
        job.indexer = self.chunking.to_settings();
        job.rebalance = RebalanceSettings {
            enabled: self.rebalance.enabled,
            force_split_above_records: self.rebalance.force_split_above_records,
        };
        job.limits = ResourceLimits {
            memory: self.resources.memory_limit,
            disk: self.resources.disk_limit,
            cores: self.resources.cores,
        };
        job.max_workers = self.resources.max_workers;
        job.memory_policy = self.resources.memory_policy;
        job.disk_policy = self.resources.disk_policy;
        job
    }

    /// Upper bound on the worker count for the configured mode
    pub fn worker_cap(&self) -> usize {
        match self.run.mode {
            ExecutionMode::Simulated => self.resources.simulated_workers.unwrap_or(4),
            ExecutionMode::Coordinator => self.run.nodes.len() * self.run.workers_per_node,
            _ => self.resources.cores.unwrap_or_else(num_cpus::get),
        }
    }
}
