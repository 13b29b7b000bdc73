//! CLI argument parsing using clap

use crate::resource::AllocationPolicy;
use clap::{ArgAction, Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Execution mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Worker threads in this process (default)
    #[default]
    Standalone,
    /// Virtual workers run one after another in this process
    Simulated,
    /// Drive workers hosted by node services
    Coordinator,
    /// Host workers for a remote coordinator
    Service,
    /// Write an artificial co-sorted dataset
    Generate,
}

/// partask - parallel chunked processing of large delimited tables
#[derive(Parser, Debug)]
#[command(name = "partask")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Execution mode (overrides the config file)
    #[arg(long, value_enum)]
    pub mode: Option<ExecutionMode>,

    /// TOML configuration file
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Table files, root table first, as PATH or NAME=PATH
    #[arg(value_name = "TABLE")]
    pub tables: Vec<String>,

    /// Join key columns, comma-separated, shared by every table
    #[arg(long, value_delimiter = ',')]
    pub key_fields: Vec<String>,

    /// Field separator
    #[arg(long)]
    pub separator: Option<char>,

    /// Files have no header line
    #[arg(long)]
    pub no_header: bool,

    // === Task ===
    /// Task to run (record-count, column-extract)
    #[arg(short = 't', long)]
    pub task: Option<String>,

    /// Task parameter as KEY=VALUE; VALUE is parsed as JSON when it can be
    #[arg(short = 'p', long = "param", value_name = "KEY=VALUE")]
    pub params: Vec<String>,

    /// Columns to load, comma-separated (default: all)
    #[arg(long, value_delimiter = ',')]
    pub columns: Vec<String>,

    // === Resources ===
    /// Maximum number of workers (0 = no bound)
    #[arg(short = 'w', long)]
    pub max_workers: Option<usize>,

    /// Number of virtual workers in simulated mode
    #[arg(long)]
    pub simulated_workers: Option<usize>,

    /// Memory cap for the whole run (e.g., 2G, 512M)
    #[arg(long)]
    pub memory_limit: Option<String>,

    /// Disk cap in the temporary directory (e.g., 10G)
    #[arg(long)]
    pub disk_limit: Option<String>,

    /// Cap on the cores used
    #[arg(long)]
    pub cores: Option<usize>,

    #[arg(long, value_enum)]
    pub memory_policy: Option<AllocationPolicy>,

    #[arg(long, value_enum)]
    pub disk_policy: Option<AllocationPolicy>,

    // === Chunking ===
    /// Forced maximum chunk size, all tables included (e.g., 64M)
    #[arg(long)]
    pub max_chunk_bytes: Option<String>,

    /// Forced maximum root records per chunk
    #[arg(long)]
    pub max_chunk_records: Option<u64>,

    /// Micro-chunk size used by the indexer (e.g., 1M)
    #[arg(long)]
    pub micro_chunk: Option<String>,

    // === Rebalancing ===
    /// Disable splitting of chunks over the worker budget
    #[arg(long)]
    pub no_rebalance: bool,

    /// Split every chunk holding more root records than this
    #[arg(long)]
    pub force_split_above: Option<u64>,

    // === Run ===
    /// Directory for staged and temporary files
    #[arg(long)]
    pub temp_dir: Option<PathBuf>,

    /// Print the negotiated resources and the chunk plan, then exit
    #[arg(long)]
    pub dry_run: bool,

    /// Write the run report (or the dry-run plan) as JSON
    #[arg(long)]
    pub json_output: Option<PathBuf>,

    // === Distributed ===
    /// Comma-separated node addresses for coordinator mode (e.g., "10.0.1.10:9999,10.0.1.11:9999")
    #[arg(long)]
    pub host_list: Option<String>,

    /// Workers hosted by each node in coordinator mode
    #[arg(long)]
    pub workers_per_node: Option<usize>,

    /// Port for the service to listen on (service mode only)
    #[arg(long)]
    pub listen_port: Option<u16>,

    // === Dataset generation ===
    /// Output directory of generate mode
    #[arg(long)]
    pub output_dir: Option<PathBuf>,

    /// Root records to generate
    #[arg(long, default_value = "10000")]
    pub records: u64,

    /// Secondary tables to generate
    #[arg(long, default_value = "1")]
    pub secondary_tables: usize,

    /// Non-key fields per generated table
    #[arg(long, default_value = "4")]
    pub fields: usize,

    /// Maximum secondary rows per root key
    #[arg(long, default_value = "5")]
    pub rows_per_key: u32,

    /// Every root key gets exactly --rows-per-key rows
    #[arg(long)]
    pub fixed_rows_per_key: bool,

    /// Generator seed
    #[arg(long, default_value = "42")]
    pub seed: u64,

    /// Verbosity (-v debug, -vv trace); RUST_LOG takes precedence
    #[arg(short = 'v', long, action = ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Checks that do not depend on the config file
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.mode == Some(ExecutionMode::Generate) {
            if self.output_dir.is_none() {
                anyhow::bail!("generate mode needs --output-dir");
            }
            if self.records == 0 {
                anyhow::bail!("records must be at least 1");
            }
            if self.rows_per_key == 0 && self.fixed_rows_per_key {
                anyhow::bail!("fixed rows per key needs --rows-per-key of at least 1");
            }
        }

        if self.simulated_workers == Some(0) {
            anyhow::bail!("simulated_workers must be at least 1");
        }
        if self.workers_per_node == Some(0) {
            anyhow::bail!("workers_per_node must be at least 1");
        }
        if self.max_chunk_records == Some(0) {
            anyhow::bail!("max_chunk_records must be at least 1");
        }
        for param in &self.params {
            if !param.contains('=') {
                anyhow::bail!("task parameter '{}' is not KEY=VALUE", param);
            }
        }

        Ok(())
    }
}
