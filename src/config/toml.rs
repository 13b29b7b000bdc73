//! TOML configuration file parsing and CLI overrides

use super::cli::{Cli, ExecutionMode};
use super::*;
use anyhow::Context;
use std::fs;
use std::path::Path;

/// Parse TOML configuration file
pub fn parse_toml_file(path: &Path) -> Result<Config> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_toml_string(&contents).with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Parse TOML configuration from string
pub fn parse_toml_string(contents: &str) -> Result<Config> {
    let config: Config = ::toml::from_str(contents).context("Failed to parse TOML configuration")?;
    Ok(config)
}

/// Merge CLI arguments with TOML configuration (CLI takes precedence)
pub fn merge_cli_with_config(cli: &Cli, mut config: Config) -> Result<Config> {
    if let Some(mode) = cli.mode {
        config.run.mode = mode;
    }

    // Database
    if !cli.tables.is_empty() {
        config.database.tables = cli
            .tables
            .iter()
            .map(|arg| parse_table_arg(arg, &cli.key_fields))
            .collect::<Result<Vec<_>>>()?;
    } else if !cli.key_fields.is_empty() {
        for table in &mut config.database.tables {
            table.key_fields = cli.key_fields.clone();
        }
    }
    if let Some(separator) = cli.separator {
        config.database.separator = separator;
    }
    if cli.no_header {
        config.database.header = false;
    }

    // Task
    if let Some(task) = &cli.task {
        config.task.name = task.clone();
    }
    if !cli.columns.is_empty() {
        config.task.columns = cli.columns.clone();
    }
    for param in &cli.params {
        let (key, value) = parse_param(param)?;
        if !config.task.params.is_object() {
            config.task.params = serde_json::Value::Object(serde_json::Map::new());
        }
        if let Some(params) = config.task.params.as_object_mut() {
            params.insert(key, value);
        }
    }

    // Resources
    if let Some(limit) = &cli.memory_limit {
        config.resources.memory_limit = Some(parse_size(limit)?);
    }
    if let Some(limit) = &cli.disk_limit {
        config.resources.disk_limit = Some(parse_size(limit)?);
    }
    if cli.cores.is_some() {
        config.resources.cores = cli.cores;
    }
    if let Some(max_workers) = cli.max_workers {
        config.resources.max_workers = max_workers;
    }
    if cli.simulated_workers.is_some() {
        config.resources.simulated_workers = cli.simulated_workers;
    }
    if let Some(policy) = cli.memory_policy {
        config.resources.memory_policy = policy;
    }
    if let Some(policy) = cli.disk_policy {
        config.resources.disk_policy = policy;
    }

    // Chunking
    if let Some(bytes) = &cli.max_chunk_bytes {
        config.chunking.max_chunk_bytes = Some(parse_size(bytes)?);
    }
    if cli.max_chunk_records.is_some() {
        config.chunking.max_chunk_records = cli.max_chunk_records;
    }
    if let Some(bytes) = &cli.micro_chunk {
        config.chunking.micro_chunk = Some(parse_size(bytes)?);
    }

    // Rebalancing
    if cli.no_rebalance {
        config.rebalance.enabled = false;
    }
    if cli.force_split_above.is_some() {
        config.rebalance.force_split_above_records = cli.force_split_above;
    }

    // Run
    if cli.temp_dir.is_some() {
        config.run.temp_dir = cli.temp_dir.clone();
    }
    if cli.dry_run {
        config.run.dry_run = true;
    }
    if cli.json_output.is_some() {
        config.run.json_output = cli.json_output.clone();
    }
    if let Some(hosts) = &cli.host_list {
        config.run.nodes = hosts
            .split(',')
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(str::to_string)
            .collect();
        if config.run.mode == ExecutionMode::Standalone && cli.mode.is_none() {
            config.run.mode = ExecutionMode::Coordinator;
        }
    }
    if let Some(workers) = cli.workers_per_node {
        config.run.workers_per_node = workers;
    }
    if let Some(port) = cli.listen_port {
        config.run.listen_port = port;
    }

    Ok(config)
}

/// `PATH` or `NAME=PATH`; the name defaults to the file stem
fn parse_table_arg(arg: &str, key_fields: &[String]) -> Result<TableSpec> {
    let (name, path) = match arg.split_once('=') {
        Some((name, path)) => (name.trim().to_string(), PathBuf::from(path.trim())),
        None => {
            let path = PathBuf::from(arg);
            let name = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .with_context(|| format!("Cannot derive a table name from '{}'", arg))?;
            (name, path)
        }
    };

    Ok(TableSpec {
        name,
        path,
        key_fields: key_fields.to_vec(),
    })
}

/// `KEY=VALUE`, with VALUE parsed as JSON and kept as a string otherwise
fn parse_param(param: &str) -> Result<(String, serde_json::Value)> {
    let (key, value) = param
        .split_once('=')
        .with_context(|| format!("Task parameter '{}' is not KEY=VALUE", param))?;
    let value = serde_json::from_str(value).unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((key.trim().to_string(), value))
}

/// Parse size string (e.g., "1G", "100M", "4k", "64KB") to bytes
pub fn parse_size(s: &str) -> Result<u64> {
    let upper = s.trim().to_uppercase();
    if upper.is_empty() {
        anyhow::bail!("Empty size string");
    }
    let s = upper
        .strip_suffix('B')
        .filter(|rest| !rest.is_empty())
        .unwrap_or(upper.as_str());

    let (num_str, multiplier) = if let Some(n) = s.strip_suffix('K') {
        (n, 1024u64)
    } else if let Some(n) = s.strip_suffix('M') {
        (n, 1024 * 1024)
    } else if let Some(n) = s.strip_suffix('G') {
        (n, 1024 * 1024 * 1024)
    } else if let Some(n) = s.strip_suffix('T') {
        (n, 1024 * 1024 * 1024 * 1024)
    } else {
        (s, 1)
    };

    let num: u64 = num_str
        .trim()
        .parse()
        .with_context(|| format!("Invalid number in size: {}", num_str))?;

    num.checked_mul(multiplier)
        .with_context(|| format!("Size out of range: {}", s))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("4k").unwrap(), 4096);
        assert_eq!(parse_size("64KB").unwrap(), 65536);
        assert_eq!(parse_size("1M").unwrap(), 1024 * 1024);
        assert_eq!(parse_size("2g").unwrap(), 2 * 1024 * 1024 * 1024);
        assert_eq!(parse_size("512").unwrap(), 512);
        assert!(parse_size("").is_err());
        assert!(parse_size("abc").is_err());
        assert!(parse_size("99999999999T").is_err());
    }

    #[test]
    fn test_cli_overrides_file() {
        let config = parse_toml_string(
            r#"
            [[database.tables]]
            name = "root"
            path = "root.txt"

            [task]
            name = "record-count"

            [chunking]
            max_chunk_records = 100
            "#,
        )
        .unwrap();
        let cli = Cli::parse_from([
            "partask",
            "--task",
            "column-extract",
            "-p",
            "output=out.tsv",
            "-p",
            "header=false",
            "--max-chunk-records",
            "2500",
            "--no-rebalance",
        ]);

        let merged = merge_cli_with_config(&cli, config).unwrap();
        assert_eq!(merged.database.tables[0].name, "root");
        assert_eq!(merged.task.name, "column-extract");
        assert_eq!(merged.task.params["output"], "out.tsv");
        assert_eq!(merged.task.params["header"], false);
        assert_eq!(merged.chunking.max_chunk_records, Some(2500));
        assert!(!merged.rebalance.enabled);
    }

    #[test]
    fn test_table_arguments() {
        let keys = vec!["Key1".to_string()];
        let table = parse_table_arg("/data/people.txt", &keys).unwrap();
        assert_eq!(table.name, "people");
        assert_eq!(table.key_fields, keys);

        let table = parse_table_arg("visits=/data/v.tsv", &keys).unwrap();
        assert_eq!(table.name, "visits");
        assert_eq!(table.path, PathBuf::from("/data/v.tsv"));
    }

    #[test]
    fn test_host_list_selects_coordinator() {
        let cli = Cli::parse_from(["partask", "--host-list", "a:9999, b:9999", "db.txt"]);
        let merged = merge_cli_with_config(&cli, Config::default()).unwrap();
        assert_eq!(merged.run.mode, ExecutionMode::Coordinator);
        assert_eq!(merged.run.nodes, vec!["a:9999", "b:9999"]);
    }
}
