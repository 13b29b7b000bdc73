//! Configuration validation

use super::cli::ExecutionMode;
use super::*;

/// Validate complete configuration
pub fn validate_config(config: &Config) -> Result<()> {
    let needs_database = matches!(
        config.run.mode,
        ExecutionMode::Standalone | ExecutionMode::Simulated | ExecutionMode::Coordinator
    );
    if needs_database {
        validate_database(&config.database)?;
        validate_task(&config.task)?;
    }
    validate_resources(&config.resources)?;
    validate_chunking(&config.chunking)?;
    validate_rebalance(&config.rebalance)?;
    validate_run(&config.run)?;
    Ok(())
}

/// Validate the table list
pub fn validate_database(database: &DatabaseConfig) -> Result<()> {
    if database.tables.is_empty() {
        anyhow::bail!("no tables given: pass table files or a [database] section");
    }
    let spec = DatabaseSpec {
        tables: database.tables.clone(),
        separator: database.separator,
        header: database.header,
    };
    spec.validate()
}

pub fn validate_task(task: &TaskConfig) -> Result<()> {
    if task.name.trim().is_empty() {
        anyhow::bail!("task name cannot be empty");
    }
    if !task.params.is_null() && !task.params.is_object() {
        anyhow::bail!("task params must be a table");
    }
    Ok(())
}

pub fn validate_resources(resources: &ResourcesConfig) -> Result<()> {
    if resources.memory_limit == Some(0) {
        anyhow::bail!("memory_limit must be greater than 0");
    }
    if resources.cores == Some(0) {
        anyhow::bail!("cores must be at least 1");
    }
    if resources.simulated_workers == Some(0) {
        anyhow::bail!("simulated_workers must be at least 1");
    }
    Ok(())
}

pub fn validate_chunking(chunking: &ChunkingConfig) -> Result<()> {
    let settings = chunking.to_settings();
    if settings.micro_chunk_bytes == 0 {
        anyhow::bail!("micro_chunk must be greater than 0");
    }
    if settings.max_chunk_bytes == Some(0) {
        anyhow::bail!("max_chunk_bytes must be greater than 0");
    }
    if settings.max_chunk_records == Some(0) {
        anyhow::bail!("max_chunk_records must be at least 1");
    }
    if settings.min_chunk_bytes > settings.preferred_chunk_bytes {
        anyhow::bail!(
            "min_chunk ({}) cannot exceed preferred_chunk ({})",
            settings.min_chunk_bytes,
            settings.preferred_chunk_bytes
        );
    }
    Ok(())
}

pub fn validate_rebalance(rebalance: &RebalanceConfig) -> Result<()> {
    if let Some(threshold) = rebalance.force_split_above_records {
        if threshold == 0 {
            anyhow::bail!("force_split_above_records must be at least 1");
        }
    }
    Ok(())
}

pub fn validate_run(run: &RunConfig) -> Result<()> {
    if run.workers_per_node == 0 {
        anyhow::bail!("workers_per_node must be at least 1");
    }
    if run.mode == ExecutionMode::Coordinator && run.nodes.is_empty() {
        anyhow::bail!("coordinator mode needs node addresses (--host-list or run.nodes)");
    }
    if let Some(dir) = &run.temp_dir {
        if dir.exists() && !dir.is_dir() {
            anyhow::bail!("temp_dir {} is not a directory", dir.display());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_table() -> Config {
        let mut config = Config::default();
        config.database.tables.push(TableSpec {
            name: "root".to_string(),
            path: PathBuf::from("root.txt"),
            key_fields: Vec::new(),
        });
        config
    }

    #[test]
    fn test_validate_database() {
        assert!(validate_config(&Config::default()).is_err());
        assert!(validate_config(&config_with_table()).is_ok());

        let mut config = config_with_table();
        config.database.tables.push(TableSpec {
            name: "detail".to_string(),
            path: PathBuf::from("detail.txt"),
            key_fields: vec!["Key1".to_string()],
        });
        // root table has no key fields
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_service_mode_needs_no_tables() {
        let mut config = Config::default();
        config.run.mode = ExecutionMode::Service;
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_validate_chunking() {
        let mut chunking = ChunkingConfig::default();
        assert!(validate_chunking(&chunking).is_ok());

        chunking.max_chunk_records = Some(0);
        assert!(validate_chunking(&chunking).is_err());

        chunking.max_chunk_records = None;
        chunking.min_chunk = Some(16 * 1024 * 1024);
        chunking.preferred_chunk = Some(1024 * 1024);
        assert!(validate_chunking(&chunking).is_err());
    }

    #[test]
    fn test_validate_rebalance() {
        let mut rebalance = RebalanceConfig::default();
        rebalance.force_split_above_records = Some(100);
        assert!(validate_rebalance(&rebalance).is_ok());

        rebalance.force_split_above_records = Some(0);
        assert!(validate_rebalance(&rebalance).is_err());
    }

    #[test]
    fn test_coordinator_needs_nodes() {
        let mut config = config_with_table();
        config.run.mode = ExecutionMode::Coordinator;
        assert!(validate_config(&config).is_err());

        config.run.nodes.push("127.0.0.1:9999".to_string());
        assert!(validate_config(&config).is_ok());
    }
}
