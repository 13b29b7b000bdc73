//! partask CLI entry point

use anyhow::Context;
use partask::config::cli::{Cli, ExecutionMode};
use partask::config::{Config, DatabaseConfig};
use partask::coordinator::Coordinator;
use partask::database::artificial::ArtificialDataset;
use partask::distributed::{NodeService, RemotePool};
use partask::error::Outcome;
use partask::output;
use partask::task::TaskRegistry;
use partask::Result;
use serde::Serialize;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Exit status of an interrupted job
const EXIT_INTERRUPTED: u8 = 130;

fn main() -> ExitCode {
    let cli = Cli::parse_args();
    init_logging(cli.verbose);

    match run(cli) {
        Ok(Outcome::Completed) => ExitCode::SUCCESS,
        Ok(Outcome::Interrupted) => ExitCode::from(EXIT_INTERRUPTED),
        Ok(Outcome::Failed) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(format!("partask={}", level)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(verbose >= 1)
        .with_thread_ids(verbose >= 2)
        .with_line_number(verbose >= 2)
        .init();
}

fn run(cli: Cli) -> Result<Outcome> {
    cli.validate()?;

    if cli.mode == Some(ExecutionMode::Generate) {
        return generate(&cli);
    }

    let config = Config::load(&cli).context("Configuration validation failed")?;
    let registry = TaskRegistry::with_builtin();
    let cancel = Arc::new(AtomicBool::new(false));

    let runtime = tokio::runtime::Runtime::new().context("Failed to create tokio runtime")?;
    runtime.block_on(async move {
        match config.run.mode {
            ExecutionMode::Service => run_service(&config, registry, cancel).await,
            _ => {
                watch_interrupt(cancel.clone());
                if config.run.dry_run {
                    dry_run(&config, registry, cancel)
                } else {
                    run_job(&config, registry, cancel).await
                }
            }
        }
    })
}

/// Raise the cancel flag on Ctrl-C
fn watch_interrupt(cancel: Arc<AtomicBool>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, stopping");
            cancel.store(true, Ordering::Relaxed);
        }
    });
}

async fn run_job(config: &Config, registry: TaskRegistry, cancel: Arc<AtomicBool>) -> Result<Outcome> {
    let job = config.to_job();
    let cap = config.worker_cap();
    let mut coordinator = Coordinator::new(registry, cancel);

    let summary = match config.run.mode {
        ExecutionMode::Simulated => coordinator.run_simulated(&job, cap).await,
        ExecutionMode::Coordinator => {
            let nodes = config.run.nodes.clone();
            coordinator
                .run_with(&job, cap, |count| async move { RemotePool::connect(&nodes, count).await })
                .await
        }
        _ => coordinator.run_local(&job, cap).await,
    };

    output::print_summary(&summary);
    if let Some(path) = &config.run.json_output {
        output::write_json_output(path, &summary, true)?;
        tracing::info!(path = %path.display(), "run report written");
    }
    Ok(summary.outcome)
}

fn dry_run(config: &Config, registry: TaskRegistry, cancel: Arc<AtomicBool>) -> Result<Outcome> {
    let coordinator = Coordinator::new(registry, cancel);
    let (_, prepared) = coordinator.prepare(&config.to_job(), config.worker_cap())?;

    output::print_plan(&prepared);
    if let Some(path) = &config.run.json_output {
        output::write_plan_output(path, &prepared, true)?;
        tracing::info!(path = %path.display(), "chunk plan written");
    }
    prepared.release()?;
    Ok(Outcome::Completed)
}

async fn run_service(config: &Config, registry: TaskRegistry, cancel: Arc<AtomicBool>) -> Result<Outcome> {
    let service = NodeService::new(config.run.listen_port, registry, config.temp_dir(), cancel.clone());

    tokio::select! {
        result = service.run() => result.map(|()| Outcome::Completed),
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("interrupt received, node service stopping");
            cancel.store(true, Ordering::Relaxed);
            Ok(Outcome::Interrupted)
        }
    }
}

#[derive(Serialize)]
struct GeneratedConfig {
    database: DatabaseConfig,
}

/// Write an artificial dataset and a config file describing it
fn generate(cli: &Cli) -> Result<Outcome> {
    let dir = cli.output_dir.as_ref().context("generate mode needs --output-dir")?;
    let dataset = ArtificialDataset {
        root_records: cli.records,
        field_count: cli.fields,
        secondary_tables: cli.secondary_tables,
        max_rows_per_key: cli.rows_per_key,
        fixed_rows_per_key: cli.fixed_rows_per_key,
        seed: cli.seed,
        ..ArtificialDataset::default()
    };
    let db = dataset.generate(dir)?;

    let config = GeneratedConfig {
        database: DatabaseConfig {
            separator: db.separator,
            header: db.header,
            tables: db.tables,
        },
    };
    let text = toml::to_string(&config).context("Failed to serialize generated config")?;
    let path = dir.join("partask.toml");
    std::fs::write(&path, text).with_context(|| format!("Failed to write {}", path.display()))?;

    println!("Generated {} root records in {}", cli.records, dir.display());
    println!("Config: {}", path.display());
    Ok(Outcome::Completed)
}
