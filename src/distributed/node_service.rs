//! Node service for distributed mode
//!
//! Runs on each worker node. Every accepted connection hosts one worker: the
//! first message must be a `Config`, which carries the shared specification and
//! the schema text. The schema is staged in the node's temporary directory and
//! the worker driver runs on the blocking thread pool, one directive at a time,
//! until the coordinator sends `Shutdown` or the connection drops.

use crate::database::schema::stage_text;
use crate::distributed::protocol::*;
use crate::task::TaskRegistry;
use crate::worker::{Directive, Report, WorkerDriver};
use crate::Result;
use anyhow::Context;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tempfile::TempPath;
use tokio::net::{TcpListener, TcpStream};

/// Node service
#[derive(Clone)]
pub struct NodeService {
    listen_port: u16,
    /// Hostname reported to the coordinator
    node_id: String,
    registry: TaskRegistry,
    temp_dir: PathBuf,
    cancel: Arc<AtomicBool>,
}

impl NodeService {
    pub fn new(listen_port: u16, registry: TaskRegistry, temp_dir: PathBuf, cancel: Arc<AtomicBool>) -> Self {
        Self {
            listen_port,
            node_id: get_node_id(),
            registry,
            temp_dir,
            cancel,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Listen on every interface and serve forever
    pub async fn run(self) -> Result<()> {
        let addr = format!("0.0.0.0:{}", self.listen_port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind node service on {}", addr))?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        tracing::info!(
            node = %self.node_id,
            addr = %listener.local_addr().context("Failed to read listener address")?,
            "node service listening"
        );

        loop {
            let (stream, peer) = listener.accept().await.context("Failed to accept connection")?;
            tracing::debug!(%peer, "coordinator connected");

            let service = self.clone();
            tokio::spawn(async move {
                if let Err(e) = service.handle_worker(stream).await {
                    tracing::warn!(%peer, error = %format!("{:#}", e), "worker connection ended with an error");
                }
            });
        }
    }

    async fn handle_worker(&self, mut stream: TcpStream) -> Result<()> {
        stream.set_nodelay(true).context("Failed to configure connection")?;

        let config = match read_message(&mut stream).await? {
            Message::Config(config) => config,
            other => {
                self.send_error(&mut stream, format!("Expected CONFIG, got {:?}", other)).await?;
                anyhow::bail!("Expected CONFIG message");
            }
        };
        if config.protocol_version != PROTOCOL_VERSION {
            self.send_error(
                &mut stream,
                format!(
                    "Protocol version mismatch: coordinator={}, node={}",
                    config.protocol_version, PROTOCOL_VERSION
                ),
            )
            .await?;
            anyhow::bail!("Protocol version mismatch");
        }

        // Held until the connection ends; the staged file is removed on drop
        let staged: TempPath = match stage_text(&config.schema_json, &self.temp_dir) {
            Ok(staged) => staged,
            Err(e) => {
                self.send_error(&mut stream, format!("{:#}", e)).await?;
                return Err(e);
            }
        };
        let mut shared = config.shared;
        shared.schema_file = staged.to_path_buf();

        let worker_id = config.worker_id;
        tracing::info!(worker = worker_id, run_id = %shared.run_id, task = %shared.task_name, "worker configured");

        let mut driver = WorkerDriver::new(worker_id, self.registry.clone(), self.cancel.clone());
        let mut directive = Directive::Init {
            shared: Arc::new(shared),
            budget: config.budget,
        };

        loop {
            let shutdown = matches!(directive, Directive::Shutdown { .. });
            let (returned, report) = tokio::task::spawn_blocking(move || {
                let report = driver.handle(directive);
                (driver, report)
            })
            .await
            .context("Worker task panicked")?;
            driver = returned;

            if let Some(report) = report {
                let message = match report {
                    Report::Ready => Message::Ready(ReadyMessage {
                        protocol_version: PROTOCOL_VERSION,
                        node_id: self.node_id.clone(),
                        worker_id,
                    }),
                    other => Message::Report(other),
                };
                write_message(&mut stream, &message).await?;
            }
            if shutdown {
                tracing::debug!(worker = worker_id, "worker shut down");
                break;
            }

            directive = match read_message(&mut stream).await {
                Ok(Message::Process(process)) => Directive::Process(process.chunk),
                Ok(Message::Park) => Directive::Park,
                Ok(Message::Shutdown(shutdown)) => Directive::Shutdown { ok: shutdown.ok },
                Ok(other) => {
                    self.send_error(&mut stream, format!("Unexpected message {:?}", other)).await?;
                    Directive::Shutdown { ok: false }
                }
                Err(e) => {
                    tracing::warn!(worker = worker_id, error = %format!("{:#}", e), "coordinator connection lost");
                    Directive::Shutdown { ok: false }
                }
            };
        }

        drop(staged);
        Ok(())
    }

    async fn send_error(&self, stream: &mut TcpStream, error: String) -> Result<()> {
        tracing::error!(node = %self.node_id, %error, "rejecting coordinator request");
        let msg = Message::Error(ErrorMessage {
            node_id: self.node_id.clone(),
            error,
        });
        write_message(stream, &msg).await
    }
}

fn get_node_id() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}
