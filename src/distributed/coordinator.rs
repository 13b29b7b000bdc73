//! Remote worker pool
//!
//! Each remote worker is one TCP connection to a node service. Workers are
//! spread round-robin over the node addresses, so a node listed once with a
//! pool of four workers hosts four connections.
//!
//! A reader task per connection turns incoming messages into pool events. A
//! broken connection, or an error message from the node, becomes a lost-worker
//! event; the reader stops after forwarding the worker's finalize report.

use crate::coordinator::pool::{event_to_report, WorkerEvent, WorkerPool};
use crate::distributed::protocol::*;
use crate::error::TaskError;
use crate::worker::{Directive, Report};
use crate::Result;
use anyhow::Context;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

struct RemoteWorker {
    address: String,
    writer: Option<OwnedWriteHalf>,
}

pub struct RemotePool {
    workers: Vec<RemoteWorker>,
    events: mpsc::UnboundedReceiver<WorkerEvent>,
    readers: Vec<JoinHandle<()>>,
    /// Staged schema text by path, read once per run
    schema_text: HashMap<PathBuf, String>,
}

impl RemotePool {
    /// Open `count` worker connections spread over `addresses`
    pub async fn connect(addresses: &[String], count: usize) -> Result<Self> {
        if addresses.is_empty() {
            anyhow::bail!("No nodes specified for distributed mode");
        }

        let (event_tx, events) = mpsc::unbounded_channel();
        let mut workers = Vec::with_capacity(count);
        let mut readers = Vec::with_capacity(count);

        for id in 0..count {
            let address = &addresses[id % addresses.len()];
            let stream = TcpStream::connect(address)
                .await
                .with_context(|| format!("Failed to connect to {}", address))?;
            stream
                .set_nodelay(true)
                .with_context(|| format!("Failed to configure connection to {}", address))?;

            let (reader, writer) = stream.into_split();
            readers.push(tokio::spawn(read_reports(id, address.clone(), reader, event_tx.clone())));
            workers.push(RemoteWorker {
                address: address.clone(),
                writer: Some(writer),
            });
            tracing::debug!(worker = id, node = %address, "worker connected");
        }

        tracing::info!(workers = count, nodes = addresses.len(), "remote workers connected");
        Ok(Self {
            workers,
            events,
            readers,
            schema_text: HashMap::new(),
        })
    }

    fn to_message(&mut self, worker: usize, directive: Directive) -> Result<Message> {
        Ok(match directive {
            Directive::Init { shared, budget } => {
                let schema_json = match self.schema_text.get(&shared.schema_file) {
                    Some(text) => text.clone(),
                    None => {
                        let text = std::fs::read_to_string(&shared.schema_file).with_context(|| {
                            format!("Failed to read staged schema {}", shared.schema_file.display())
                        })?;
                        self.schema_text.insert(shared.schema_file.clone(), text.clone());
                        text
                    }
                };
                Message::Config(ConfigMessage {
                    protocol_version: PROTOCOL_VERSION,
                    worker_id: worker,
                    shared: (*shared).clone(),
                    schema_json,
                    budget,
                })
            }
            Directive::Process(chunk) => Message::Process(ProcessMessage { chunk }),
            Directive::Park => Message::Park,
            Directive::Shutdown { ok } => Message::Shutdown(ShutdownMessage { ok }),
        })
    }
}

async fn read_reports(
    worker: usize,
    address: String,
    mut reader: OwnedReadHalf,
    events: mpsc::UnboundedSender<WorkerEvent>,
) {
    loop {
        let event = match read_message(&mut reader).await {
            Ok(Message::Ready(ready)) if ready.protocol_version != PROTOCOL_VERSION => Err(format!(
                "Protocol version mismatch on node {}: expected {}, got {}",
                ready.node_id, PROTOCOL_VERSION, ready.protocol_version
            )),
            Ok(Message::Ready(ready)) => {
                tracing::debug!(worker, node = %ready.node_id, "remote worker ready");
                Ok(Report::Ready)
            }
            Ok(Message::Report(report)) => Ok(report),
            Ok(Message::Error(err)) => Err(format!("Node {} reported error: {}", err.node_id, err.error)),
            Ok(other) => Err(format!("Unexpected message from node {}: {:?}", address, other)),
            Err(e) => Err(format!("Connection to {} lost: {:#}", address, e)),
        };

        let last = matches!(event, Ok(Report::Finalized { .. }) | Err(_));
        if events.send((worker, event)).is_err() || last {
            break;
        }
    }
}

#[async_trait]
impl WorkerPool for RemotePool {
    fn size(&self) -> usize {
        self.workers.len()
    }

    async fn send(&mut self, worker: usize, directive: Directive) -> Result<()> {
        let message = self.to_message(worker, directive)?;
        let remote = self
            .workers
            .get_mut(worker)
            .ok_or_else(|| TaskError::WorkerLost { worker, message: "no such worker".to_string() })?;
        let writer = remote.writer.as_mut().ok_or_else(|| TaskError::WorkerLost {
            worker,
            message: format!("connection to {} is closed", remote.address),
        })?;

        if let Err(e) = write_message(writer, &message).await {
            remote.writer = None;
            return Err(TaskError::WorkerLost {
                worker,
                message: format!("{:#}", e),
            }
            .into());
        }
        Ok(())
    }

    async fn next_report(&mut self) -> Result<(usize, Report)> {
        event_to_report(self.events.recv().await)
    }

    async fn close(&mut self) -> Result<()> {
        for worker in &mut self.workers {
            worker.writer = None;
        }
        for reader in self.readers.drain(..) {
            reader.abort();
        }
        Ok(())
    }
}
