//! Worker pools
//!
//! The coordinator talks to its workers only through [`WorkerPool`]: send a
//! directive to one worker, wait for the next report from any worker. A worker
//! that disappears surfaces as [`TaskError::WorkerLost`] from `next_report`.

use crate::error::TaskError;
use crate::task::TaskRegistry;
use crate::worker::{Directive, Report, WorkerDriver};
use crate::Result;
use anyhow::Context;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::mpsc;

/// Report from a worker, or why the worker is gone
pub type WorkerEvent = (usize, std::result::Result<Report, String>);

#[async_trait]
pub trait WorkerPool: Send {
    fn size(&self) -> usize;

    async fn send(&mut self, worker: usize, directive: Directive) -> Result<()>;

    /// Next report from any worker, in arrival order
    async fn next_report(&mut self) -> Result<(usize, Report)>;

    async fn close(&mut self) -> Result<()>;
}

/// Turn a pool event into a report or a lost-worker error
pub(crate) fn event_to_report(event: Option<WorkerEvent>) -> Result<(usize, Report)> {
    match event {
        Some((worker, Ok(report))) => Ok((worker, report)),
        Some((worker, Err(message))) => Err(TaskError::WorkerLost { worker, message }.into()),
        None => Err(TaskError::Protocol("every worker channel is closed".to_string()).into()),
    }
}

/// Workers running on threads of this process
pub struct ThreadPool {
    senders: Vec<Option<mpsc::UnboundedSender<Directive>>>,
    events: mpsc::UnboundedReceiver<WorkerEvent>,
    handles: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    pub fn spawn(count: usize, registry: &TaskRegistry, cancel: Arc<AtomicBool>) -> Result<Self> {
        let (event_tx, events) = mpsc::unbounded_channel();
        let mut senders = Vec::with_capacity(count);
        let mut handles = Vec::with_capacity(count);

        for id in 0..count {
            let (tx, mut rx) = mpsc::unbounded_channel::<Directive>();
            let events = event_tx.clone();
            let mut driver = WorkerDriver::new(id, registry.clone(), cancel.clone());

            let handle = std::thread::Builder::new()
                .name(format!("partask-worker-{}", id))
                .spawn(move || {
                    while let Some(directive) = rx.blocking_recv() {
                        let shutdown = matches!(directive, Directive::Shutdown { .. });
                        match std::panic::catch_unwind(AssertUnwindSafe(|| driver.handle(directive))) {
                            Ok(Some(report)) => {
                                if events.send((id, Ok(report))).is_err() {
                                    break;
                                }
                            }
                            Ok(None) => {}
                            Err(_) => {
                                let _ = events.send((id, Err("worker thread panicked".to_string())));
                                break;
                            }
                        }
                        if shutdown {
                            break;
                        }
                    }
                })
                .with_context(|| format!("Failed to spawn worker thread {}", id))?;

            senders.push(Some(tx));
            handles.push(handle);
        }

        tracing::debug!(workers = count, "worker threads started");
        Ok(Self { senders, events, handles })
    }
}

#[async_trait]
impl WorkerPool for ThreadPool {
    fn size(&self) -> usize {
        self.senders.len()
    }

    async fn send(&mut self, worker: usize, directive: Directive) -> Result<()> {
        let sender = self
            .senders
            .get(worker)
            .and_then(Option::as_ref)
            .ok_or_else(|| TaskError::WorkerLost { worker, message: "no such worker".to_string() })?;
        sender.send(directive).map_err(|_| {
            TaskError::WorkerLost {
                worker,
                message: "worker thread exited".to_string(),
            }
            .into()
        })
    }

    async fn next_report(&mut self) -> Result<(usize, Report)> {
        event_to_report(self.events.recv().await)
    }

    async fn close(&mut self) -> Result<()> {
        self.senders.iter_mut().for_each(|s| *s = None);
        let handles: Vec<JoinHandle<()>> = self.handles.drain(..).collect();
        let panicked = tokio::task::spawn_blocking(move || {
            handles
                .into_iter()
                .map(JoinHandle::join)
                .filter(|joined| joined.is_err())
                .count()
        })
        .await
        .context("Failed to join worker threads")?;
        if panicked > 0 {
            tracing::warn!(panicked, "worker threads panicked");
        }
        Ok(())
    }
}

/// Virtual workers run inline and in turn by the coordinator task
///
/// Each directive is handled as soon as it is sent; replies queue up until the
/// coordinator asks for them.
pub struct InlinePool {
    drivers: Vec<WorkerDriver>,
    pending: VecDeque<(usize, Report)>,
}

impl InlinePool {
    pub fn new(count: usize, registry: &TaskRegistry, cancel: Arc<AtomicBool>) -> Self {
        Self {
            drivers: (0..count)
                .map(|id| WorkerDriver::new(id, registry.clone(), cancel.clone()))
                .collect(),
            pending: VecDeque::new(),
        }
    }
}

#[async_trait]
impl WorkerPool for InlinePool {
    fn size(&self) -> usize {
        self.drivers.len()
    }

    async fn send(&mut self, worker: usize, directive: Directive) -> Result<()> {
        let driver = self
            .drivers
            .get_mut(worker)
            .ok_or_else(|| TaskError::WorkerLost { worker, message: "no such worker".to_string() })?;
        if let Some(report) = driver.handle(directive) {
            self.pending.push_back((worker, report));
        }
        Ok(())
    }

    async fn next_report(&mut self) -> Result<(usize, Report)> {
        self.pending
            .pop_front()
            .ok_or_else(|| TaskError::Protocol("waiting for a report no simulated worker owes".to_string()).into())
    }

    async fn close(&mut self) -> Result<()> {
        self.pending.clear();
        Ok(())
    }
}
