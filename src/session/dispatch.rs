//! Worker pool that runs the application's message handler
//!
//! Inbound messages are queued in accept order and picked up by a fixed set
//! of workers, so the transport callback path never waits on application
//! code. Each message runs as its own task: a handler error or panic is
//! logged and counted, and the worker moves on to the next message.

use super::model::InboundMessage;
use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Workers per logical core
pub const WORKERS_PER_CORE: usize = 3;

/// Error returned by a [`MessageHandler`]
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("handler failed: {0}")]
    Failed(String),
    #[error("handler failed")]
    Other(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl HandlerError {
    pub fn failed<S: Into<String>>(message: S) -> Self {
        Self::Failed(message.into())
    }
}

/// Errors from submitting to the pool
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("dispatch pool is stopped")]
    Stopped,
}

/// Application capability invoked once per inbound message
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: InboundMessage) -> Result<(), HandlerError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(InboundMessage) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, message: InboundMessage) -> Result<(), HandlerError> {
        (self.0)(message).await
    }
}

/// Wrap an async closure as a [`MessageHandler`]
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(InboundMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

#[derive(Debug, Default)]
struct PoolStats {
    queued: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
}

/// Fixed-size pool of handler workers
pub struct DispatchPool {
    size: usize,
    sender: Mutex<Option<mpsc::UnboundedSender<InboundMessage>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    stats: Arc<PoolStats>,
}

impl std::fmt::Debug for DispatchPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchPool")
            .field("size", &self.size)
            .field("pending", &self.pending())
            .field("running", &self.is_running())
            .finish()
    }
}

impl DispatchPool {
    /// Worker count derived from the host: three per logical core
    pub fn default_size() -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            * WORKERS_PER_CORE
    }

    /// Spawn `size` workers on the current tokio runtime
    pub fn new(size: usize, handler: Arc<dyn MessageHandler>) -> Self {
        let size = size.max(1);
        let (tx, rx) = mpsc::unbounded_channel::<InboundMessage>();
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let stats = Arc::new(PoolStats::default());

        let workers = (0..size)
            .map(|worker_id| {
                tokio::spawn(Self::worker_loop(
                    worker_id,
                    rx.clone(),
                    handler.clone(),
                    stats.clone(),
                ))
            })
            .collect();

        debug!(workers = size, "dispatch pool started");
        Self {
            size,
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            stats,
        }
    }

    async fn worker_loop(
        worker_id: usize,
        rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<InboundMessage>>>,
        handler: Arc<dyn MessageHandler>,
        stats: Arc<PoolStats>,
    ) {
        loop {
            let next = {
                let mut rx = rx.lock().await;
                rx.recv().await
            };
            let Some(message) = next else {
                break;
            };

            let topic = message.topic.clone();
            let handler = handler.clone();
            let outcome = tokio::spawn(async move { handler.handle(message).await }).await;
            stats.queued.fetch_sub(1, Ordering::SeqCst);

            match outcome {
                Ok(Ok(())) => {
                    stats.completed.fetch_add(1, Ordering::Relaxed);
                    debug!(worker_id, topic = %topic, "message handled");
                }
                Ok(Err(e)) => {
                    stats.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        worker_id,
                        topic = %topic,
                        error = %e,
                        "message handler returned an error"
                    );
                }
                Err(join_error) if join_error.is_panic() => {
                    stats.failed.fetch_add(1, Ordering::Relaxed);
                    error!(worker_id, topic = %topic, "message handler panicked");
                }
                Err(join_error) => {
                    stats.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        worker_id,
                        topic = %topic,
                        error = %join_error,
                        "message handler cancelled"
                    );
                }
            }
        }
        debug!(worker_id, "dispatch worker exiting");
    }

    /// Queue a message without waiting for it to run
    pub fn submit(&self, message: InboundMessage) -> Result<(), DispatchError> {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        let sender = sender.as_ref().ok_or(DispatchError::Stopped)?;
        self.stats.queued.fetch_add(1, Ordering::SeqCst);
        sender.send(message).map_err(|_| {
            self.stats.queued.fetch_sub(1, Ordering::SeqCst);
            DispatchError::Stopped
        })
    }

    /// Stop accepting messages and wait for the queue to drain
    pub async fn shutdown(&self) {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if sender.is_none() {
            return;
        }
        drop(sender);

        let workers: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "dispatch worker ended abnormally");
            }
        }
        info!(
            completed = self.completed(),
            failed = self.failed(),
            "dispatch pool drained"
        );
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Messages accepted but not yet finished
    pub fn pending(&self) -> usize {
        self.stats.queued.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> u64 {
        self.stats.completed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.stats.failed.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}
