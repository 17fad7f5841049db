//! Bounded per-destination forwarding queues.
//!
//! Each destination channel gets one bounded FIFO queue and exactly one
//! worker task draining it. The worker spaces deliveries by a fixed delay and
//! honors rate-limit waits from the remote, so bursts in source chats never
//! translate into bursts at the destination.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    domain::{ChannelId, MessageRef},
    errors::Error,
    metrics::{ErrorCategory, MetricsSink},
    Result,
};

#[derive(Clone, Copy, Debug)]
pub struct QueueConfig {
    pub capacity: usize,
    pub enqueue_timeout: Duration,
    pub forward_delay: Duration,
    /// When true, a rate-limited delivery is retried once after the wait
    /// instead of being dropped.
    pub requeue_on_rate_limit: bool,
    pub shutdown_grace: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            enqueue_timeout: Duration::from_secs(60),
            forward_delay: Duration::from_millis(500),
            requeue_on_rate_limit: false,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct QueueEntry {
    pub message: MessageRef,
    pub enqueued_at: Instant,
}

/// Delivery port the workers call for each dequeued entry.
#[async_trait]
pub trait MessageForwarder: Send + Sync {
    async fn forward(&self, destination: ChannelId, message: MessageRef) -> Result<()>;
}

struct DestinationQueue {
    tx: mpsc::Sender<QueueEntry>,
    depth: Arc<AtomicUsize>,
    cancel: CancellationToken,
    worker: JoinHandle<()>,
}

/// Owns all destination queues and their workers.
pub struct QueueManager {
    cfg: QueueConfig,
    metrics: Arc<dyn MetricsSink>,
    queues: Mutex<HashMap<ChannelId, DestinationQueue>>,
}

impl QueueManager {
    pub fn new(cfg: QueueConfig, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            cfg,
            metrics,
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Ensures a queue and worker exist for `destination`. Idempotent: a
    /// second call for a live destination is a no-op, so there is never more
    /// than one worker per destination.
    pub async fn start(&self, destination: ChannelId, forwarder: Arc<dyn MessageForwarder>) {
        let mut queues = self.queues.lock().await;
        if let Some(existing) = queues.get(&destination) {
            if !existing.worker.is_finished() {
                return;
            }
            queues.remove(&destination);
        }

        let (tx, rx) = mpsc::channel(self.cfg.capacity);
        let depth = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(run_worker(
            destination,
            rx,
            Arc::clone(&depth),
            cancel.clone(),
            self.cfg,
            forwarder,
            Arc::clone(&self.metrics),
        ));
        queues.insert(
            destination,
            DestinationQueue {
                tx,
                depth,
                cancel,
                worker,
            },
        );
        debug!(channel = %destination, "forwarding queue started");
    }

    /// Enqueues a message for `destination`, waiting up to the configured
    /// timeout when the queue is full. A timeout drops the message.
    pub async fn enqueue(&self, destination: ChannelId, message: MessageRef) -> Result<()> {
        let (tx, depth) = {
            let queues = self.queues.lock().await;
            let q = queues
                .get(&destination)
                .ok_or_else(|| Error::NotFound(format!("no queue for channel {destination}")))?;
            (q.tx.clone(), Arc::clone(&q.depth))
        };

        let entry = QueueEntry {
            message,
            enqueued_at: Instant::now(),
        };
        match tx.send_timeout(entry, self.cfg.enqueue_timeout).await {
            Ok(()) => {
                let d = depth.fetch_add(1, Ordering::Relaxed) + 1;
                self.metrics.queue_depth(destination, d);
                Ok(())
            }
            Err(_) => {
                self.metrics.message_dropped(destination);
                self.metrics.error(ErrorCategory::QueueFull);
                warn!(channel = %destination, "queue full, dropping message");
                Err(Error::QueueFull {
                    channel_id: destination,
                })
            }
        }
    }

    pub async fn depth(&self, destination: ChannelId) -> Option<usize> {
        let queues = self.queues.lock().await;
        queues
            .get(&destination)
            .map(|q| q.depth.load(Ordering::Relaxed))
    }

    /// Stops one destination's worker. Entries still queued are abandoned.
    pub async fn stop(&self, destination: ChannelId) {
        let removed = {
            let mut queues = self.queues.lock().await;
            queues.remove(&destination)
        };
        if let Some(q) = removed {
            self.shutdown_queue(destination, q).await;
        }
    }

    pub async fn stop_all(&self) {
        let drained: Vec<_> = {
            let mut queues = self.queues.lock().await;
            queues.drain().collect()
        };
        for (destination, q) in drained {
            self.shutdown_queue(destination, q).await;
        }
    }

    async fn shutdown_queue(&self, destination: ChannelId, q: DestinationQueue) {
        q.cancel.cancel();
        drop(q.tx);
        let abort = q.worker.abort_handle();
        if tokio::time::timeout(self.cfg.shutdown_grace, q.worker)
            .await
            .is_err()
        {
            warn!(channel = %destination, "queue worker did not stop in time, aborting");
            abort.abort();
        }
        info!(channel = %destination, "forwarding queue stopped");
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_worker(
    destination: ChannelId,
    mut rx: mpsc::Receiver<QueueEntry>,
    depth: Arc<AtomicUsize>,
    cancel: CancellationToken,
    cfg: QueueConfig,
    forwarder: Arc<dyn MessageForwarder>,
    metrics: Arc<dyn MetricsSink>,
) {
    loop {
        let entry = tokio::select! {
            _ = cancel.cancelled() => break,
            entry = rx.recv() => match entry {
                Some(entry) => entry,
                None => break,
            },
        };
        let d = depth.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
        metrics.queue_depth(destination, d);

        // Spacing delay before every delivery attempt.
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(cfg.forward_delay) => {}
        }

        deliver(destination, entry, &cancel, &cfg, &*forwarder, &*metrics).await;
    }
    debug!(channel = %destination, "queue worker exiting");
}

async fn deliver(
    destination: ChannelId,
    entry: QueueEntry,
    cancel: &CancellationToken,
    cfg: &QueueConfig,
    forwarder: &dyn MessageForwarder,
    metrics: &dyn MetricsSink,
) {
    match forwarder.forward(destination, entry.message).await {
        Ok(()) => {
            metrics.message_forwarded(destination);
        }
        Err(Error::RateLimited { retry_after }) => {
            metrics.error(ErrorCategory::RateLimited);
            warn!(
                channel = %destination,
                wait_secs = retry_after.as_secs(),
                "rate limited while forwarding"
            );
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(retry_after) => {}
            }
            if cfg.requeue_on_rate_limit {
                // Single retry after the wait; a second rate limit drops.
                match forwarder.forward(destination, entry.message).await {
                    Ok(()) => metrics.message_forwarded(destination),
                    Err(err) => {
                        metrics.error(ErrorCategory::from(&err));
                        metrics.message_dropped(destination);
                        warn!(channel = %destination, error = %err, "retry after rate limit failed, dropping");
                    }
                }
            } else {
                metrics.message_dropped(destination);
            }
        }
        Err(err) => {
            metrics.error(ErrorCategory::from(&err));
            metrics.message_dropped(destination);
            warn!(channel = %destination, error = %err, "forward failed, dropping message");
        }
    }
}
