// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Worker pool draining the queues into the metrics sink.
//!
//! Delivery is at-least-once: a failed hand-off is retried with exponential
//! backoff up to a configured attempt budget, so a retried item may be
//! double-counted downstream but is never lost silently. When the budget is
//! exhausted the loss is recorded as a countable drop. Shutdown is graceful:
//! on cancellation each worker drains what is already queued before exiting.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::queue::{LogQueue, QueueItem, QueuePayload, QueueReceivers};
use crate::stats::EventSummary;
use crate::stats_service::StatsHandle;

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("metrics sink unavailable: {0}")]
    Unavailable(String),
}

/// Where the workers deliver processed events. The production impl is the
/// stats handle; tests swap in failing sinks to exercise the retry path.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn deliver(&self, payload: &QueuePayload) -> Result<(), SinkError>;

    /// Records events lost after retries were exhausted.
    async fn record_loss(&self, count: u64);
}

#[async_trait]
impl EventSink for StatsHandle {
    async fn deliver(&self, payload: &QueuePayload) -> Result<(), SinkError> {
        let summaries = match payload {
            QueuePayload::Single(event) => vec![EventSummary::of(event)],
            QueuePayload::Batch { events, .. } => events.iter().map(EventSummary::of).collect(),
        };
        self.consume(summaries)
            .map_err(|e| SinkError::Unavailable(e.to_string()))
    }

    async fn record_loss(&self, count: u64) {
        if self.record_drop(count).is_err() {
            error!(count, "Failed to record dropped events, stats service is gone");
        }
    }
}

/// Bounded-retry policy for failed deliveries.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total delivery attempts per item, including the first.
    pub max_attempts: u32,
    /// Base delay; doubles with every failed attempt.
    pub backoff_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            backoff_base: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    #[must_use]
    fn delay(&self, attempt: u32) -> Duration {
        self.backoff_base * 2u32.saturating_pow(attempt.saturating_sub(1).min(16))
    }
}

/// Fixed pool of workers shared across the two queue classes.
pub struct WorkerPool {
    workers: usize,
    policy: RetryPolicy,
    queue: LogQueue,
    sink: Arc<dyn EventSink>,
    cancel_token: CancellationToken,
}

impl WorkerPool {
    #[must_use]
    pub fn new(
        workers: usize,
        policy: RetryPolicy,
        queue: LogQueue,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        WorkerPool {
            workers: workers.max(2),
            policy,
            queue,
            sink,
            cancel_token: CancellationToken::new(),
        }
    }

    /// Token for shutdown coordination; cancel it to drain and stop.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Spawns the workers. At least one worker serves each queue class; the
    /// rest are split evenly.
    pub fn spawn(self, receivers: QueueReceivers) -> Vec<JoinHandle<()>> {
        let single_workers = (self.workers / 2).max(1);
        let batch_workers = (self.workers - single_workers).max(1);

        let single_rx = Arc::new(Mutex::new(receivers.single));
        let batch_rx = Arc::new(Mutex::new(receivers.batch));

        let mut handles = Vec::with_capacity(single_workers + batch_workers);
        for id in 0..single_workers {
            handles.push(tokio::spawn(run_worker(
                format!("single-{id}"),
                Arc::clone(&single_rx),
                self.queue.clone(),
                Arc::clone(&self.sink),
                self.policy,
                self.cancel_token.clone(),
            )));
        }
        for id in 0..batch_workers {
            handles.push(tokio::spawn(run_worker(
                format!("batch-{id}"),
                Arc::clone(&batch_rx),
                self.queue.clone(),
                Arc::clone(&self.sink),
                self.policy,
                self.cancel_token.clone(),
            )));
        }
        handles
    }
}

enum Next {
    Item(QueueItem),
    Closed,
    Cancelled,
}

async fn run_worker(
    name: String,
    rx: Arc<Mutex<mpsc::Receiver<QueueItem>>>,
    queue: LogQueue,
    sink: Arc<dyn EventSink>,
    policy: RetryPolicy,
    cancel_token: CancellationToken,
) {
    debug!(worker = %name, "worker started");

    loop {
        let next = {
            let mut guard = rx.lock().await;
            tokio::select! {
                item = guard.recv() => match item {
                    Some(item) => Next::Item(item),
                    None => Next::Closed,
                },
                () = cancel_token.cancelled() => Next::Cancelled,
            }
        };

        match next {
            Next::Item(item) => process_item(item, &queue, &sink, policy).await,
            Next::Closed => break,
            Next::Cancelled => {
                debug!(worker = %name, "shutdown signal received, draining queue");
                loop {
                    let drained = { rx.lock().await.try_recv() };
                    match drained {
                        Ok(item) => process_item(item, &queue, &sink, policy).await,
                        Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
                    }
                }
                break;
            }
        }
    }

    debug!(worker = %name, "worker stopped");
}

async fn process_item(
    mut item: QueueItem,
    queue: &LogQueue,
    sink: &Arc<dyn EventSink>,
    policy: RetryPolicy,
) {
    let events = item.payload.event_count();
    match sink.deliver(&item.payload).await {
        Ok(()) => {
            debug!(events, "delivered item to metrics sink");
        }
        Err(e) => {
            item.attempt_count += 1;
            if item.attempt_count >= policy.max_attempts {
                error!(
                    error = %e,
                    attempts = item.attempt_count,
                    events,
                    "dropping item after exhausting retry budget"
                );
                sink.record_loss(events).await;
                return;
            }

            let delay = policy.delay(item.attempt_count);
            warn!(
                error = %e,
                attempt = item.attempt_count,
                max_attempts = policy.max_attempts,
                "delivery failed, requeueing after backoff"
            );
            tokio::time::sleep(delay).await;
            if let Err(requeue_err) = queue.enqueue(item) {
                error!(error = %requeue_err, events, "requeue failed, dropping item");
                sink.record_loss(events).await;
            }
        }
    }
}
