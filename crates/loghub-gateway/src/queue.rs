// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded queues decoupling request acceptance from processing.
//!
//! Two queue classes back the gateway: one for single events, one for whole
//! batches. A batch travels as one item so its internal event order survives
//! all the way to the metrics sink. Enqueue never blocks: a saturated buffer
//! surfaces as [`EnqueueError::QueueFull`], which the gateway turns into
//! backpressure for the caller instead of swallowing it.

use std::time::Instant;
use tokio::sync::mpsc;

use crate::contract::{LogBatch, LogEvent};

#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    #[error("queue is full")]
    QueueFull,

    #[error("queue is closed")]
    Closed,
}

/// The work carried by one queue item.
#[derive(Debug)]
pub enum QueuePayload {
    Single(LogEvent),
    Batch {
        batch_id: String,
        events: Vec<LogEvent>,
    },
}

impl QueuePayload {
    /// Number of log events the item carries.
    #[must_use]
    pub fn event_count(&self) -> u64 {
        match self {
            QueuePayload::Single(_) => 1,
            QueuePayload::Batch { events, .. } => events.len() as u64,
        }
    }
}

/// One accepted, not-yet-processed unit of work.
#[derive(Debug)]
pub struct QueueItem {
    pub payload: QueuePayload,
    pub enqueue_time: Instant,
    pub attempt_count: u32,
}

impl QueueItem {
    #[must_use]
    pub fn single(event: LogEvent) -> Self {
        QueueItem {
            payload: QueuePayload::Single(event),
            enqueue_time: Instant::now(),
            attempt_count: 0,
        }
    }

    #[must_use]
    pub fn batch(batch: LogBatch) -> Self {
        QueueItem {
            payload: QueuePayload::Batch {
                batch_id: batch.batch_id,
                events: batch.events,
            },
            enqueue_time: Instant::now(),
            attempt_count: 0,
        }
    }

    /// Whether the item came in through the batch endpoint. Retries go back
    /// to the queue class they came from.
    #[must_use]
    pub fn is_batch(&self) -> bool {
        matches!(self.payload, QueuePayload::Batch { .. })
    }
}

/// Producer side of both queue classes. Cheap to clone; the gateway handlers
/// and the worker requeue path each hold one.
#[derive(Debug, Clone)]
pub struct LogQueue {
    single_tx: mpsc::Sender<QueueItem>,
    batch_tx: mpsc::Sender<QueueItem>,
}

/// Consumer side, handed to the worker pool exactly once.
#[derive(Debug)]
pub struct QueueReceivers {
    pub single: mpsc::Receiver<QueueItem>,
    pub batch: mpsc::Receiver<QueueItem>,
}

impl LogQueue {
    /// Creates both queue classes with the given per-class capacity.
    #[must_use]
    pub fn bounded(capacity: usize) -> (LogQueue, QueueReceivers) {
        let (single_tx, single_rx) = mpsc::channel(capacity);
        let (batch_tx, batch_rx) = mpsc::channel(capacity);
        (
            LogQueue {
                single_tx,
                batch_tx,
            },
            QueueReceivers {
                single: single_rx,
                batch: batch_rx,
            },
        )
    }

    /// Pushes one item without waiting. Full buffer -> `QueueFull`.
    pub fn enqueue(&self, item: QueueItem) -> Result<(), EnqueueError> {
        let tx = if item.is_batch() {
            &self.batch_tx
        } else {
            &self.single_tx
        };
        tx.try_send(item).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => EnqueueError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => EnqueueError::Closed,
        })
    }
}
