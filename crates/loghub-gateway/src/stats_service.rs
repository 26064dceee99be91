// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Command-channel wrapper giving the aggregator a single owner.
//!
//! Workers and stats queries talk to a [`StatsHandle`]; the [`StatsService`]
//! task owns the [`StatsAggregator`] and applies commands one at a time.
//! Writes are fire-and-forget sends, reads round-trip through a oneshot, so
//! a stats query never blocks a worker for longer than queueing a command.

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::stats::{EventSummary, GlobalMetrics, ServiceMetrics, ServiceVolume, StatsAggregator};

#[derive(Debug)]
pub enum StatsCommand {
    Consume(Vec<EventSummary>),
    RecordDrop(u64),
    ServiceStats {
        service_name: String,
        response_tx: oneshot::Sender<Option<ServiceMetrics>>,
    },
    GlobalStats {
        response_tx: oneshot::Sender<GlobalMetrics>,
    },
    TopServices {
        limit: usize,
        response_tx: oneshot::Sender<Vec<ServiceVolume>>,
    },
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct StatsHandle {
    tx: mpsc::UnboundedSender<StatsCommand>,
}

impl StatsHandle {
    /// Hands a batch of processed-event summaries to the aggregator.
    /// Order within the batch is preserved by the single consumer.
    pub fn consume(
        &self,
        summaries: Vec<EventSummary>,
    ) -> Result<(), mpsc::error::SendError<StatsCommand>> {
        self.tx.send(StatsCommand::Consume(summaries))
    }

    /// Counts events lost to retry exhaustion.
    pub fn record_drop(&self, count: u64) -> Result<(), mpsc::error::SendError<StatsCommand>> {
        self.tx.send(StatsCommand::RecordDrop(count))
    }

    pub async fn service_stats(&self, service_name: &str) -> Result<Option<ServiceMetrics>, String> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(StatsCommand::ServiceStats {
                service_name: service_name.to_string(),
                response_tx,
            })
            .map_err(|e| format!("Failed to send service_stats command: {e}"))?;

        response_rx
            .await
            .map_err(|e| format!("Failed to receive service_stats response: {e}"))
    }

    pub async fn global_stats(&self) -> Result<GlobalMetrics, String> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(StatsCommand::GlobalStats { response_tx })
            .map_err(|e| format!("Failed to send global_stats command: {e}"))?;

        response_rx
            .await
            .map_err(|e| format!("Failed to receive global_stats response: {e}"))
    }

    pub async fn top_services(&self, limit: usize) -> Result<Vec<ServiceVolume>, String> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(StatsCommand::TopServices { limit, response_tx })
            .map_err(|e| format!("Failed to send top_services command: {e}"))?;

        response_rx
            .await
            .map_err(|e| format!("Failed to receive top_services response: {e}"))
    }

    pub fn shutdown(&self) -> Result<(), mpsc::error::SendError<StatsCommand>> {
        self.tx.send(StatsCommand::Shutdown)
    }
}

pub struct StatsService {
    aggregator: StatsAggregator,
    rx: mpsc::UnboundedReceiver<StatsCommand>,
}

impl StatsService {
    #[must_use]
    pub fn new(aggregator: StatsAggregator) -> (Self, StatsHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        (StatsService { aggregator, rx }, StatsHandle { tx })
    }

    pub async fn run(mut self) {
        debug!("Stats service started");

        while let Some(command) = self.rx.recv().await {
            match command {
                StatsCommand::Consume(summaries) => {
                    for summary in summaries {
                        self.aggregator.consume(summary);
                    }
                }

                StatsCommand::RecordDrop(count) => {
                    self.aggregator.record_drop(count);
                }

                StatsCommand::ServiceStats {
                    service_name,
                    response_tx,
                } => {
                    let stats = self.aggregator.service_stats(&service_name);
                    if response_tx.send(stats).is_err() {
                        debug!("Stats requester went away before the response");
                    }
                }

                StatsCommand::GlobalStats { response_tx } => {
                    if response_tx.send(self.aggregator.global_stats()).is_err() {
                        debug!("Stats requester went away before the response");
                    }
                }

                StatsCommand::TopServices { limit, response_tx } => {
                    if response_tx.send(self.aggregator.top_services(limit)).is_err() {
                        debug!("Stats requester went away before the response");
                    }
                }

                StatsCommand::Shutdown => {
                    debug!("Stats service shutting down");
                    break;
                }
            }
        }

        debug!("Stats service stopped");
    }
}
