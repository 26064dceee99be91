// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Aggregate counters derived from the processed event stream.
//!
//! The aggregator itself is single-owner state: it is only ever touched by
//! the [`crate::stats_service::StatsService`] task, which serializes all
//! mutation, so the additive counters can stay plain integers. Reprocessing
//! a retried item double-counts here; that is the documented at-least-once
//! tradeoff of the pipeline, not a bug to hide.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::contract::{LogEvent, LogLevel};

/// Rolling window used for the ingestion-rate sample.
pub const DEFAULT_RATE_WINDOW: Duration = Duration::from_secs(60);

/// Upper bound on buffered rate samples per service. When the buffer is
/// full the oldest sample is evicted first, keeping memory bounded under
/// sustained volume.
const MAX_RATE_SAMPLES: usize = 10_000;

/// The slice of a [`LogEvent`] the metrics engine cares about.
#[derive(Debug, Clone)]
pub struct EventSummary {
    pub service_name: String,
    pub level: LogLevel,
    pub size_bytes: u64,
}

impl EventSummary {
    #[must_use]
    pub fn of(event: &LogEvent) -> Self {
        EventSummary {
            service_name: event.service_name.clone(),
            level: event.level,
            size_bytes: event.size_bytes(),
        }
    }
}

/// Point-in-time aggregate for one service.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceMetrics {
    pub service_name: String,
    pub total_count: u64,
    pub count_by_level: BTreeMap<LogLevel, u64>,
    pub total_bytes: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// Events per second over the rolling sample window.
    pub ingestion_rate: f64,
}

/// One row of the volume ranking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceVolume {
    pub service_name: String,
    pub total_count: u64,
}

/// Aggregate across all known services, folded at read time so it is always
/// consistent with the per-service totals.
#[derive(Debug, Clone, Serialize)]
pub struct GlobalMetrics {
    pub total_services: usize,
    pub total_count: u64,
    pub count_by_level: BTreeMap<LogLevel, u64>,
    pub total_bytes: u64,
    pub top_services: Vec<ServiceVolume>,
    /// Events successfully handed to the metrics engine.
    pub events_processed: u64,
    /// Events lost after the worker retry budget was exhausted.
    pub events_dropped: u64,
}

#[derive(Debug)]
struct ServiceEntry {
    total_count: u64,
    count_by_level: BTreeMap<LogLevel, u64>,
    total_bytes: u64,
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    samples: VecDeque<Instant>,
}

impl ServiceEntry {
    fn new(now: DateTime<Utc>) -> Self {
        ServiceEntry {
            total_count: 0,
            count_by_level: BTreeMap::new(),
            total_bytes: 0,
            first_seen: now,
            last_seen: now,
            samples: VecDeque::new(),
        }
    }

    fn prune_samples(&mut self, now: Instant, window: Duration) {
        while let Some(front) = self.samples.front() {
            if now.duration_since(*front) > window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Live aggregates over the event stream.
#[derive(Debug)]
pub struct StatsAggregator {
    services: HashMap<String, ServiceEntry>,
    events_processed: u64,
    events_dropped: u64,
    rate_window: Duration,
}

impl Default for StatsAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_RATE_WINDOW)
    }
}

impl StatsAggregator {
    #[must_use]
    pub fn new(rate_window: Duration) -> Self {
        StatsAggregator {
            services: HashMap::new(),
            events_processed: 0,
            events_dropped: 0,
            rate_window,
        }
    }

    /// Folds one processed event into the per-service and global counters.
    pub fn consume(&mut self, summary: EventSummary) {
        let now_utc = Utc::now();
        let now = Instant::now();
        let window = self.rate_window;

        let entry = self
            .services
            .entry(summary.service_name)
            .or_insert_with(|| ServiceEntry::new(now_utc));

        entry.total_count += 1;
        *entry.count_by_level.entry(summary.level).or_insert(0) += 1;
        entry.total_bytes += summary.size_bytes;
        entry.last_seen = now_utc;

        if entry.samples.len() >= MAX_RATE_SAMPLES {
            entry.samples.pop_front();
        }
        entry.samples.push_back(now);
        entry.prune_samples(now, window);

        self.events_processed += 1;
    }

    /// Records events lost after the worker retry budget ran out.
    pub fn record_drop(&mut self, count: u64) {
        self.events_dropped += count;
    }

    /// Snapshot for one service, or `None` if it has never been seen.
    #[must_use]
    pub fn service_stats(&mut self, service_name: &str) -> Option<ServiceMetrics> {
        let window = self.rate_window;
        let entry = self.services.get_mut(service_name)?;
        entry.prune_samples(Instant::now(), window);

        Some(ServiceMetrics {
            service_name: service_name.to_string(),
            total_count: entry.total_count,
            count_by_level: entry.count_by_level.clone(),
            total_bytes: entry.total_bytes,
            first_seen: entry.first_seen,
            last_seen: entry.last_seen,
            ingestion_rate: entry.samples.len() as f64 / window.as_secs_f64(),
        })
    }

    /// Global aggregate, computed as a fold over the per-service entries.
    #[must_use]
    pub fn global_stats(&mut self) -> GlobalMetrics {
        let mut total_count = 0;
        let mut total_bytes = 0;
        let mut count_by_level: BTreeMap<LogLevel, u64> = BTreeMap::new();

        for entry in self.services.values() {
            total_count += entry.total_count;
            total_bytes += entry.total_bytes;
            for (level, count) in &entry.count_by_level {
                *count_by_level.entry(*level).or_insert(0) += count;
            }
        }

        GlobalMetrics {
            total_services: self.services.len(),
            total_count,
            count_by_level,
            total_bytes,
            top_services: self.top_services(10),
            events_processed: self.events_processed,
            events_dropped: self.events_dropped,
        }
    }

    /// Services ranked by volume, descending. Ties break on the service
    /// name in lexical order so results are reproducible.
    #[must_use]
    pub fn top_services(&self, limit: usize) -> Vec<ServiceVolume> {
        let mut ranking: Vec<ServiceVolume> = self
            .services
            .iter()
            .map(|(name, entry)| ServiceVolume {
                service_name: name.clone(),
                total_count: entry.total_count,
            })
            .collect();
        ranking.sort_by(|a, b| {
            b.total_count
                .cmp(&a.total_count)
                .then_with(|| a.service_name.cmp(&b.service_name))
        });
        ranking.truncate(limit);
        ranking
    }
}
