// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Core of the centralized log-ingestion hub.
//!
//! Services across the ecosystem push structured log events here over HTTP.
//! The pipeline authenticates the caller, charges its rate-limit window,
//! validates the payload against the log contract, and queues the accepted
//! events for a small worker pool that folds them into live per-service and
//! global metrics.
//!
//! Delivery from the queue to the metrics engine is at-least-once with a
//! bounded retry budget: a retried item may be double-counted, an exhausted
//! one is dropped and counted as a loss, nothing is lost silently.
//!
//! All state lives in process memory and is gone on restart; that is a
//! deliberate property of the current deployment, not an accident.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

/// API-key authentication and per-service rate limiting
pub mod auth;

/// Environment-driven configuration
pub mod config;

/// Wire contract and validation for log events and batches
pub mod contract;

/// HTTP surface: routing and the request handling sequence
pub mod gateway;

/// Shared request/response helpers
pub mod http_utils;

/// Bounded queues between acceptance and processing
pub mod queue;

/// Aggregate counters over the processed event stream
pub mod stats;

/// Single-owner service wrapping the stats aggregator
pub mod stats_service;

/// Worker pool draining the queues into the metrics sink
pub mod worker;
