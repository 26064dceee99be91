// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::{env, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use loghub_gateway::{
    auth::{AuthService, ServiceRegistration},
    config::Config,
    gateway::LogGateway,
    queue::LogQueue,
    stats::StatsAggregator,
    stats_service::StatsService,
    worker::{RetryPolicy, WorkerPool},
};

#[tokio::main]
pub async fn main() {
    let log_level = env::var("LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    let env_filter = format!("h2=off,hyper=off,{}", log_level);

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let config = match Config::from_env() {
        Ok(c) => Arc::new(c),
        Err(e) => {
            error!("Error creating config on log hub startup: {e}");
            return;
        }
    };

    let auth = Arc::new(AuthService::new(Duration::from_secs(
        config.rate_window_secs,
    )));
    for seed in &config.seed_services {
        let registration = ServiceRegistration {
            service_name: seed.service_name.clone(),
            service_type: seed.service_type.clone(),
            api_key: Some(seed.api_key.clone()),
            rate_limit: Some(seed.rate_limit),
        };
        if let Err(e) = auth.register_service(registration) {
            error!("Error seeding the service registry: {e}");
            return;
        }
    }

    // 1. Create the stats service and start it in the background
    let (stats_service, stats_handle) = StatsService::new(StatsAggregator::default());
    tokio::spawn(stats_service.run());

    // 2. Create the queues and start the worker pool draining them into the
    //    stats handle (cheap to clone)
    let (queue, receivers) = LogQueue::bounded(config.queue_capacity);
    let retry_policy = RetryPolicy {
        max_attempts: config.max_attempts,
        backoff_base: Duration::from_millis(config.retry_backoff_base_ms),
    };
    let worker_pool = WorkerPool::new(
        config.workers,
        retry_policy,
        queue.clone(),
        Arc::new(stats_handle.clone()),
    );
    let cancel_token = worker_pool.cancel_token();
    let worker_handles = worker_pool.spawn(receivers);

    // 3. Bind the gateway and serve until shutdown
    let addr = format!("{}:{}", config.host, config.port);
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Error binding {addr}: {e}");
            return;
        }
    };
    info!("Log hub gateway listening on {addr}");

    let gateway = LogGateway::new(
        Arc::clone(&config),
        auth,
        queue,
        stats_handle.clone(),
    );
    tokio::spawn(async move {
        if let Err(e) = gateway.start(listener).await {
            error!("Error when running the log hub gateway: {e:?}");
        }
    });

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Error waiting for shutdown signal: {e}");
    }
    info!("Shutdown signal received, draining queued events");

    cancel_token.cancel();
    for handle in worker_handles {
        if let Err(e) = handle.await {
            error!("Worker task failed during shutdown: {e:?}");
        }
    }
    if stats_handle.shutdown().is_err() {
        debug!("Stats service already stopped");
    }
}
