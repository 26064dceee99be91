// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! HTTP surface of the ingestion hub.
//!
//! Every ingest request walks the same short-circuit sequence: bearer
//! authentication, rate-limit charge, contract validation, enqueue. The first
//! failing step produces the response and later steps never run, so a refused
//! request has no side effects beyond its quota charge. Acceptance is an ack
//! only: processing happens behind the queue, and the gateway never waits on
//! it.

use chrono::Utc;
use http_body_util::BodyExt;
use hyper::body::{Body, Bytes};
use hyper::service::service_fn;
use hyper::{http, Method, Request, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::io;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error};
use uuid::Uuid;

use crate::auth::{AuthError, AuthService, ServiceIdentity, ServiceRegistration};
use crate::config::Config;
use crate::contract::{validate_batch, validate_event, RawLogBatch, RawLogEvent, ValidationError};
use crate::http_utils::{
    bearer_token, json_response, log_and_create_http_response, verify_request_content_length,
    HttpResponse,
};
use crate::queue::{EnqueueError, LogQueue, QueueItem};
use crate::stats_service::StatsHandle;

const SINGLE_INGEST_PATH: &str = "/api/v1/ingestion/logs/single";
const BATCH_INGEST_PATH: &str = "/api/v1/ingestion/logs/batch";
const INGESTION_STATS_PATH: &str = "/api/v1/ingestion/stats";
const GLOBAL_STATS_PATH: &str = "/api/v1/stats/global";
const TOP_SERVICES_PATH: &str = "/api/v1/stats/top-services";
const ADMIN_SERVICES_PATH: &str = "/api/v1/admin/services";
const ADMIN_SERVICES_PREFIX: &str = "/api/v1/admin/services/";
const ROTATE_KEY_SUFFIX: &str = "/rotate-key";
const HEALTH_PATH: &str = "/health";

const DEFAULT_TOP_SERVICES_LIMIT: usize = 10;
const MAX_TOP_SERVICES_LIMIT: usize = 100;

/// Request body for the administrative service registration endpoint.
#[derive(Debug, Deserialize)]
struct RegisterServiceRequest {
    service_name: String,
    service_type: String,
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    rate_limit: Option<u32>,
}

/// The boundary object tying auth, contract, queue and stats together.
#[derive(Clone)]
pub struct LogGateway {
    pub config: Arc<Config>,
    pub auth: Arc<AuthService>,
    pub queue: LogQueue,
    pub stats: StatsHandle,
}

impl LogGateway {
    #[must_use]
    pub fn new(
        config: Arc<Config>,
        auth: Arc<AuthService>,
        queue: LogQueue,
        stats: StatsHandle,
    ) -> Self {
        LogGateway {
            config,
            auth,
            queue,
            stats,
        }
    }

    /// Serves the gateway on the given listener until the process exits.
    pub async fn start(self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error>> {
        if let Ok(addr) = listener.local_addr() {
            debug!("Log gateway started: listening on {addr}");
        }

        let gateway = self.clone();
        let service = service_fn(move |req| {
            // called for each http request
            let gateway = gateway.clone();
            async move { gateway.handle(req).await }
        });

        Self::serve_tcp(listener, service).await
    }

    async fn serve_tcp<S>(listener: TcpListener, service: S) -> Result<(), Box<dyn std::error::Error>>
    where
        S: hyper::service::Service<Request<hyper::body::Incoming>, Response = HttpResponse>
            + Clone
            + Send
            + 'static,
        S::Future: Send,
        S::Error: std::error::Error + Send + Sync + 'static,
    {
        let server = hyper::server::conn::http1::Builder::new();
        let mut joinset = tokio::task::JoinSet::new();

        loop {
            let conn = tokio::select! {
                con_res = listener.accept() => match con_res {
                    Err(e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::ConnectionAborted
                                | io::ErrorKind::ConnectionReset
                                | io::ErrorKind::ConnectionRefused
                        ) =>
                    {
                        continue;
                    }
                    Err(e) => {
                        error!("Server error: {e}");
                        return Err(e.into());
                    }
                    Ok((conn, _)) => conn,
                },
                finished = async {
                    match joinset.join_next().await {
                        Some(finished) => finished,
                        None => std::future::pending().await,
                    }
                } => match finished {
                    Err(e) if e.is_panic() => {
                        // Don't kill server on panic - log and continue
                        error!("Connection handler panicked: {:?}", e);
                        continue;
                    },
                    Ok(()) | Err(_) => continue,
                },
            };
            let conn = hyper_util::rt::TokioIo::new(conn);
            let server = server.clone();
            let service = service.clone();
            joinset.spawn(async move {
                if let Err(e) = server.serve_connection(conn, service).await {
                    error!("Connection error: {e}");
                }
            });
        }
    }

    /// Routes one request. Generic over the body so tests can drive handlers
    /// without a socket.
    pub async fn handle<B>(self, req: Request<B>) -> http::Result<HttpResponse>
    where
        B: Body,
        B::Error: std::fmt::Display,
    {
        match (req.method(), req.uri().path()) {
            (&Method::POST, SINGLE_INGEST_PATH) => self.handle_ingest_single(req).await,
            (&Method::POST, BATCH_INGEST_PATH) => self.handle_ingest_batch(req).await,
            (&Method::GET, INGESTION_STATS_PATH) => self.handle_service_stats(req).await,
            (&Method::GET, GLOBAL_STATS_PATH) => self.handle_global_stats().await,
            (&Method::GET, TOP_SERVICES_PATH) => {
                let query = req.uri().query().map(str::to_string);
                self.handle_top_services(query.as_deref()).await
            }
            (&Method::POST, ADMIN_SERVICES_PATH) => self.handle_register_service(req).await,
            (&Method::GET, ADMIN_SERVICES_PATH) => self.handle_list_services(),
            (&Method::POST, path)
                if path.starts_with(ADMIN_SERVICES_PREFIX) && path.ends_with(ROTATE_KEY_SUFFIX) =>
            {
                match path
                    .strip_prefix(ADMIN_SERVICES_PREFIX)
                    .and_then(|rest| rest.strip_suffix(ROTATE_KEY_SUFFIX))
                {
                    Some(service_name) => self.handle_rotate_key(service_name),
                    None => not_found(),
                }
            }
            (_, HEALTH_PATH) => json_response(StatusCode::OK, json!({ "status": "ok" })),
            _ => not_found(),
        }
    }

    fn authenticate(
        &self,
        headers: &hyper::http::HeaderMap,
    ) -> Result<ServiceIdentity, http::Result<HttpResponse>> {
        let Some(api_key) = bearer_token(headers) else {
            return Err(log_and_create_http_response(
                "Unauthorized: missing bearer credential",
                StatusCode::UNAUTHORIZED,
            ));
        };
        self.auth.authenticate(api_key).map_err(|e| {
            log_and_create_http_response(&format!("Unauthorized: {e}"), StatusCode::UNAUTHORIZED)
        })
    }

    fn charge_quota(
        &self,
        identity: &ServiceIdentity,
        cost: u32,
    ) -> Result<(), http::Result<HttpResponse>> {
        self.auth
            .check_and_consume(&identity.service_name, cost)
            .map_err(|e| match e {
                AuthError::RateLimited { .. } => log_and_create_http_response(
                    &format!("Rate limited `{}`: {e}", identity.service_name),
                    StatusCode::TOO_MANY_REQUESTS,
                ),
                other => log_and_create_http_response(
                    &format!("Unauthorized: {other}"),
                    StatusCode::UNAUTHORIZED,
                ),
            })
    }

    async fn handle_ingest_single<B>(&self, req: Request<B>) -> http::Result<HttpResponse>
    where
        B: Body,
        B::Error: std::fmt::Display,
    {
        let (parts, body) = req.into_parts();

        let identity = match self.authenticate(&parts.headers) {
            Ok(identity) => identity,
            Err(response) => return response,
        };
        if let Some(response) = verify_request_content_length(
            &parts.headers,
            self.config.max_request_content_length,
            "Error processing log event",
        ) {
            return response;
        }
        if let Err(response) = self.charge_quota(&identity, 1) {
            return response;
        }

        let body_bytes = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                return log_and_create_http_response(
                    &format!("Error reading log event body: {e}"),
                    StatusCode::BAD_REQUEST,
                );
            }
        };
        let raw: RawLogEvent = match serde_json::from_slice(&body_bytes) {
            Ok(raw) => raw,
            Err(e) => {
                return log_and_create_http_response(
                    &format!("Invalid log event payload: {e}"),
                    StatusCode::BAD_REQUEST,
                );
            }
        };
        let event = match validate_event(raw, &self.config.limits, Utc::now()) {
            Ok(event) => event,
            Err(e) => {
                return log_and_create_http_response(
                    &format!("Invalid log event: {e}"),
                    StatusCode::BAD_REQUEST,
                );
            }
        };
        if event.service_name != identity.service_name {
            let mismatch = ValidationError::CredentialMismatch {
                payload: event.service_name,
                authenticated: identity.service_name,
            };
            return log_and_create_http_response(
                &format!("Invalid log event: {mismatch}"),
                StatusCode::BAD_REQUEST,
            );
        }

        match self.queue.enqueue(QueueItem::single(event)) {
            Ok(()) => {
                debug!(service = %identity.service_name, "accepted log event");
                json_response(
                    StatusCode::CREATED,
                    json!({
                        "status": "accepted",
                        "ingestion_id": Uuid::new_v4().to_string(),
                        "message": "Log event accepted and queued for processing",
                        "timestamp": Utc::now().to_rfc3339(),
                    }),
                )
            }
            Err(e) => enqueue_error_response(&e),
        }
    }

    async fn handle_ingest_batch<B>(&self, req: Request<B>) -> http::Result<HttpResponse>
    where
        B: Body,
        B::Error: std::fmt::Display,
    {
        let (parts, body) = req.into_parts();

        let identity = match self.authenticate(&parts.headers) {
            Ok(identity) => identity,
            Err(response) => return response,
        };
        if let Some(response) = verify_request_content_length(
            &parts.headers,
            self.config.max_request_content_length,
            "Error processing log batch",
        ) {
            return response;
        }

        let body_bytes = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                return log_and_create_http_response(
                    &format!("Error reading log batch body: {e}"),
                    StatusCode::BAD_REQUEST,
                );
            }
        };
        let raw: RawLogBatch = match serde_json::from_slice(&body_bytes) {
            Ok(raw) => raw,
            Err(e) => {
                return log_and_create_http_response(
                    &format!("Invalid log batch payload: {e}"),
                    StatusCode::BAD_REQUEST,
                );
            }
        };

        // The whole batch is charged in one step: either every event fits in
        // the window or none is admitted.
        let cost = u32::try_from(raw.len()).unwrap_or(u32::MAX);
        if let Err(response) = self.charge_quota(&identity, cost) {
            return response;
        }

        let batch = match validate_batch(raw, &self.config.limits, Utc::now()) {
            Ok(batch) => batch,
            Err(e) => {
                return log_and_create_http_response(
                    &format!("Invalid log batch: {e}"),
                    StatusCode::BAD_REQUEST,
                );
            }
        };
        if batch.service_name != identity.service_name {
            let mismatch = ValidationError::CredentialMismatch {
                payload: batch.service_name,
                authenticated: identity.service_name,
            };
            return log_and_create_http_response(
                &format!("Invalid log batch: {mismatch}"),
                StatusCode::BAD_REQUEST,
            );
        }

        let batch_id = batch.batch_id.clone();
        let total_events = batch.events.len();
        let ingestion_ids: Vec<String> = (0..total_events)
            .map(|_| Uuid::new_v4().to_string())
            .collect();

        match self.queue.enqueue(QueueItem::batch(batch)) {
            Ok(()) => {
                debug!(
                    service = %identity.service_name,
                    batch_id = %batch_id,
                    total_events,
                    "accepted log batch"
                );
                json_response(
                    StatusCode::CREATED,
                    json!({
                        "status": "accepted",
                        "batch_id": batch_id,
                        "ingestion_ids": ingestion_ids,
                        "total_events": total_events,
                        "message": "Log batch accepted and queued for processing",
                        "timestamp": Utc::now().to_rfc3339(),
                    }),
                )
            }
            Err(e) => enqueue_error_response(&e),
        }
    }

    async fn handle_service_stats<B>(&self, req: Request<B>) -> http::Result<HttpResponse>
    where
        B: Body,
    {
        let identity = match self.authenticate(req.headers()) {
            Ok(identity) => identity,
            Err(response) => return response,
        };

        match self.stats.service_stats(&identity.service_name).await {
            Ok(Some(metrics)) => json_response(StatusCode::OK, json!(metrics)),
            Ok(None) => json_response(
                StatusCode::OK,
                json!({
                    "service_name": identity.service_name,
                    "total_count": 0,
                    "count_by_level": {},
                    "total_bytes": 0,
                    "ingestion_rate": 0.0,
                    "message": "No data available for this service",
                }),
            ),
            Err(e) => log_and_create_http_response(
                &format!("Error retrieving service stats: {e}"),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        }
    }

    async fn handle_global_stats(&self) -> http::Result<HttpResponse> {
        match self.stats.global_stats().await {
            Ok(metrics) => json_response(StatusCode::OK, json!(metrics)),
            Err(e) => log_and_create_http_response(
                &format!("Error retrieving global stats: {e}"),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        }
    }

    async fn handle_top_services(&self, query: Option<&str>) -> http::Result<HttpResponse> {
        let limit = match parse_limit(query) {
            Ok(limit) => limit,
            Err(message) => {
                return log_and_create_http_response(&message, StatusCode::BAD_REQUEST);
            }
        };

        match self.stats.top_services(limit).await {
            Ok(top_services) => json_response(
                StatusCode::OK,
                json!({
                    "top_services": top_services,
                    "limit": limit,
                }),
            ),
            Err(e) => log_and_create_http_response(
                &format!("Error retrieving top services: {e}"),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        }
    }

    async fn handle_register_service<B>(&self, req: Request<B>) -> http::Result<HttpResponse>
    where
        B: Body,
        B::Error: std::fmt::Display,
    {
        let body_bytes = match req.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                return log_and_create_http_response(
                    &format!("Error reading registration body: {e}"),
                    StatusCode::BAD_REQUEST,
                );
            }
        };
        let request: RegisterServiceRequest = match serde_json::from_slice(&body_bytes) {
            Ok(request) => request,
            Err(e) => {
                return log_and_create_http_response(
                    &format!("Invalid registration payload: {e}"),
                    StatusCode::BAD_REQUEST,
                );
            }
        };

        match self.auth.register_service(ServiceRegistration {
            service_name: request.service_name,
            service_type: request.service_type,
            api_key: request.api_key,
            rate_limit: request.rate_limit,
        }) {
            Ok((identity, api_key)) => json_response(
                StatusCode::CREATED,
                json!({
                    "status": "registered",
                    "service_name": identity.service_name,
                    "service_type": identity.service_type,
                    "rate_limit": identity.rate_limit,
                    "api_key": api_key,
                }),
            ),
            Err(e @ AuthError::Conflict(_)) => {
                log_and_create_http_response(&e.to_string(), StatusCode::CONFLICT)
            }
            Err(e) => log_and_create_http_response(
                &format!("Error registering service: {e}"),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        }
    }

    fn handle_rotate_key(&self, service_name: &str) -> http::Result<HttpResponse> {
        match self.auth.rotate_key(service_name) {
            Ok(api_key) => json_response(
                StatusCode::OK,
                json!({
                    "service_name": service_name,
                    "api_key": api_key,
                }),
            ),
            Err(e @ AuthError::UnknownService(_)) => {
                log_and_create_http_response(&e.to_string(), StatusCode::NOT_FOUND)
            }
            Err(e) => log_and_create_http_response(
                &format!("Error rotating key: {e}"),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        }
    }

    fn handle_list_services(&self) -> http::Result<HttpResponse> {
        let services = self.auth.list_services();
        json_response(
            StatusCode::OK,
            json!({
                "total_services": services.len(),
                "services": services,
            }),
        )
    }
}

fn not_found() -> http::Result<HttpResponse> {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .body(http_body_util::Full::new(Bytes::new()))
}

fn enqueue_error_response(error: &EnqueueError) -> http::Result<HttpResponse> {
    log_and_create_http_response(
        &format!("Unable to accept log data: {error}"),
        StatusCode::SERVICE_UNAVAILABLE,
    )
}

fn parse_limit(query: Option<&str>) -> Result<usize, String> {
    let mut limit = DEFAULT_TOP_SERVICES_LIMIT;
    if let Some(query) = query {
        for pair in query.split('&') {
            if let Some(value) = pair.strip_prefix("limit=") {
                limit = value
                    .parse::<usize>()
                    .map_err(|_| format!("Invalid limit `{value}`"))?;
            }
        }
    }
    if limit < 1 || limit > MAX_TOP_SERVICES_LIMIT {
        return Err(format!(
            "Limit must be between 1 and {MAX_TOP_SERVICES_LIMIT}"
        ));
    }
    Ok(limit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{QueuePayload, QueueReceivers};
    use crate::stats::StatsAggregator;
    use crate::stats_service::StatsService;
    use http_body_util::Full;
    use std::time::Duration;

    struct TestContext {
        gateway: LogGateway,
        receivers: QueueReceivers,
    }

    fn test_gateway(config: Config) -> TestContext {
        let auth = Arc::new(AuthService::new(Duration::from_secs(
            config.rate_window_secs,
        )));
        auth.register_service(ServiceRegistration {
            service_name: "checkout".to_string(),
            service_type: "web-backend".to_string(),
            api_key: Some("checkout-key".to_string()),
            rate_limit: Some(100),
        })
        .unwrap();

        let (queue, receivers) = LogQueue::bounded(config.queue_capacity);
        let (stats_service, stats_handle) = StatsService::new(StatsAggregator::default());
        tokio::spawn(stats_service.run());

        TestContext {
            gateway: LogGateway::new(Arc::new(config), auth, queue, stats_handle),
            receivers,
        }
    }

    fn request(
        method: Method,
        path: &str,
        api_key: Option<&str>,
        body: serde_json::Value,
    ) -> Request<Full<Bytes>> {
        let bytes = Bytes::from(body.to_string());
        let mut builder = Request::builder()
            .method(method)
            .uri(path)
            .header("content-length", bytes.len());
        if let Some(key) = api_key {
            builder = builder.header("authorization", format!("Bearer {key}"));
        }
        builder.body(Full::new(bytes)).unwrap()
    }

    fn event_body() -> serde_json::Value {
        json!({
            "service_name": "checkout",
            "service_type": "web-backend",
            "service_version": "1.0.0",
            "service_instance_id": "checkout-001",
            "level": "INFO",
            "message": "request completed",
            "environment": "prod"
        })
    }

    async fn body_json(response: HttpResponse) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_ingest_single_accepted() {
        let mut ctx = test_gateway(Config::default());

        let response = ctx
            .gateway
            .clone()
            .handle(request(
                Method::POST,
                SINGLE_INGEST_PATH,
                Some("checkout-key"),
                event_body(),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let body = body_json(response).await;
        assert_eq!(body["status"], "accepted");
        assert!(body["ingestion_id"].is_string());

        let item = ctx.receivers.single.try_recv().unwrap();
        assert!(matches!(item.payload, QueuePayload::Single(_)));
    }

    #[tokio::test]
    async fn test_ingest_single_missing_credential() {
        let ctx = test_gateway(Config::default());

        let response = ctx
            .gateway
            .handle(request(Method::POST, SINGLE_INGEST_PATH, None, event_body()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_ingest_single_unknown_key() {
        let ctx = test_gateway(Config::default());

        let response = ctx
            .gateway
            .handle(request(
                Method::POST,
                SINGLE_INGEST_PATH,
                Some("wrong-key"),
                event_body(),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_ingest_single_rate_limited() {
        let ctx = test_gateway(Config::default());
        // Burn the whole quota in one charge.
        ctx.gateway.auth.check_and_consume("checkout", 100).unwrap();

        let response = ctx
            .gateway
            .handle(request(
                Method::POST,
                SINGLE_INGEST_PATH,
                Some("checkout-key"),
                event_body(),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_ingest_single_invalid_payload() {
        let mut ctx = test_gateway(Config::default());

        let mut body = event_body();
        body["level"] = json!("LOUD");
        let response = ctx
            .gateway
            .clone()
            .handle(request(
                Method::POST,
                SINGLE_INGEST_PATH,
                Some("checkout-key"),
                body,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(ctx.receivers.single.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_ingest_single_service_mismatch() {
        let mut ctx = test_gateway(Config::default());

        let mut body = event_body();
        body["service_name"] = json!("payments");
        let response = ctx
            .gateway
            .clone()
            .handle(request(
                Method::POST,
                SINGLE_INGEST_PATH,
                Some("checkout-key"),
                body,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(ctx.receivers.single.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_ingest_single_queue_full() {
        let config = Config {
            queue_capacity: 1,
            ..Config::default()
        };
        let ctx = test_gateway(config);

        let first = ctx
            .gateway
            .clone()
            .handle(request(
                Method::POST,
                SINGLE_INGEST_PATH,
                Some("checkout-key"),
                event_body(),
            ))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::CREATED);

        let second = ctx
            .gateway
            .handle(request(
                Method::POST,
                SINGLE_INGEST_PATH,
                Some("checkout-key"),
                event_body(),
            ))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    fn batch_body() -> serde_json::Value {
        json!({
            "batch_id": "batch-001",
            "service_name": "checkout",
            "service_type": "web-backend",
            "service_version": "1.0.0",
            "service_instance_id": "checkout-001",
            "logs": [
                {"level": "INFO", "message": "first", "environment": "prod"},
                {"level": "ERROR", "message": "second", "environment": "prod"}
            ]
        })
    }

    #[tokio::test]
    async fn test_ingest_batch_accepted_as_one_item() {
        let mut ctx = test_gateway(Config::default());

        let response = ctx
            .gateway
            .clone()
            .handle(request(
                Method::POST,
                BATCH_INGEST_PATH,
                Some("checkout-key"),
                batch_body(),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let body = body_json(response).await;
        assert_eq!(body["total_events"], 2);
        assert_eq!(body["ingestion_ids"].as_array().unwrap().len(), 2);

        let item = ctx.receivers.batch.try_recv().unwrap();
        match item.payload {
            QueuePayload::Batch { batch_id, events } => {
                assert_eq!(batch_id, "batch-001");
                assert_eq!(events.len(), 2);
                assert_eq!(events[0].message, "first");
                assert_eq!(events[1].message, "second");
            }
            QueuePayload::Single(_) => panic!("expected batch payload"),
        }
    }

    #[tokio::test]
    async fn test_ingest_batch_atomic_rejection_enqueues_nothing() {
        let mut ctx = test_gateway(Config::default());

        let mut body = batch_body();
        body["logs"].as_array_mut().unwrap().insert(
            1,
            json!({"level": "BROKEN", "message": "bad", "environment": "prod"}),
        );
        let response = ctx
            .gateway
            .clone()
            .handle(request(
                Method::POST,
                BATCH_INGEST_PATH,
                Some("checkout-key"),
                body,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(ctx.receivers.batch.try_recv().is_err());
        assert!(ctx.receivers.single.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_ingest_batch_charges_quota_for_whole_batch() {
        let ctx = test_gateway(Config::default());

        let response = ctx
            .gateway
            .clone()
            .handle(request(
                Method::POST,
                BATCH_INGEST_PATH,
                Some("checkout-key"),
                batch_body(),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        // The two batch events count against the quota of 100.
        ctx.gateway.auth.check_and_consume("checkout", 98).unwrap();
        assert!(ctx.gateway.auth.check_and_consume("checkout", 1).is_err());
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let ctx = test_gateway(Config::default());

        let response = ctx
            .gateway
            .handle(request(Method::GET, HEALTH_PATH, None, json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_path_is_404() {
        let ctx = test_gateway(Config::default());

        let response = ctx
            .gateway
            .handle(request(Method::GET, "/nope", None, json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_top_services_limit_bounds() {
        let ctx = test_gateway(Config::default());

        let response = ctx
            .gateway
            .clone()
            .handle(request(
                Method::GET,
                "/api/v1/stats/top-services?limit=0",
                None,
                json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = ctx
            .gateway
            .handle(request(
                Method::GET,
                "/api/v1/stats/top-services?limit=3",
                None,
                json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_register_and_conflict() {
        let ctx = test_gateway(Config::default());

        let body = json!({
            "service_name": "billing",
            "service_type": "worker",
            "rate_limit": 50
        });
        let response = ctx
            .gateway
            .clone()
            .handle(request(
                Method::POST,
                ADMIN_SERVICES_PATH,
                None,
                body.clone(),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let registered = body_json(response).await;
        let api_key = registered["api_key"].as_str().unwrap().to_string();
        assert!(ctx.gateway.auth.authenticate(&api_key).is_ok());

        let response = ctx
            .gateway
            .handle(request(Method::POST, ADMIN_SERVICES_PATH, None, body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_rotate_key_endpoint() {
        let ctx = test_gateway(Config::default());

        let response = ctx
            .gateway
            .clone()
            .handle(request(
                Method::POST,
                "/api/v1/admin/services/checkout/rotate-key",
                None,
                json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        let new_key = body["api_key"].as_str().unwrap();

        assert!(ctx.gateway.auth.authenticate("checkout-key").is_err());
        assert!(ctx.gateway.auth.authenticate(new_key).is_ok());

        let response = ctx
            .gateway
            .handle(request(
                Method::POST,
                "/api/v1/admin/services/ghost/rotate-key",
                None,
                json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_service_stats_requires_auth() {
        let ctx = test_gateway(Config::default());

        let response = ctx
            .gateway
            .handle(request(Method::GET, INGESTION_STATS_PATH, None, json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_service_stats_empty_service() {
        let ctx = test_gateway(Config::default());

        let response = ctx
            .gateway
            .handle(request(
                Method::GET,
                INGESTION_STATS_PATH,
                Some("checkout-key"),
                json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["total_count"], 0);
    }
}
