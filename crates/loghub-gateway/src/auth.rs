// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! API-key authentication and per-service rate limiting.
//!
//! The registry is a process-scoped state object handed to the gateway as an
//! `Arc`, never a module-level singleton, so tests can build isolated
//! instances. Rate limiting uses a fixed window per service: `rate_limit`
//! events are admitted per window, the counter resets when the window
//! elapses. Both the key lookup and the window update run under one lock so
//! two concurrent requests for the same service can never both slip past a
//! nearly-exhausted quota.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use uuid::Uuid;

pub const DEFAULT_RATE_LIMIT: u32 = 100;
const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("unknown API key")]
    UnknownApiKey,

    #[error("rate limit exceeded, retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("service `{0}` is already registered")]
    Conflict(String),

    #[error("unknown service `{0}`")]
    UnknownService(String),
}

/// The registered owner of an API key.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceIdentity {
    pub service_name: String,
    pub service_type: String,
    /// Admitted events per rate window.
    pub rate_limit: u32,
    pub registered_at: DateTime<Utc>,
}

/// Registration request for [`AuthService::register_service`].
#[derive(Debug, Clone)]
pub struct ServiceRegistration {
    pub service_name: String,
    pub service_type: String,
    /// Credential to install; a fresh one is generated when absent.
    pub api_key: Option<String>,
    pub rate_limit: Option<u32>,
}

/// Fixed-window usage counter for one service.
#[derive(Debug)]
struct RateWindow {
    window_start: Instant,
    used: u32,
}

impl RateWindow {
    fn new(now: Instant) -> Self {
        RateWindow {
            window_start: now,
            used: 0,
        }
    }
}

#[derive(Debug)]
struct ServiceRecord {
    identity: ServiceIdentity,
    api_key: String,
    window: RateWindow,
}

#[derive(Debug, Default)]
struct Registry {
    services: HashMap<String, ServiceRecord>,
    /// api_key -> service_name index for O(1) authentication.
    keys: HashMap<String, String>,
}

/// Decides whether a request identified by a bearer credential may proceed,
/// and at what cost against the owner's quota.
#[derive(Debug)]
pub struct AuthService {
    inner: RwLock<Registry>,
    window: Duration,
}

impl Default for AuthService {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

impl AuthService {
    #[must_use]
    pub fn new(window: Duration) -> Self {
        AuthService {
            inner: RwLock::new(Registry::default()),
            window,
        }
    }

    /// Maps an API key to its service identity.
    pub fn authenticate(&self, api_key: &str) -> Result<ServiceIdentity, AuthError> {
        let registry = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let service_name = registry.keys.get(api_key).ok_or(AuthError::UnknownApiKey)?;
        let record = registry
            .services
            .get(service_name)
            .ok_or(AuthError::UnknownApiKey)?;
        Ok(record.identity.clone())
    }

    /// Atomically charges `cost` events against the service's current window.
    ///
    /// Batch ingestion passes the batch size as `cost`: the whole batch is
    /// admitted or refused in one step, never partially. On refusal nothing
    /// is consumed.
    pub fn check_and_consume(&self, service_name: &str, cost: u32) -> Result<(), AuthError> {
        let mut registry = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let record = registry
            .services
            .get_mut(service_name)
            .ok_or_else(|| AuthError::UnknownService(service_name.to_string()))?;

        let now = Instant::now();
        if now.duration_since(record.window.window_start) >= self.window {
            record.window = RateWindow::new(now);
        }

        let used = record.window.used;
        if used.saturating_add(cost) > record.identity.rate_limit {
            let elapsed = now.duration_since(record.window.window_start);
            let retry_after_secs = self.window.saturating_sub(elapsed).as_secs().max(1);
            debug!(
                service = service_name,
                used, cost, "rate limit refused request"
            );
            return Err(AuthError::RateLimited { retry_after_secs });
        }
        record.window.used = used + cost;
        Ok(())
    }

    /// Administrative add-only registration. Fails when the name is taken.
    pub fn register_service(
        &self,
        registration: ServiceRegistration,
    ) -> Result<(ServiceIdentity, String), AuthError> {
        let mut registry = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if registry.services.contains_key(&registration.service_name) {
            return Err(AuthError::Conflict(registration.service_name));
        }

        let api_key = registration
            .api_key
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let identity = ServiceIdentity {
            service_name: registration.service_name.clone(),
            service_type: registration.service_type,
            rate_limit: registration.rate_limit.unwrap_or(DEFAULT_RATE_LIMIT),
            registered_at: Utc::now(),
        };

        registry
            .keys
            .insert(api_key.clone(), registration.service_name.clone());
        registry.services.insert(
            registration.service_name.clone(),
            ServiceRecord {
                identity: identity.clone(),
                api_key: api_key.clone(),
                window: RateWindow::new(Instant::now()),
            },
        );

        info!(service = %identity.service_name, "registered service");
        Ok((identity, api_key))
    }

    /// Replaces the service's credential. The old key stops validating the
    /// moment this returns; the swap happens in one write-lock critical
    /// section so concurrent requests see either the old or the new key,
    /// never a torn state.
    pub fn rotate_key(&self, service_name: &str) -> Result<String, AuthError> {
        let mut registry = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let record = registry
            .services
            .get_mut(service_name)
            .ok_or_else(|| AuthError::UnknownService(service_name.to_string()))?;

        let new_key = Uuid::new_v4().to_string();
        let old_key = std::mem::replace(&mut record.api_key, new_key.clone());
        registry.keys.remove(&old_key);
        registry
            .keys
            .insert(new_key.clone(), service_name.to_string());

        info!(service = service_name, "rotated API key");
        Ok(new_key)
    }

    /// All registered identities, for the admin listing. Keys are not
    /// included.
    #[must_use]
    pub fn list_services(&self) -> Vec<ServiceIdentity> {
        let registry = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let mut services: Vec<ServiceIdentity> = registry
            .services
            .values()
            .map(|record| record.identity.clone())
            .collect();
        services.sort_by(|a, b| a.service_name.cmp(&b.service_name));
        services
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registration(name: &str, rate_limit: u32) -> ServiceRegistration {
        ServiceRegistration {
            service_name: name.to_string(),
            service_type: "web-backend".to_string(),
            api_key: Some(format!("{name}-key")),
            rate_limit: Some(rate_limit),
        }
    }

    #[test]
    fn test_authenticate_known_key() {
        let auth = AuthService::default();
        auth.register_service(registration("checkout", 10)).unwrap();

        let identity = auth.authenticate("checkout-key").unwrap();
        assert_eq!(identity.service_name, "checkout");
        assert_eq!(identity.rate_limit, 10);
    }

    #[test]
    fn test_authenticate_unknown_key() {
        let auth = AuthService::default();
        let err = auth.authenticate("nope").unwrap_err();
        assert!(matches!(err, AuthError::UnknownApiKey));
    }

    #[test]
    fn test_register_conflict() {
        let auth = AuthService::default();
        auth.register_service(registration("checkout", 10)).unwrap();

        let err = auth
            .register_service(registration("checkout", 10))
            .unwrap_err();
        assert!(matches!(err, AuthError::Conflict(name) if name == "checkout"));
    }

    #[test]
    fn test_register_generates_key_when_absent() {
        let auth = AuthService::default();
        let (_, key) = auth
            .register_service(ServiceRegistration {
                service_name: "checkout".to_string(),
                service_type: "web-backend".to_string(),
                api_key: None,
                rate_limit: None,
            })
            .unwrap();

        assert!(!key.is_empty());
        assert_eq!(auth.authenticate(&key).unwrap().rate_limit, DEFAULT_RATE_LIMIT);
    }

    #[test]
    fn test_rate_limit_exact_budget() {
        let auth = AuthService::default();
        auth.register_service(registration("checkout", 3)).unwrap();

        for _ in 0..3 {
            auth.check_and_consume("checkout", 1).unwrap();
        }
        let err = auth.check_and_consume("checkout", 1).unwrap_err();
        assert!(matches!(err, AuthError::RateLimited { .. }));
    }

    #[test]
    fn test_rate_limit_window_rollover() {
        let auth = AuthService::new(Duration::from_millis(50));
        auth.register_service(registration("checkout", 1)).unwrap();

        auth.check_and_consume("checkout", 1).unwrap();
        assert!(auth.check_and_consume("checkout", 1).is_err());

        std::thread::sleep(Duration::from_millis(60));
        auth.check_and_consume("checkout", 1).unwrap();
    }

    #[test]
    fn test_rate_limit_batch_cost_is_atomic() {
        let auth = AuthService::default();
        auth.register_service(registration("checkout", 5)).unwrap();

        auth.check_and_consume("checkout", 3).unwrap();
        // Refusing a batch must not consume any quota...
        let err = auth.check_and_consume("checkout", 3).unwrap_err();
        assert!(matches!(err, AuthError::RateLimited { .. }));
        // ...so the remaining budget is still spendable.
        auth.check_and_consume("checkout", 2).unwrap();
    }

    #[test]
    fn test_rate_limit_concurrent_requests_share_quota() {
        use std::sync::Arc;

        let auth = Arc::new(AuthService::default());
        auth.register_service(registration("checkout", 100)).unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let auth = Arc::clone(&auth);
            handles.push(std::thread::spawn(move || {
                let mut admitted = 0u32;
                for _ in 0..25 {
                    if auth.check_and_consume("checkout", 1).is_ok() {
                        admitted += 1;
                    }
                }
                admitted
            }));
        }

        let total: u32 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        // 200 attempts against a quota of 100: exactly 100 may pass.
        assert_eq!(total, 100);
    }

    #[test]
    fn test_rotate_key_invalidates_old_key_immediately() {
        let auth = AuthService::default();
        auth.register_service(registration("checkout", 10)).unwrap();

        let new_key = auth.rotate_key("checkout").unwrap();
        assert!(matches!(
            auth.authenticate("checkout-key").unwrap_err(),
            AuthError::UnknownApiKey
        ));
        assert_eq!(auth.authenticate(&new_key).unwrap().service_name, "checkout");
    }

    #[test]
    fn test_rotate_key_unknown_service() {
        let auth = AuthService::default();
        let err = auth.rotate_key("ghost").unwrap_err();
        assert!(matches!(err, AuthError::UnknownService(name) if name == "ghost"));
    }

    #[test]
    fn test_list_services_sorted_by_name() {
        let auth = AuthService::default();
        auth.register_service(registration("orders", 10)).unwrap();
        auth.register_service(registration("billing", 10)).unwrap();

        let names: Vec<String> = auth
            .list_services()
            .into_iter()
            .map(|identity| identity.service_name)
            .collect();
        assert_eq!(names, vec!["billing", "orders"]);
    }
}
