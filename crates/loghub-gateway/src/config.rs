// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;

use crate::contract::{ContractLimits, OversizePolicy};

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_QUEUE_CAPACITY: usize = 1000;
const DEFAULT_WORKERS: usize = 2;
const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_BACKOFF_BASE_MS: u64 = 100;
const DEFAULT_RATE_WINDOW_SECS: u64 = 60;

/// A service identity installed into the registry at startup, before any
/// client traffic arrives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedService {
    pub service_name: String,
    pub service_type: String,
    pub api_key: String,
    pub rate_limit: u32,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub max_request_content_length: usize,
    /// Per-class capacity of the single and batch queues.
    pub queue_capacity: usize,
    /// Worker pool size draining the queues.
    pub workers: usize,
    /// Total delivery attempts per queue item, including the first.
    pub max_attempts: u32,
    /// Base backoff between delivery retries, in milliseconds.
    pub retry_backoff_base_ms: u64,
    /// Length of the fixed rate-limit window, in seconds.
    pub rate_window_secs: u64,
    pub limits: ContractLimits,
    pub seed_services: Vec<SeedService>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            max_request_content_length: 10 * 1024 * 1024, // 10MB in Bytes
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            workers: DEFAULT_WORKERS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_backoff_base_ms: DEFAULT_RETRY_BACKOFF_BASE_MS,
            rate_window_secs: DEFAULT_RATE_WINDOW_SECS,
            limits: ContractLimits::default(),
            seed_services: Vec::new(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<T>().ok())
        .unwrap_or(default)
}

impl Config {
    /// Builds the configuration from environment variables, falling back to
    /// defaults for anything unset. Malformed values that would silently
    /// change semantics (the oversize policy, the seed registry) are startup
    /// errors instead of falling back.
    pub fn from_env() -> Result<Config, Box<dyn std::error::Error>> {
        let defaults = Config::default();
        let default_limits = defaults.limits.clone();

        let oversize_policy = match env::var("LOGHUB_OVERSIZE_POLICY") {
            Ok(raw) => raw
                .parse::<OversizePolicy>()
                .map_err(|e| anyhow::anyhow!("Invalid LOGHUB_OVERSIZE_POLICY: {e}"))?,
            Err(_) => default_limits.oversize_policy,
        };

        let seed_services = match env::var("LOGHUB_SEED_SERVICES") {
            Ok(raw) => Self::parse_seed_services(&raw)
                .map_err(|e| anyhow::anyhow!("Invalid LOGHUB_SEED_SERVICES: {e}"))?,
            Err(_) => Vec::new(),
        };

        Ok(Config {
            host: env::var("LOGHUB_HOST").unwrap_or(defaults.host),
            port: env_parse("LOGHUB_PORT", defaults.port),
            max_request_content_length: env_parse(
                "LOGHUB_MAX_CONTENT_LENGTH",
                defaults.max_request_content_length,
            ),
            queue_capacity: env_parse("LOGHUB_QUEUE_CAPACITY", defaults.queue_capacity),
            workers: env_parse("LOGHUB_WORKERS", defaults.workers),
            max_attempts: env_parse("LOGHUB_MAX_ATTEMPTS", defaults.max_attempts),
            retry_backoff_base_ms: env_parse(
                "LOGHUB_RETRY_BACKOFF_BASE_MS",
                defaults.retry_backoff_base_ms,
            ),
            rate_window_secs: env_parse("LOGHUB_RATE_WINDOW_SECS", defaults.rate_window_secs),
            limits: ContractLimits {
                max_message_bytes: env_parse(
                    "LOGHUB_MAX_MESSAGE_BYTES",
                    default_limits.max_message_bytes,
                ),
                oversize_policy,
                max_batch_len: env_parse("LOGHUB_MAX_BATCH_LEN", default_limits.max_batch_len),
                max_extra_keys: env_parse("LOGHUB_MAX_EXTRA_KEYS", default_limits.max_extra_keys),
                max_context_bytes: env_parse(
                    "LOGHUB_MAX_CONTEXT_BYTES",
                    default_limits.max_context_bytes,
                ),
            },
            seed_services,
        })
    }

    /// Parses `name:type:key:limit` entries separated by commas, e.g.
    /// `checkout:web-backend:checkout-key:1000,billing:worker:billing-key:200`.
    fn parse_seed_services(raw: &str) -> Result<Vec<SeedService>, String> {
        let mut services = Vec::new();
        for entry in raw.split(',').filter(|entry| !entry.trim().is_empty()) {
            let parts: Vec<&str> = entry.trim().split(':').collect();
            if parts.len() != 4 {
                return Err(format!(
                    "expected `name:type:key:limit`, got `{}`",
                    entry.trim()
                ));
            }
            let rate_limit = parts[3]
                .parse::<u32>()
                .map_err(|_| format!("invalid rate limit `{}` in `{}`", parts[3], entry.trim()))?;
            if parts[0].is_empty() || parts[2].is_empty() {
                return Err(format!("empty name or key in `{}`", entry.trim()));
            }
            services.push(SeedService {
                service_name: parts[0].to_string(),
                service_type: parts[1].to_string(),
                api_key: parts[2].to_string(),
                rate_limit,
            });
        }
        Ok(services)
    }
}

#[cfg(test)]
mod tests {
    use serial_test::serial;
    use std::env;

    use super::{Config, SeedService};
    use crate::contract::OversizePolicy;

    #[test]
    #[serial]
    fn test_defaults() {
        for var in [
            "LOGHUB_PORT",
            "LOGHUB_QUEUE_CAPACITY",
            "LOGHUB_OVERSIZE_POLICY",
            "LOGHUB_SEED_SERVICES",
        ] {
            env::remove_var(var);
        }

        let config = Config::from_env().unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.queue_capacity, 1000);
        assert_eq!(config.workers, 2);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.limits.max_message_bytes, 8192);
        assert_eq!(config.limits.oversize_policy, OversizePolicy::Reject);
        assert!(config.seed_services.is_empty());
    }

    #[test]
    #[serial]
    fn test_custom_port_and_capacity() {
        env::set_var("LOGHUB_PORT", "9999");
        env::set_var("LOGHUB_QUEUE_CAPACITY", "5");
        let config = Config::from_env().unwrap();
        assert_eq!(config.port, 9999);
        assert_eq!(config.queue_capacity, 5);
        env::remove_var("LOGHUB_PORT");
        env::remove_var("LOGHUB_QUEUE_CAPACITY");
    }

    #[test]
    #[serial]
    fn test_truncate_policy() {
        env::set_var("LOGHUB_OVERSIZE_POLICY", "truncate");
        let config = Config::from_env().unwrap();
        assert_eq!(config.limits.oversize_policy, OversizePolicy::Truncate);
        env::remove_var("LOGHUB_OVERSIZE_POLICY");
    }

    #[test]
    #[serial]
    fn test_invalid_oversize_policy_is_fatal() {
        env::set_var("LOGHUB_OVERSIZE_POLICY", "shrink");
        assert!(Config::from_env().is_err());
        env::remove_var("LOGHUB_OVERSIZE_POLICY");
    }

    #[test]
    #[serial]
    fn test_seed_services_parsing() {
        env::set_var(
            "LOGHUB_SEED_SERVICES",
            "checkout:web-backend:checkout-key:1000, billing:worker:billing-key:200",
        );
        let config = Config::from_env().unwrap();
        assert_eq!(
            config.seed_services,
            vec![
                SeedService {
                    service_name: "checkout".to_string(),
                    service_type: "web-backend".to_string(),
                    api_key: "checkout-key".to_string(),
                    rate_limit: 1000,
                },
                SeedService {
                    service_name: "billing".to_string(),
                    service_type: "worker".to_string(),
                    api_key: "billing-key".to_string(),
                    rate_limit: 200,
                },
            ]
        );
        env::remove_var("LOGHUB_SEED_SERVICES");
    }

    #[test]
    #[serial]
    fn test_malformed_seed_services_is_fatal() {
        env::set_var("LOGHUB_SEED_SERVICES", "checkout:web-backend");
        assert!(Config::from_env().is_err());
        env::remove_var("LOGHUB_SEED_SERVICES");
    }

    #[test]
    #[serial]
    fn test_seed_services_bad_rate_limit_is_fatal() {
        env::set_var("LOGHUB_SEED_SERVICES", "checkout:web-backend:key:lots");
        assert!(Config::from_env().is_err());
        env::remove_var("LOGHUB_SEED_SERVICES");
    }
}
