// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wire contract for log ingestion.
//!
//! Defines the shape of a single log event and of a batch of events, and the
//! validation that runs before anything downstream trusts a payload. Unknown
//! wire fields are preserved in an open attribute map rather than rejected,
//! so newer clients can ship fields this version does not know about yet.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Severity levels accepted on the wire. Anything else is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LogLevel {
    #[serde(rename = "DEBUG")]
    Debug,
    #[serde(rename = "INFO")]
    Info,
    #[serde(rename = "WARNING")]
    Warning,
    #[serde(rename = "ERROR")]
    Error,
    #[serde(rename = "CRITICAL")]
    Critical,
}

impl LogLevel {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
            LogLevel::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "WARNING" => Ok(LogLevel::Warning),
            "ERROR" => Ok(LogLevel::Error),
            "CRITICAL" => Ok(LogLevel::Critical),
            other => Err(ValidationError::UnknownLevel(other.to_string())),
        }
    }
}

/// What to do with a `message` that exceeds the configured byte cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OversizePolicy {
    /// Reject the event with a validation error.
    Reject,
    /// Cut the message at the cap and mark the event with `truncated: true`.
    Truncate,
}

impl FromStr for OversizePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "reject" => Ok(OversizePolicy::Reject),
            "truncate" => Ok(OversizePolicy::Truncate),
            other => Err(format!("unknown oversize policy `{other}`")),
        }
    }
}

/// Caps applied during validation.
#[derive(Debug, Clone)]
pub struct ContractLimits {
    /// Maximum `message` size in bytes.
    pub max_message_bytes: usize,
    /// Behavior when `message` exceeds [`ContractLimits::max_message_bytes`].
    pub oversize_policy: OversizePolicy,
    /// Maximum number of events in one batch.
    pub max_batch_len: usize,
    /// Maximum number of unknown extra fields kept per event.
    pub max_extra_keys: usize,
    /// Maximum serialized size of `context` plus the extra fields, in bytes.
    pub max_context_bytes: usize,
}

impl Default for ContractLimits {
    fn default() -> Self {
        ContractLimits {
            max_message_bytes: 8192,
            oversize_policy: OversizePolicy::Reject,
            max_batch_len: 1000,
            max_extra_keys: 64,
            max_context_bytes: 10_000,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("field `{0}` must not be empty")]
    EmptyField(&'static str),

    #[error("unknown log level `{0}`")]
    UnknownLevel(String),

    #[error("message exceeds {limit} bytes (got {actual})")]
    MessageTooLarge { actual: usize, limit: usize },

    #[error("invalid timestamp `{0}`, expected RFC 3339")]
    InvalidTimestamp(String),

    #[error("field `{0}` must be a finite, non-negative number")]
    InvalidNumber(&'static str),

    #[error("too many extra attributes: {actual} (limit {limit})")]
    TooManyAttributes { actual: usize, limit: usize },

    #[error("context exceeds {limit} bytes (got {actual})")]
    ContextTooLarge { actual: usize, limit: usize },

    #[error("batch contains no events")]
    EmptyBatch,

    #[error("batch exceeds {limit} events (got {actual})")]
    BatchTooLarge { actual: usize, limit: usize },

    #[error("event {index}: {source}")]
    BatchMember {
        index: usize,
        #[source]
        source: Box<ValidationError>,
    },

    #[error("event {index}: service `{actual}` does not match batch service `{expected}`")]
    ServiceMismatch {
        index: usize,
        actual: String,
        expected: String,
    },

    #[error("payload service `{payload}` does not match authenticated service `{authenticated}`")]
    CredentialMismatch {
        payload: String,
        authenticated: String,
    },
}

/// Well-known optional attributes a client may attach to an event.
///
/// All of these are pass-through context: validation only checks the numeric
/// fields for sane values, everything else is kept as sent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventAttributes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logger_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_usage_mb: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
}

/// A log event as it arrives on the wire, before validation.
///
/// Every field is optional here so that missing-field errors are reported as
/// [`ValidationError`]s with the field name instead of opaque parse failures.
/// The well-known attributes are named fields; anything this version does
/// not know about lands in `extra` and is preserved.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawLogEvent {
    #[serde(default)]
    pub service_name: Option<String>,
    #[serde(default)]
    pub service_type: Option<String>,
    #[serde(default)]
    pub service_version: Option<String>,
    #[serde(default)]
    pub service_instance_id: Option<String>,
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub environment: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub logger_name: Option<String>,
    #[serde(default)]
    pub thread_name: Option<String>,
    #[serde(default)]
    pub context: Option<Map<String, Value>>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub exception_type: Option<String>,
    #[serde(default)]
    pub exception_message: Option<String>,
    #[serde(default)]
    pub stack_trace: Option<String>,
    #[serde(default)]
    pub execution_time_ms: Option<f64>,
    #[serde(default)]
    pub memory_usage_mb: Option<f64>,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub http_method: Option<String>,
    #[serde(default)]
    pub status_code: Option<i64>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A validated, immutable log event. Nothing downstream mutates one of these.
#[derive(Debug, Clone, Serialize)]
pub struct LogEvent {
    pub service_name: String,
    pub service_type: String,
    pub service_version: String,
    pub service_instance_id: String,
    pub level: LogLevel,
    pub message: String,
    pub environment: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub attributes: EventAttributes,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl LogEvent {
    /// Approximate wire size of the event, used for byte accounting.
    #[must_use]
    pub fn size_bytes(&self) -> u64 {
        serde_json::to_vec(self).map_or(self.message.len() as u64, |v| v.len() as u64)
    }
}

/// A batch of log events as it arrives on the wire, before validation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawLogBatch {
    #[serde(default)]
    pub batch_id: Option<String>,
    #[serde(default)]
    pub service_name: Option<String>,
    #[serde(default)]
    pub service_type: Option<String>,
    #[serde(default)]
    pub service_version: Option<String>,
    #[serde(default)]
    pub service_instance_id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub logs: Vec<RawLogEvent>,
}

impl RawLogBatch {
    /// Number of events in the batch, used for rate-limit cost before
    /// validation runs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.logs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.logs.is_empty()
    }
}

/// A validated batch. Event order matches the order they were validated in.
#[derive(Debug, Clone)]
pub struct LogBatch {
    pub batch_id: String,
    pub service_name: String,
    pub events: Vec<LogEvent>,
}

fn required(field: Option<String>, name: &'static str) -> Result<String, ValidationError> {
    match field {
        None => Err(ValidationError::MissingField(name)),
        Some(s) if s.trim().is_empty() => Err(ValidationError::EmptyField(name)),
        Some(s) => Ok(s),
    }
}

fn check_non_negative(value: Option<f64>, name: &'static str) -> Result<(), ValidationError> {
    if let Some(v) = value {
        if !v.is_finite() || v < 0.0 {
            return Err(ValidationError::InvalidNumber(name));
        }
    }
    Ok(())
}

fn serialized_len(value: &impl Serialize) -> usize {
    serde_json::to_vec(value).map_or(0, |v| v.len())
}

// Cut on a char boundary so truncation never produces invalid UTF-8.
fn truncate_message(message: &mut String, max_bytes: usize) {
    let mut end = max_bytes;
    while end > 0 && !message.is_char_boundary(end) {
        end -= 1;
    }
    message.truncate(end);
}

/// Validates a single raw event against the contract.
///
/// `received_at` becomes the event timestamp when the client did not send one.
/// Pure: no side effects, no global state.
pub fn validate_event(
    raw: RawLogEvent,
    limits: &ContractLimits,
    received_at: DateTime<Utc>,
) -> Result<LogEvent, ValidationError> {
    let service_name = required(raw.service_name, "service_name")?;
    let service_type = required(raw.service_type, "service_type")?;
    let service_version = required(raw.service_version, "service_version")?;
    let service_instance_id = required(raw.service_instance_id, "service_instance_id")?;
    let environment = required(raw.environment, "environment")?;

    let level = required(raw.level, "level")?.parse::<LogLevel>()?;

    let mut message = required(raw.message, "message")?;
    let mut extra = raw.extra;
    if message.len() > limits.max_message_bytes {
        match limits.oversize_policy {
            OversizePolicy::Reject => {
                return Err(ValidationError::MessageTooLarge {
                    actual: message.len(),
                    limit: limits.max_message_bytes,
                });
            }
            OversizePolicy::Truncate => {
                truncate_message(&mut message, limits.max_message_bytes);
                extra.insert("truncated".to_string(), Value::Bool(true));
            }
        }
    }

    let timestamp = match raw.timestamp {
        None => received_at,
        Some(s) => DateTime::parse_from_rfc3339(&s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|_| ValidationError::InvalidTimestamp(s))?,
    };

    let attributes = EventAttributes {
        logger_name: raw.logger_name,
        thread_name: raw.thread_name,
        context: raw.context,
        tags: raw.tags,
        exception_type: raw.exception_type,
        exception_message: raw.exception_message,
        stack_trace: raw.stack_trace,
        execution_time_ms: raw.execution_time_ms,
        memory_usage_mb: raw.memory_usage_mb,
        request_id: raw.request_id,
        user_id: raw.user_id,
        endpoint: raw.endpoint,
        http_method: raw.http_method,
        status_code: raw.status_code,
        host: raw.host,
        ip_address: raw.ip_address,
    };
    check_non_negative(attributes.execution_time_ms, "execution_time_ms")?;
    check_non_negative(attributes.memory_usage_mb, "memory_usage_mb")?;

    if extra.len() > limits.max_extra_keys {
        return Err(ValidationError::TooManyAttributes {
            actual: extra.len(),
            limit: limits.max_extra_keys,
        });
    }
    let context_bytes =
        attributes.context.as_ref().map_or(0, |context| serialized_len(context))
            + serialized_len(&extra);
    if context_bytes > limits.max_context_bytes {
        return Err(ValidationError::ContextTooLarge {
            actual: context_bytes,
            limit: limits.max_context_bytes,
        });
    }

    Ok(LogEvent {
        service_name,
        service_type,
        service_version,
        service_instance_id,
        level,
        message,
        environment,
        timestamp,
        attributes,
        extra,
    })
}

/// Validates a raw batch atomically: one bad member rejects the whole batch
/// and no event from it is ever accepted.
///
/// Batch-level service fields act as defaults for members that omit them;
/// a member naming a different service than the batch fails validation.
pub fn validate_batch(
    raw: RawLogBatch,
    limits: &ContractLimits,
    received_at: DateTime<Utc>,
) -> Result<LogBatch, ValidationError> {
    let batch_id = required(raw.batch_id, "batch_id")?;
    let service_name = required(raw.service_name, "service_name")?;
    let service_type = required(raw.service_type, "service_type")?;
    let service_version = required(raw.service_version, "service_version")?;
    let service_instance_id = required(raw.service_instance_id, "service_instance_id")?;

    if raw.logs.is_empty() {
        return Err(ValidationError::EmptyBatch);
    }
    if raw.logs.len() > limits.max_batch_len {
        return Err(ValidationError::BatchTooLarge {
            actual: raw.logs.len(),
            limit: limits.max_batch_len,
        });
    }

    let mut events = Vec::with_capacity(raw.logs.len());
    for (index, mut member) in raw.logs.into_iter().enumerate() {
        if let Some(member_service) = member.service_name.as_deref() {
            if member_service != service_name {
                return Err(ValidationError::ServiceMismatch {
                    index,
                    actual: member_service.to_string(),
                    expected: service_name,
                });
            }
        }
        member.service_name.get_or_insert_with(|| service_name.clone());
        member.service_type.get_or_insert_with(|| service_type.clone());
        member
            .service_version
            .get_or_insert_with(|| service_version.clone());
        member
            .service_instance_id
            .get_or_insert_with(|| service_instance_id.clone());

        let event = validate_event(member, limits, received_at).map_err(|source| {
            ValidationError::BatchMember {
                index,
                source: Box::new(source),
            }
        })?;
        events.push(event);
    }

    Ok(LogBatch {
        batch_id,
        service_name,
        events,
    })
}
