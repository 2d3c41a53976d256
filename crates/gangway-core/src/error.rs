//! Error taxonomy, runtime-error classification, and message sanitization.
//!
//! Raw runtime errors carry filesystem paths, container hashes, and socket
//! addresses; nothing leaves the core unsanitized. Classification maps the
//! opaque message onto a fixed `{code, retryable}` table so callers can
//! apply backoff to transient classes only.

use std::future::Future;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Stable error codes surfaced to callers and audit entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NotFound,
    NotRunning,
    PermissionDenied,
    ConnectionLost,
    Timeout,
    Cancelled,
    OutOfMemory,
    DiskQuota,
    BadRequest,
    ServerError,
    StreamCorrupt,
    CircuitOpen,
    PolicyDenied,
    Unknown,
}

impl ErrorCode {
    /// Transient classes eligible for backoff retry.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::ConnectionLost | ErrorCode::Timeout | ErrorCode::ServerError
        )
    }
}

/// Errors produced by the exec pipeline.
#[derive(Debug, thiserror::Error)]
pub enum GangwayError {
    #[error("policy denied: {reason}")]
    PolicyDenied { reason: String },

    #[error("runtime error ({code:?}): {message}")]
    Runtime { code: ErrorCode, message: String },

    #[error("circuit open: retry after {reset_in_ms}ms")]
    CircuitOpen { reset_in_ms: u64 },

    #[error("stream corrupt: {buffered} bytes buffered without a parseable frame (limit {limit})")]
    StreamCorrupt { buffered: usize, limit: usize },

    #[error("operation timed out after {limit_ms}ms")]
    Timeout { limit_ms: u64 },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl GangwayError {
    /// Wrap an opaque runtime failure message, classifying it.
    pub fn runtime(message: impl Into<String>) -> Self {
        let message = message.into();
        let code = classify_runtime_error(&message);
        GangwayError::Runtime { code, message }
    }

    /// Code surfaced in error responses and audit entries.
    pub fn code(&self) -> ErrorCode {
        match self {
            GangwayError::PolicyDenied { .. } => ErrorCode::PolicyDenied,
            GangwayError::Runtime { code, .. } => *code,
            GangwayError::CircuitOpen { .. } => ErrorCode::CircuitOpen,
            GangwayError::StreamCorrupt { .. } => ErrorCode::StreamCorrupt,
            GangwayError::Timeout { .. } => ErrorCode::Timeout,
            GangwayError::InvalidRequest(_) => ErrorCode::BadRequest,
            GangwayError::Serialization(_) => ErrorCode::BadRequest,
            GangwayError::Io(_) => ErrorCode::ConnectionLost,
        }
    }

    /// Whether a caller-supplied retry policy may re-attempt this error.
    pub fn retryable(&self) -> bool {
        self.code().retryable()
    }

    /// Display form with identifying fragments replaced by placeholders.
    pub fn sanitized_message(&self) -> String {
        sanitize_message(&self.to_string())
    }
}

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, GangwayError>;

/// Map an opaque runtime failure message onto the fixed code table.
pub fn classify_runtime_error(message: &str) -> ErrorCode {
    let lower = message.to_lowercase();

    if lower.contains("no such container")
        || lower.contains("no such exec")
        || lower.contains("not found")
        || lower.contains("404")
    {
        ErrorCode::NotFound
    } else if lower.contains("is not running") || lower.contains("container not running") {
        ErrorCode::NotRunning
    } else if lower.contains("permission denied")
        || lower.contains("unauthorized")
        || lower.contains("forbidden")
        || lower.contains("401")
        || lower.contains("403")
    {
        ErrorCode::PermissionDenied
    } else if lower.contains("connection refused")
        || lower.contains("connection reset")
        || lower.contains("broken pipe")
        || lower.contains("socket hang up")
        || lower.contains("econnrefused")
    {
        ErrorCode::ConnectionLost
    } else if lower.contains("timeout") || lower.contains("timed out") || lower.contains("deadline")
    {
        ErrorCode::Timeout
    } else if lower.contains("out of memory") || lower.contains("cannot allocate") {
        ErrorCode::OutOfMemory
    } else if lower.contains("no space left") || lower.contains("disk quota") {
        ErrorCode::DiskQuota
    } else if lower.contains("500")
        || lower.contains("502")
        || lower.contains("503")
        || lower.contains("internal server error")
    {
        ErrorCode::ServerError
    } else if lower.contains("400") || lower.contains("bad request") {
        ErrorCode::BadRequest
    } else {
        ErrorCode::Unknown
    }
}

struct Sanitizers {
    hex64: Regex,
    hex12: Regex,
    ipv4: Regex,
    port: Regex,
    path: Regex,
}

fn sanitizers() -> Option<&'static Sanitizers> {
    static SANITIZERS: OnceLock<Option<Sanitizers>> = OnceLock::new();
    SANITIZERS
        .get_or_init(|| {
            Some(Sanitizers {
                hex64: Regex::new(r"\b[0-9a-fA-F]{64}\b").ok()?,
                hex12: Regex::new(r"\b[0-9a-fA-F]{12}\b").ok()?,
                ipv4: Regex::new(r"\b\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}\b").ok()?,
                port: Regex::new(r":\d{2,5}\b").ok()?,
                path: Regex::new(r"(?:/[A-Za-z0-9._-]+){2,}/?").ok()?,
            })
        })
        .as_ref()
}

/// Replace path-like segments, container hashes, short hex IDs, IPv4
/// addresses, and port suffixes with placeholder tokens.
pub fn sanitize_message(message: &str) -> String {
    let Some(s) = sanitizers() else {
        return message.to_string();
    };
    let out = s.hex64.replace_all(message, "<container-id>");
    let out = s.hex12.replace_all(&out, "<id>");
    let out = s.ipv4.replace_all(&out, "<ip>");
    let out = s.port.replace_all(&out, ":<port>");
    let out = s.path.replace_all(&out, "<path>");
    out.into_owned()
}

/// Caller-supplied retry policy: fixed attempt cap, doubling delay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first (1 = no retries).
    pub max_attempts: u32,
    /// Base delay before the first retry; doubles each attempt.
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
        }
    }
}

/// Run `op` with exponential backoff on retryable errors.
///
/// Non-retryable errors surface immediately; retryable ones are re-attempted
/// up to the policy's cap with a doubling delay between attempts.
pub async fn retry_with_backoff<F, Fut, T>(policy: &RetryPolicy, op: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.retryable() && attempt < max_attempts => {
                let delay =
                    Duration::from_millis(policy.base_delay_ms * 2u64.pow(attempt - 1));
                tracing::debug!(
                    event = "retry.backoff",
                    attempt = attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Race a future against a timer; the timer is always cleared on either
/// outcome (`tokio::time::timeout` drops its sleep with the future).
pub async fn with_timeout<T>(limit: Duration, fut: impl Future<Output = T>) -> Result<T> {
    match tokio::time::timeout(limit, fut).await {
        Ok(value) => Ok(value),
        Err(_) => Err(GangwayError::Timeout {
            limit_ms: limit.as_millis() as u64,
        }),
    }
}
