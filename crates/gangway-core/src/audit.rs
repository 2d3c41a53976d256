//! Audit trail for every admission decision and execution outcome.
//!
//! Entries are fire-and-forget: the hot path pushes onto a bounded queue
//! and moves on, a background task hands them to the configured sink. A
//! full queue drops the entry (counted in the log) rather than stalling an
//! execution.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::AuditConfig;

/// One audited operation, emitted whether it was admitted or blocked.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub trace_id: String,
    pub operation: String,
    pub container_id: String,
    /// Joined command line; empty for non-exec operations.
    pub command: String,
    pub user: Option<String>,
    pub exit_code: Option<i64>,
    pub duration_ms: Option<u64>,
    pub output_bytes: Option<u64>,
    pub blocked: bool,
    /// Denial reason when blocked, error summary when failed.
    pub reason: Option<String>,
}

impl AuditEntry {
    /// Entry skeleton for an operation about to be admitted or denied.
    pub fn new(trace_id: &str, operation: &str, container_id: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            trace_id: trace_id.to_string(),
            operation: operation.to_string(),
            container_id: container_id.to_string(),
            command: String::new(),
            user: None,
            exit_code: None,
            duration_ms: None,
            output_bytes: None,
            blocked: false,
            reason: None,
        }
    }

    pub fn blocked(mut self, reason: &str) -> Self {
        self.blocked = true;
        self.reason = Some(reason.to_string());
        self
    }
}

/// Destination for audit entries.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, entry: AuditEntry);
}

/// Default sink: one structured log line per entry.
#[derive(Debug, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, entry: AuditEntry) {
        tracing::info!(
            event = "audit",
            trace_id = %entry.trace_id,
            operation = %entry.operation,
            container_id = %entry.container_id,
            command = %entry.command,
            user = entry.user.as_deref(),
            exit_code = entry.exit_code,
            duration_ms = entry.duration_ms,
            output_bytes = entry.output_bytes,
            blocked = entry.blocked,
            reason = entry.reason.as_deref(),
        );
    }
}

/// Sink appending one JSON line per entry to a file.
///
/// Serialization or write failures are logged and swallowed; the audit
/// trail must never take an execution down with it.
pub struct JsonlAuditSink {
    path: std::path::PathBuf,
}

impl JsonlAuditSink {
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl AuditSink for JsonlAuditSink {
    async fn record(&self, entry: AuditEntry) {
        let line = match serde_json::to_string(&entry) {
            Ok(line) => line,
            Err(err) => {
                tracing::warn!(event = "audit.serialize_failed", error = %err);
                return;
            }
        };
        let path = self.path.clone();
        let result = tokio::task::spawn_blocking(move || {
            use std::io::Write;
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)?;
            writeln!(file, "{line}")
        })
        .await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::warn!(event = "audit.write_failed", error = %err),
            Err(err) => tracing::warn!(event = "audit.write_failed", error = %err),
        }
    }
}

/// Cheap clonable handle the executor pushes entries through.
#[derive(Clone)]
pub struct AuditHandle {
    tx: Option<mpsc::Sender<AuditEntry>>,
}

impl AuditHandle {
    /// Spawn the writer task over the given sink. Returns the handle plus
    /// the task, which the caller owns for shutdown.
    pub fn spawn(cfg: &AuditConfig, sink: Arc<dyn AuditSink>) -> (Self, Option<JoinHandle<()>>) {
        if !cfg.enabled {
            return (Self { tx: None }, None);
        }
        let (tx, mut rx) = mpsc::channel::<AuditEntry>(cfg.queue_capacity.max(1));
        let writer = tokio::spawn(async move {
            while let Some(entry) = rx.recv().await {
                sink.record(entry).await;
            }
        });
        (Self { tx: Some(tx) }, Some(writer))
    }

    /// Disabled handle that swallows everything.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Enqueue an entry without waiting. Dropped (and logged) when the
    /// queue is full or auditing is disabled.
    pub fn record(&self, entry: AuditEntry) {
        let Some(tx) = &self.tx else { return };
        if let Err(err) = tx.try_send(entry) {
            tracing::warn!(event = "audit.dropped", error = %err);
        }
    }
}
