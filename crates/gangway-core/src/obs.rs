//! Structured observability hooks for session lifecycle events.
//!
//! This module provides:
//! - Session-scoped tracing spans via [`session_span`] (attach with
//!   `tracing::Instrument` so the span survives await points)
//! - Emission functions for key lifecycle events: admission, start,
//!   completion, cancellation, staleness reaping
//!
//! Events are emitted at `info!` level; denials at `warn!`.

use tracing::{info, warn, Span};

/// Span covering one session's run, tagged with the session id.
pub fn session_span(session_id: &str) -> Span {
    tracing::info_span!("gangway.session", session_id = %session_id)
}

/// Emit event: request denied at admission.
pub fn emit_admission_denied(trace_id: &str, operation: &str, reason: &str) {
    warn!(
        event = "admission.denied",
        trace_id = %trace_id,
        operation = %operation,
        reason = %reason,
    );
}

/// Emit event: session started for a container command.
pub fn emit_session_started(session_id: &str, container_id: &str, streaming: bool) {
    info!(
        event = "session.started",
        session_id = %session_id,
        container_id = %container_id,
        streaming = streaming,
    );
}

/// Emit event: session finished with exit code, bytes, and duration.
pub fn emit_session_completed(
    session_id: &str,
    exit_code: Option<i64>,
    output_bytes: u64,
    duration_ms: u64,
) {
    info!(
        event = "session.completed",
        session_id = %session_id,
        exit_code = exit_code,
        output_bytes = output_bytes,
        duration_ms = duration_ms,
    );
}

/// Emit event: session cancelled, with the reason (`timeout` or
/// `client_cancel`).
pub fn emit_session_cancelled(session_id: &str, reason: &str, duration_ms: u64) {
    info!(
        event = "session.cancelled",
        session_id = %session_id,
        reason = %reason,
        duration_ms = duration_ms,
    );
}

/// Emit event: session failed with a sanitized error.
pub fn emit_session_failed(session_id: &str, error: &dyn std::fmt::Display) {
    warn!(event = "session.failed", session_id = %session_id, error = %error);
}

/// Emit event: staleness sweep force-cancelled a session.
pub fn emit_session_reaped(session_id: &str, age_secs: u64) {
    warn!(event = "session.reaped", session_id = %session_id, age_secs = age_secs);
}
