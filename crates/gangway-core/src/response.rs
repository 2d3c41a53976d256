//! Structured response payloads emitted to the protocol layer.
//!
//! The core never hands raw text upward: buffered operations return one
//! result record, streaming operations emit a sequence of tagged events
//! terminated by exactly one of the terminal variants.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::demux::Channel;
use crate::error::ErrorCode;

/// Buffered exec result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i64>,
    pub output_bytes: u64,
    pub duration_ms: u64,
    pub truncated: bool,
    pub session_id: String,
    pub trace_id: String,
}

/// Buffered logs result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogsResult {
    pub logs: String,
    pub total_bytes: u64,
    pub truncated: bool,
    pub trace_id: String,
}

/// One event of a streaming exec or logs operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    ExecChunk {
        session_id: String,
        channel: Channel,
        data: String,
        timestamp: DateTime<Utc>,
    },
    ExecComplete {
        session_id: String,
        exit_code: Option<i64>,
        output_bytes: u64,
        duration_ms: u64,
    },
    ExecCancelled {
        session_id: String,
        reason: String,
        output_bytes: u64,
        duration_ms: u64,
    },
    ExecError {
        session_id: String,
        error: String,
        code: ErrorCode,
    },
    LogChunk {
        data: String,
        timestamp: DateTime<Utc>,
    },
    LogComplete {
        total_bytes: u64,
    },
    LogError {
        error: String,
        code: ErrorCode,
    },
}

/// Well-formed error result crossing the protocol boundary.
///
/// Denied and failed operations resolve to this instead of raising; the
/// message is sanitized before it gets here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorResult {
    pub is_error: bool,
    pub error: String,
    pub code: ErrorCode,
    pub trace_id: String,
}

impl ErrorResult {
    pub fn new(error: impl Into<String>, code: ErrorCode, trace_id: impl Into<String>) -> Self {
        Self {
            is_error: true,
            error: error.into(),
            code,
            trace_id: trace_id.into(),
        }
    }
}
