//! Gangway Core Library
//!
//! Re-exports the exec pipeline components: admission control, session
//! lifecycle, stream demultiplexing, and the executor facade.

pub mod audit;
pub mod breaker;
pub mod buffer;
pub mod config;
pub mod demux;
pub mod error;
pub mod executor;
pub mod fakes;
pub mod homoglyph;
pub mod metrics;
pub mod obs;
pub mod ratelimit;
pub mod response;
pub mod runtime;
pub mod security;
pub mod session;
pub mod shellparse;
pub mod telemetry;

pub use audit::{AuditEntry, AuditHandle, AuditSink, JsonlAuditSink, TracingAuditSink};

pub use breaker::{BreakerState, CircuitBreaker};

pub use buffer::CircularBuffer;

pub use config::{
    AuditConfig, BreakerConfig, Config, DemuxConfig, PolicyMode, RateLimitConfig, SecurityConfig,
    SessionConfig,
};

pub use demux::{demux_logs, demux_stream, Channel, DemuxedChunk, FrameDecoder, LogDecoder};

pub use error::{
    classify_runtime_error, retry_with_backoff, sanitize_message, with_timeout, ErrorCode,
    GangwayError, Result, RetryPolicy,
};

pub use executor::{ContainerExecutor, ExecRequest, OpResult};

pub use homoglyph::ObfuscationReport;

pub use ratelimit::{
    backend_from_config, MemoryBackend, RateLimitDecision, RateLimiter, RateLimiterBackend,
};

pub use response::{ErrorResult, ExecResult, LogsResult, StreamEvent};

pub use runtime::{
    ByteStream, ContainerRuntime, ContainerSummary, ExecHandle, ExecSpec, ExecStatus, LogOpts,
};

pub use security::{SecurityContext, SecurityDecision, SecurityManager};

pub use session::{
    CancelReason, CancelSignal, ExecSession, SessionHandle, SessionManager, SessionOutcome,
    SessionRun, SessionState,
};

pub use shellparse::{DangerReport, ParsedCommand};

pub use metrics::METRICS;
pub use obs::{
    emit_admission_denied, emit_session_cancelled, emit_session_completed, emit_session_failed,
    emit_session_reaped, emit_session_started, session_span,
};
pub use telemetry::init_tracing;

/// Gangway version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
