//! The execution facade: admission, session orchestration, and result
//! shaping for every operation the protocol layer exposes.
//!
//! Denied and failed operations resolve to a well-formed [`ErrorResult`]
//! with a sanitized message; the raw runtime error never crosses this
//! boundary. Runtime queries (info, version, listings, inspections) go
//! through the circuit breaker; exec sessions do not — a long-running
//! command is not a health probe.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::audit::{AuditEntry, AuditHandle, AuditSink, TracingAuditSink};
use crate::breaker::CircuitBreaker;
use crate::buffer::CircularBuffer;
use crate::config::{Config, DemuxConfig};
use crate::demux::demux_logs;
use crate::error::{classify_runtime_error, ErrorCode, GangwayError};
use crate::metrics::METRICS;
use crate::obs;
use crate::ratelimit::{backend_from_config, RateLimiter};
use crate::response::{ErrorResult, ExecResult, LogsResult, StreamEvent};
use crate::runtime::{ContainerRuntime, ExecSpec, LogOpts};
use crate::security::{SecurityContext, SecurityManager};
use crate::session::{
    CancelReason, ExecSession, SessionManager, SessionOutcome, SessionRun, SessionState,
};

use futures::StreamExt;

/// One exec request as it arrives from the protocol layer.
#[derive(Debug, Clone, Default)]
pub struct ExecRequest {
    pub container_id: String,
    pub command: Vec<String>,
    /// User to run as; `None` means the container default.
    pub user: Option<String>,
    pub workdir: Option<String>,
    /// Environment entries, `KEY=VALUE`.
    pub env: Vec<String>,
    /// Payload written to the process before stdin is closed.
    pub stdin: Option<String>,
    /// Allocate a TTY; the output stream arrives unframed.
    pub tty: bool,
    /// Per-request timeout; `None` falls back to the configured default.
    pub timeout_ms: Option<u64>,
    /// Per-request output chunk ceiling; `None` falls back to the
    /// configured demux chunk size.
    pub chunk_size: Option<usize>,
    /// Caller identity the rate limiter keys on.
    pub identifier: String,
}

/// Outcome of a buffered operation: the result record, or a sanitized
/// error record. Both are well-formed protocol payloads.
pub type OpResult<T> = std::result::Result<T, Box<ErrorResult>>;

/// Ties admission, sessions, the breaker, and audit together behind one
/// surface.
pub struct ContainerExecutor {
    runtime: Arc<dyn ContainerRuntime>,
    security: SecurityManager,
    sessions: Arc<SessionManager>,
    breaker: CircuitBreaker,
    audit: AuditHandle,
    audit_writer: Option<JoinHandle<()>>,
    cfg: Config,
}

impl ContainerExecutor {
    /// Build the full pipeline from one injected config, logging audit
    /// entries through the default sink.
    pub fn new(runtime: Arc<dyn ContainerRuntime>, cfg: Config) -> Self {
        Self::with_audit_sink(runtime, cfg, Arc::new(TracingAuditSink))
    }

    pub fn with_audit_sink(
        runtime: Arc<dyn ContainerRuntime>,
        cfg: Config,
        sink: Arc<dyn AuditSink>,
    ) -> Self {
        let backend = backend_from_config(&cfg.rate_limit);
        let limiter = Arc::new(RateLimiter::new(cfg.rate_limit.clone(), backend));
        let security = SecurityManager::new(cfg.security.clone(), limiter);
        let sessions = SessionManager::new(cfg.session.clone());
        let breaker = CircuitBreaker::new(cfg.breaker.clone());
        let (audit, audit_writer) = AuditHandle::spawn(&cfg.audit, sink);
        Self {
            runtime,
            security,
            sessions,
            breaker,
            audit,
            audit_writer,
            cfg,
        }
    }

    /// Start the background staleness sweep.
    pub async fn start(&self) {
        self.sessions.start_sweeper().await;
    }

    /// Cancel all live sessions and stop background tasks.
    pub async fn shutdown(&mut self) {
        self.sessions.shutdown().await;
        if let Some(writer) = self.audit_writer.take() {
            writer.abort();
        }
    }

    /// Number of sessions currently registered.
    pub async fn live_sessions(&self) -> usize {
        self.sessions.live_count().await
    }

    /// Signal client cancellation on a running session.
    pub async fn cancel(&self, session_id: &str) -> bool {
        self.sessions.cancel_session(session_id).await
    }

    // -----------------------------------------------------------------
    // Exec
    // -----------------------------------------------------------------

    /// Run a command to completion and return the buffered result.
    pub async fn exec(&self, req: ExecRequest) -> OpResult<ExecResult> {
        let trace_id = new_trace_id();
        self.admit_exec(&req, &trace_id).await?;

        let outcome = self.run_session(&req, &trace_id, None).await?;
        self.audit_outcome(&req, &trace_id, &outcome);

        match outcome.state {
            SessionState::Completed => Ok(ExecResult {
                stdout: outcome.stdout,
                stderr: outcome.stderr,
                exit_code: outcome.exit_code,
                output_bytes: outcome.output_bytes,
                duration_ms: outcome.duration_ms,
                truncated: outcome.truncated,
                session_id: outcome.session_id,
                trace_id,
            }),
            SessionState::Cancelled => {
                let reason = outcome
                    .cancel_reason
                    .unwrap_or(CancelReason::ClientCancel);
                let code = match reason {
                    CancelReason::Timeout => ErrorCode::Timeout,
                    CancelReason::ClientCancel => ErrorCode::Cancelled,
                };
                Err(Box::new(ErrorResult::new(
                    format!(
                        "execution cancelled ({}) after {}ms, {} output bytes captured",
                        reason.as_str(),
                        outcome.duration_ms,
                        outcome.output_bytes
                    ),
                    code,
                    trace_id,
                )))
            }
            _ => {
                let message = outcome
                    .error
                    .unwrap_or_else(|| "execution failed".to_string());
                let code = classify_runtime_error(&message);
                Err(Box::new(ErrorResult::new(message, code, trace_id)))
            }
        }
    }

    /// Run a command, forwarding output chunks as they arrive.
    ///
    /// Returns the session id once the session is admitted and spawned. The
    /// event sequence on `tx` ends with exactly one terminal variant
    /// (`ExecComplete`, `ExecCancelled`, or `ExecError`).
    pub async fn exec_streaming(
        &self,
        req: ExecRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> OpResult<String> {
        let trace_id = new_trace_id();
        self.admit_exec(&req, &trace_id).await?;

        let permit = self
            .sessions
            .acquire()
            .await
            .map_err(|err| self.server_error(&err, &trace_id))?;
        let handle = self.sessions.register().await;
        let session_id = handle.id.clone();

        let exec_handle = match self.start_exec(&req).await {
            Ok(h) => h,
            Err(err) => {
                self.sessions.remove(&session_id).await;
                drop(permit);
                let result = self.runtime_error(&err, &trace_id);
                self.audit
                    .record(self.failed_entry(&req, &trace_id, &result.error));
                return Err(result);
            }
        };

        obs::emit_session_started(&session_id, &req.container_id, true);

        let (chunk_tx, mut chunk_rx) = mpsc::channel(64);
        let session = ExecSession::new(
            session_id.clone(),
            Arc::clone(&handle.cancel),
            self.cfg.session.clone(),
            self.demux_cfg(&req),
        );
        let run = SessionRun {
            container_id: req.container_id.clone(),
            handle: exec_handle,
            stdin: req.stdin.clone(),
            timeout: self.effective_timeout(&req),
            chunk_tx: Some(chunk_tx),
        };

        let runtime = Arc::clone(&self.runtime);
        let sessions = Arc::clone(&self.sessions);
        let audit = self.audit.clone();
        let entry = self.exec_entry(&req, &trace_id);
        let event_tx = tx.clone();
        let forward_id = session_id.clone();

        let session_task = tokio::spawn(session.run(runtime, run));
        let forwarder = tokio::spawn(async move {
            while let Some(chunk) = chunk_rx.recv().await {
                let event = StreamEvent::ExecChunk {
                    session_id: forward_id.clone(),
                    channel: chunk.channel,
                    data: chunk.data,
                    timestamp: chunk.timestamp,
                };
                if event_tx.send(event).await.is_err() {
                    // Receiver gone; keep draining so the session is not
                    // blocked on a full channel.
                    continue;
                }
            }
        });

        let task_id = session_id.clone();
        let trace = trace_id;
        tokio::spawn(async move {
            let _permit = permit;
            let outcome = match session_task.await {
                Ok(outcome) => outcome,
                Err(join_err) => {
                    tracing::error!(event = "session.task_panicked", error = %join_err);
                    sessions.remove(&task_id).await;
                    let _ = tx
                        .send(StreamEvent::ExecError {
                            session_id: task_id,
                            error: "session task failed".to_string(),
                            code: ErrorCode::ServerError,
                        })
                        .await;
                    return;
                }
            };
            let _ = forwarder.await;
            sessions.remove(&task_id).await;
            audit.record(finished_entry(entry, &outcome));

            let terminal = match outcome.state {
                SessionState::Completed => StreamEvent::ExecComplete {
                    session_id: outcome.session_id,
                    exit_code: outcome.exit_code,
                    output_bytes: outcome.output_bytes,
                    duration_ms: outcome.duration_ms,
                },
                SessionState::Cancelled => StreamEvent::ExecCancelled {
                    session_id: outcome.session_id,
                    reason: outcome
                        .cancel_reason
                        .unwrap_or(CancelReason::ClientCancel)
                        .as_str()
                        .to_string(),
                    output_bytes: outcome.output_bytes,
                    duration_ms: outcome.duration_ms,
                },
                _ => {
                    let error = outcome
                        .error
                        .unwrap_or_else(|| "execution failed".to_string());
                    let code = classify_runtime_error(&error);
                    StreamEvent::ExecError {
                        session_id: outcome.session_id,
                        error,
                        code,
                    }
                }
            };
            if tx.send(terminal).await.is_err() {
                tracing::debug!(event = "stream.receiver_gone", trace_id = %trace);
            }
        });

        Ok(session_id)
    }

    // -----------------------------------------------------------------
    // Logs
    // -----------------------------------------------------------------

    /// Fetch container logs, buffered and bounded.
    pub async fn logs(
        &self,
        container_id: &str,
        opts: LogOpts,
        identifier: &str,
    ) -> OpResult<LogsResult> {
        let trace_id = new_trace_id();
        self.admit_operation("logs", identifier, container_id, &trace_id)
            .await?;

        let stream = self
            .breaker
            .call(|| self.runtime.logs(container_id, opts))
            .await
            .map_err(|err| self.runtime_error(&err, &trace_id))?;

        let mut buffer = CircularBuffer::new(
            self.cfg.session.buffer_max_items,
            self.cfg.session.buffer_max_bytes,
        );
        let mut total_bytes: u64 = 0;
        let mut chunks = Box::pin(demux_logs(stream, &self.cfg.demux));
        while let Some(next) = chunks.next().await {
            let chunk = next.map_err(|err| self.runtime_error(&err, &trace_id))?;
            total_bytes += chunk.data.len() as u64;
            METRICS.add_bytes_streamed(chunk.data.len() as u64);
            buffer.push(chunk.data);
        }

        let truncated = total_bytes > buffer.total_bytes() as u64;
        self.audit
            .record(AuditEntry::new(&trace_id, "logs", container_id));
        Ok(LogsResult {
            logs: buffer.contents(),
            total_bytes,
            truncated,
            trace_id,
        })
    }

    /// Stream container logs; the event sequence ends with `LogComplete`
    /// or `LogError`.
    pub async fn logs_streaming(
        &self,
        container_id: &str,
        opts: LogOpts,
        identifier: &str,
        tx: mpsc::Sender<StreamEvent>,
    ) -> OpResult<()> {
        let trace_id = new_trace_id();
        self.admit_operation("logs", identifier, container_id, &trace_id)
            .await?;

        let stream = self
            .breaker
            .call(|| self.runtime.logs(container_id, opts))
            .await
            .map_err(|err| self.runtime_error(&err, &trace_id))?;

        let demux_cfg = self.cfg.demux.clone();
        let audit = self.audit.clone();
        let container = container_id.to_string();
        tokio::spawn(async move {
            let mut total_bytes: u64 = 0;
            let mut chunks = Box::pin(demux_logs(stream, &demux_cfg));
            let terminal = loop {
                match chunks.next().await {
                    Some(Ok(chunk)) => {
                        total_bytes += chunk.data.len() as u64;
                        METRICS.add_bytes_streamed(chunk.data.len() as u64);
                        let event = StreamEvent::LogChunk {
                            data: chunk.data,
                            timestamp: chunk.timestamp,
                        };
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    Some(Err(err)) => {
                        break StreamEvent::LogError {
                            error: err.sanitized_message(),
                            code: err.code(),
                        }
                    }
                    None => break StreamEvent::LogComplete { total_bytes },
                }
            };
            audit.record(AuditEntry::new(&trace_id, "logs", &container));
            let _ = tx.send(terminal).await;
        });

        Ok(())
    }

    // -----------------------------------------------------------------
    // Runtime queries (breaker-wrapped)
    // -----------------------------------------------------------------

    pub async fn list_containers(&self, all: bool, identifier: &str) -> OpResult<Value> {
        let trace_id = new_trace_id();
        self.admit_operation("list_containers", identifier, "", &trace_id)
            .await?;
        let containers = self
            .breaker
            .call(|| self.runtime.list_containers(all))
            .await
            .map_err(|err| self.runtime_error(&err, &trace_id))?;
        serde_json::to_value(containers)
            .map_err(|err| self.server_error(&GangwayError::from(err), &trace_id))
    }

    pub async fn inspect_container(&self, id: &str, identifier: &str) -> OpResult<Value> {
        self.query(identifier, "inspect", || self.runtime.inspect_container(id))
            .await
    }

    pub async fn inspect_image(&self, id: &str, identifier: &str) -> OpResult<Value> {
        self.query(identifier, "inspect", || self.runtime.inspect_image(id))
            .await
    }

    pub async fn inspect_network(&self, id: &str, identifier: &str) -> OpResult<Value> {
        self.query(identifier, "inspect", || self.runtime.inspect_network(id))
            .await
    }

    pub async fn inspect_volume(&self, id: &str, identifier: &str) -> OpResult<Value> {
        self.query(identifier, "inspect", || self.runtime.inspect_volume(id))
            .await
    }

    pub async fn runtime_info(&self, identifier: &str) -> OpResult<Value> {
        self.query(identifier, "info", || self.runtime.info()).await
    }

    pub async fn runtime_version(&self, identifier: &str) -> OpResult<Value> {
        self.query(identifier, "version", || self.runtime.version())
            .await
    }

    // -----------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------

    async fn query<F, Fut>(&self, identifier: &str, operation: &str, op: F) -> OpResult<Value>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = crate::error::Result<Value>>,
    {
        let trace_id = new_trace_id();
        self.admit_operation(operation, identifier, "", &trace_id)
            .await?;
        self.breaker
            .call(op)
            .await
            .map_err(|err| self.runtime_error(&err, &trace_id))
    }

    /// Validate the request shape, then run the five admission checks.
    async fn admit_exec(&self, req: &ExecRequest, trace_id: &str) -> OpResult<()> {
        if req.container_id.is_empty() {
            return Err(self.bad_request("container_id must not be empty", trace_id));
        }
        if req.command.is_empty() || req.command[0].is_empty() {
            return Err(self.bad_request("command must not be empty", trace_id));
        }

        let ctx = SecurityContext {
            identifier: req.identifier.clone(),
            operation: "exec".to_string(),
            user: req.user.clone(),
        };
        let decision = self
            .security
            .check_command(&req.command, &ctx)
            .await
            .map_err(|err| self.server_error(&err, trace_id))?;
        if !decision.allowed {
            let reason = decision.reason.unwrap_or_else(|| "denied".to_string());
            obs::emit_admission_denied(trace_id, "exec", &reason);
            self.audit
                .record(self.exec_entry(req, trace_id).blocked(&reason));
            return Err(Box::new(ErrorResult::new(
                reason,
                ErrorCode::PolicyDenied,
                trace_id,
            )));
        }
        Ok(())
    }

    /// Rate-limit admission for command-less operations.
    async fn admit_operation(
        &self,
        operation: &str,
        identifier: &str,
        container_id: &str,
        trace_id: &str,
    ) -> OpResult<()> {
        let decision = self
            .security
            .check_operation(operation, identifier)
            .await
            .map_err(|err| self.server_error(&err, trace_id))?;
        if !decision.allowed {
            let reason = decision.reason.unwrap_or_else(|| "denied".to_string());
            obs::emit_admission_denied(trace_id, operation, &reason);
            self.audit
                .record(AuditEntry::new(trace_id, operation, container_id).blocked(&reason));
            return Err(Box::new(ErrorResult::new(
                reason,
                ErrorCode::PolicyDenied,
                trace_id,
            )));
        }
        Ok(())
    }

    async fn start_exec(
        &self,
        req: &ExecRequest,
    ) -> crate::error::Result<Box<dyn crate::runtime::ExecHandle>> {
        let spec = ExecSpec {
            cmd: req.command.clone(),
            user: req.user.clone(),
            workdir: req.workdir.clone(),
            env: req.env.clone(),
            tty: req.tty,
            attach_stdin: req.stdin.is_some(),
        };
        self.runtime.exec(&req.container_id, spec).await
    }

    /// Demux bounds for one request; the decoder classifies framed versus
    /// unframed on its own, so a TTY stream needs no mode switch here.
    fn demux_cfg(&self, req: &ExecRequest) -> DemuxConfig {
        let mut cfg = self.cfg.demux.clone();
        if let Some(size) = req.chunk_size {
            cfg.chunk_size = size.max(1);
        }
        cfg
    }

    /// Admitted request through to a terminal outcome (buffered mode).
    async fn run_session(
        &self,
        req: &ExecRequest,
        trace_id: &str,
        chunk_tx: Option<mpsc::Sender<crate::demux::DemuxedChunk>>,
    ) -> OpResult<SessionOutcome> {
        let permit = self
            .sessions
            .acquire()
            .await
            .map_err(|err| self.server_error(&err, trace_id))?;
        let handle = self.sessions.register().await;

        let exec_handle = match self.start_exec(req).await {
            Ok(h) => h,
            Err(err) => {
                self.sessions.remove(&handle.id).await;
                drop(permit);
                let result = self.runtime_error(&err, trace_id);
                self.audit
                    .record(self.failed_entry(req, trace_id, &result.error));
                return Err(result);
            }
        };

        obs::emit_session_started(&handle.id, &req.container_id, chunk_tx.is_some());

        let session = ExecSession::new(
            handle.id.clone(),
            Arc::clone(&handle.cancel),
            self.cfg.session.clone(),
            self.demux_cfg(req),
        );
        let run = SessionRun {
            container_id: req.container_id.clone(),
            handle: exec_handle,
            stdin: req.stdin.clone(),
            timeout: self.effective_timeout(req),
            chunk_tx,
        };

        let outcome = session.run(Arc::clone(&self.runtime), run).await;
        self.sessions.remove(&handle.id).await;
        drop(permit);
        Ok(outcome)
    }

    fn effective_timeout(&self, req: &ExecRequest) -> Option<Duration> {
        let ms = req
            .timeout_ms
            .unwrap_or(self.cfg.session.default_timeout_ms);
        (ms > 0).then(|| Duration::from_millis(ms))
    }

    fn exec_entry(&self, req: &ExecRequest, trace_id: &str) -> AuditEntry {
        let mut entry = AuditEntry::new(trace_id, "exec", &req.container_id);
        entry.command = req.command.join(" ");
        entry.user = req.user.clone();
        entry
    }

    /// Entry for an infrastructure failure: reason set, but not a denial.
    fn failed_entry(&self, req: &ExecRequest, trace_id: &str, error: &str) -> AuditEntry {
        let mut entry = self.exec_entry(req, trace_id);
        entry.reason = Some(error.to_string());
        entry
    }

    fn audit_outcome(&self, req: &ExecRequest, trace_id: &str, outcome: &SessionOutcome) {
        self.audit
            .record(finished_entry(self.exec_entry(req, trace_id), outcome));
    }

    fn bad_request(&self, message: &str, trace_id: &str) -> Box<ErrorResult> {
        Box::new(ErrorResult::new(
            message,
            ErrorCode::BadRequest,
            trace_id,
        ))
    }

    fn runtime_error(&self, err: &GangwayError, trace_id: &str) -> Box<ErrorResult> {
        Box::new(ErrorResult::new(
            err.sanitized_message(),
            err.code(),
            trace_id,
        ))
    }

    fn server_error(&self, err: &GangwayError, trace_id: &str) -> Box<ErrorResult> {
        Box::new(ErrorResult::new(
            err.sanitized_message(),
            ErrorCode::ServerError,
            trace_id,
        ))
    }
}

fn new_trace_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn finished_entry(mut entry: AuditEntry, outcome: &SessionOutcome) -> AuditEntry {
    entry.exit_code = outcome.exit_code;
    entry.duration_ms = Some(outcome.duration_ms);
    entry.output_bytes = Some(outcome.output_bytes);
    if outcome.state == SessionState::Failed {
        entry.blocked = false;
        entry.reason = outcome.error.clone();
    }
    if let Some(reason) = outcome.cancel_reason {
        entry.reason = Some(reason.as_str().to_string());
    }
    entry
}
