//! Exec session lifecycle: state machine, cancellation, and the session
//! table with its concurrency gate and staleness sweep.
//!
//! A session moves `Created -> Running -> {Completed | Cancelled | Failed}`
//! and never transitions out of a terminal state. Cancellation is
//! cooperative: the read loop observes the signal at its next suspension
//! point, drains what it has, and runs the best-effort kill escalation.
//! A cancelled session resolves to a well-formed outcome, never an error.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::Instrument;
use tokio::sync::{mpsc, Mutex, Notify, Semaphore};
use tokio::task::JoinHandle;

use crate::buffer::CircularBuffer;
use crate::config::{DemuxConfig, SessionConfig};
use crate::demux::{demux_stream, DemuxedChunk};
use crate::error::{sanitize_message, GangwayError, Result};
use crate::metrics::METRICS;
use crate::obs;
use crate::runtime::{ContainerRuntime, ExecHandle, ExecSpec};

/// Grace period between SIGTERM and SIGKILL during cancellation.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Marker appended to both buffers when the output ceiling is hit.
const TRUNCATION_MARKER: &str = "\n[output truncated]";

/// Session lifecycle states. The last three are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Running,
    Completed,
    Cancelled,
    Failed,
}

/// Why a session was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    Timeout,
    ClientCancel,
}

impl CancelReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CancelReason::Timeout => "timeout",
            CancelReason::ClientCancel => "client_cancel",
        }
    }
}

/// Idempotent one-shot cancellation signal shared between a session's read
/// loop and the paths that may cancel it (timeout, sweep, shutdown).
#[derive(Debug, Default)]
pub struct CancelSignal {
    reason: StdMutex<Option<CancelReason>>,
    notify: Notify,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<CancelReason>> {
        self.reason.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Signal cancellation. Returns `false` when already cancelled (no-op).
    pub fn cancel(&self, reason: CancelReason) -> bool {
        let mut guard = self.lock();
        if guard.is_some() {
            return false;
        }
        *guard = Some(reason);
        drop(guard);
        self.notify.notify_waiters();
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.lock().is_some()
    }

    pub fn reason(&self) -> Option<CancelReason> {
        *self.lock()
    }

    /// Resolves once cancellation is signalled (immediately if it already
    /// was).
    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Shared view of a live session, held by the session table.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub id: String,
    pub started_at: Instant,
    pub cancel: Arc<CancelSignal>,
}

/// Everything a finished session reports, whatever its terminal state.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub session_id: String,
    pub state: SessionState,
    pub exit_code: Option<i64>,
    /// Clamped to the configured ceiling in buffered mode.
    pub output_bytes: u64,
    pub duration_ms: u64,
    pub truncated: bool,
    pub stdout: String,
    pub stderr: String,
    pub cancel_reason: Option<CancelReason>,
    /// Sanitized error message when the state is `Failed`.
    pub error: Option<String>,
}

/// Inputs for one session run.
pub struct SessionRun {
    pub container_id: String,
    pub handle: Box<dyn ExecHandle>,
    pub stdin: Option<String>,
    pub timeout: Option<Duration>,
    /// When set, decoded chunks are forwarded as they arrive and the output
    /// ceiling is not applied.
    pub chunk_tx: Option<mpsc::Sender<DemuxedChunk>>,
}

/// One execution's lifecycle, owned exclusively by its run loop.
pub struct ExecSession {
    id: String,
    state: SessionState,
    started_at: Instant,
    output_bytes: u64,
    exit_code: Option<i64>,
    stdout: CircularBuffer,
    stderr: CircularBuffer,
    cancel: Arc<CancelSignal>,
    /// Pending timers and auxiliary tasks, aborted together on teardown.
    tasks: Vec<JoinHandle<()>>,
    session_cfg: SessionConfig,
    demux_cfg: DemuxConfig,
}

impl ExecSession {
    pub fn new(
        id: String,
        cancel: Arc<CancelSignal>,
        session_cfg: SessionConfig,
        demux_cfg: DemuxConfig,
    ) -> Self {
        Self {
            id,
            state: SessionState::Created,
            started_at: Instant::now(),
            output_bytes: 0,
            exit_code: None,
            stdout: CircularBuffer::new(session_cfg.buffer_max_items, session_cfg.buffer_max_bytes),
            stderr: CircularBuffer::new(session_cfg.buffer_max_items, session_cfg.buffer_max_bytes),
            cancel,
            tasks: Vec::new(),
            session_cfg,
            demux_cfg,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Exit code is recorded exactly once; later writes are ignored.
    fn record_exit_code(&mut self, code: Option<i64>) {
        if self.exit_code.is_none() {
            self.exit_code = code;
        }
    }

    /// Drive the session to a terminal state. Never returns an error for
    /// cancellation — a cancelled run is a well-formed outcome.
    pub async fn run(
        mut self,
        runtime: Arc<dyn ContainerRuntime>,
        run: SessionRun,
    ) -> SessionOutcome {
        let span = obs::session_span(&self.id);
        METRICS.inc_sessions_started();

        match self.run_inner(runtime, run).instrument(span).await {
            Ok(()) => {}
            Err(err) => {
                // Cancellation observed mid-setup still resolves as
                // cancelled, not failed.
                if !self.cancel.is_cancelled() {
                    self.state = SessionState::Failed;
                    let sanitized = sanitize_message(&err.to_string());
                    obs::emit_session_failed(&self.id, &sanitized);
                    return self.into_outcome(Some(sanitized));
                }
            }
        }

        if self.cancel.is_cancelled() {
            self.state = SessionState::Cancelled;
        }
        self.into_outcome(None)
    }

    async fn run_inner(
        &mut self,
        runtime: Arc<dyn ContainerRuntime>,
        run: SessionRun,
    ) -> Result<()> {
        self.state = SessionState::Running;

        let stream = run.handle.start().await?;

        if let Some(stdin) = &run.stdin {
            run.handle.write_stdin(stdin.as_bytes()).await?;
        }
        run.handle.close_stdin().await?;

        if let Some(timeout) = run.timeout {
            self.arm_timeout(timeout);
        }

        let streaming = run.chunk_tx.is_some();
        let demux_cfg = self.demux_cfg.clone();
        let mut chunks = Box::pin(demux_stream(stream, &demux_cfg));
        let mut stream_error: Option<GangwayError> = None;
        let cancel = Arc::clone(&self.cancel);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = chunks.next() => match next {
                    Some(Ok(chunk)) => {
                        self.output_bytes += chunk.data.len() as u64;
                        METRICS.add_bytes_streamed(chunk.data.len() as u64);
                        match chunk.channel {
                            crate::demux::Channel::Stdout => self.stdout.push(chunk.data.clone()),
                            crate::demux::Channel::Stderr => self.stderr.push(chunk.data.clone()),
                        }
                        if let Some(tx) = &run.chunk_tx {
                            // A gone receiver turns streaming into discard.
                            let _ = tx.send(chunk).await;
                        }
                        if !streaming
                            && self.output_bytes > self.session_cfg.max_output_bytes as u64
                        {
                            self.stdout.push(TRUNCATION_MARKER);
                            self.stderr.push(TRUNCATION_MARKER);
                            break;
                        }
                    }
                    Some(Err(err)) => {
                        stream_error = Some(err);
                        break;
                    }
                    None => break,
                },
            }
        }

        if self.cancel.is_cancelled() {
            self.terminate_process(&runtime, &run.container_id, run.handle.as_ref())
                .await;
            return Ok(());
        }

        if let Some(err) = stream_error {
            return Err(err);
        }

        // Drained to end of input (or truncated): fetch the exit code once.
        match run.handle.inspect().await {
            Ok(status) => self.record_exit_code(status.exit_code),
            Err(err) => {
                tracing::debug!(event = "session.exit_code_unavailable", error = %err);
                self.record_exit_code(None);
            }
        }
        self.state = SessionState::Completed;
        Ok(())
    }

    fn arm_timeout(&mut self, timeout: Duration) {
        let cancel = Arc::clone(&self.cancel);
        self.tasks.push(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            cancel.cancel(CancelReason::Timeout);
        }));
    }

    /// Best-effort process termination: resize nudge, in-container SIGTERM,
    /// grace period, SIGKILL. Failures are logged, never raised.
    async fn terminate_process(
        &self,
        runtime: &Arc<dyn ContainerRuntime>,
        container_id: &str,
        handle: &dyn ExecHandle,
    ) {
        if let Err(err) = handle.resize(0, 0).await {
            tracing::debug!(event = "session.kill_nudge_failed", error = %err);
        }

        let pid = match handle.inspect().await {
            Ok(status) if status.running => status.pid,
            Ok(_) => return, // already gone
            Err(err) => {
                tracing::debug!(event = "session.kill_inspect_failed", error = %err);
                return;
            }
        };
        let Some(pid) = pid else { return };

        self.kill_in_container(runtime, container_id, pid, "-TERM")
            .await;
        tokio::time::sleep(KILL_GRACE).await;

        match handle.inspect().await {
            Ok(status) if status.running => {
                self.kill_in_container(runtime, container_id, pid, "-KILL")
                    .await;
            }
            Ok(_) => {}
            Err(err) => {
                tracing::debug!(event = "session.kill_recheck_failed", error = %err);
            }
        }
    }

    async fn kill_in_container(
        &self,
        runtime: &Arc<dyn ContainerRuntime>,
        container_id: &str,
        pid: i64,
        signal: &str,
    ) {
        let spec = ExecSpec {
            cmd: vec!["kill".to_string(), signal.to_string(), pid.to_string()],
            ..ExecSpec::default()
        };
        match runtime.exec(container_id, spec).await {
            Ok(kill_handle) => {
                if let Err(err) = kill_handle.start().await {
                    tracing::debug!(event = "session.kill_exec_failed", signal = %signal, error = %err);
                }
            }
            Err(err) => {
                tracing::debug!(event = "session.kill_exec_failed", signal = %signal, error = %err);
            }
        }
    }

    fn into_outcome(mut self, error: Option<String>) -> SessionOutcome {
        // Teardown: every pending timer goes at once.
        for task in self.tasks.drain(..) {
            task.abort();
        }

        let duration_ms = self.started_at.elapsed().as_millis() as u64;
        let truncated = self.output_bytes > self.session_cfg.max_output_bytes as u64;
        let reported_bytes = self
            .output_bytes
            .min(self.session_cfg.max_output_bytes as u64);

        match self.state {
            SessionState::Completed => {
                METRICS.inc_sessions_completed();
                obs::emit_session_completed(&self.id, self.exit_code, reported_bytes, duration_ms);
            }
            SessionState::Cancelled => {
                METRICS.inc_sessions_cancelled();
                let reason = self
                    .cancel
                    .reason()
                    .unwrap_or(CancelReason::ClientCancel)
                    .as_str();
                obs::emit_session_cancelled(&self.id, reason, duration_ms);
            }
            SessionState::Failed => METRICS.inc_sessions_failed(),
            SessionState::Created | SessionState::Running => {}
        }

        SessionOutcome {
            session_id: self.id,
            state: self.state,
            exit_code: self.exit_code,
            output_bytes: reported_bytes,
            duration_ms,
            truncated,
            stdout: self.stdout.contents(),
            stderr: self.stderr.contents(),
            cancel_reason: self.cancel.reason(),
            error,
        }
    }
}

/// Permit for one concurrency slot; dropping it frees the slot.
pub struct SessionPermit {
    _permit: tokio::sync::OwnedSemaphorePermit,
}

/// Allocates session IDs, gates concurrency, tracks live sessions, and
/// reaps stale ones.
pub struct SessionManager {
    cfg: SessionConfig,
    gate: Arc<Semaphore>,
    table: Mutex<HashMap<String, SessionHandle>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl SessionManager {
    pub fn new(cfg: SessionConfig) -> Arc<Self> {
        Arc::new(Self {
            gate: Arc::new(Semaphore::new(cfg.max_concurrent.max(1))),
            table: Mutex::new(HashMap::new()),
            sweeper: Mutex::new(None),
            cfg,
        })
    }

    /// Wait FIFO for a concurrency slot.
    pub async fn acquire(&self) -> Result<SessionPermit> {
        let permit = Arc::clone(&self.gate)
            .acquire_owned()
            .await
            .map_err(|_| GangwayError::runtime("session manager is shut down"))?;
        Ok(SessionPermit { _permit: permit })
    }

    /// Create and register a new live session entry.
    pub async fn register(&self) -> SessionHandle {
        let handle = SessionHandle {
            id: format!("exec-{}", uuid::Uuid::new_v4()),
            started_at: Instant::now(),
            cancel: Arc::new(CancelSignal::new()),
        };
        self.table
            .lock()
            .await
            .insert(handle.id.clone(), handle.clone());
        handle
    }

    /// Remove a session from the table. Idempotent.
    pub async fn remove(&self, session_id: &str) {
        self.table.lock().await.remove(session_id);
    }

    pub async fn live_count(&self) -> usize {
        self.table.lock().await.len()
    }

    /// Signal cancellation on one live session. Returns `false` when the
    /// session is unknown or already cancelled.
    pub async fn cancel_session(&self, session_id: &str) -> bool {
        let handle = self.table.lock().await.get(session_id).cloned();
        match handle {
            Some(h) => h.cancel.cancel(CancelReason::ClientCancel),
            None => false,
        }
    }

    /// Force-cancel every session older than the staleness threshold.
    /// Returns how many were reaped.
    pub async fn sweep_once(&self) -> usize {
        let stale_after = Duration::from_secs(self.cfg.stale_after_secs);
        let stale: Vec<SessionHandle> = {
            let table = self.table.lock().await;
            table
                .values()
                .filter(|h| h.started_at.elapsed() >= stale_after)
                .cloned()
                .collect()
        };

        let mut reaped = 0;
        for handle in stale {
            if handle.cancel.cancel(CancelReason::ClientCancel) {
                obs::emit_session_reaped(&handle.id, handle.started_at.elapsed().as_secs());
                reaped += 1;
            }
        }
        reaped
    }

    /// Start the background staleness sweep. Idempotent.
    pub async fn start_sweeper(self: &Arc<Self>) {
        let mut guard = self.sweeper.lock().await;
        if guard.is_some() {
            return;
        }
        let manager = Arc::clone(self);
        let interval = Duration::from_secs(self.cfg.sweep_interval_secs.max(1));
        *guard = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let reaped = manager.sweep_once().await;
                if reaped > 0 {
                    tracing::info!(event = "sweep.reaped", count = reaped);
                }
            }
        }));
    }

    /// Cancel every live session and wait (bounded) for them to retire.
    /// A single session failing to settle does not block the rest.
    pub async fn shutdown(&self) {
        if let Some(sweeper) = self.sweeper.lock().await.take() {
            sweeper.abort();
        }

        let handles: Vec<SessionHandle> =
            self.table.lock().await.values().cloned().collect();
        for handle in &handles {
            handle.cancel.cancel(CancelReason::ClientCancel);
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        while self.live_count().await > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        self.gate.close();
        tracing::info!(event = "sessions.shutdown", cancelled = handles.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{FakeExec, FakeRuntime};
    use crate::runtime::ExecStatus;

    fn session(handle: &SessionHandle) -> ExecSession {
        ExecSession::new(
            handle.id.clone(),
            Arc::clone(&handle.cancel),
            SessionConfig::default(),
            DemuxConfig::default(),
        )
    }

    fn run_for(container: &str, exec: FakeExec) -> SessionRun {
        SessionRun {
            container_id: container.to_string(),
            handle: Box::new(exec),
            stdin: None,
            timeout: None,
            chunk_tx: None,
        }
    }

    #[test]
    fn test_cancel_signal_idempotent() {
        let signal = CancelSignal::new();
        assert!(!signal.is_cancelled());
        assert!(signal.cancel(CancelReason::Timeout));
        assert!(!signal.cancel(CancelReason::ClientCancel));
        assert_eq!(signal.reason(), Some(CancelReason::Timeout));
    }

    #[tokio::test]
    async fn test_cancelled_future_resolves_after_signal() {
        let signal = Arc::new(CancelSignal::new());
        let waiter = {
            let signal = Arc::clone(&signal);
            tokio::spawn(async move { signal.cancelled().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        signal.cancel(CancelReason::ClientCancel);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should resolve")
            .expect("join");
    }

    #[tokio::test]
    async fn test_cancelled_future_resolves_when_already_cancelled() {
        let signal = CancelSignal::new();
        signal.cancel(CancelReason::Timeout);
        tokio::time::timeout(Duration::from_millis(100), signal.cancelled())
            .await
            .expect("should resolve immediately");
    }

    #[tokio::test]
    async fn test_completed_session_reports_exit_code_and_output() {
        let runtime = Arc::new(FakeRuntime::new());
        let manager = SessionManager::new(SessionConfig::default());
        let handle = manager.register().await;

        let exec = FakeExec::new()
            .with_stdout(b"hello ")
            .with_stderr(b"warn")
            .with_status(ExecStatus {
                exit_code: Some(0),
                running: false,
                pid: None,
            });

        let outcome = session(&handle)
            .run(runtime, run_for("c1", exec))
            .await;

        assert_eq!(outcome.state, SessionState::Completed);
        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(outcome.stdout, "hello ");
        assert_eq!(outcome.stderr, "warn");
        assert_eq!(outcome.output_bytes, 10);
        assert!(!outcome.truncated);
        assert!(outcome.error.is_none());
    }

    #[tokio::test]
    async fn test_timeout_resolves_to_cancelled_outcome() {
        let runtime = Arc::new(FakeRuntime::new());
        let manager = SessionManager::new(SessionConfig::default());
        let handle = manager.register().await;

        // A stream that never ends keeps the loop at its suspension point.
        let exec = FakeExec::new().with_stdout(b"partial").hanging();

        let mut run = run_for("c1", exec);
        run.timeout = Some(Duration::from_millis(50));

        let started = Instant::now();
        let outcome = session(&handle).run(runtime, run).await;

        assert_eq!(outcome.state, SessionState::Cancelled);
        assert_eq!(outcome.cancel_reason, Some(CancelReason::Timeout));
        assert!(outcome.stdout.contains("partial"));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_external_cancel_reason_is_client_cancel() {
        let runtime = Arc::new(FakeRuntime::new());
        let manager = SessionManager::new(SessionConfig::default());
        let handle = manager.register().await;

        let exec = FakeExec::new().hanging();
        let cancel = Arc::clone(&handle.cancel);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel(CancelReason::ClientCancel);
        });

        let outcome = session(&handle).run(runtime, run_for("c1", exec)).await;
        assert_eq!(outcome.state, SessionState::Cancelled);
        assert_eq!(outcome.cancel_reason, Some(CancelReason::ClientCancel));
    }

    #[tokio::test]
    async fn test_buffered_output_ceiling_truncates() {
        let runtime = Arc::new(FakeRuntime::new());
        let cfg = SessionConfig {
            max_output_bytes: 64,
            ..SessionConfig::default()
        };
        let manager = SessionManager::new(cfg.clone());
        let handle = manager.register().await;

        let exec = FakeExec::new().with_stdout(&[b'x'; 500]);
        let outcome = ExecSession::new(
            handle.id.clone(),
            Arc::clone(&handle.cancel),
            cfg,
            DemuxConfig::default(),
        )
        .run(runtime, run_for("c1", exec))
        .await;

        assert!(outcome.truncated);
        assert!(outcome.output_bytes <= 64);
        assert!(outcome.stdout.contains("[output truncated]"));
    }

    #[tokio::test]
    async fn test_failed_start_yields_failed_outcome() {
        let runtime = Arc::new(FakeRuntime::new());
        let manager = SessionManager::new(SessionConfig::default());
        let handle = manager.register().await;

        let exec = FakeExec::new().failing_start("No such container: deadbeefdead");
        let outcome = session(&handle).run(runtime, run_for("c1", exec)).await;

        assert_eq!(outcome.state, SessionState::Failed);
        let error = outcome.error.expect("error message");
        // Sanitized: the 12-hex id must not leak.
        assert!(!error.contains("deadbeefdead"));
    }

    #[tokio::test]
    async fn test_streaming_forwards_chunks() {
        let runtime = Arc::new(FakeRuntime::new());
        let manager = SessionManager::new(SessionConfig::default());
        let handle = manager.register().await;

        let (tx, mut rx) = mpsc::channel(16);
        let exec = FakeExec::new().with_stdout(b"a").with_stderr(b"b");
        let mut run = run_for("c1", exec);
        run.chunk_tx = Some(tx);

        let outcome = session(&handle).run(runtime, run).await;
        assert_eq!(outcome.state, SessionState::Completed);

        let mut received = Vec::new();
        while let Some(chunk) = rx.recv().await {
            received.push(chunk.data);
        }
        assert_eq!(received, vec!["a", "b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_kill_escalation_runs_term_then_kill() {
        let runtime = Arc::new(FakeRuntime::new());
        let manager = SessionManager::new(SessionConfig::default());
        let handle = manager.register().await;

        // Process reports running with a pid, and stays running after TERM.
        let exec = FakeExec::new().hanging().with_status(ExecStatus {
            exit_code: None,
            running: true,
            pid: Some(1234),
        });

        handle.cancel.cancel(CancelReason::ClientCancel);
        let outcome = session(&handle)
            .run(Arc::clone(&runtime) as Arc<dyn ContainerRuntime>, run_for("c1", exec))
            .await;

        assert_eq!(outcome.state, SessionState::Cancelled);
        let kills = runtime.exec_specs().await;
        assert_eq!(kills.len(), 2);
        assert_eq!(kills[0].cmd, vec!["kill", "-TERM", "1234"]);
        assert_eq!(kills[1].cmd, vec!["kill", "-KILL", "1234"]);
    }

    #[tokio::test]
    async fn test_manager_concurrency_gate_queues_fifo() {
        let manager = SessionManager::new(SessionConfig {
            max_concurrent: 1,
            ..SessionConfig::default()
        });

        let first = manager.acquire().await.expect("first slot");
        let manager2 = Arc::clone(&manager);
        let waiter = tokio::spawn(async move { manager2.acquire().await.map(|_| ()) });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished(), "second acquire must queue");

        drop(first);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("queued acquire should resolve")
            .expect("join")
            .expect("acquire");
    }

    #[tokio::test]
    async fn test_register_remove_idempotent() {
        let manager = SessionManager::new(SessionConfig::default());
        let handle = manager.register().await;
        assert_eq!(manager.live_count().await, 1);
        manager.remove(&handle.id).await;
        manager.remove(&handle.id).await; // no-op
        assert_eq!(manager.live_count().await, 0);
    }

    #[tokio::test]
    async fn test_sweep_cancels_only_stale_sessions() {
        let manager = SessionManager::new(SessionConfig {
            stale_after_secs: 0, // everything is instantly stale
            ..SessionConfig::default()
        });
        let handle = manager.register().await;
        assert_eq!(manager.sweep_once().await, 1);
        assert!(handle.cancel.is_cancelled());

        // Already-cancelled sessions are not reaped twice.
        assert_eq!(manager.sweep_once().await, 0);
    }

    #[tokio::test]
    async fn test_fresh_sessions_survive_sweep() {
        let manager = SessionManager::new(SessionConfig::default());
        let handle = manager.register().await;
        assert_eq!(manager.sweep_once().await, 0);
        assert!(!handle.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_shutdown_cancels_all_live_sessions() {
        let manager = SessionManager::new(SessionConfig::default());
        let a = manager.register().await;
        let b = manager.register().await;

        // Simulate the run loops retiring their sessions on cancellation.
        for handle in [&a, &b] {
            let manager = Arc::clone(&manager);
            let handle = handle.clone();
            tokio::spawn(async move {
                handle.cancel.cancelled().await;
                manager.remove(&handle.id).await;
            });
        }

        manager.shutdown().await;
        assert!(a.cancel.is_cancelled());
        assert!(b.cancel.is_cancelled());
        assert_eq!(manager.live_count().await, 0);
        assert!(manager.acquire().await.is_err(), "gate closed after shutdown");
    }
}
