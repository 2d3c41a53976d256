//! Integration tests for the exec pipeline over the in-memory runtime.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use gangway_core::fakes::{FakeExec, FakeRuntime};
use gangway_core::{
    Config, ContainerExecutor, ErrorCode, ExecRequest, ExecStatus, PolicyMode, SecurityConfig,
    SessionConfig, StreamEvent,
};

fn open_config() -> Config {
    Config {
        security: SecurityConfig {
            policy_mode: PolicyMode::None,
            ..SecurityConfig::default()
        },
        ..Config::default()
    }
}

fn request(cmd: &[&str]) -> ExecRequest {
    ExecRequest {
        container_id: "web-1".into(),
        command: cmd.iter().map(|s| s.to_string()).collect(),
        user: Some("appuser".into()),
        identifier: "client-a".into(),
        ..ExecRequest::default()
    }
}

fn exited(code: i64) -> ExecStatus {
    ExecStatus {
        exit_code: Some(code),
        running: false,
        pid: None,
    }
}

/// Test: a buffered exec returns stdout, stderr, and the exit code, and
/// leaves no live session behind.
#[tokio::test]
async fn test_buffered_exec_end_to_end() {
    let runtime = Arc::new(FakeRuntime::new());
    runtime.push_exec(
        FakeExec::new()
            .with_stdout(b"total 0\n")
            .with_stderr(b"ls: .hidden: warning\n")
            .with_status(exited(0)),
    );
    let executor = ContainerExecutor::new(runtime.clone(), open_config());

    let result = executor
        .exec(request(&["ls", "-la"]))
        .await
        .expect("exec should succeed");

    assert_eq!(result.stdout, "total 0\n");
    assert_eq!(result.stderr, "ls: .hidden: warning\n");
    assert_eq!(result.exit_code, Some(0));
    assert_eq!(result.output_bytes, 29);
    assert!(!result.truncated);
    assert!(result.session_id.starts_with("exec-"));
    assert_eq!(executor.live_sessions().await, 0);

    let specs = runtime.exec_specs().await;
    assert_eq!(specs.len(), 1);
    assert_eq!(specs[0].cmd, vec!["ls", "-la"]);
    assert!(!specs[0].attach_stdin);
}

/// Test: stdin payload is written to the handle and stdin is closed.
#[tokio::test]
async fn test_stdin_written_and_closed() {
    let runtime = Arc::new(FakeRuntime::new());
    let handle = FakeExec::new().with_stdout(b"3\n").with_status(exited(0));
    let probe = handle.clone();
    runtime.push_exec(handle);
    let executor = ContainerExecutor::new(runtime, open_config());

    let mut req = request(&["wc", "-l"]);
    req.stdin = Some("a\nb\nc\n".to_string());
    executor.exec(req).await.expect("exec");

    assert_eq!(probe.stdin_writes(), vec![b"a\nb\nc\n".to_vec()]);
    assert!(probe.stdin_was_closed());
}

/// Test: a hanging command is cancelled at its timeout and reports the
/// partial output captured so far.
#[tokio::test]
async fn test_timeout_cancels_with_partial_output() {
    let runtime = Arc::new(FakeRuntime::new());
    runtime.push_exec(FakeExec::new().with_stdout(b"tick\n").hanging());
    let executor = ContainerExecutor::new(runtime, open_config());

    let mut req = request(&["tail", "-f", "/var/log/app.log"]);
    req.timeout_ms = Some(80);

    let started = std::time::Instant::now();
    let err = executor.exec(req).await.expect_err("should time out");

    assert_eq!(err.code, ErrorCode::Timeout);
    assert!(err.error.contains("timeout"), "{}", err.error);
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(executor.live_sessions().await, 0);
}

/// Test: output beyond the configured ceiling truncates the buffered result
/// and clamps the reported byte count.
#[tokio::test]
async fn test_output_ceiling_truncates_buffered_result() {
    let runtime = Arc::new(FakeRuntime::new());
    runtime.push_exec(
        FakeExec::new()
            .with_stdout(&[b'y'; 4096])
            .with_status(exited(0)),
    );
    let cfg = Config {
        session: SessionConfig {
            max_output_bytes: 256,
            ..SessionConfig::default()
        },
        ..open_config()
    };
    let executor = ContainerExecutor::new(runtime, cfg);

    let result = executor
        .exec(request(&["yes"]))
        .await
        .expect("truncation is not an error");
    assert!(result.truncated);
    assert!(result.output_bytes <= 256);
    assert!(result.stdout.contains("[output truncated]"));
}

/// Test: streaming exec delivers chunks in order and ends with exactly one
/// terminal event.
#[tokio::test]
async fn test_streaming_exec_event_sequence() {
    let runtime = Arc::new(FakeRuntime::new());
    runtime.push_exec(
        FakeExec::new()
            .with_stdout(b"step 1\n")
            .with_stdout(b"step 2\n")
            .with_stderr(b"note\n")
            .with_status(exited(0)),
    );
    let executor = ContainerExecutor::new(runtime, open_config());

    let (tx, mut rx) = mpsc::channel(32);
    executor
        .exec_streaming(request(&["deploy.sh"]), tx)
        .await
        .expect("admitted");

    let mut chunks = Vec::new();
    let mut terminals = Vec::new();
    while let Some(event) = rx.recv().await {
        match event {
            StreamEvent::ExecChunk { data, .. } => chunks.push(data),
            other => terminals.push(other),
        }
    }

    assert_eq!(chunks, vec!["step 1\n", "step 2\n", "note\n"]);
    assert_eq!(terminals.len(), 1, "exactly one terminal event");
    assert!(matches!(
        terminals[0],
        StreamEvent::ExecComplete { exit_code: Some(0), .. }
    ));
}

/// Test: client cancellation of a streaming session emits `ExecCancelled`
/// with the client_cancel reason.
#[tokio::test]
async fn test_client_cancel_mid_stream() {
    let runtime = Arc::new(FakeRuntime::new());
    runtime.push_exec(FakeExec::new().with_stdout(b"streaming...\n").hanging());
    let executor = ContainerExecutor::new(runtime, open_config());

    let (tx, mut rx) = mpsc::channel(32);
    let session_id = executor
        .exec_streaming(request(&["tail", "-f", "x"]), tx)
        .await
        .expect("admitted");

    // Wait for evidence the session is live before cancelling.
    assert!(matches!(
        rx.recv().await,
        Some(StreamEvent::ExecChunk { .. })
    ));
    assert!(executor.cancel(&session_id).await);
    // Second cancel is a no-op.
    assert!(!executor.cancel(&session_id).await);

    let mut last = None;
    while let Some(event) = rx.recv().await {
        last = Some(event);
    }
    match last {
        Some(StreamEvent::ExecCancelled { reason, .. }) => assert_eq!(reason, "client_cancel"),
        other => panic!("expected ExecCancelled, got {other:?}"),
    }
}

/// Test: the concurrency gate queues the excess request FIFO and admits it
/// when a slot frees up.
#[tokio::test]
async fn test_concurrency_gate_fifo() {
    let runtime = Arc::new(FakeRuntime::new());
    runtime.push_exec(FakeExec::new().hanging());
    runtime.push_exec(FakeExec::new().with_status(exited(0)));
    let cfg = Config {
        session: SessionConfig {
            max_concurrent: 1,
            ..SessionConfig::default()
        },
        ..open_config()
    };
    let executor = Arc::new(ContainerExecutor::new(runtime, cfg));

    let (tx, mut rx) = mpsc::channel(8);
    let first = executor
        .exec_streaming(request(&["sleep", "999"]), tx)
        .await
        .expect("first admitted");

    let queued_exec = Arc::clone(&executor);
    let queued = tokio::spawn(async move { queued_exec.exec(request(&["true"])).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!queued.is_finished(), "second request must wait");

    assert!(executor.cancel(&first).await);
    while rx.recv().await.is_some() {}

    let result = queued
        .await
        .expect("join")
        .expect("queued exec runs after the slot frees");
    assert_eq!(result.exit_code, Some(0));
}

/// Test: a runtime failure surfaces as a classified, sanitized error result.
#[tokio::test]
async fn test_runtime_failure_classified_and_sanitized() {
    let runtime = Arc::new(FakeRuntime::new());
    runtime.set_failure("Get \"http://10.0.0.7:2375/exec\": connection refused");
    let executor = ContainerExecutor::new(runtime, open_config());

    let err = executor
        .exec(request(&["ls"]))
        .await
        .expect_err("runtime down");
    assert_eq!(err.code, ErrorCode::ConnectionLost);
    assert!(!err.error.contains("10.0.0.7"), "{}", err.error);
    assert!(!err.error.contains("2375"), "{}", err.error);
}

/// Test: repeated query failures open the breaker; once open, calls are
/// rejected without touching the runtime.
#[tokio::test]
async fn test_breaker_opens_on_repeated_query_failures() {
    let runtime = Arc::new(FakeRuntime::new());
    runtime.set_failure("HTTP 502 Bad Gateway");
    let cfg = Config {
        breaker: gangway_core::BreakerConfig {
            failure_threshold: 3,
            ..gangway_core::BreakerConfig::default()
        },
        ..open_config()
    };
    let executor = ContainerExecutor::new(runtime.clone(), cfg);

    for _ in 0..3 {
        let err = executor
            .runtime_version("client-a")
            .await
            .expect_err("backend failing");
        assert_eq!(err.code, ErrorCode::ServerError);
    }

    runtime.clear_failure();
    let err = executor
        .runtime_version("client-a")
        .await
        .expect_err("breaker still open");
    assert_eq!(err.code, ErrorCode::CircuitOpen);
}
