//! Capability interface over the container runtime.
//!
//! The core never talks to a concrete runtime client; it depends on these
//! traits only. An adapter crate implements them over the real API, and
//! [`crate::fakes`] provides scripted in-memory implementations for tests.
//! Runtime failures arrive as opaque messages the core classifies through
//! [`crate::error::classify_runtime_error`].

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Raw bytes from the runtime, possibly multiplexed per [`crate::demux`].
pub type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// What to run and how, passed to [`ContainerRuntime::exec`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExecSpec {
    /// Command argument vector.
    pub cmd: Vec<String>,
    /// User to run as; `None` means the container default.
    pub user: Option<String>,
    /// Working directory override.
    pub workdir: Option<String>,
    /// Environment entries, `KEY=VALUE`.
    pub env: Vec<String>,
    /// Allocate a TTY (output arrives unframed).
    pub tty: bool,
    /// Attach stdin for writing.
    pub attach_stdin: bool,
}

/// Snapshot of a running or finished exec.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExecStatus {
    /// Present once the process has exited.
    pub exit_code: Option<i64>,
    pub running: bool,
    /// Process ID inside the container, when the runtime reports one.
    pub pid: Option<i64>,
}

/// Options for a log fetch.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LogOpts {
    /// Stream new lines as they appear instead of returning and closing.
    pub follow: bool,
    /// Only the last N lines.
    pub tail: Option<u64>,
    /// Only lines after this instant.
    pub since: Option<DateTime<Utc>>,
    /// Ask the runtime to prefix each line with an RFC3339 timestamp.
    pub timestamps: bool,
}

/// One row of [`ContainerRuntime::list_containers`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ContainerSummary {
    pub id: String,
    pub names: Vec<String>,
    pub image: String,
    pub state: String,
}

/// Handle to one created exec instance.
#[async_trait]
pub trait ExecHandle: Send + Sync {
    /// Attach and start; returns the duplex output stream.
    async fn start(&self) -> Result<ByteStream>;

    /// Write a stdin payload. Only valid when the spec attached stdin.
    async fn write_stdin(&self, data: &[u8]) -> Result<()>;

    /// Close the stdin side so the process sees EOF.
    async fn close_stdin(&self) -> Result<()>;

    /// Fetch exit code / running / pid.
    async fn inspect(&self) -> Result<ExecStatus>;

    /// Resize the exec's terminal. A zero-size resize doubles as an
    /// interrupt nudge during cancellation.
    async fn resize(&self, width: u16, height: u16) -> Result<()>;
}

/// The opaque container runtime: `exec`, `inspect`, `logs`, listings.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create an exec instance in a running container.
    async fn exec(&self, container_id: &str, spec: ExecSpec) -> Result<Box<dyn ExecHandle>>;

    /// Raw log byte stream for a container.
    async fn logs(&self, container_id: &str, opts: LogOpts) -> Result<ByteStream>;

    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>>;

    async fn inspect_container(&self, id: &str) -> Result<serde_json::Value>;
    async fn inspect_image(&self, id: &str) -> Result<serde_json::Value>;
    async fn inspect_network(&self, id: &str) -> Result<serde_json::Value>;
    async fn inspect_volume(&self, id: &str) -> Result<serde_json::Value>;

    async fn info(&self) -> Result<serde_json::Value>;
    async fn version(&self) -> Result<serde_json::Value>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_spec_serde_roundtrip() {
        let spec = ExecSpec {
            cmd: vec!["echo".into(), "hi".into()],
            user: Some("nobody".into()),
            workdir: Some("/tmp".into()),
            env: vec!["FOO=bar".into()],
            tty: false,
            attach_stdin: true,
        };
        let json = serde_json::to_string(&spec).expect("serialize");
        let back: ExecSpec = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(spec, back);
    }

    #[test]
    fn test_exec_status_default_is_running_false() {
        let status = ExecStatus::default();
        assert!(status.exit_code.is_none());
        assert!(!status.running);
        assert!(status.pid.is_none());
    }
}
