//! In-memory fakes for the runtime traits (testing only)
//!
//! Provides `FakeRuntime` and `FakeExec` that satisfy the trait contracts
//! with scripted output and failure injection, without a real daemon.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use futures::StreamExt;
use serde_json::{json, Value};

use crate::error::{GangwayError, Result};
use crate::runtime::{
    ByteStream, ContainerRuntime, ContainerSummary, ExecHandle, ExecSpec, ExecStatus, LogOpts,
};

/// Wrap a payload in the runtime's 8-byte multiplexing frame.
pub fn frame(channel: u8, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + data.len());
    out.push(channel);
    out.extend_from_slice(&[0, 0, 0]);
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    out.extend_from_slice(data);
    out
}

// ---------------------------------------------------------------------------
// FakeExec
// ---------------------------------------------------------------------------

/// Scripted exec handle. Chunks are emitted as one framed `Bytes` item each,
/// in the order they were added.
#[derive(Debug, Clone, Default)]
pub struct FakeExec {
    chunks: Vec<Bytes>,
    status: ExecStatus,
    hang_after: bool,
    start_error: Option<String>,
    stdin_writes: Arc<Mutex<Vec<Vec<u8>>>>,
    stdin_closed: Arc<Mutex<bool>>,
    resizes: Arc<Mutex<Vec<(u16, u16)>>>,
}

impl FakeExec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stdout(mut self, data: &[u8]) -> Self {
        self.chunks.push(Bytes::from(frame(1, data)));
        self
    }

    pub fn with_stderr(mut self, data: &[u8]) -> Self {
        self.chunks.push(Bytes::from(frame(2, data)));
        self
    }

    /// Append a raw (unframed) item, for exercising TTY-mode streams.
    pub fn with_raw(mut self, data: &[u8]) -> Self {
        self.chunks.push(Bytes::copy_from_slice(data));
        self
    }

    pub fn with_status(mut self, status: ExecStatus) -> Self {
        self.status = status;
        self
    }

    /// After the scripted chunks, the stream never ends.
    pub fn hanging(mut self) -> Self {
        self.hang_after = true;
        self
    }

    /// `start` fails with this runtime message.
    pub fn failing_start(mut self, message: &str) -> Self {
        self.start_error = Some(message.to_string());
        self
    }

    pub fn stdin_writes(&self) -> Vec<Vec<u8>> {
        self.stdin_writes.lock().unwrap().clone()
    }

    pub fn stdin_was_closed(&self) -> bool {
        *self.stdin_closed.lock().unwrap()
    }

    pub fn resizes(&self) -> Vec<(u16, u16)> {
        self.resizes.lock().unwrap().clone()
    }
}

#[async_trait]
impl ExecHandle for FakeExec {
    async fn start(&self) -> Result<ByteStream> {
        if let Some(message) = &self.start_error {
            return Err(GangwayError::runtime(message.clone()));
        }
        let items: Vec<std::io::Result<Bytes>> =
            self.chunks.iter().cloned().map(Ok).collect();
        let scripted = stream::iter(items);
        let out: ByteStream = if self.hang_after {
            Box::pin(scripted.chain(stream::pending()))
        } else {
            Box::pin(scripted)
        };
        Ok(out)
    }

    async fn write_stdin(&self, data: &[u8]) -> Result<()> {
        self.stdin_writes.lock().unwrap().push(data.to_vec());
        Ok(())
    }

    async fn close_stdin(&self) -> Result<()> {
        *self.stdin_closed.lock().unwrap() = true;
        Ok(())
    }

    async fn inspect(&self) -> Result<ExecStatus> {
        Ok(self.status.clone())
    }

    async fn resize(&self, width: u16, height: u16) -> Result<()> {
        self.resizes.lock().unwrap().push((width, height));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FakeRuntime
// ---------------------------------------------------------------------------

/// Scripted container runtime. `exec` hands out queued handles (a fresh
/// default handle once the queue is empty) and records every spec it saw.
#[derive(Debug, Default)]
pub struct FakeRuntime {
    specs: Mutex<Vec<ExecSpec>>,
    exec_queue: Mutex<VecDeque<FakeExec>>,
    log_bytes: Mutex<Option<Vec<u8>>>,
    containers: Mutex<Vec<ContainerSummary>>,
    fail_message: Mutex<Option<String>>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the handle the next `exec` call returns.
    pub fn push_exec(&self, exec: FakeExec) {
        self.exec_queue.lock().unwrap().push_back(exec);
    }

    /// Set the raw byte payload `logs` streams back.
    pub fn set_logs(&self, data: &[u8]) {
        *self.log_bytes.lock().unwrap() = Some(data.to_vec());
    }

    pub fn set_containers(&self, containers: Vec<ContainerSummary>) {
        *self.containers.lock().unwrap() = containers;
    }

    /// Make every runtime call fail with this message until cleared.
    pub fn set_failure(&self, message: &str) {
        *self.fail_message.lock().unwrap() = Some(message.to_string());
    }

    pub fn clear_failure(&self) {
        *self.fail_message.lock().unwrap() = None;
    }

    /// Every spec passed to `exec`, in call order.
    pub async fn exec_specs(&self) -> Vec<ExecSpec> {
        self.specs.lock().unwrap().clone()
    }

    fn check_failure(&self) -> Result<()> {
        match self.fail_message.lock().unwrap().as_ref() {
            Some(message) => Err(GangwayError::runtime(message.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn exec(&self, _container_id: &str, spec: ExecSpec) -> Result<Box<dyn ExecHandle>> {
        self.check_failure()?;
        self.specs.lock().unwrap().push(spec);
        let handle = self
            .exec_queue
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default();
        Ok(Box::new(handle))
    }

    async fn logs(&self, _container_id: &str, _opts: LogOpts) -> Result<ByteStream> {
        self.check_failure()?;
        let data = self.log_bytes.lock().unwrap().clone().unwrap_or_default();
        let items: Vec<std::io::Result<Bytes>> = vec![Ok(Bytes::from(data))];
        Ok(Box::pin(stream::iter(items)))
    }

    async fn list_containers(&self, _all: bool) -> Result<Vec<ContainerSummary>> {
        self.check_failure()?;
        Ok(self.containers.lock().unwrap().clone())
    }

    async fn inspect_container(&self, id: &str) -> Result<Value> {
        self.check_failure()?;
        Ok(json!({ "Id": id, "State": { "Running": true } }))
    }

    async fn inspect_image(&self, id: &str) -> Result<Value> {
        self.check_failure()?;
        Ok(json!({ "Id": id }))
    }

    async fn inspect_network(&self, id: &str) -> Result<Value> {
        self.check_failure()?;
        Ok(json!({ "Id": id }))
    }

    async fn inspect_volume(&self, id: &str) -> Result<Value> {
        self.check_failure()?;
        Ok(json!({ "Name": id }))
    }

    async fn info(&self) -> Result<Value> {
        self.check_failure()?;
        Ok(json!({ "Containers": 1, "ServerVersion": "fake" }))
    }

    async fn version(&self) -> Result<Value> {
        self.check_failure()?;
        Ok(json!({ "Version": "fake", "ApiVersion": "1.43" }))
    }
}
