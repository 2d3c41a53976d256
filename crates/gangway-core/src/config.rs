//! Gangway configuration.
//!
//! One [`Config`] value is constructed at process start (the daemon reads
//! the environment exactly once) and injected into every component
//! constructor. No component reads ambient process state directly.

use serde::{Deserialize, Serialize};

/// Top-level configuration injected into every component.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub demux: DemuxConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub audit: AuditConfig,
}

/// How command patterns are interpreted by the security manager.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PolicyMode {
    /// Default-deny; a pattern match allows.
    Allowlist,
    /// Default-allow; a pattern match denies.
    #[default]
    Denylist,
    /// Skip pattern matching (injection and homoglyph screens still run).
    None,
}

/// Security policy knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SecurityConfig {
    /// Permit execution as root (user absent, "root", or "0").
    pub allow_root: bool,

    /// Pattern interpretation mode.
    pub policy_mode: PolicyMode,

    /// Allow- or deny-list entries, tried as case-insensitive regexes with a
    /// substring fallback when an entry is not a valid expression.
    pub command_patterns: Vec<String>,

    /// Substrings denied anywhere in the joined command (e.g. "--privileged").
    pub denied_flags: Vec<String>,

    /// Paths denied unless the leading command is in the read-only allow-set.
    pub denied_paths: Vec<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            allow_root: false,
            policy_mode: PolicyMode::Denylist,
            command_patterns: Vec::new(),
            denied_flags: vec!["--privileged".to_string()],
            denied_paths: vec!["/proc".to_string(), "/sys".to_string()],
        }
    }
}

/// Rate limiting, keyed by (operation, identifier).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RateLimitConfig {
    /// Master switch; disabled means every check passes without metering.
    pub enabled: bool,

    /// Sliding window length in milliseconds.
    pub window_ms: u64,

    /// Per-window ceiling for exec requests.
    pub exec_limit: u32,

    /// Per-window ceiling for log requests.
    pub logs_limit: u32,

    /// Per-window ceiling for inspect/info/list requests.
    pub inspect_limit: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_ms: 60_000,
            exec_limit: 30,
            logs_limit: 60,
            inspect_limit: 120,
        }
    }
}

impl RateLimitConfig {
    /// Ceiling for a named operation; unknown operations share the exec limit.
    pub fn limit_for(&self, operation: &str) -> u32 {
        match operation {
            "logs" => self.logs_limit,
            "inspect" | "info" | "version" | "list_containers" => self.inspect_limit,
            _ => self.exec_limit,
        }
    }
}

/// Session lifecycle and output bounds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    /// Maximum concurrently running sessions; extra requests queue FIFO.
    pub max_concurrent: usize,

    /// Sessions older than this are force-cancelled by the sweep (seconds).
    pub stale_after_secs: u64,

    /// Staleness sweep interval (seconds).
    pub sweep_interval_secs: u64,

    /// Hard ceiling on buffered output per session (bytes).
    pub max_output_bytes: usize,

    /// Tail-buffer caps for each of stdout/stderr.
    pub buffer_max_items: usize,
    pub buffer_max_bytes: usize,

    /// Default timeout applied when a request carries none (0 = unlimited).
    pub default_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 8,
            stale_after_secs: 300,
            sweep_interval_secs: 60,
            max_output_bytes: 1_048_576,
            buffer_max_items: 1_000,
            buffer_max_bytes: 1_048_576,
            default_timeout_ms: 0,
        }
    }
}

/// Stream demultiplexer bounds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DemuxConfig {
    /// Emitted chunks never exceed this many bytes.
    pub chunk_size: usize,

    /// Accumulation ceiling before the stream is failed as corrupt.
    pub max_buffer_bytes: usize,

    /// A declared frame length above this fails header validation.
    pub max_frame_bytes: usize,
}

impl Default for DemuxConfig {
    fn default() -> Self {
        Self {
            chunk_size: 8_192,
            max_buffer_bytes: 50 * 1024 * 1024,
            max_frame_bytes: 10 * 1024 * 1024,
        }
    }
}

/// Circuit breaker guarding runtime queries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the breaker open.
    pub failure_threshold: u32,

    /// Successes in half-open state required to close.
    pub success_threshold: u32,

    /// How long the breaker stays open before allowing a probe (ms).
    pub reset_timeout_ms: u64,

    /// Per-call timeout applied to every wrapped operation (ms).
    pub call_timeout_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout_ms: 30_000,
            call_timeout_ms: 10_000,
        }
    }
}

/// Audit emission.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditConfig {
    /// Master switch.
    pub enabled: bool,

    /// Entries queued toward the sink; further entries are dropped while
    /// the queue is full.
    pub queue_capacity: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            queue_capacity: 1_024,
        }
    }
}
