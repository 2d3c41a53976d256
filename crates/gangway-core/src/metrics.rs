//! Global atomic counters for Gangway observability.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (e.g. on a daemon tick or at shutdown).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters — no allocations, no locking.
pub struct Metrics {
    sessions_started: AtomicU64,
    sessions_completed: AtomicU64,
    sessions_cancelled: AtomicU64,
    sessions_failed: AtomicU64,
    policy_denials: AtomicU64,
    rate_limit_denials: AtomicU64,
    bytes_streamed: AtomicU64,
    breaker_opens: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            sessions_started: AtomicU64::new(0),
            sessions_completed: AtomicU64::new(0),
            sessions_cancelled: AtomicU64::new(0),
            sessions_failed: AtomicU64::new(0),
            policy_denials: AtomicU64::new(0),
            rate_limit_denials: AtomicU64::new(0),
            bytes_streamed: AtomicU64::new(0),
            breaker_opens: AtomicU64::new(0),
        }
    }

    pub fn inc_sessions_started(&self) {
        self.sessions_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_sessions_completed(&self) {
        self.sessions_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_sessions_cancelled(&self) {
        self.sessions_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_sessions_failed(&self) {
        self.sessions_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_policy_denials(&self) {
        self.policy_denials.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rate_limit_denials(&self) {
        self.rate_limit_denials.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes_streamed(&self, n: u64) {
        self.bytes_streamed.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_breaker_opens(&self) {
        self.breaker_opens.fetch_add(1, Ordering::Relaxed);
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            sessions_started = self.sessions_started(),
            sessions_completed = self.sessions_completed(),
            sessions_cancelled = self.sessions_cancelled(),
            sessions_failed = self.sessions_failed(),
            policy_denials = self.policy_denials(),
            rate_limit_denials = self.rate_limit_denials(),
            bytes_streamed = self.bytes_streamed(),
            breaker_opens = self.breaker_opens(),
        );
    }

    pub fn sessions_started(&self) -> u64 {
        self.sessions_started.load(Ordering::Relaxed)
    }

    pub fn sessions_completed(&self) -> u64 {
        self.sessions_completed.load(Ordering::Relaxed)
    }

    pub fn sessions_cancelled(&self) -> u64 {
        self.sessions_cancelled.load(Ordering::Relaxed)
    }

    pub fn sessions_failed(&self) -> u64 {
        self.sessions_failed.load(Ordering::Relaxed)
    }

    pub fn policy_denials(&self) -> u64 {
        self.policy_denials.load(Ordering::Relaxed)
    }

    pub fn rate_limit_denials(&self) -> u64 {
        self.rate_limit_denials.load(Ordering::Relaxed)
    }

    pub fn bytes_streamed(&self) -> u64 {
        self.bytes_streamed.load(Ordering::Relaxed)
    }

    pub fn breaker_opens(&self) -> u64 {
        self.breaker_opens.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.sessions_started.store(0, Ordering::Relaxed);
        self.sessions_completed.store(0, Ordering::Relaxed);
        self.sessions_cancelled.store(0, Ordering::Relaxed);
        self.sessions_failed.store(0, Ordering::Relaxed);
        self.policy_denials.store(0, Ordering::Relaxed);
        self.rate_limit_denials.store(0, Ordering::Relaxed);
        self.bytes_streamed.store(0, Ordering::Relaxed);
        self.breaker_opens.store(0, Ordering::Relaxed);
    }
}
