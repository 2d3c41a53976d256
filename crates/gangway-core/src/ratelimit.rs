//! Windowed rate limiting keyed by (operation, identifier).
//!
//! The counter store is behind [`RateLimiterBackend`] so an external store
//! with native atomic increments can replace the in-process map without the
//! caller branching on backend identity — use [`backend_from_config`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::config::RateLimitConfig;
use crate::error::Result;

/// Post-increment counter state for one key's window.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct WindowCount {
    /// Requests seen in the current window, including this one.
    pub count: u32,
    /// Seconds until the window resets.
    pub ttl_secs: u64,
}

/// Pluggable counter store. Increments must be atomic per key.
#[async_trait]
pub trait RateLimiterBackend: Send + Sync {
    /// Atomically bump the key's windowed counter, starting a fresh window
    /// if the previous one expired.
    async fn increment(&self, key: &str, window: Duration) -> Result<WindowCount>;

    /// Current count without incrementing (0 for unknown/expired keys).
    async fn get(&self, key: &str) -> Result<u32>;

    /// Drop the key's counter.
    async fn reset(&self, key: &str) -> Result<()>;

    /// Release backend resources.
    async fn close(&self) -> Result<()>;
}

#[derive(Debug)]
struct WindowEntry {
    count: u32,
    window_start: Instant,
    window: Duration,
}

/// In-process fixed-window counters.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    counters: Mutex<HashMap<String, WindowEntry>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RateLimiterBackend for MemoryBackend {
    async fn increment(&self, key: &str, window: Duration) -> Result<WindowCount> {
        let mut counters = self.counters.lock().await;
        let now = Instant::now();

        let entry = counters.entry(key.to_string()).or_insert(WindowEntry {
            count: 0,
            window_start: now,
            window,
        });
        if now.duration_since(entry.window_start) >= entry.window {
            entry.count = 0;
            entry.window_start = now;
            entry.window = window;
        }
        entry.count += 1;

        let elapsed = now.duration_since(entry.window_start);
        let ttl_secs = entry.window.saturating_sub(elapsed).as_secs().max(1);
        Ok(WindowCount {
            count: entry.count,
            ttl_secs,
        })
    }

    async fn get(&self, key: &str) -> Result<u32> {
        let counters = self.counters.lock().await;
        Ok(counters
            .get(key)
            .filter(|e| e.window_start.elapsed() < e.window)
            .map(|e| e.count)
            .unwrap_or(0))
    }

    async fn reset(&self, key: &str) -> Result<()> {
        self.counters.lock().await.remove(key);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.counters.lock().await.clear();
        Ok(())
    }
}

/// Build the configured backend. Callers hold the trait object only.
pub fn backend_from_config(_cfg: &RateLimitConfig) -> Arc<dyn RateLimiterBackend> {
    // In-process counters; a distributed store plugs in here.
    Arc::new(MemoryBackend::new())
}

/// One rate-limit verdict, carrying the figures a denial reason needs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub current: u32,
    pub limit: u32,
    pub reset_secs: u64,
}

/// Sliding-window limiter keyed by (operation, identifier).
pub struct RateLimiter {
    cfg: RateLimitConfig,
    backend: Arc<dyn RateLimiterBackend>,
}

impl RateLimiter {
    pub fn new(cfg: RateLimitConfig, backend: Arc<dyn RateLimiterBackend>) -> Self {
        Self { cfg, backend }
    }

    /// Meter one attempt and decide.
    ///
    /// The counter is incremented on every call — attempts later denied by
    /// downstream policy checks still consume budget.
    pub async fn check(&self, operation: &str, identifier: &str) -> Result<RateLimitDecision> {
        let limit = self.cfg.limit_for(operation);
        if !self.cfg.enabled {
            return Ok(RateLimitDecision {
                allowed: true,
                current: 0,
                limit,
                reset_secs: 0,
            });
        }

        let key = format!("{operation}:{identifier}");
        let window = Duration::from_millis(self.cfg.window_ms);
        let counted = self.backend.increment(&key, window).await?;

        Ok(RateLimitDecision {
            allowed: counted.count <= limit,
            current: counted.count,
            limit,
            reset_secs: counted.ttl_secs,
        })
    }

    /// Drop the counter for one (operation, identifier) pair.
    pub async fn reset(&self, operation: &str, identifier: &str) -> Result<()> {
        self.backend
            .reset(&format!("{operation}:{identifier}"))
            .await
    }

    /// Release the backend.
    pub async fn close(&self) -> Result<()> {
        self.backend.close().await
    }
}
