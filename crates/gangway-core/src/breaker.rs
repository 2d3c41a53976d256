//! Circuit breaker guarding calls into the container runtime.
//!
//! Closed: failures count up, any success resets; at the threshold the
//! breaker trips open and schedules a reset time. Open: calls are rejected
//! without invoking the operation until the reset time passes, then one
//! probe is let through half-open. Half-open: enough successes close the
//! circuit; a single failure re-opens it immediately.
//!
//! Every wrapped call is also bounded by a fixed timeout independent of the
//! breaker state.

use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::config::BreakerConfig;
use crate::error::{with_timeout, GangwayError, Result};

/// Breaker state, exposed for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    half_open_successes: u32,
    open_until: Option<Instant>,
}

/// Three-state circuit breaker with timed recovery.
#[derive(Debug)]
pub struct CircuitBreaker {
    cfg: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(cfg: BreakerConfig) -> Self {
        Self {
            cfg,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                open_until: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current state (open flips to half-open once the reset time passes).
    pub fn state(&self) -> BreakerState {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        inner.state
    }

    /// When open past its reset time, admit one probe by going half-open.
    fn refresh(&self, inner: &mut Inner) {
        if inner.state == BreakerState::Open {
            if let Some(until) = inner.open_until {
                if Instant::now() >= until {
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_successes = 0;
                    tracing::info!(event = "breaker.half_open");
                }
            }
        }
    }

    /// Admission check. Errors with `CircuitOpen` without invoking anything.
    fn before_call(&self) -> Result<()> {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        if inner.state == BreakerState::Open {
            let reset_in_ms = inner
                .open_until
                .map(|u| u.saturating_duration_since(Instant::now()).as_millis() as u64)
                .unwrap_or(self.cfg.reset_timeout_ms);
            return Err(GangwayError::CircuitOpen { reset_in_ms });
        }
        Ok(())
    }

    fn on_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => inner.consecutive_failures = 0,
            BreakerState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.cfg.success_threshold {
                    inner.state = BreakerState::Closed;
                    inner.consecutive_failures = 0;
                    inner.open_until = None;
                    tracing::info!(event = "breaker.closed");
                }
            }
            BreakerState::Open => {}
        }
    }

    fn on_failure(&self) {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.cfg.failure_threshold {
                    self.trip(&mut inner);
                }
            }
            BreakerState::HalfOpen => self.trip(&mut inner),
            BreakerState::Open => {}
        }
    }

    fn trip(&self, inner: &mut Inner) {
        inner.state = BreakerState::Open;
        inner.open_until =
            Some(Instant::now() + Duration::from_millis(self.cfg.reset_timeout_ms));
        crate::metrics::METRICS.inc_breaker_opens();
        tracing::warn!(
            event = "breaker.open",
            consecutive_failures = inner.consecutive_failures,
            reset_timeout_ms = self.cfg.reset_timeout_ms,
        );
    }

    /// Run `op` through the breaker with the per-call timeout applied.
    pub async fn call<F, Fut, T>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.before_call()?;

        let limit = Duration::from_millis(self.cfg.call_timeout_ms);
        let outcome = match with_timeout(limit, op()).await {
            Ok(inner_result) => inner_result,
            Err(timeout_err) => Err(timeout_err),
        };

        match &outcome {
            Ok(_) => self.on_success(),
            Err(_) => self.on_failure(),
        }
        outcome
    }
}
