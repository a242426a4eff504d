//! Per-source circuit breaker.
//!
//! ```text
//!   Closed ──(failures >= threshold)──► Open
//!     ▲                                   │ cooldown elapsed
//!     │ trial ok                          ▼
//!     └─────────────────────────────── HalfOpen ──(trial failed)──► Open
//! ```
//!
//! One mutex per breaker. The lock is only held for state bookkeeping, never
//! across the wrapped operation.

use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use tokio::time::Instant;

use crate::types::{CircuitBreakerConfig, Error, ErrorKind, Result};

// =============================================================================
// State
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failures: u32,
    opened_at: Option<Instant>,
    last_failure: Option<Instant>,
    trial_in_flight: bool,
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failures: u32,
}

// =============================================================================
// Breaker
// =============================================================================

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failures: 0,
                opened_at: None,
                last_failure: None,
                trial_in_flight: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Recorded state. An Open breaker whose cooldown has elapsed still
    /// reports Open until the next call moves it to HalfOpen.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failures
    }

    pub fn last_failure(&self) -> Option<Instant> {
        self.inner.lock().last_failure
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failures: inner.failures,
        }
    }

    /// Force the breaker back to Closed.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.failures = 0;
        inner.opened_at = None;
        inner.trial_in_flight = false;
    }

    /// Run `op` through the breaker.
    ///
    /// Cancellation of the wrapped operation is neither a success nor a
    /// failure: it only releases a held trial slot.
    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let permit = self.acquire()?;
        match op().await {
            Ok(value) => {
                permit.succeeded();
                Ok(value)
            }
            Err(err) if err.kind() == ErrorKind::Cancelled => Err(err),
            Err(err) => {
                permit.failed();
                Err(err)
            }
        }
    }

    fn acquire(&self) -> Result<Permit<'_>> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Ok(Permit::new(self, false)),
            CircuitState::Open => {
                let cooled = inner
                    .opened_at
                    .map(|at| at.elapsed() >= self.config.cooldown)
                    .unwrap_or(true);
                if !cooled {
                    return Err(Error::CircuitOpen(self.name.clone()));
                }
                inner.state = CircuitState::HalfOpen;
                inner.trial_in_flight = true;
                tracing::info!(source = %self.name, "circuit half-open, allowing trial");
                Ok(Permit::new(self, true))
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    return Err(Error::CircuitOpen(self.name.clone()));
                }
                inner.trial_in_flight = true;
                Ok(Permit::new(self, true))
            }
        }
    }

    fn on_success(&self, trial: bool) {
        let mut inner = self.inner.lock();
        if trial {
            inner.trial_in_flight = false;
        }
        if inner.state == CircuitState::HalfOpen && trial {
            tracing::info!(source = %self.name, "circuit closed");
        }
        inner.state = CircuitState::Closed;
        inner.failures = 0;
        inner.opened_at = None;
    }

    fn on_failure(&self, trial: bool) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.last_failure = Some(now);
        if trial {
            inner.trial_in_flight = false;
            inner.state = CircuitState::Open;
            inner.opened_at = Some(now);
            tracing::warn!(source = %self.name, "trial failed, circuit re-opened");
            return;
        }
        inner.failures = inner.failures.saturating_add(1);
        if inner.state == CircuitState::Closed && inner.failures >= self.config.failure_threshold {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(now);
            tracing::warn!(
                source = %self.name,
                failures = inner.failures,
                cooldown_ms = self.config.cooldown.as_millis() as u64,
                "circuit opened"
            );
        }
    }
}

// =============================================================================
// Permit
// =============================================================================

/// Admission ticket. Dropping an unsettled trial permit frees the slot.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl<'a> Permit<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            settled: false,
        }
    }

    fn succeeded(mut self) {
        self.settled = true;
        self.breaker.on_success(self.trial);
    }

    fn failed(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.trial);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.inner.lock().trial_in_flight = false;
        }
    }
}
