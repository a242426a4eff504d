//! Resilience primitives: retry with backoff and circuit breaking.
//!
//! Sources wrap every fetch as `breaker(retry(op))`: a whole retry loop counts
//! as one breaker outcome, so a flapping dependency opens the circuit only
//! after `failure_threshold` exhausted loops.

pub mod circuit_breaker;
pub mod retry;

pub use circuit_breaker::{BreakerSnapshot, CircuitBreaker, CircuitState};
pub use retry::{backoff_delay, with_retry};

use std::future::Future;

use crate::context::Context;
use crate::types::{CircuitBreakerConfig, Result, RetryConfig};

/// Retry policy plus breaker owned by one source.
#[derive(Debug)]
pub struct Resilience {
    label: String,
    retry: RetryConfig,
    breaker: CircuitBreaker,
}

impl Resilience {
    pub fn new(label: impl Into<String>, retry: RetryConfig, breaker: CircuitBreakerConfig) -> Self {
        let label = label.into();
        Self {
            breaker: CircuitBreaker::new(label.clone(), breaker),
            label,
            retry,
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    /// Run `op` under the breaker, retrying inside it.
    pub async fn call<T, F, Fut>(&self, ctx: &Context, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.breaker
            .execute(|| with_retry(ctx, &self.label, &self.retry, op))
            .await
    }

    /// Run `fut` once under the breaker. For writes, which are never replayed.
    pub async fn call_once<T, Fut>(&self, ctx: &Context, fut: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        self.breaker.execute(|| ctx.run(&self.label, fut)).await
    }
}
