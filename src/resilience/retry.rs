//! Retry executor with exponential backoff.
//!
//! delay before retry k (k >= 1) = min(base_delay * multiplier^(k-1), max_delay)

use std::future::Future;
use std::time::Duration;

use crate::context::Context;
use crate::types::{Error, ErrorKind, Result, RetryConfig};

/// Delay before retry number `retry` (1-indexed).
pub fn backoff_delay(config: &RetryConfig, retry: u32) -> Duration {
    let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
    let secs = config.base_delay.as_secs_f64() * config.multiplier.max(1.0).powi(exponent);
    let cap = config.max_delay.as_secs_f64();
    if !secs.is_finite() || secs >= cap {
        config.max_delay
    } else {
        Duration::from_secs_f64(secs)
    }
}

/// Run `op` up to `max_retries + 1` times.
///
/// Non-retryable errors are returned as-is after the attempt that produced
/// them. Cancellation of `ctx` aborts both an in-flight attempt and a pending
/// backoff. Exhaustion returns [`Error::RetriesExhausted`] wrapping the last
/// error.
pub async fn with_retry<T, F, Fut>(
    ctx: &Context,
    label: &str,
    config: &RetryConfig,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = config.max_retries.saturating_add(1);
    let mut attempt = 0u32;

    loop {
        ctx.check(label)?;
        attempt += 1;

        let err = match ctx.run(label, op()).await {
            Ok(value) => {
                if attempt > 1 && config.enable_log {
                    tracing::info!(label, attempt, "succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        if err.kind() == ErrorKind::Cancelled || !err.is_retryable() {
            return Err(err);
        }

        if attempt >= max_attempts {
            if config.enable_log {
                tracing::warn!(label, attempts = attempt, error = %err, "retries exhausted");
            }
            return Err(Error::RetriesExhausted {
                label: label.to_string(),
                attempts: attempt,
                last: Box::new(err),
            });
        }

        let delay = backoff_delay(config, attempt);
        if config.enable_log {
            tracing::warn!(
                label,
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "attempt failed, retrying"
            );
        }
        ctx.sleep(delay).await?;
    }
}
