//! Inline retry with exponential backoff
//!
//! Sub-step retries (a single HTTP call) happen here. Attempt-level retries are
//! scheduled on the task queue by the orchestrator using `next_retry_at`.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::classify::{ErrorClassification, PublishError};

/// Retry policy for inline sub-step retries.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Upper bound on any single inline delay. Longer platform-suggested
    /// delays are not slept through; the error is returned instead so the
    /// attempt can be rescheduled on the queue.
    pub max_inline_delay: Duration,
    /// Add up to one second of random jitter to each delay
    pub jitter: bool,
    /// Multiplier applied to every computed delay (0.0 disables sleeping)
    pub delay_scale: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_inline_delay: Duration::from_secs(60),
            jitter: true,
            delay_scale: 1.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_inline_delay: Duration) -> Self {
        Self {
            max_inline_delay,
            ..Default::default()
        }
    }

    /// Policy that retries with the normal budget but never sleeps
    pub fn immediate() -> Self {
        Self {
            max_inline_delay: Duration::from_secs(60),
            jitter: false,
            delay_scale: 0.0,
        }
    }

    /// Delay before retry number `attempt` (0-based) without jitter:
    /// `base_delay × 2^attempt`, or the platform-suggested delay when present.
    pub fn base_delay_for(&self, attempt: u32, classification: &ErrorClassification) -> Duration {
        let raw = match classification.suggested_delay {
            Some(delay) => delay,
            None => classification
                .base_delay
                .saturating_mul(2_u32.saturating_pow(attempt)),
        };
        raw.mul_f64(self.delay_scale)
    }

    fn delay_for(&self, attempt: u32, classification: &ErrorClassification) -> Duration {
        let base = self.base_delay_for(attempt, classification);
        if self.jitter && self.delay_scale > 0.0 {
            let jitter_ms = rand::thread_rng().gen_range(0..1000);
            base + Duration::from_millis(jitter_ms)
        } else {
            base
        }
    }
}

/// Run `operation`, retrying per the classification of each failure.
///
/// Attempts are bounded by the `max_retries` of the failure's error code. On
/// exhaustion, or for a non-retryable failure, the last classified error is
/// returned to the caller.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    operation_name: &str,
    operation: F,
) -> Result<T, PublishError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, PublishError>>,
{
    retry_with_backoff_if(policy, operation_name, |_| true, operation).await
}

/// Like [`retry_with_backoff`], but only failures for which `should_retry`
/// holds are retried; any other failure is returned at once.
pub async fn retry_with_backoff_if<T, F, Fut, P>(
    policy: &RetryPolicy,
    operation_name: &str,
    should_retry: P,
    mut operation: F,
) -> Result<T, PublishError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, PublishError>>,
    P: Fn(&PublishError) -> bool,
{
    let mut retries: u32 = 0;

    loop {
        match operation().await {
            Ok(value) => {
                if retries > 0 {
                    info!(
                        operation = operation_name,
                        retries, "Succeeded after retrying"
                    );
                }
                return Ok(value);
            }
            Err(error) => {
                let classification = error.classification();

                if !classification.retryable
                    || retries >= classification.max_retries
                    || !should_retry(&error)
                {
                    if retries > 0 {
                        warn!(
                            operation = operation_name,
                            retries,
                            code = %classification.code,
                            "Giving up after {} retries: {}",
                            retries,
                            error
                        );
                    }
                    return Err(error);
                }

                if let Some(suggested) = classification.suggested_delay {
                    if suggested > policy.max_inline_delay {
                        warn!(
                            operation = operation_name,
                            code = %classification.code,
                            delay_secs = suggested.as_secs(),
                            "Suggested delay exceeds inline limit, deferring"
                        );
                        return Err(error);
                    }
                }

                let delay = policy.delay_for(retries, &classification);
                warn!(
                    operation = operation_name,
                    attempt = retries + 1,
                    max_retries = classification.max_retries,
                    code = %classification.code,
                    delay_ms = delay.as_millis() as u64,
                    "Retryable failure: {}",
                    error
                );
                if !delay.is_zero() {
                    sleep(delay).await;
                }
                retries += 1;
            }
        }
    }
}
