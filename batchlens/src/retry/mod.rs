//! Retry execution with exponential backoff.
//!
//! Retries only errors classified as transient (rate-limit, timeout,
//! network). Terminal errors propagate after the first attempt, and a
//! halt condition (open breaker, cancellation) stops the loop without
//! consuming further attempts. The backoff sleep races the batch cancel
//! token so shutdown interrupts pending retries.

use crate::cancellation::CancelToken;
use crate::errors::{ClassifyError, PipelineError};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Backoff configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum attempts, including the first.
    pub max_attempts: u32,
    /// First backoff delay in milliseconds.
    pub initial_delay_ms: u64,
    /// Multiplier applied per additional attempt.
    pub multiplier: f64,
    /// Backoff cap in milliseconds.
    pub max_delay_ms: u64,
    /// Apply full jitter (random delay in `[0, computed]`).
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1000,
            multiplier: 2.0,
            max_delay_ms: 30_000,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum attempts.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Sets the initial delay.
    #[must_use]
    pub fn with_initial_delay_ms(mut self, delay: u64) -> Self {
        self.initial_delay_ms = delay;
        self
    }

    /// Sets the backoff multiplier.
    #[must_use]
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Sets the delay cap.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Enables or disables jitter.
    #[must_use]
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Computes the backoff before attempt `attempt + 1`, where
    /// `attempt` is 1-based: `min(max, initial * multiplier^(attempt-1))`.
    #[must_use]
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let raw = self.initial_delay_ms as f64 * self.multiplier.powi(exponent as i32);
        let capped = raw.min(self.max_delay_ms as f64).max(0.0) as u64;

        let millis = if self.jitter && capped > 0 {
            rand::thread_rng().gen_range(0..=capped)
        } else {
            capped
        };
        Duration::from_millis(millis)
    }
}

/// Error produced by one attempt inside the retry loop.
#[derive(Debug)]
pub enum AttemptError {
    /// The backend call failed; retryability follows the error class.
    Classify(ClassifyError),
    /// Stop retrying immediately and surface this error as-is
    /// (open breaker, budget withdrawal, shutdown).
    Halt(PipelineError),
}

impl From<ClassifyError> for AttemptError {
    fn from(err: ClassifyError) -> Self {
        Self::Classify(err)
    }
}

/// Runs `op` up to `policy.max_attempts` times.
///
/// Returns the first success together with the number of attempts it
/// took. Transient failures back off between attempts; the sleep is
/// cancelled by `token`, in which case the loop ends with
/// [`PipelineError::Cancelled`].
///
/// # Errors
///
/// The final [`ClassifyError`] annotated with the attempt count once
/// attempts are exhausted or the error is not transient; a
/// [`AttemptError::Halt`] error unchanged.
pub async fn run_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    token: &Arc<CancelToken>,
    mut op: F,
) -> Result<(T, u32), PipelineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AttemptError>>,
{
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok((value, attempt)),
            Err(AttemptError::Halt(err)) => return Err(err),
            Err(AttemptError::Classify(err)) => {
                if !err.is_transient() || attempt >= policy.max_attempts {
                    return Err(PipelineError::backend(err, attempt));
                }

                let delay = policy.backoff_delay(attempt);
                debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying after transient error"
                );

                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = token.cancelled() => {
                        let reason = token.reason().unwrap_or_else(|| "cancelled".to_string());
                        return Err(PipelineError::Cancelled(reason));
                    }
                }
            }
        }
    }
}
