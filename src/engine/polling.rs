//! Bounded poll-with-backoff.
//!
//! Replaces open-ended "run the probe again until it works" loops: every
//! caller states how many attempts it is willing to make.

use std::future::Future;
use std::time::Duration;

use crate::error::AppError;

#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl PollPolicy {
    pub fn new(max_attempts: u32, initial_backoff: Duration) -> Self {
        Self {
            max_attempts,
            initial_backoff,
            max_backoff: initial_backoff * 8,
        }
    }

    /// Backoff before attempt `attempt + 1` (attempts are 1-based).
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.initial_backoff.saturating_mul(factor).min(self.max_backoff)
    }
}

/// Call `probe` until it yields `Some`, at most `policy.max_attempts` times,
/// sleeping with exponential backoff in between.
///
/// Probe errors count as "not ready yet". Returns `Ok(None)` when attempts run
/// out, or the last error if the final attempt failed.
pub async fn poll_until<T, F, Fut>(
    label: &str,
    policy: &PollPolicy,
    mut probe: F,
) -> Result<Option<T>, AppError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Option<T>, AppError>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut last_error = None;

    for attempt in 1..=attempts {
        match probe(attempt).await {
            Ok(Some(value)) => {
                tracing::debug!(label, attempt, "Poll condition met");
                return Ok(Some(value));
            }
            Ok(None) => last_error = None,
            Err(e) => {
                tracing::debug!(label, attempt, "Poll probe failed: {}", e);
                last_error = Some(e);
            }
        }

        if attempt < attempts {
            tokio::time::sleep(policy.backoff_after(attempt)).await;
        }
    }

    tracing::debug!(label, attempts, "Poll attempts exhausted");
    match last_error {
        Some(e) => Err(e),
        None => Ok(None),
    }
}
