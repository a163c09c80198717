//! Generic exponential-backoff retry for fallible async operations.
//!
//! The engine knows nothing about what it retries: navigation, clicks,
//! form fills, and custom assertions all pass through the same wrapper.
//! Attempts are strictly sequential (one in flight at a time) and the
//! final error is returned unmodified so callers can still classify the
//! original failure.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

/// Backoff policy for one retried call site.
///
/// Constructed per call site, never persisted. `retries` is the number of
/// retries after the first attempt, so `retries = 2` means up to three
/// attempts total.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Additional attempts after the first (0 = no retries).
    pub retries: u32,
    /// Delay before the first retry.
    pub delay: Duration,
    /// Multiplicative backoff factor (>= 1.0).
    pub backoff: f64,
    /// Cap on any single delay.
    pub max_delay: Duration,
    /// Jitter factor (0.0-1.0) applied to each delay. Defaults to off so
    /// the schedule stays deterministic unless a caller opts in.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 2,
            delay: Duration::from_millis(250),
            backoff: 2.0,
            max_delay: Duration::from_secs(10),
            jitter: 0.0,
        }
    }
}

impl RetryPolicy {
    /// Policy with the given retry count and defaults for the rest.
    pub fn with_retries(retries: u32) -> Self {
        Self {
            retries,
            ..Self::default()
        }
    }

    /// Delay scheduled after failed attempt `attempt` (1-based):
    /// `min(delay * backoff^(attempt-1), max_delay)`. Jitter, when
    /// enabled, is applied inside the cap, so `max_delay` holds either
    /// way.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let base = self.delay.as_secs_f64();
        let factor = self.backoff.max(1.0).powi(attempt as i32 - 1);
        let cap = self.max_delay.as_secs_f64();
        let mut secs = (base * factor).min(cap);

        if self.jitter > 0.0 && secs > 0.0 {
            let jitter = (fastrand::f64() * 2.0 - 1.0) * self.jitter;
            secs = (secs * (1.0 + jitter)).clamp(0.0, cap);
        }

        Duration::from_secs_f64(secs)
    }

    /// Total attempts including the first.
    pub fn max_attempts(&self) -> u32 {
        self.retries + 1
    }
}

/// Run `op` with up to `policy.retries` retries.
///
/// On failure of attempt `i` (while retries remain) the engine sleeps
/// `policy.delay_for(i)` and tries again. On exhaustion the last error is
/// returned as-is: never swallowed, never wrapped.
pub async fn retry<F, Fut, T, E>(label: &str, policy: &RetryPolicy, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = policy.max_attempts();
    let mut attempt = 1;

    loop {
        debug!(label, attempt, max_attempts, "starting attempt");

        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(label, attempt, "attempt succeeded after retry");
                }
                return Ok(value);
            }
            Err(_) if attempt < max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!(
                    label,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "attempt failed, retrying after backoff"
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                warn!(label, attempt, "attempt failed, retries exhausted");
                return Err(err);
            }
        }
    }
}
