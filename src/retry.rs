// =============================================================================
// Retry: bounded exponential backoff for connections and publishes
// =============================================================================

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use tracing::{error, warn};

/// Exponential backoff with an attempt budget.
///
/// `next_delay` yields `base, base*factor, base*factor^2, ...` capped at
/// `max`. Once `max_attempts` delays have been handed out the policy is
/// exhausted until [`reset`](Self::reset) is called.
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
    factor: f64,
    current: Duration,
    max_attempts: u32,
    attempts: u32,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, max: Duration, factor: f64, max_attempts: u32) -> Self {
        let factor = if factor.is_finite() && factor > 1.0 {
            factor
        } else {
            1.5
        };
        Self {
            base,
            max: max.max(base),
            factor,
            current: base,
            max_attempts: max_attempts.max(1),
            attempts: 0,
        }
    }

    /// Delay before the next attempt, or `None` once the budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.max_attempts {
            return None;
        }
        self.attempts += 1;
        let delay = self.current;
        let next = (self.current.as_secs_f64() * self.factor).min(self.max.as_secs_f64());
        self.current = Duration::from_secs_f64(next);
        Some(delay)
    }

    pub fn reset(&mut self) {
        self.current = self.base;
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30), 2.0, 8)
    }
}

/// Run `op` until it succeeds, sleeping per `policy` between failures.
///
/// The first call is made immediately; `policy.max_attempts` further retries
/// follow. The last error is returned with `label` attached once the budget
/// runs out.
pub async fn retry_async<T, F, Fut>(label: &str, mut policy: ExponentialBackoff, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    policy.reset();
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => match policy.next_delay() {
                Some(delay) => {
                    warn!(
                        op = label,
                        attempt = policy.attempts(),
                        max_attempts = policy.max_attempts(),
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "operation failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    error!(op = label, error = %e, "retries exhausted");
                    return Err(e.context(format!(
                        "{label}: giving up after {} retries",
                        policy.max_attempts()
                    )));
                }
            },
        }
    }
}
