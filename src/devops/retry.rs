//! Backoff for tracker reads
//!
//! Queries and fetches are retried on throttling and server-side failures.
//! Writes are not: a PATCH that reached the tracker but timed out on the way
//! back would otherwise apply twice.

use rand::Rng;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// How often and how patiently a read is retried
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub base_delay: Duration,
    /// Upper bound for computed delays and for server-provided Retry-After
    pub max_delay: Duration,
    pub factor: f64,
    /// Stretch each delay by up to a quarter so parallel passes drift apart
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(3, 500)
    }
}

impl RetryPolicy {
    /// Policy from the `retry` section of the YAML file
    pub fn from_settings(max_retries: u32, initial_backoff_ms: u64) -> Self {
        Self {
            max_retries,
            base_delay: Duration::from_millis(initial_backoff_ms),
            max_delay: Duration::from_secs(30),
            factor: 2.0,
            jitter: true,
        }
    }

    /// Single attempt only
    pub fn disabled() -> Self {
        Self::from_settings(0, 0)
    }

    /// Delay before retry number `retry` (0-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponential = self.base_delay.as_secs_f64() * self.factor.powi(retry as i32);
        let mut secs = exponential.min(self.max_delay.as_secs_f64());
        if self.jitter {
            secs *= 1.0 + rand::thread_rng().gen_range(0.0..0.25);
        }
        Duration::from_secs_f64(secs)
    }
}

/// What to do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry,
    /// Server told us how long to wait
    RetryAfter(Duration),
    NoRetry,
}

/// Errors that know whether another attempt could succeed
pub trait RetryableError {
    fn retry_decision(&self) -> RetryDecision;
}

/// Run `attempt` until it succeeds, fails permanently, or the policy runs out
pub async fn with_retry<F, Fut, T, E>(policy: &RetryPolicy, name: &str, mut attempt: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: RetryableError + Display,
{
    let mut retry = 0;

    loop {
        let err = match attempt().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        let delay = match err.retry_decision() {
            RetryDecision::NoRetry => {
                debug!(operation = name, error = %err, "Permanent failure, not retrying");
                return Err(err);
            }
            _ if retry >= policy.max_retries => {
                warn!(operation = name, attempts = retry + 1, error = %err, "Giving up");
                return Err(err);
            }
            RetryDecision::RetryAfter(wait) => wait.min(policy.max_delay),
            RetryDecision::Retry => policy.delay_for(retry),
        };

        warn!(
            operation = name,
            retry = retry + 1,
            max_retries = policy.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Transient failure, retrying"
        );
        sleep(delay).await;
        retry += 1;
    }
}
