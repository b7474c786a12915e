//! Retry utilities with exponential backoff and jitter.
//!
//! [`retry_with_backoff`] wraps an async operation that may fail transiently.
//! [`RetryConfig::delay_for_attempt`] gives the un-jittered delay for callers
//! that schedule the retry themselves (e.g. a controller requeue).
//!
//! # Example
//!
//! ```ignore
//! use keel_common::retry::{retry_with_backoff, RetryConfig};
//!
//! retry_with_backoff(&RetryConfig::with_max_attempts(5), "install_crds", || async {
//!     install(&client).await
//! })
//! .await?;
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

/// Backoff policy shared by CRD installation and controller requeues
#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    /// Attempts before giving up; 0 retries forever
    pub max_attempts: u32,
    /// Delay after the first failure
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Growth factor per attempt
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Default backoff limited to `attempts` tries
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Delay before retry number `attempt` (1-based), without jitter.
    ///
    /// `initial_delay * multiplier^(attempt - 1)`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }

    /// Whether `attempt` failures use up the budget
    pub fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts > 0 && attempt >= self.max_attempts
    }
}

/// Scale a delay by a random factor in `[0.5, 1.5)`
fn jittered(delay: Duration) -> Duration {
    delay.mul_f64(rand::thread_rng().gen_range(0.5..1.5))
}

/// Run `operation` until it succeeds or the attempt budget runs out
///
/// Returns the last error once [`RetryConfig::exhausted`] holds.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if config.exhausted(attempt) {
            error!(operation = operation_name, attempt, error = %err, "giving up");
            return Err(err);
        }

        let delay = jittered(config.delay_for_attempt(attempt));
        warn!(
            operation = operation_name,
            attempt,
            error = %err,
            delay_ms = delay.as_millis() as u64,
            "attempt failed, backing off"
        );
        tokio::time::sleep(delay).await;
    }
}
