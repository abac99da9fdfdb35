//! Bounded retry with jittered exponential backoff
//!
//! Broker reads inside the OSB client, every per-record step of the migration
//! engine and CRD bootstrap go through [`retry_with_backoff`]. The reconcilers
//! do not: their retries belong to the work queue.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Attempts before giving up; 0 retries forever
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
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
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// One attempt and no retries.
    pub fn none() -> Self {
        Self::with_max_attempts(1)
    }

    fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts > 0 && attempt >= self.max_attempts
    }
}

/// Delay sequence for one retried operation.
struct Backoff {
    base: Duration,
    max: Duration,
    multiplier: f64,
}

impl Backoff {
    fn new(config: &RetryConfig) -> Self {
        Self {
            base: config.initial_delay,
            max: config.max_delay,
            multiplier: config.backoff_multiplier,
        }
    }

    /// The next sleep, jittered to 0.5x..1.5x of the current base.
    fn next_delay(&mut self) -> Duration {
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let delay = self.base.mul_f64(jitter);
        self.base = self.base.mul_f64(self.multiplier).min(self.max);
        delay
    }
}

/// Run `operation` until it succeeds or the attempts run out; the last error
/// is returned.
pub async fn retry_with_backoff<F, Fut, T, E>(config: &RetryConfig, operation_name: &str, operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    retry_with_backoff_if(config, operation_name, |_| true, operation).await
}

/// Like [`retry_with_backoff`], but an error `should_retry` rejects is
/// returned at once.
pub async fn retry_with_backoff_if<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    should_retry: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
    P: Fn(&E) -> bool,
{
    let mut backoff = Backoff::new(config);
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if !should_retry(&e) => return Err(e),
            Err(e) => e,
        };
        if config.exhausted(attempt) {
            error!(operation = %operation_name, attempt, error = %err, "Giving up");
            return Err(err);
        }
        let delay = backoff.next_delay();
        warn!(
            operation = %operation_name,
            attempt,
            error = %err,
            delay_ms = delay.as_millis() as u64,
            "Retrying"
        );
        tokio::time::sleep(delay).await;
    }
}
