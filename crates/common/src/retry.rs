/*
 * Bounded retry of storage operations.
 *
 * Staging writes, staging reads, abort-path deletes and staging directory
 * removal each get the initial attempt plus at most `max_retries` more,
 * with capped exponential backoff in between. Only errors for which
 * `CommitError::is_retryable()` holds are retried; a table conflict or a
 * corrupt staging file fails on the first attempt.
 */

use crate::{CommitError, Result};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// How often and how patiently an operation is retried.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Retries after the initial attempt; 0 disables retrying
    pub max_retries: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Growth factor of the delay per attempt
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// `max_retries` retries, always waiting `delay`.
    pub fn fixed(max_retries: usize, delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay: delay,
            max_delay: delay,
            backoff_multiplier: 1.0,
        }
    }

    /// Wait before retry number `retry` (0 is the first retry).
    pub fn delay_for_attempt(&self, retry: usize) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let millis = self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let cap = self.max_delay.as_millis() as f64;
        Duration::from_millis(millis.min(cap) as u64)
    }
}

/// Runs one named operation under a `RetryConfig`.
pub struct RetryBuilder<'a> {
    config: &'a RetryConfig,
    name: Option<String>,
}

impl<'a> RetryBuilder<'a> {
    pub fn new(config: &'a RetryConfig) -> Self {
        Self { config, name: None }
    }

    /// Name used in log lines.
    pub fn operation(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Calls `operation` until it succeeds, fails permanently, or the
    /// retry bound is used up. The last error is returned as-is.
    pub async fn run<F, Fut, T>(self, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let name = self.name.as_deref().unwrap_or("operation");
        let mut retry = 0;

        loop {
            let error: CommitError = match operation().await {
                Ok(value) => {
                    if retry > 0 {
                        debug!("{} succeeded after {} retries", name, retry);
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            if !error.is_retryable() {
                debug!("{} failed permanently: {}", name, error);
                return Err(error);
            }
            if retry >= self.config.max_retries {
                warn!("{} gave up after {} retries: {}", name, retry, error);
                return Err(error);
            }

            let delay = self.config.delay_for_attempt(retry);
            warn!("{} failed, retry {} of {} in {:?}: {}", name, retry + 1, self.config.max_retries, delay, error);
            tokio::time::sleep(delay).await;
            retry += 1;
        }
    }
}
