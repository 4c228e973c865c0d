//! Backoff for resource-busy filesystem errors.
//!
//! Only errors for which [`Error::is_transient`] holds are retried. Once the
//! ceiling is reached the last error is escalated with [`Error::into_fatal`].

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use akravault_common::{Error, Result};

/// How persistently a busy file is retried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Wait before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for any single wait.
    pub max_delay: Duration,
    /// Growth factor between consecutive waits.
    pub backoff_multiplier: f64,
    /// Spread waits by +/-25% so parallel workers do not retry in lockstep.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Default delays with a different ceiling.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Fixed, jitter-free waits of `delay`. Handy in tests.
    pub fn constant(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self.max_delay = delay;
        self.backoff_multiplier = 1.0;
        self.jitter = false;
        self
    }

    /// Wait before retry number `retry` (zero-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let grown = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(retry as i32);
        let mut secs = grown.min(self.max_delay.as_secs_f64());
        if self.jitter {
            secs *= 0.75 + rand::random::<f64>() * 0.5;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// What to do after `failures` failed attempts ending in `err`.
    fn next_step(&self, failures: u32, err: Error) -> std::result::Result<Duration, Error> {
        if !err.is_transient() {
            return Err(err);
        }
        if failures > self.max_retries {
            warn!(attempts = failures, error = %err, "Giving up on busy resource");
            return Err(err.into_fatal());
        }
        let delay = self.delay_for(failures - 1);
        debug!(attempt = failures, ?delay, error = %err, "Resource busy, retrying");
        Ok(delay)
    }
}

/// Runs filesystem calls under a [`RetryConfig`].
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Run an async call until it succeeds, fails permanently or exhausts
    /// the retries.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut failures = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    failures += 1;
                    let delay = self.config.next_step(failures, err)?;
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Blocking counterpart of [`RetryExecutor::execute`] for cipher workers.
    pub fn execute_blocking<F, T>(&self, operation: F) -> Result<T>
    where
        F: Fn() -> Result<T>,
    {
        let mut failures = 0;
        loop {
            match operation() {
                Ok(value) => return Ok(value),
                Err(err) => {
                    failures += 1;
                    let delay = self.config.next_step(failures, err)?;
                    std::thread::sleep(delay);
                }
            }
        }
    }
}
