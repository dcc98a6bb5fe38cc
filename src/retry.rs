//! Retry with exponential backoff around whole connection attempts.
//!
//! Never wraps a half-completed `execute()`: a command that may have reached
//! the engine is not re-sent.

use std::time::Duration;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts after the first one.
    pub max_retries: u32,
    pub delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delay: Duration::from_secs(1),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// A policy that tries exactly once.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (0-based), capped at `max_delay`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = self.backoff_factor.max(1.0).powi(retry.min(i32::MAX as u32) as i32);
        let secs = self.delay.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }

    /// Run `attempt` until it succeeds, fails with an error `retryable`
    /// rejects, or the retry budget is spent. The last error is returned.
    pub fn run<T>(
        &self,
        retryable: impl Fn(&Error) -> bool,
        attempt: impl FnMut(u32) -> Result<T>,
    ) -> Result<T> {
        self.run_with_sleep(retryable, attempt, std::thread::sleep)
    }

    pub(crate) fn run_with_sleep<T>(
        &self,
        retryable: impl Fn(&Error) -> bool,
        mut attempt: impl FnMut(u32) -> Result<T>,
        mut sleep: impl FnMut(Duration),
    ) -> Result<T> {
        let mut n = 0;
        loop {
            match attempt(n) {
                Ok(value) => return Ok(value),
                Err(e) if n < self.max_retries && retryable(&e) => {
                    let wait = self.delay_for(n);
                    tracing::warn!(
                        attempt = n + 1,
                        max_attempts = self.max_retries + 1,
                        "attempt failed: {}; retrying in {:?}",
                        e,
                        wait
                    );
                    sleep(wait);
                    n += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
