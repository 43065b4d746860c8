//! Exponential reconnect backoff.
//!
//! ```text
//! delay[n] = min(initial * multiplier^(n-1), max_delay)
//! ```
//!
//! With jitter enabled each delay is scaled by a random factor in
//! [0.5, 1.5]. The attempt counter resets on a successful connect.

use std::time::Duration;

use rand::Rng;
use thiserror::Error;

use crate::config::BackoffConfig;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BackoffError {
    #[error("maximum number of attempts exceeded: {0}")]
    Exhausted(u32),
}

#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Attempts handed out since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_retries
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Delay before the next attempt, or `Exhausted` once `max_retries`
    /// attempts have been handed out.
    pub fn next_sleep(&mut self) -> Result<Duration, BackoffError> {
        if self.attempt >= self.config.max_retries {
            return Err(BackoffError::Exhausted(self.config.max_retries));
        }
        self.attempt += 1;
        let delay = self.base_delay(self.attempt);
        if self.config.jitter {
            Ok(delay.mul_f64(rand::rng().random_range(0.5..=1.5)))
        } else {
            Ok(delay)
        }
    }

    /// Un-jittered delay for the given 1-based attempt.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.config.initial_delay_secs * self.config.multiplier.powi(exponent);
        let capped = if secs.is_finite() {
            secs.min(self.config.max_delay_secs)
        } else {
            self.config.max_delay_secs
        };
        Duration::from_secs_f64(capped.max(0.0))
    }
}
