//! Bounded retry with exponential backoff and jitter around source calls.

use std::{future::Future, time::Duration};

use rand::Rng;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use tracing::warn;

use crate::source::FetchError;

/// Inconsistent retry settings.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum RetryConfigError {
    /// No attempt would ever be made.
    #[snafu(display("max_attempts must be at least 1"))]
    NoAttempts,

    /// Delays would shrink between retries.
    #[snafu(display("backoff_factor must be >= 1.0, found {factor}"))]
    BackoffFactor {
        /// Configured factor.
        factor: f64,
    },

    /// The cap is below the first delay.
    #[snafu(display("max_delay_ms ({max_ms}) must be >= base_delay_ms ({base_ms})"))]
    DelayBounds {
        /// Configured base delay.
        base_ms: u64,
        /// Configured cap.
        max_ms: u64,
    },
}

/// Retry settings for source calls.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay_ms: u64,
    /// Cap on any single delay, jitter included.
    pub max_delay_ms: u64,
    /// Multiplier applied to the delay after each retry.
    pub backoff_factor: f64,
    /// Upper bound of the random delay added to each retry.
    pub jitter_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 10_000,
            backoff_factor: 2.0,
            jitter_ms: 250,
        }
    }
}

impl RetryPolicy {
    /// A policy that never sleeps.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay_ms: 0,
            max_delay_ms: 0,
            backoff_factor: 1.0,
            jitter_ms: 0,
        }
    }

    /// Check the settings for consistency.
    pub fn validate(&self) -> Result<(), RetryConfigError> {
        ensure!(self.max_attempts > 0, NoAttemptsSnafu);
        ensure!(
            !self.backoff_factor.is_nan() && self.backoff_factor >= 1.0,
            BackoffFactorSnafu {
                factor: self.backoff_factor,
            }
        );
        ensure!(
            self.max_delay_ms >= self.base_delay_ms,
            DelayBoundsSnafu {
                base_ms: self.base_delay_ms,
                max_ms: self.max_delay_ms,
            }
        );
        Ok(())
    }

    /// Backoff before retry number `retry` (1-based), without jitter.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = self.backoff_factor.powi(retry.saturating_sub(1) as i32);
        let ms = (self.base_delay_ms as f64 * exp).round();
        let capped = if ms.is_finite() {
            (ms as u64).min(self.max_delay_ms)
        } else {
            self.max_delay_ms
        };
        Duration::from_millis(capped)
    }

    fn jittered(&self, retry: u32) -> Duration {
        let jitter = if self.jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.jitter_ms)
        };
        self.delay_for(retry)
            .saturating_add(Duration::from_millis(jitter))
            .min(Duration::from_millis(self.max_delay_ms))
    }

    /// Run `operation` until it succeeds, fails with a non-transient error,
    /// or exhausts `max_attempts`. The last error is returned.
    pub async fn run<T, F, Fut>(&self, label: &str, mut operation: F) -> Result<T, FetchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match operation().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = self.jittered(attempt);
                    warn!(
                        %label,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying fetch"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
