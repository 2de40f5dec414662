//! Exponential backoff with jitter for transient boundary errors.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::Deserialize;

use crate::error::RelayError;

/// Backoff policy. Deserializable so it can sit in the `[backoff]` table.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Backoff {
    /// Delay before the first retry.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Upper bound for any single delay.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Retries after the initial attempt (0 = no retries).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Randomizes each delay by ± this fraction.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_initial_delay_ms() -> u64 {
    100
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_multiplier() -> f64 {
    2.0
}
fn default_max_retries() -> u32 {
    5
}
fn default_jitter() -> f64 {
    0.25
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            max_retries: default_max_retries(),
            jitter: default_jitter(),
        }
    }
}

impl Backoff {
    /// Delay before attempt n (0-indexed). Attempt 0 has no delay.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let sample = rand::thread_rng().gen_range(0.0..1.0);
        self.delay_with_sample(attempt, sample)
    }

    /// Same as [`delay_for_attempt`](Self::delay_for_attempt) with an explicit
    /// jitter sample in `[0, 1]`; 0.5 means no jitter.
    pub fn delay_with_sample(&self, attempt: u32, sample: f64) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exp = self.multiplier.powi(attempt.saturating_sub(1).min(i32::MAX as u32) as i32);
        let base_ms = (self.initial_delay_ms as f64 * exp).min(self.max_delay_ms as f64);
        let offset = (sample * 2.0 - 1.0) * base_ms * self.jitter;
        let final_ms = (base_ms + offset).max(1.0);
        Duration::from_micros((final_ms * 1000.0) as u64)
    }

    /// Run `op`, retrying transient errors with backoff. Permanent errors and
    /// the last transient error are returned as-is.
    pub async fn retry<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, RelayError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RelayError>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    attempt += 1;
                    let delay = self.delay_for_attempt(attempt);
                    tracing::warn!(
                        op = what,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> Backoff {
        Backoff {
            initial_delay_ms: 100,
            max_delay_ms: 500,
            multiplier: 2.0,
            max_retries: 3,
            jitter: 0.25,
        }
    }

    #[test]
    fn exponential_growth_without_jitter() {
        let b = fast();
        assert_eq!(b.delay_with_sample(0, 0.5), Duration::ZERO);
        assert_eq!(b.delay_with_sample(1, 0.5), Duration::from_millis(100));
        assert_eq!(b.delay_with_sample(2, 0.5), Duration::from_millis(200));
        assert_eq!(b.delay_with_sample(3, 0.5), Duration::from_millis(400));
        assert_eq!(b.delay_with_sample(4, 0.5), Duration::from_millis(500));
    }

    #[test]
    fn jitter_bounds() {
        let b = fast();
        assert_eq!(b.delay_with_sample(1, 0.0), Duration::from_millis(75));
        assert_eq!(b.delay_with_sample(1, 1.0), Duration::from_millis(125));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = fast()
            .retry("append", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(RelayError::io("storage unavailable"))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_retries() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = fast()
            .retry("append", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(RelayError::io("down")) }
            })
            .await;
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Io);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = fast()
            .retry("append", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(RelayError::overflow("full")) }
            })
            .await;
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Overflow);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
