//! Retry wrapper for transient store failures.
//!
//! Only errors with [`Error::is_transient`] are retried (deadlocks, serialization
//! failures, outbox unique-violation races). Everything else surfaces immediately.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Retry settings for transient errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Upper bound on any delay, in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 50,
            max_delay_ms: 2_000,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    /// Delay before retry number `retry` (0-based): full jitter over `base * 2^retry`.
    #[must_use]
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = 1_u64.checked_shl(retry.min(63)).unwrap_or(u64::MAX);
        let ceiling = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        if ceiling == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(ceiling / 2..=ceiling))
    }
}

/// Runs `op`, retrying transient failures per `policy`.
///
/// # Errors
///
/// Returns the first non-transient error, or the last transient error once attempts
/// are exhausted.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, operation: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut retry = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(error) if error.is_transient() && retry + 1 < attempts => {
                let delay = policy.delay(retry);
                tracing::warn!(operation, retry, ?delay, %error, "transient failure; retrying");
                tokio::time::sleep(delay).await;
                retry += 1;
            }
            Err(error) => return Err(give_up(operation, retry, error)),
        }
    }
}

fn give_up(operation: &str, retry: u32, error: Error) -> Error {
    if retry > 0 {
        tracing::warn!(operation, retries = retry, %error, "giving up after retries");
    }
    error
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::error::TransientKind;

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried() -> Result<()> {
        let calls = AtomicU32::new(0);
        let value = with_retry(&RetryPolicy::default(), "test", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Error::transient(TransientKind::Deadlock, "deadlock detected"))
            } else {
                Ok(7)
            }
        })
        .await?;
        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_attempts_return_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry(&RetryPolicy::default(), "test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::transient(TransientKind::SerializationFailure, "could not serialize"))
        })
        .await;
        assert!(result.unwrap_err().is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry(&RetryPolicy::default(), "test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::validation("bad input"))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn delay_is_capped() {
        let policy = RetryPolicy::default();
        assert!(policy.delay(30) <= Duration::from_millis(2_000));
        assert_eq!(RetryPolicy::none().delay(3), Duration::ZERO);
    }
}
