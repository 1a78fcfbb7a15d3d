//! Retry policy with exponential backoff.
//!
//! Every remote call that may fail transiently (listing, metadata, fetch,
//! export) goes through [`RetryPolicy::run`], so attempt ceilings and backoff
//! behave the same everywhere.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{MirrorError, Result};

/// Default maximum attempts, including the first one.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(32);
const DEFAULT_MULTIPLIER: f64 = 2.0;

/// Upper bound of random jitter, as a fraction of the computed delay.
const JITTER_FRACTION: f64 = 0.25;

/// Attempt ceiling and backoff schedule.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            multiplier: DEFAULT_MULTIPLIER,
        }
    }
}

/// Result of a retried operation together with the attempts it took.
#[derive(Debug)]
pub struct Attempted<T> {
    pub result: Result<T>,
    pub attempts: u32,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            multiplier: DEFAULT_MULTIPLIER,
        }
    }

    /// A policy that retries without sleeping.
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO, Duration::ZERO)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Whether an error should be retried at all.
    pub fn is_retryable(&self, error: &MirrorError) -> bool {
        error.is_transient()
    }

    /// Delay before the attempt following `attempt` (1-indexed).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(30) as i32;
        let base = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = base.min(self.max_delay.as_secs_f64());
        if capped <= 0.0 {
            return Duration::ZERO;
        }
        let jitter = rand::thread_rng().gen_range(0.0..=capped * JITTER_FRACTION);
        Duration::from_secs_f64(capped + jitter)
    }

    /// Run `op` until it succeeds, fails permanently, or the ceiling is hit.
    ///
    /// `op` receives the 1-indexed attempt number. Backoff sleeps end early
    /// with [`MirrorError::Cancelled`] when `cancel` fires.
    pub async fn run<T, F, Fut>(&self, cancel: &CancellationToken, mut op: F) -> Attempted<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            if cancel.is_cancelled() {
                return Attempted {
                    result: Err(MirrorError::Cancelled),
                    attempts: attempt - 1,
                };
            }

            let error = match op(attempt).await {
                Ok(value) => {
                    return Attempted {
                        result: Ok(value),
                        attempts: attempt,
                    }
                }
                Err(e) => e,
            };

            if !self.is_retryable(&error) {
                return Attempted {
                    result: Err(error),
                    attempts: attempt,
                };
            }
            if attempt >= self.max_attempts {
                debug!(attempt, max = self.max_attempts, "max attempts reached");
                return Attempted {
                    result: Err(error),
                    attempts: attempt,
                };
            }

            let delay = self.delay_after(attempt);
            warn!(
                attempt,
                next_attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "transient failure, retrying"
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Attempted {
                        result: Err(MirrorError::Cancelled),
                        attempts: attempt,
                    };
                }
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn rate_limited() -> MirrorError {
        MirrorError::Transient {
            status: Some(429),
            message: "slow down".into(),
        }
    }

    #[test]
    fn test_delay_grows_and_caps() {
        let policy = RetryPolicy::new(10, Duration::from_millis(100), Duration::from_millis(400));
        let first = policy.delay_after(1);
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(125));
        let third = policy.delay_after(3);
        assert!(third >= Duration::from_millis(400) && third <= Duration::from_millis(500));
        let tenth = policy.delay_after(10);
        assert!(tenth <= Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let policy = RetryPolicy::immediate(5);
        let outcome = policy
            .run(&CancellationToken::new(), move |_| async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(rate_limited())
                } else {
                    Ok("done")
                }
            })
            .await;

        assert_eq!(outcome.result.unwrap(), "done");
        assert_eq!(outcome.attempts, 3);
    }

    #[tokio::test]
    async fn test_ceiling_is_exact() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let policy = RetryPolicy::immediate(4);
        let outcome: Attempted<()> = policy
            .run(&CancellationToken::new(), move |_| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(rate_limited())
            })
            .await;

        assert!(outcome.result.is_err());
        assert_eq!(outcome.attempts, 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_permission_is_not_retried() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let policy = RetryPolicy::immediate(5);
        let outcome: Attempted<()> = policy
            .run(&CancellationToken::new(), move |_| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(MirrorError::Permission("forbidden".into()))
            })
            .await;

        assert!(outcome.result.unwrap_err().is_permission());
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test]
    async fn test_cancel_stops_backoff() {
        let cancel = CancellationToken::new();
        let policy = RetryPolicy::new(5, Duration::from_secs(60), Duration::from_secs(60));
        let trigger = cancel.clone();
        let outcome: Attempted<()> = policy
            .run(&cancel, |_| {
                trigger.cancel();
                async { Err(rate_limited()) }
            })
            .await;

        assert!(matches!(outcome.result, Err(MirrorError::Cancelled)));
        assert_eq!(outcome.attempts, 1);
    }
}
