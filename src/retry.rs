//! Retry policy for provider round trips.
//!
//! Only errors classified retryable by [`crate::GatewayError::is_retryable`] are
//! re-issued: rate limits (429/402) and transient transport failures. The
//! backoff doubles per attempt, capped, and a server-sent `Retry-After`
//! overrides the computed delay.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::Result;

/// Bounded exponential backoff policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Policy for providers known to rate-limit aggressively: same attempt
    /// budget, longer initial wait.
    pub fn aggressive_rate_limits() -> Self {
        Self {
            base_delay: Duration::from_secs(3),
            ..Self::default()
        }
    }

    /// Run `operation` up to `max_attempts` times.
    ///
    /// Non-retryable errors return immediately. Between attempts the policy
    /// sleeps for the server's `Retry-After` when present, else the current
    /// backoff delay.
    pub async fn execute<F, Fut, T>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut delay = self.base_delay;
        let mut attempts = 0;

        loop {
            attempts += 1;
            match operation().await {
                Ok(v) => {
                    if attempts > 1 {
                        debug!(attempts, "request succeeded after retry");
                    }
                    return Ok(v);
                }
                Err(e) => {
                    if !e.is_retryable() {
                        return Err(e);
                    }
                    if attempts >= self.max_attempts {
                        warn!(attempts, error = %e, "giving up after retries");
                        return Err(e);
                    }

                    let wait = e.retry_after().unwrap_or(delay).min(self.max_delay);
                    warn!(
                        attempt = attempts,
                        max_attempts = self.max_attempts,
                        wait_ms = wait.as_millis() as u64,
                        error = %e,
                        "retryable error, backing off"
                    );
                    sleep(wait).await;
                    delay = (delay * 2).min(self.max_delay);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GatewayError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn test_succeeds_first_try() {
        let result = fast_policy().execute(|| async { Ok::<_, GatewayError>(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_retries_rate_limit_then_succeeds() {
        let count = Arc::new(AtomicU32::new(0));
        let count_clone = count.clone();
        let result = fast_policy()
            .execute(|| {
                let count = count_clone.clone();
                async move {
                    if count.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(GatewayError::RateLimited {
                            status: 429,
                            retry_after: None,
                            message: "slow down".into(),
                        })
                    } else {
                        Ok(7)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_with_status_preserved() {
        let count = Arc::new(AtomicU32::new(0));
        let count_clone = count.clone();
        let result = fast_policy()
            .execute(|| {
                let count = count_clone.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Err::<i32, _>(GatewayError::RateLimited {
                        status: 429,
                        retry_after: None,
                        message: "still limited".into(),
                    })
                }
            })
            .await;
        let err = result.unwrap_err();
        assert_eq!(err.status(), Some(429));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_returns_immediately() {
        let count = Arc::new(AtomicU32::new(0));
        let count_clone = count.clone();
        let result = fast_policy()
            .execute(|| {
                let count = count_clone.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Err::<i32, _>(GatewayError::Auth("bad key".into()))
                }
            })
            .await;
        assert!(matches!(result.unwrap_err(), GatewayError::Auth(_)));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_after_capped_by_max_delay() {
        // Retry-After of 60s would stall the test if the cap were ignored.
        let count = Arc::new(AtomicU32::new(0));
        let count_clone = count.clone();
        let policy = RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        };
        let result = policy
            .execute(|| {
                let count = count_clone.clone();
                async move {
                    if count.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(GatewayError::RateLimited {
                            status: 429,
                            retry_after: Some(Duration::from_secs(60)),
                            message: "wait".into(),
                        })
                    } else {
                        Ok(1)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 1);
    }

    #[test]
    fn test_aggressive_policy_waits_longer() {
        let policy = RetryPolicy::aggressive_rate_limits();
        assert_eq!(policy.base_delay, Duration::from_secs(3));
        assert_eq!(policy.max_attempts, RetryPolicy::default().max_attempts);
    }
}
