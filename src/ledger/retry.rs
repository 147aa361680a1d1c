use std::future::Future;
use std::time::Duration;
use tracing::{error, warn};

use crate::config::RetryConfig;
use crate::error::{QuorumError, Result};

/// Bounded exponential backoff for transient ledger and bus failures
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_backoff: Duration::from_millis(config.base_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }

    /// base * 2^attempt, capped
    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        let base = self.base_backoff.as_millis() as u64;
        let delay = base.saturating_mul(2u64.saturating_pow(attempt));
        Duration::from_millis(delay.min(self.max_backoff.as_millis() as u64))
    }

    /// Run `op` until it succeeds, fails permanently, or the attempt budget is spent.
    ///
    /// Only transient failures are retried. Exhausting the budget yields the fatal
    /// `LedgerUnavailable`.
    pub async fn run<T, F, Fut>(&self, op_name: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() => {
                    attempt += 1;
                    if attempt >= self.max_attempts {
                        error!(op = op_name, attempts = attempt, error = %e, "retry budget exhausted");
                        return Err(QuorumError::LedgerUnavailable {
                            attempts: attempt,
                            reason: e.to_string(),
                        });
                    }
                    let delay = self.backoff_duration(attempt - 1);
                    warn!(
                        op = op_name,
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
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio_test::{assert_err, assert_ok};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
        }
    }

    #[test]
    fn test_backoff_calculation() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(1000),
        };
        assert_eq!(policy.backoff_duration(0), Duration::from_millis(100));
        assert_eq!(policy.backoff_duration(1), Duration::from_millis(200));
        assert_eq!(policy.backoff_duration(3), Duration::from_millis(800));
        assert_eq!(policy.backoff_duration(4), Duration::from_millis(1000));
        assert_eq!(policy.backoff_duration(40), Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = assert_ok!(
            fast_policy(5)
                .run("flaky", move || async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(QuorumError::TransientIo("store unreachable".into()))
                    } else {
                        Ok(42)
                    }
                })
                .await
        );
        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_is_fatal() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let err = assert_err!(
            fast_policy(3)
                .run("down", move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(QuorumError::TransientIo("connection refused".into()))
                })
                .await
        );
        assert!(err.is_fatal());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let err = fast_policy(5)
            .run("bad", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(QuorumError::Validation("nope".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, QuorumError::Validation(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
