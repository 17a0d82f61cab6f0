// src/retry.rs
use crate::WalletError;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Retry policy for one logical operation. The default matches the
/// backend contract: three attempts, linear 25ms backoff, retrying only
/// transient conflicts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub retryable: fn(&WalletError) -> bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(25),
            retryable: WalletError::is_transient,
        }
    }
}

impl RetryPolicy {
    /// Linear backoff: base × number of failed attempts so far.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_backoff * attempt
    }
}

/// Runs `op` until it succeeds, fails non-transiently, or exhausts the
/// attempt budget. Each call to `op` must be a fresh transaction from the
/// first step: no locks or partial state survive between attempts, which
/// is what makes blind re-execution safe (idempotency absorbs the case
/// where the previous attempt actually committed).
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, WalletError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, WalletError>>,
{
    let mut attempt = 0u32;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;

                if attempt < policy.max_attempts && (policy.retryable)(&err) {
                    let backoff = policy.backoff(attempt);
                    warn!(
                        attempt = attempt + 1,
                        max_attempts = policy.max_attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        "retrying transaction after transient backend conflict"
                    );
                    tokio::time::sleep(backoff).await;
                    continue;
                }

                return Err(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn transient() -> WalletError {
        WalletError::TransientConflict("could not serialize access".into())
    }

    #[tokio::test]
    async fn first_success_needs_no_retry() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&RetryPolicy::default(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, WalletError>(7) }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_success() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&RetryPolicy::default(), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(transient())
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn attempts_are_bounded() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&RetryPolicy::default(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(transient()) }
        })
        .await;

        assert!(matches!(result, Err(WalletError::TransientConflict(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn domain_errors_propagate_without_retry() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&RetryPolicy::default(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(WalletError::InsufficientBalance) }
        })
        .await;

        assert!(matches!(result, Err(WalletError::InsufficientBalance)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn backoff_grows_linearly() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(25));
        assert_eq!(policy.backoff(2), Duration::from_millis(50));
    }
}
