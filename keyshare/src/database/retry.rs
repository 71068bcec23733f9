//! Retry helpers for lock contention on the write path.
//!
//! Every write goes through the single-connection write pool inside
//! `BEGIN IMMEDIATE`, so contention shows up as SQLITE_BUSY from other
//! processes sharing the file or from the busy timeout expiring.

use rand::random;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::Result;

/// Backoff schedule for busy/locked writes.
#[derive(Debug, Clone, Copy)]
pub struct BusyRetryPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BusyRetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 12,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl BusyRetryPolicy {
    /// Exponential delay for the given attempt, with up to 25% jitter, never
    /// above `max_delay`.
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let max_ms = self.max_delay.as_millis() as u64;
        let capped_ms = base_ms.saturating_mul(1u64 << attempt.min(16)).min(max_ms);
        let jitter_ms = random::<u64>() % (capped_ms / 4 + 1);
        Duration::from_millis((capped_ms + jitter_ms).min(max_ms))
    }

    /// Run `op` until it succeeds, fails with something other than lock
    /// contention, or the retry budget is spent.
    ///
    /// The operation must be safe to repeat: every write it makes has to
    /// live inside a transaction that the failure rolled back.
    pub async fn run<T, F, Fut>(&self, op_name: &'static str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0usize;
        loop {
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !err.is_lock_contention() {
                return Err(err);
            }
            if attempt >= self.max_retries {
                warn!(op = op_name, attempts = attempt + 1, "Giving up on busy database");
                return Err(err);
            }

            let delay = self.delay_for(attempt);
            attempt += 1;
            debug!(
                op = op_name,
                attempt,
                max_retries = self.max_retries,
                delay_ms = delay.as_millis() as u64,
                "Database busy, retrying"
            );
            sleep(delay).await;
        }
    }
}

/// [`BusyRetryPolicy::run`] with the default policy.
pub async fn retry_on_sqlite_busy<T, F, Fut>(op_name: &'static str, op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    BusyRetryPolicy::default().run(op_name, op).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn locked() -> Error {
        Error::Persistence(sqlx::Error::Protocol("database is locked".to_string()))
    }

    fn fast_policy(max_retries: usize) -> BusyRetryPolicy {
        BusyRetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = BusyRetryPolicy::default();
        for attempt in 0..40 {
            assert!(policy.delay_for(attempt) <= policy.max_delay);
        }
        assert!(policy.delay_for(0) >= policy.base_delay);
    }

    #[tokio::test]
    async fn test_busy_error_is_retried_until_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let result = fast_policy(5)
            .run("assign", || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(locked())
                    } else {
                        Ok(7u32)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_budget_is_bounded() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let result: Result<()> = fast_policy(3)
            .run("renew", || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(locked())
                }
            })
            .await;

        assert!(result.unwrap_err().is_lock_contention());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let result: Result<()> = retry_on_sqlite_busy("assign", || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(Error::PoolExhausted)
            }
        })
        .await;

        assert!(matches!(result, Err(Error::PoolExhausted)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
