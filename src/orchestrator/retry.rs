use std::future::Future;

use tokio::time::{sleep, timeout, Duration};
use uuid::Uuid;

use crate::config;
use crate::executor::{SyncError, SyncStats};

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(300);
const DEFAULT_BACKOFF: Duration = Duration::from_millis(1000);

/// Attempts, per-attempt timeout and linear backoff for executor calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub attempt_timeout: Duration,
    /// Wait before attempt `n + 1` is `backoff * n`.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
            backoff: DEFAULT_BACKOFF,
        }
    }
}

impl RetryPolicy {
    pub fn from_env() -> Self {
        Self {
            max_attempts: *config::SYNC_MAX_ATTEMPTS,
            attempt_timeout: Duration::from_secs(*config::SYNC_ATTEMPT_TIMEOUT_SECS),
            backoff: Duration::from_millis(*config::SYNC_RETRY_BACKOFF_MS),
        }
    }

    pub fn backoff_after(&self, attempt: u32) -> Duration {
        self.backoff * attempt
    }

    /// Upper bound on how long one job can legitimately stay `processing`.
    pub fn worst_case_runtime(&self) -> Duration {
        let attempts = self.max_attempts.max(1);
        (self.attempt_timeout + self.backoff_after(attempts)) * attempts
    }
}

#[derive(Debug)]
pub struct RetryOutcome {
    pub result: Result<SyncStats, SyncError>,
    pub attempts: u32,
}

/// key: sync-retry -> bounded attempts under a hard per-attempt timeout
///
/// A timed-out attempt counts as a transient failure. Non-transient errors end the
/// loop on the spot.
pub async fn run_with_retry<F, Fut>(
    policy: &RetryPolicy,
    execution_id: Uuid,
    mut operation: F,
) -> RetryOutcome
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<SyncStats, SyncError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        tracing::debug!(%execution_id, attempt, max_attempts, "starting sync attempt");

        let result = match timeout(policy.attempt_timeout, operation(attempt)).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout(policy.attempt_timeout)),
        };

        match result {
            Ok(stats) => {
                if attempt > 1 {
                    tracing::info!(%execution_id, attempt, "sync succeeded after retry");
                }
                return RetryOutcome {
                    result: Ok(stats),
                    attempts: attempt,
                };
            }
            Err(err) if attempt < max_attempts && err.is_transient() => {
                tracing::warn!(
                    %execution_id,
                    attempt,
                    max_attempts,
                    error = %err,
                    "retryable sync failure"
                );
                sleep(policy.backoff_after(attempt)).await;
            }
            Err(err) => {
                return RetryOutcome {
                    result: Err(err),
                    attempts: attempt,
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            attempt_timeout: Duration::from_millis(50),
            backoff: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn transient_failures_are_retried_until_success() {
        let calls = AtomicU32::new(0);
        let outcome = run_with_retry(&fast_policy(), Uuid::new_v4(), |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err(SyncError::Transient("503".into()))
                } else {
                    Ok(SyncStats {
                        total_records: 7,
                        ..SyncStats::default()
                    })
                }
            }
        })
        .await;
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.result.unwrap().total_records, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn auth_errors_short_circuit() {
        let outcome = run_with_retry(&fast_policy(), Uuid::new_v4(), |_| async {
            Err(SyncError::AuthOrPermission("revoked".into()))
        })
        .await;
        assert_eq!(outcome.attempts, 1);
        assert!(matches!(
            outcome.result,
            Err(SyncError::AuthOrPermission(_))
        ));
    }

    #[tokio::test]
    async fn timeouts_consume_attempts() {
        let outcome = run_with_retry(&fast_policy(), Uuid::new_v4(), |_| async {
            sleep(Duration::from_secs(5)).await;
            Ok(SyncStats::default())
        })
        .await;
        assert_eq!(outcome.attempts, 3);
        assert!(matches!(outcome.result, Err(SyncError::Timeout(_))));
    }

    #[test]
    fn backoff_is_linear() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_after(1), Duration::from_millis(1000));
        assert_eq!(policy.backoff_after(3), Duration::from_millis(3000));
    }
}
