//! Bounded exponential backoff driven by error kind.
//!
//! Every failure picks its policy from its own [`ErrorKind`], and attempts
//! are counted per kind. A call that is rate limited twice and then hits a
//! network fault has used two rate-limit attempts and one transient
//! attempt.

use quorum_core::{CallError, ErrorKind, RetryPolicy, RetryTable};
use rand::Rng;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

/// Applies the retry table around a single logical call.
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    table: RetryTable,
}

impl RetryExecutor {
    pub fn new(table: RetryTable) -> Self {
        Self { table }
    }

    /// Same table, but rate limits fail on first occurrence.
    ///
    /// Used inside rotation pools, where a rate-limited endpoint is swapped
    /// for another rather than waited on.
    pub fn without_rate_limit_retry(mut self) -> Self {
        self.table.rate_limit = RetryPolicy::never();
        self
    }

    pub fn policy_for(&self, kind: ErrorKind) -> RetryPolicy {
        self.table.policy_for(kind)
    }

    /// Un-jittered delays the executor would wait for repeated failures of
    /// one kind.
    pub fn schedule(&self, kind: ErrorKind) -> Vec<Duration> {
        self.policy_for(kind).schedule()
    }

    /// Delay before retry number `retry` (0-based) after `error`.
    ///
    /// Jitter, when enabled, scales the exponential delay uniformly within
    /// [0.5x, 1.5x]. A provider wait hint is a floor on the result.
    pub fn delay_after(&self, error: &CallError, retry: u32) -> Duration {
        let policy = self.policy_for(error.kind());
        let mut delay = policy.delay_for(retry);
        if policy.jitter {
            delay = jittered(delay);
        }
        match error.retry_after() {
            Some(hint) => delay.max(hint),
            None => delay,
        }
    }

    /// Run `call` until it succeeds, fails with a non-retryable kind, or
    /// exhausts the attempts allowed for the kind it last failed with.
    ///
    /// `call` receives the 1-based attempt number. The final failure is
    /// returned unchanged.
    pub async fn execute_with_retry<T, F, Fut>(&self, label: &str, mut call: F) -> Result<T, CallError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        let mut used: HashMap<ErrorKind, u32> = HashMap::new();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let error = match call(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            let kind = error.kind();
            let policy = self.policy_for(kind);
            let count = used.entry(kind).or_insert(0);
            *count += 1;

            if !kind.is_retryable() || *count >= policy.attempts() {
                if kind.is_retryable() {
                    tracing::warn!(
                        target_call = label,
                        %kind,
                        attempts = *count,
                        error = %error,
                        "Retries exhausted"
                    );
                }
                return Err(error);
            }

            let delay = self.delay_after(&error, *count - 1);
            tracing::debug!(
                target_call = label,
                %kind,
                attempt,
                delay = ?delay,
                error = %error,
                "Retrying after failure"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

fn jittered(delay: Duration) -> Duration {
    let factor: f64 = rand::thread_rng().gen_range(0.5..=1.5);
    delay.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn no_jitter() -> RetryExecutor {
        let mut table = RetryTable::default();
        table.transient.jitter = false;
        table.rate_limit.jitter = false;
        RetryExecutor::new(table)
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_exceeds_max_attempts() {
        let executor = no_jitter();
        let calls = AtomicU32::new(0);
        let started = Instant::now();

        let result: Result<(), _> = executor
            .execute_with_retry("exa", |_| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(CallError::transient("exa", "502"))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 1s + 2s of backoff
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_validation_is_never_retried() {
        let executor = RetryExecutor::default();
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = executor
            .execute_with_retry("exa", |_| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(CallError::Validation("empty query".into()))
            })
            .await;

        assert!(matches!(result, Err(CallError::Validation(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_execution_is_not_retried() {
        let executor = RetryExecutor::default();
        let calls = AtomicU32::new(0);

        let _: Result<(), _> = executor
            .execute_with_retry("kalshi", |_| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(CallError::execution("kalshi", "insufficient funds", false))
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failure() {
        let executor = RetryExecutor::default();

        let result = executor
            .execute_with_retry("exa", |attempt| async move {
                if attempt < 2 {
                    Err(CallError::transient("exa", "reset"))
                } else {
                    Ok(attempt)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_hint_is_a_floor() {
        let executor = no_jitter();
        let started = Instant::now();

        let result = executor
            .execute_with_retry("m1", |attempt| async move {
                if attempt == 1 {
                    Err(CallError::rate_limited("m1", Some(Duration::from_secs(7))))
                } else {
                    Ok(())
                }
            })
            .await;

        assert!(result.is_ok());
        assert_eq!(started.elapsed(), Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_counted_per_kind() {
        let executor = no_jitter();
        let calls = AtomicU32::new(0);

        // Two rate limits, then transient faults until the transient budget runs out
        let result: Result<(), _> = executor
            .execute_with_retry("m1", |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt <= 2 {
                        Err(CallError::rate_limited("m1", None))
                    } else {
                        Err(CallError::transient("m1", "reset"))
                    }
                }
            })
            .await;

        assert!(matches!(result, Err(CallError::Transient { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_without_rate_limit_retry() {
        let executor = RetryExecutor::default().without_rate_limit_retry();
        let calls = AtomicU32::new(0);

        let _: Result<(), _> = executor
            .execute_with_retry("pool", |_| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(CallError::rate_limited("pool", None))
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let executor = RetryExecutor::default();
        let error = CallError::transient("exa", "502");
        for retry in 0..4 {
            let base = executor.policy_for(ErrorKind::Transient).delay_for(retry);
            for _ in 0..50 {
                let delay = executor.delay_after(&error, retry);
                assert!(delay >= base.mul_f64(0.5) && delay <= base.mul_f64(1.5));
            }
        }
    }

    #[test]
    fn test_schedule_matches_table() {
        let executor = RetryExecutor::default();
        assert_eq!(
            executor.schedule(ErrorKind::RateLimit),
            vec![
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
                Duration::from_secs(16)
            ]
        );
        assert_eq!(
            executor.schedule(ErrorKind::ExecutionTransient),
            vec![Duration::from_millis(500)]
        );
        assert!(executor.schedule(ErrorKind::Validation).is_empty());
    }
}
