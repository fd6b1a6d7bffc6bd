//! Bounded exponential-backoff retry.
//!
//! Only errors whose [`VaultkeeperError::is_retryable`] is true are retried.
//! Integrity violations, policy errors and cancellation surface immediately.
//! Once the attempt budget or the overall timeout is spent the last error is
//! wrapped in [`VaultkeeperError::RetriesExhausted`].

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::context::CallContext;
use crate::config::RetryConfig;
use crate::errors::{Result, VaultkeeperError};
use crate::observability::MetricsRecorder;

/// Backoff parameters. Defaults: 5 retries, 1s initial, 32s cap, x2, 10% jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    /// Fraction of the delay added or removed at random, 0.0..=1.0
    pub jitter: f64,
    /// Upper bound on the whole retry loop including sleeps
    pub overall_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(32),
            multiplier: 2.0,
            jitter: 0.1,
            overall_timeout: Some(Duration::from_secs(300)),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            multiplier: config.multiplier,
            jitter: config.jitter,
            overall_timeout: (config.overall_timeout_seconds > 0)
                .then(|| Duration::from_secs(config.overall_timeout_seconds)),
        }
    }

    /// No retries at all.
    pub fn none() -> Self {
        Self { max_retries: 0, ..Self::default() }
    }

    /// Un-jittered delay before retry number `retry` (0-based), capped.
    pub fn base_delay(&self, retry: u32) -> Duration {
        let exp = self.multiplier.powi(retry.min(i32::MAX as u32) as i32);
        let secs = (self.initial_backoff.as_secs_f64() * exp).min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// Delay with +/- jitter applied, still capped at `max_backoff`.
    pub fn delay_with_jitter(&self, retry: u32) -> Duration {
        let base = self.base_delay(retry).as_secs_f64();
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || base == 0.0 {
            return Duration::from_secs_f64(base);
        }
        let offset = base * jitter;
        let jittered = base - offset + rand::thread_rng().gen::<f64>() * 2.0 * offset;
        Duration::from_secs_f64(jittered.clamp(0.0, self.max_backoff.as_secs_f64()))
    }
}

#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    metrics: MetricsRecorder,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy, metrics: MetricsRecorder) -> Self {
        Self { policy, metrics }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `op` until it succeeds, fails permanently, or the budget runs out.
    ///
    /// `op` is invoked once per attempt; each attempt and each backoff sleep
    /// is abandoned as soon as `ctx` is cancelled.
    pub async fn execute<T, F, Fut>(
        &self,
        ctx: &CallContext,
        operation: &str,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let error = match ctx.run(operation, op()).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(
                            operation = %operation,
                            attempts = attempt,
                            "Operation succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            if !error.is_retryable() {
                return Err(error);
            }

            if attempt > self.policy.max_retries {
                return Err(self.exhausted(operation, attempt, error));
            }

            let delay = self.policy.delay_with_jitter(attempt - 1);
            if let Some(limit) = self.policy.overall_timeout {
                if started.elapsed() + delay > limit {
                    return Err(self.exhausted(operation, attempt, error));
                }
            }

            warn!(
                operation = %operation,
                attempt = attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Transient failure, retrying"
            );
            self.metrics.record_retry(operation);
            ctx.sleep(operation, delay).await?;
        }
    }

    fn exhausted(
        &self,
        operation: &str,
        attempts: u32,
        last: VaultkeeperError,
    ) -> VaultkeeperError {
        warn!(operation = %operation, attempts = attempts, error = %last, "Retries exhausted");
        VaultkeeperError::RetriesExhausted {
            operation: operation.to_string(),
            attempts,
            source: Box::new(last),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(40),
            multiplier: 2.0,
            jitter: 0.0,
            overall_timeout: None,
        }
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = fast_policy(10);
        assert_eq!(policy.base_delay(0), Duration::from_millis(10));
        assert_eq!(policy.base_delay(1), Duration::from_millis(20));
        assert_eq!(policy.base_delay(2), Duration::from_millis(40));
        assert_eq!(policy.base_delay(8), Duration::from_millis(40));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy::default();
        for retry in 0..6 {
            let base = policy.base_delay(retry).as_secs_f64();
            let delay = policy.delay_with_jitter(retry).as_secs_f64();
            assert!(delay >= base * 0.9 - 1e-9, "delay {} below bound for {}", delay, base);
            assert!(delay <= (base * 1.1).min(32.0) + 1e-9);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_then_succeeds() {
        let executor = RetryExecutor::new(fast_policy(3), MetricsRecorder::new());
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result = executor
            .execute(&CallContext::new(), "list_versions", || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(VaultkeeperError::transient("list_versions", "s", "503"))
                    } else {
                        Ok("ok")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_wraps_last_error() {
        let executor = RetryExecutor::new(fast_policy(2), MetricsRecorder::new());
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let err = executor
            .execute(&CallContext::new(), "get_secret", || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    let message = format!("fail {}", n);
                    Err::<(), _>(VaultkeeperError::transient("get_secret", "s", message))
                }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match err {
            VaultkeeperError::RetriesExhausted { attempts, source, .. } => {
                assert_eq!(attempts, 3);
                assert!(source.to_string().contains("fail 2"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_integrity_error_not_retried() {
        let executor = RetryExecutor::new(fast_policy(5), MetricsRecorder::new());
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let err = executor
            .execute(&CallContext::new(), "decrypt", || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(VaultkeeperError::integrity("decrypt", "k", Some(1), None)) }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, VaultkeeperError::IntegrityViolation { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let policy = RetryPolicy { initial_backoff: Duration::from_secs(30), ..fast_policy(5) };
        let executor = RetryExecutor::new(policy, MetricsRecorder::new());
        let ctx = CallContext::new();
        let canceller = ctx.clone();

        let handle = tokio::spawn(async move {
            executor
                .execute(&ctx, "add_version", || async {
                    Err::<(), _>(VaultkeeperError::transient("add_version", "s", "timeout"))
                })
                .await
        });

        tokio::task::yield_now().await;
        canceller.cancel();
        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, VaultkeeperError::Cancelled { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_overall_timeout_stops_loop() {
        let policy = RetryPolicy {
            max_retries: 100,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(1),
            multiplier: 1.0,
            jitter: 0.0,
            overall_timeout: Some(Duration::from_millis(2500)),
        };
        let executor = RetryExecutor::new(policy, MetricsRecorder::new());
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let err = executor
            .execute(&CallContext::new(), "put_object", || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(VaultkeeperError::transient("put_object", "b", "503")) }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, VaultkeeperError::RetriesExhausted { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
