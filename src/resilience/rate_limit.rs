//! Token-bucket limiter shared by every outbound backend call.
//!
//! `acquire` never fails for lack of tokens; it only adds latency. A caller
//! that finds the bucket empty reserves the next token (the balance goes
//! negative) and sleeps outside the lock until that token would have been
//! refilled, which serializes callers at the steady-state rate. The wait is
//! the full deficit however many callers are queued; only cancellation cuts
//! it short. With a zero refill rate no token ever arrives, so callers wait
//! `max_wait` and proceed.
//!
//! # Configuration
//!
//! - `VAULTKEEPER_RATE_LIMIT_MAX_TOKENS`: bucket capacity (default: 100)
//! - `VAULTKEEPER_RATE_LIMIT_REFILL_PER_SECOND`: refill rate (default: 10)

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use super::context::CallContext;
use crate::config::RateLimitConfig;
use crate::errors::Result;
use crate::observability::MetricsRecorder;

/// Snapshot of the bucket, mutated under the limiter's lock.
#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    max_tokens: f64,
    /// Tokens per second
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(max_tokens: u32, refill_rate: f64) -> Self {
        Self {
            tokens: max_tokens as f64,
            max_tokens: max_tokens as f64,
            refill_rate: refill_rate.max(0.0),
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.max_tokens);
        self.last_refill = now;
    }

    /// Take one token and return how long the caller must wait before using it.
    ///
    /// `max_wait` applies only when the bucket never refills.
    fn reserve(&mut self, now: Instant, max_wait: Duration) -> Duration {
        self.refill(now);
        let wait = if self.tokens >= 1.0 {
            Duration::ZERO
        } else if self.refill_rate > 0.0 {
            Duration::from_secs_f64((1.0 - self.tokens) / self.refill_rate)
        } else {
            max_wait
        };
        self.tokens -= 1.0;
        wait
    }
}

#[derive(Debug, Clone)]
pub struct RateLimiter {
    bucket: Arc<Mutex<TokenBucket>>,
    /// Wait applied when the refill rate is zero
    max_wait: Duration,
    metrics: MetricsRecorder,
}

impl RateLimiter {
    /// Create a limiter with a full bucket.
    pub fn new(max_tokens: u32, refill_rate: f64, max_wait: Duration) -> Self {
        Self {
            bucket: Arc::new(Mutex::new(TokenBucket::new(max_tokens, refill_rate))),
            max_wait,
            metrics: MetricsRecorder::new(),
        }
    }

    pub fn from_config(config: &RateLimitConfig, metrics: MetricsRecorder) -> Self {
        Self {
            metrics,
            ..Self::new(
                config.max_tokens,
                config.refill_per_second,
                Duration::from_millis(config.max_wait_ms),
            )
        }
    }

    /// Effectively unlimited; for tests and local tooling.
    pub fn unlimited() -> Self {
        Self::new(u32::MAX, f64::from(u32::MAX), Duration::ZERO)
    }

    /// Wait for a permit.
    ///
    /// Returns `Cancelled` if `ctx` finishes while waiting; the reserved token
    /// is handed back in that case.
    pub async fn acquire(&self, ctx: &CallContext) -> Result<()> {
        ctx.check("rate_limit_acquire")?;

        let wait = {
            let mut bucket = self.bucket.lock().await;
            bucket.reserve(Instant::now(), self.max_wait)
        };

        if wait.is_zero() {
            return Ok(());
        }

        debug!(wait_ms = wait.as_millis() as u64, "Rate limiter applying backpressure");
        self.metrics.record_rate_limit_wait(wait.as_secs_f64());

        if let Err(e) = ctx.sleep("rate_limit_acquire", wait).await {
            let mut bucket = self.bucket.lock().await;
            bucket.tokens = (bucket.tokens + 1.0).min(bucket.max_tokens);
            return Err(e);
        }
        Ok(())
    }

    /// Current token balance; negative while callers hold reservations.
    pub async fn available(&self) -> f64 {
        let mut bucket = self.bucket.lock().await;
        bucket.refill(Instant::now());
        bucket.tokens
    }
}
