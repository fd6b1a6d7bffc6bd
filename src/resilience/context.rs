//! Per-call cancellation and deadline.
//!
//! Every backend-facing operation takes a [`CallContext`]. Waiting on
//! [`CallContext::done`] resolves when the caller cancels or the deadline
//! passes, so in-flight HTTP requests and subprocesses can be dropped promptly.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::errors::{Result, VaultkeeperError};

#[derive(Debug, Clone, Default)]
pub struct CallContext {
    token: CancellationToken,
    deadline: Option<Instant>,
    bypass_cache: bool,
    /// Identity the call is made on behalf of, checked by access policies
    principal: Option<Arc<str>>,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an existing cancellation token, e.g. the daemon's shutdown token.
    pub fn from_token(token: CancellationToken) -> Self {
        Self { token, ..Self::default() }
    }

    /// Child context with an additional timeout. The earlier deadline wins.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(existing) if existing < deadline => existing,
            _ => deadline,
        };
        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
            bypass_cache: self.bypass_cache,
            principal: self.principal.clone(),
        }
    }

    /// Same cancellation, but read-through caches are skipped.
    pub fn fresh(&self) -> Self {
        Self { bypass_cache: true, ..self.clone() }
    }

    /// Context that ignores this one's cancellation, bounded by `timeout`.
    ///
    /// Used for compensating work (rollback) that must run even after the
    /// caller gave up.
    pub fn detached(&self, timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: Some(Instant::now() + timeout),
            bypass_cache: true,
            principal: self.principal.clone(),
        }
    }

    /// Same context, acting on behalf of `principal`.
    pub fn with_principal(&self, principal: impl Into<Arc<str>>) -> Self {
        Self { principal: Some(principal.into()), ..self.clone() }
    }

    pub fn principal(&self) -> Option<&str> {
        self.principal.as_deref()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn bypass_cache(&self) -> bool {
        self.bypass_cache
    }

    /// Time left before the deadline, if one is set.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn is_done(&self) -> bool {
        self.token.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Resolves once cancelled or past the deadline.
    pub async fn done(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.token.cancelled().await,
        }
    }

    /// Fail with `Cancelled` if the context is already done.
    pub fn check(&self, operation: &str) -> Result<()> {
        if self.is_done() {
            return Err(VaultkeeperError::cancelled(operation));
        }
        Ok(())
    }

    /// Run `fut`, aborting it with `Cancelled` when the context finishes first.
    pub async fn run<T, F>(&self, operation: &str, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        self.check(operation)?;
        tokio::select! {
            biased;
            _ = self.done() => Err(VaultkeeperError::cancelled(operation)),
            result = fut => result,
        }
    }

    /// Sleep for `duration` unless cancelled first.
    pub async fn sleep(&self, operation: &str, duration: Duration) -> Result<()> {
        self.run(operation, async {
            tokio::time::sleep(duration).await;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_completes_when_not_cancelled() {
        let ctx = CallContext::new();
        let value = ctx.run("op", async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_cancel_aborts_pending_future() {
        let ctx = CallContext::new();
        let child = ctx.clone();
        let handle = tokio::spawn(async move {
            child.run("slow_call", std::future::pending::<Result<()>>()).await
        });
        ctx.cancel();
        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, VaultkeeperError::Cancelled { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_expires() {
        let ctx = CallContext::new().with_timeout(Duration::from_secs(2));
        let err = ctx.sleep("wait", Duration::from_secs(10)).await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(ctx.is_done());
    }

    #[tokio::test(start_paused = true)]
    async fn test_earlier_deadline_wins() {
        let ctx = CallContext::new().with_timeout(Duration::from_secs(1));
        let child = ctx.with_timeout(Duration::from_secs(60));
        assert!(child.remaining().unwrap() <= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_detached_ignores_parent_cancel() {
        let ctx = CallContext::new();
        ctx.cancel();
        let detached = ctx.detached(Duration::from_secs(5));
        assert!(!detached.is_done());
        assert!(detached.bypass_cache());
    }

    #[test]
    fn test_principal_survives_derived_contexts() {
        let ctx = CallContext::new().with_principal("payments");
        assert_eq!(ctx.with_timeout(Duration::from_secs(5)).principal(), Some("payments"));
        assert_eq!(ctx.fresh().principal(), Some("payments"));
        assert_eq!(ctx.detached(Duration::from_secs(5)).principal(), Some("payments"));
        assert_eq!(CallContext::new().principal(), None);
    }

    #[test]
    fn test_child_cancelled_with_parent() {
        let ctx = CallContext::new();
        let child = ctx.with_timeout(Duration::from_secs(60));
        ctx.cancel();
        assert!(child.check("op").is_err());
    }
}
