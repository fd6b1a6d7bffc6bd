//! Periodic rotation of secrets whose policy says they are due.

use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use super::coordinator::{RotationCoordinator, RotationRequest};
use crate::domain::RotationReport;
use crate::errors::{Result, VaultkeeperError};
use crate::resilience::CallContext;

#[derive(Debug, Default)]
pub struct SchedulerSummary {
    pub rotated: Vec<RotationReport>,
    /// Secrets skipped because a rotation was running or not yet due
    pub skipped: Vec<String>,
    pub failed: Vec<(String, VaultkeeperError)>,
}

#[derive(Debug, Clone)]
pub struct RotationScheduler {
    coordinator: Arc<RotationCoordinator>,
}

impl RotationScheduler {
    pub fn new(coordinator: Arc<RotationCoordinator>) -> Self {
        Self { coordinator }
    }

    /// Rotate every secret with a rotation policy that is due now.
    ///
    /// Up to `rotation.max_concurrent_rotations` secrets rotate at once. On
    /// cancellation the rotations already started are drained so their
    /// rollbacks complete before the error is returned.
    pub async fn rotate_due(&self, ctx: &CallContext) -> Result<SchedulerSummary> {
        ctx.check("scheduled_rotation")?;
        let secrets = self.coordinator.store().list_secrets(&ctx.fresh()).await?;
        let now = Utc::now();
        let due: Vec<_> = secrets
            .into_iter()
            .filter(|s| s.rotation_policy.as_ref().is_some_and(|p| p.is_due(now)))
            .collect();
        debug!(due = due.len(), "Starting scheduled rotation pass");

        let limit = self.coordinator.config().max_concurrent_rotations.max(1);
        let mut outcomes = stream::iter(due)
            .map(|secret| async move {
                let result =
                    self.coordinator.rotate(ctx, &secret, RotationRequest::default()).await;
                (secret.name, result)
            })
            .buffer_unordered(limit);

        let mut summary = SchedulerSummary::default();
        let mut cancelled = None;
        while let Some((name, result)) = outcomes.next().await {
            match result {
                Ok(report) => summary.rotated.push(report),
                Err(
                    VaultkeeperError::RotationInProgress { .. }
                    | VaultkeeperError::RotationTooSoon { .. },
                ) => {
                    debug!(secret = %name, "Scheduled rotation skipped");
                    summary.skipped.push(name);
                }
                Err(e) if e.is_cancelled() => {
                    cancelled.get_or_insert(e);
                }
                Err(e) => {
                    error!(
                        secret = %name,
                        error = %e,
                        manual_intervention = e.requires_manual_intervention(),
                        "Scheduled rotation failed"
                    );
                    summary.failed.push((name, e));
                }
            }
        }
        if let Some(e) = cancelled {
            return Err(e);
        }

        info!(
            rotated = summary.rotated.len(),
            skipped = summary.skipped.len(),
            failed = summary.failed.len(),
            "Scheduled rotation pass complete"
        );
        Ok(summary)
    }

    /// Run [`Self::rotate_due`] on a fixed interval until `ctx` is cancelled.
    pub async fn run(&self, ctx: &CallContext, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ctx.done() => {
                    info!("Rotation scheduler stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.rotate_due(ctx).await {
                if e.is_cancelled() {
                    return;
                }
                error!(error = %e, "Scheduled rotation pass failed");
            }
        }
    }
}
