//! Rotation stages as types
//!
//! Every stage is its own type and each transition consumes the previous one,
//! so a run cannot reach TESTING without a backup and a new version in hand,
//! and cannot commit without passing verification. A failed transition hands
//! back a [`StageFailure`] holding what the rollback needs.

use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{debug, info, Span};

use super::probes::{ProbeOutcome, ProbeSet};
use crate::domain::{
    BackupRecord, RotationJobId, RotationReport, RotationState, Secret, SecretVersion,
    StageTransition, VersionSelector,
};
use crate::errors::{Result, VaultkeeperError};
use crate::resilience::CallContext;
use crate::secrets::{SecretStore, SecretString};
use crate::services::backup_archiver::BackupArchiver;
use crate::services::secret_cipher::SecretCipher;

/// Stage history of one run.
#[derive(Debug)]
pub(crate) struct Journal {
    pub job_id: RotationJobId,
    pub secret_name: String,
    pub forced: bool,
    pub started_at: DateTime<Utc>,
    pub current: RotationState,
    pub transitions: Vec<StageTransition>,
    span: Span,
}

impl Journal {
    pub fn new(secret_name: &str, forced: bool) -> Self {
        let started_at = Utc::now();
        let job_id = RotationJobId::new();
        let span = crate::rotation_span!(secret_name, job_id, forced = forced);
        Self {
            job_id,
            secret_name: secret_name.to_string(),
            forced,
            started_at,
            current: RotationState::Idle,
            transitions: vec![StageTransition {
                state: RotationState::Idle,
                entered_at: started_at,
            }],
            span,
        }
    }

    pub fn span(&self) -> Span {
        self.span.clone()
    }

    pub fn enter(&mut self, state: RotationState) {
        self.current = state;
        self.transitions.push(StageTransition { state, entered_at: Utc::now() });
        self.span.record("stage", state.as_str());
        debug!(secret = %self.secret_name, stage = %state, "Entered rotation stage");
    }

    pub fn visited(&self) -> Vec<RotationState> {
        self.transitions.iter().map(|t| t.state).collect()
    }
}

/// A stage failed. `backup` is present once BACKING_UP completed.
#[derive(Debug)]
pub(crate) struct StageFailure {
    pub journal: Journal,
    pub error: VaultkeeperError,
    pub backup: Option<BackupRecord>,
    /// Version added during ROTATING, disabled by the rollback
    pub failed_version: Option<String>,
}

impl StageFailure {
    pub fn stage(&self) -> RotationState {
        self.journal.current
    }
}

pub(crate) struct Validated {
    secret: Secret,
}

pub(crate) struct BackedUp {
    secret: Secret,
    backup: BackupRecord,
}

pub(crate) struct Rotated {
    secret: Secret,
    backup: BackupRecord,
    new_version: SecretVersion,
    credential: SecretString,
}

pub(crate) struct Tested {
    secret: Secret,
    backup: BackupRecord,
    new_version: SecretVersion,
    probe: ProbeOutcome,
}

pub(crate) struct Verified {
    backup: BackupRecord,
    new_version: SecretVersion,
    probe: ProbeOutcome,
}

pub(crate) struct RotationRun<S> {
    journal: Journal,
    stage: S,
}

fn fail(
    journal: Journal,
    error: VaultkeeperError,
    backup: Option<BackupRecord>,
    failed_version: Option<String>,
) -> StageFailure {
    StageFailure { journal, error, backup, failed_version }
}

impl RotationRun<Validated> {
    /// Continue a run whose VALIDATING checks (lock, period) passed.
    pub fn validated(journal: Journal, secret: Secret) -> Self {
        debug_assert_eq!(journal.current, RotationState::Validating);
        Self { journal, stage: Validated { secret } }
    }

    /// BACKING_UP: snapshot the current version. Nothing is mutated on failure.
    pub async fn back_up(
        mut self,
        ctx: &CallContext,
        archiver: &BackupArchiver,
    ) -> std::result::Result<RotationRun<BackedUp>, StageFailure> {
        self.journal.enter(RotationState::BackingUp);
        let secret = self.stage.secret;
        match archiver.backup(ctx, &secret.name).await {
            Ok(backup) => {
                Ok(RotationRun { journal: self.journal, stage: BackedUp { secret, backup } })
            }
            Err(e) => Err(fail(self.journal, e, None, None)),
        }
    }
}

impl RotationRun<BackedUp> {
    /// ROTATING: seal `credential` and append it as the new latest version.
    /// The previous version stays enabled.
    pub async fn rotate(
        mut self,
        ctx: &CallContext,
        store: &dyn SecretStore,
        cipher: &SecretCipher,
        credential: SecretString,
    ) -> std::result::Result<RotationRun<Rotated>, StageFailure> {
        self.journal.enter(RotationState::Rotating);
        let BackedUp { secret, backup } = self.stage;

        let envelope = match cipher.encrypt(ctx, credential.expose_secret().as_bytes()).await {
            Ok(envelope) => envelope,
            Err(e) => return Err(fail(self.journal, e, Some(backup), None)),
        };
        let new_version = match store.add_version(ctx, &secret.name, &envelope).await {
            Ok(version) => version,
            Err(e) => return Err(fail(self.journal, e, Some(backup), None)),
        };
        info!(secret = %secret.name, version = %new_version.id, "Added rotated version");

        Ok(RotationRun {
            journal: self.journal,
            stage: Rotated { secret, backup, new_version, credential },
        })
    }
}

impl RotationRun<Rotated> {
    /// TESTING: exercise the new credential with the probe for its type.
    pub async fn test(
        mut self,
        ctx: &CallContext,
        probes: &ProbeSet,
    ) -> std::result::Result<RotationRun<Tested>, StageFailure> {
        self.journal.enter(RotationState::Testing);
        let Rotated { secret, backup, new_version, credential } = self.stage;

        match probes.test(ctx, &secret, &credential).await {
            Ok(probe) => Ok(RotationRun {
                journal: self.journal,
                stage: Tested { secret, backup, new_version, probe },
            }),
            Err(e) => {
                let failed = Some(new_version.id);
                Err(fail(self.journal, e, Some(backup), failed))
            }
        }
    }
}

impl RotationRun<Tested> {
    /// VERIFYING: the new version must be the fresh `latest` and recent;
    /// then the previous version is disabled. Recording the rotation time is
    /// the last backend call, so a rolled-back rotation never moves
    /// `last_rotated_at`.
    pub async fn verify(
        mut self,
        ctx: &CallContext,
        store: &dyn SecretStore,
        window: Duration,
    ) -> std::result::Result<RotationRun<Verified>, StageFailure> {
        self.journal.enter(RotationState::Verifying);
        let Tested { secret, backup, new_version, probe } = self.stage;

        let result = verify_latest(ctx, store, &secret.name, &new_version, window).await;
        let result = match result {
            Ok(now) if backup.version_id != new_version.id => {
                store.disable_version(ctx, &backup.version_id).await.map(|()| now)
            }
            other => other,
        };
        let result = match result {
            Ok(now) => store.record_rotation(ctx, &secret.name, now).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => Ok(RotationRun {
                journal: self.journal,
                stage: Verified { backup, new_version, probe },
            }),
            Err(e) => {
                let failed = Some(new_version.id);
                Err(fail(self.journal, e, Some(backup), failed))
            }
        }
    }
}

async fn verify_latest(
    ctx: &CallContext,
    store: &dyn SecretStore,
    name: &str,
    expected: &SecretVersion,
    window: Duration,
) -> Result<DateTime<Utc>> {
    let latest = store.access_version(&ctx.fresh(), name, &VersionSelector::Latest).await?;
    if latest.id != expected.id {
        return Err(VaultkeeperError::backend(
            "verify_rotation",
            name,
            format!("latest version is {}, expected {}", latest.id, expected.id),
            false,
        ));
    }

    let now = Utc::now();
    let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX);
    if now.signed_duration_since(latest.created_at) > window {
        return Err(VaultkeeperError::backend(
            "verify_rotation",
            name,
            format!("latest version was created at {}, outside the window", latest.created_at),
            false,
        ));
    }
    Ok(now)
}

impl RotationRun<Verified> {
    /// COMMITTED: terminal.
    pub fn commit(mut self) -> (RotationReport, ProbeOutcome) {
        self.journal.enter(RotationState::Committed);
        let Verified { backup, new_version, probe } = self.stage;
        let journal = self.journal;
        let report = RotationReport {
            job_id: journal.job_id,
            secret_name: journal.secret_name,
            forced: journal.forced,
            backup_id: backup.id,
            previous_version: backup.version_id,
            new_version: new_version.id,
            transitions: journal.transitions,
            started_at: journal.started_at,
            completed_at: Utc::now(),
        };
        (report, probe)
    }
}
