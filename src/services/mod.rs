//! Secret lifecycle services
//!
//! Everything here talks to backends only through the traits in
//! [`crate::secrets`], so the same services run against the hosted backends
//! (wrapped in the resilience decorators) and the in-memory ones.

pub mod backup_archiver;
pub mod compliance;
pub mod rotation;
pub mod secret_cipher;

pub use backup_archiver::{BackupArchiver, BackupDocument, BackupMetadata};
pub use compliance::{AuditReport, ComplianceAuditor, ComplianceScanner, RemediationReport};
pub use rotation::{
    ProbeOutcome, ProbeSet, RotationCoordinator, RotationRequest, RotationScheduler,
    SchedulerSummary,
};
pub use secret_cipher::SecretCipher;
