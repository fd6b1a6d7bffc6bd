//! Domain layer
//!
//! Plain data types shared by every service: secrets and their versions,
//! backup records, compliance results, credentials, access policies and
//! rotation reports.
//! Nothing in here performs I/O.

pub mod access;
pub mod compliance;
pub mod credential;
pub mod id;
pub mod rotation;
pub mod secret;

pub use access::{AccessAuditEntry, AccessOutcome, AccessPolicy, DenialReason, ANY_PRINCIPAL};
pub use compliance::{ComplianceCheck, ComplianceResult, Severity, Violation};
pub use credential::{CredentialSourceKind, CredentialToken, DEFAULT_EXPIRY_GRACE};
pub use id::{BackupId, RotationJobId};
pub use rotation::{RotationReport, RotationState, StageTransition};
pub use secret::{
    annotations, is_valid_secret_name, BackupPolicy, BackupRecord, EncryptionConfig,
    ReplicationMode, RotationPolicy, Secret, SecretType, SecretVersion, VersionSelector,
    VersionState, SECRET_TYPE_LABEL,
};
