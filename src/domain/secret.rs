//! Secret domain types
//!
//! A [`Secret`] is the long-lived container managed by the backend store; its
//! payload lives in an append-only series of [`SecretVersion`]s. Rotation adds a
//! version and disables the previous one, so history is never rewritten.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use super::id::BackupId;

/// Label carrying the declared secret type
pub const SECRET_TYPE_LABEL: &str = "type";

/// Annotation keys read and written by vaultkeeper.
pub mod annotations {
    pub const LAST_ROTATED_AT: &str = "vaultkeeper-last-rotated-at";
    pub const AUDIT_LOG: &str = "vaultkeeper-audit-log";
    pub const BACKUP_INTERVAL_HOURS: &str = "vaultkeeper-backup-interval-hours";
    pub const BACKUP_RETENTION_DAYS: &str = "vaultkeeper-backup-retention-days";
    /// URL an API key is tested against
    pub const PROBE_URL: &str = "vaultkeeper-probe-url";
    /// OAuth token endpoint for client-credential tests
    pub const TOKEN_URL: &str = "vaultkeeper-token-url";
    pub const CLIENT_ID: &str = "vaultkeeper-client-id";
    pub const DB_HOST: &str = "vaultkeeper-db-host";
    pub const DB_PORT: &str = "vaultkeeper-db-port";
    pub const DB_NAME: &str = "vaultkeeper-db-name";
    pub const DB_USER: &str = "vaultkeeper-db-user";
}

static SECRET_NAME_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9_-]{1,255}$").expect("secret name pattern is a valid regex")
});

/// Returns true when `name` is an acceptable secret identifier.
pub fn is_valid_secret_name(name: &str) -> bool {
    SECRET_NAME_REGEX.is_match(name)
}

/// Declared kind of credential stored in a secret.
///
/// Drives which connectivity probe runs while a rotation is in TESTING.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretType {
    /// Database connection credential (password or full connection URL)
    Database,
    /// API key presented to an HTTP service
    ApiKey,
    /// OAuth client secret exchanged at a token endpoint
    #[serde(rename = "oauth")]
    OAuth,
    /// Anything else; probes are skipped for this type
    Unknown,
}

impl SecretType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Database => "database",
            Self::ApiKey => "api_key",
            Self::OAuth => "oauth",
            Self::Unknown => "unknown",
        }
    }

    /// Resolve the type from a secret's labels, falling back to `Unknown`.
    pub fn from_labels(labels: &BTreeMap<String, String>) -> Self {
        labels.get(SECRET_TYPE_LABEL).and_then(|v| v.parse().ok()).unwrap_or(Self::Unknown)
    }
}

impl FromStr for SecretType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "database" | "db" => Ok(Self::Database),
            "api_key" | "api-key" | "apikey" => Ok(Self::ApiKey),
            "oauth" | "oauth2" => Ok(Self::OAuth),
            "unknown" => Ok(Self::Unknown),
            _ => Err(format!("Unknown secret type: {}", s)),
        }
    }
}

impl fmt::Display for SecretType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle state of a single version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VersionState {
    Enabled,
    Disabled,
    Destroyed,
}

impl VersionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enabled => "ENABLED",
            Self::Disabled => "DISABLED",
            Self::Destroyed => "DESTROYED",
        }
    }
}

impl FromStr for VersionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ENABLED" => Ok(Self::Enabled),
            "DISABLED" => Ok(Self::Disabled),
            "DESTROYED" => Ok(Self::Destroyed),
            _ => Err(format!("Unknown version state: {}", s)),
        }
    }
}

impl fmt::Display for VersionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Minimum spacing between rotations plus the time of the last one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationPolicy {
    pub period: Duration,
    pub last_rotated_at: Option<DateTime<Utc>>,
}

impl RotationPolicy {
    pub fn new(period: Duration) -> Self {
        Self { period, last_rotated_at: None }
    }

    /// Earliest instant at which the next unforced rotation may start.
    ///
    /// `None` means the secret has never been rotated and may rotate now.
    pub fn next_allowed_at(&self) -> Option<DateTime<Utc>> {
        let last = self.last_rotated_at?;
        let period = chrono::Duration::from_std(self.period).unwrap_or(chrono::Duration::MAX);
        Some(last.checked_add_signed(period).unwrap_or(DateTime::<Utc>::MAX_UTC))
    }

    /// True when `now - last_rotated_at < period`.
    pub fn is_too_soon(&self, now: DateTime<Utc>) -> bool {
        self.next_allowed_at().is_some_and(|next| now < next)
    }

    /// True when a rotation is owed: never rotated, or the period has fully elapsed.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.is_too_soon(now)
    }
}

/// How the backend replicates the secret's payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ReplicationMode {
    Automatic,
    UserManaged {
        locations: Vec<String>,
    },
    #[default]
    Unspecified,
}

impl ReplicationMode {
    pub fn is_configured(&self) -> bool {
        match self {
            Self::Automatic => true,
            Self::UserManaged { locations } => !locations.is_empty(),
            Self::Unspecified => false,
        }
    }
}

/// Customer-managed key wrapping the secret's payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionConfig {
    /// Full KMS key resource name
    pub kms_key_name: String,
}

/// Declared backup cadence for a secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupPolicy {
    pub interval: Duration,
    pub retention_days: u32,
}

/// A managed secret and the configuration the compliance checks read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Secret {
    /// Short name, unique within the project
    pub name: String,
    /// Full resource path, e.g. `projects/p/secrets/db-password`
    pub resource_path: String,
    pub labels: BTreeMap<String, String>,
    pub secret_type: SecretType,
    pub rotation_policy: Option<RotationPolicy>,
    pub replication: ReplicationMode,
    pub encryption: Option<EncryptionConfig>,
    /// Pub/Sub topic or log sink receiving access events
    pub audit_log_destination: Option<String>,
    pub backup_policy: Option<BackupPolicy>,
    /// IAM members holding accessor roles on the secret
    pub access_members: Vec<String>,
    /// Free-form metadata, e.g. connection details for post-rotation tests
    pub annotations: BTreeMap<String, String>,
    pub created_at: Option<DateTime<Utc>>,
}

impl Secret {
    /// Create a bare secret with no policies attached.
    pub fn new(name: impl Into<String>, resource_path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            resource_path: resource_path.into(),
            labels: BTreeMap::new(),
            secret_type: SecretType::Unknown,
            rotation_policy: None,
            replication: ReplicationMode::Unspecified,
            encryption: None,
            audit_log_destination: None,
            backup_policy: None,
            access_members: Vec::new(),
            annotations: BTreeMap::new(),
            created_at: None,
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_type(mut self, secret_type: SecretType) -> Self {
        self.secret_type = secret_type;
        self
    }

    pub fn with_rotation_policy(mut self, policy: RotationPolicy) -> Self {
        self.rotation_policy = Some(policy);
        self
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }
}

/// Which version of a secret to read.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VersionSelector {
    Latest,
    Id(String),
}

impl VersionSelector {
    /// Path segment used by the backend API (`latest` or the version number).
    pub fn as_path_segment(&self) -> &str {
        match self {
            Self::Latest => "latest",
            Self::Id(id) => id.rsplit('/').next().unwrap_or(id),
        }
    }
}

impl fmt::Display for VersionSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_path_segment())
    }
}

/// One immutable version of a secret's payload.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretVersion {
    /// Full version resource path, e.g. `projects/p/secrets/s/versions/3`
    pub id: String,
    pub secret_name: String,
    /// Stored bytes; an envelope when a cipher is configured
    pub payload_ciphertext: Vec<u8>,
    /// CRC32C over `payload_ciphertext`
    pub checksum: u32,
    pub state: VersionState,
    pub created_at: DateTime<Utc>,
}

impl SecretVersion {
    /// Trailing version number parsed from the resource path.
    pub fn number(&self) -> Option<u64> {
        self.id.rsplit('/').next().and_then(|n| n.parse().ok())
    }

    pub fn is_enabled(&self) -> bool {
        self.state == VersionState::Enabled
    }
}

impl fmt::Debug for SecretVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretVersion")
            .field("id", &self.id)
            .field("secret_name", &self.secret_name)
            .field("payload_len", &self.payload_ciphertext.len())
            .field("checksum", &self.checksum)
            .field("state", &self.state)
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// Reference to a snapshot archived in object storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: BackupId,
    pub secret_name: String,
    /// Version that was latest when the snapshot was taken
    pub version_id: String,
    pub bucket: String,
    pub object_key: String,
    pub created_at: DateTime<Utc>,
    /// Whether the archived document was sealed with the secret cipher
    pub encrypted: bool,
}
