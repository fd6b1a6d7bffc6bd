//! Rotation state names and the report a rotation run produces.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::id::{BackupId, RotationJobId};

/// Named states of the rotation state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RotationState {
    Idle,
    Validating,
    BackingUp,
    Rotating,
    Testing,
    Verifying,
    Committed,
    RolledBack,
}

impl RotationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Validating => "VALIDATING",
            Self::BackingUp => "BACKING_UP",
            Self::Rotating => "ROTATING",
            Self::Testing => "TESTING",
            Self::Verifying => "VERIFYING",
            Self::Committed => "COMMITTED",
            Self::RolledBack => "ROLLED_BACK",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack)
    }

    /// Failures in these states have already mutated the store and need rollback.
    pub fn requires_rollback(&self) -> bool {
        matches!(self, Self::Rotating | Self::Testing | Self::Verifying)
    }
}

impl fmt::Display for RotationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTransition {
    pub state: RotationState,
    pub entered_at: DateTime<Utc>,
}

/// Record of a committed rotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationReport {
    pub job_id: RotationJobId,
    pub secret_name: String,
    pub forced: bool,
    pub backup_id: BackupId,
    pub previous_version: String,
    pub new_version: String,
    pub transitions: Vec<StageTransition>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl RotationReport {
    pub fn duration(&self) -> chrono::Duration {
        self.completed_at - self.started_at
    }

    pub fn visited(&self) -> Vec<RotationState> {
        self.transitions.iter().map(|t| t.state).collect()
    }
}
