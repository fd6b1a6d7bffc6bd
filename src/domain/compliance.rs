//! Compliance scan results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Violation severity, ordered from least to most serious.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }

    /// Severities at or above HIGH fail a scan.
    pub fn is_blocking(&self) -> bool {
        *self >= Self::High
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The individual policy checks a scan evaluates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplianceCheck {
    RotationPolicy,
    Encryption,
    AuditLog,
    Replication,
    RequiredLabels,
    BackupPolicy,
    PublicExposure,
}

impl ComplianceCheck {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RotationPolicy => "rotation_policy",
            Self::Encryption => "encryption",
            Self::AuditLog => "audit_log",
            Self::Replication => "replication",
            Self::RequiredLabels => "required_labels",
            Self::BackupPolicy => "backup_policy",
            Self::PublicExposure => "public_exposure",
        }
    }
}

impl fmt::Display for ComplianceCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub check: ComplianceCheck,
    pub severity: Severity,
    pub message: String,
}

impl Violation {
    pub fn new(check: ComplianceCheck, severity: Severity, message: impl Into<String>) -> Self {
        Self { check, severity, message: message.into() }
    }
}

/// Outcome of scanning one secret. Recomputed on every scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplianceResult {
    pub secret_name: String,
    pub scanned_at: DateTime<Utc>,
    pub passed: bool,
    /// In check evaluation order
    pub violations: Vec<Violation>,
}

impl ComplianceResult {
    /// Build a result; `passed` is derived from the violations.
    pub fn new(
        secret_name: impl Into<String>,
        scanned_at: DateTime<Utc>,
        violations: Vec<Violation>,
    ) -> Self {
        let passed = !violations.iter().any(|v| v.severity.is_blocking());
        Self { secret_name: secret_name.into(), scanned_at, passed, violations }
    }

    pub fn highest_severity(&self) -> Option<Severity> {
        self.violations.iter().map(|v| v.severity).max()
    }

    pub fn has_violation(&self, check: ComplianceCheck) -> bool {
        self.violations.iter().any(|v| v.check == check)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::Medium < Severity::High);
        assert!(Severity::High < Severity::Critical);
        assert!(!Severity::Medium.is_blocking());
        assert!(Severity::High.is_blocking());
    }

    #[test]
    fn test_passed_derived_from_violations() {
        let now = Utc::now();
        let ok = ComplianceResult::new(
            "s",
            now,
            vec![Violation::new(ComplianceCheck::RequiredLabels, Severity::Medium, "x")],
        );
        assert!(ok.passed);
        assert_eq!(ok.highest_severity(), Some(Severity::Medium));

        let failed = ComplianceResult::new(
            "s",
            now,
            vec![
                Violation::new(ComplianceCheck::BackupPolicy, Severity::Low, "x"),
                Violation::new(ComplianceCheck::Encryption, Severity::Critical, "y"),
            ],
        );
        assert!(!failed.passed);
        assert!(failed.has_violation(ComplianceCheck::Encryption));

        let clean = ComplianceResult::new("s", now, vec![]);
        assert!(clean.passed);
        assert_eq!(clean.highest_severity(), None);
    }
}
