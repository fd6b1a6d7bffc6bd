//! Per-secret access policies and the audit trail of payload reads.

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Wildcard entry in `allowed_principals`.
pub const ANY_PRINCIPAL: &str = "*";

/// Who may read a secret's payload, and when.
///
/// Denials win over allowances. Hours (0-23) and days (0 = Sunday) are
/// evaluated in UTC; an empty list places no restriction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessPolicy {
    pub allowed_principals: Vec<String>,
    pub denied_principals: Vec<String>,
    pub allowed_hours: Vec<u32>,
    pub allowed_days: Vec<u32>,
}

impl AccessPolicy {
    /// Policy admitting the given principals at any time.
    pub fn allow<I, S>(principals: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed_principals: principals.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn evaluate(&self, principal: &str, now: DateTime<Utc>) -> Result<(), DenialReason> {
        if self.denied_principals.iter().any(|p| p == principal) {
            return Err(DenialReason::ExplicitlyDenied);
        }
        if !self.allowed_principals.iter().any(|p| p == principal || p == ANY_PRINCIPAL) {
            return Err(DenialReason::NotAllowed);
        }
        let hour_ok = self.allowed_hours.is_empty() || self.allowed_hours.contains(&now.hour());
        let day = now.weekday().num_days_from_sunday();
        let day_ok = self.allowed_days.is_empty() || self.allowed_days.contains(&day);
        if !(hour_ok && day_ok) {
            return Err(DenialReason::OutsideAllowedTime);
        }
        Ok(())
    }

    /// Hours and days outside their valid ranges, for config validation.
    pub fn invalid_time_entries(&self) -> Vec<String> {
        let hours = self.allowed_hours.iter().filter(|h| **h > 23).map(|h| format!("hour {h}"));
        let days = self.allowed_days.iter().filter(|d| **d > 6).map(|d| format!("day {d}"));
        hours.chain(days).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    ExplicitlyDenied,
    NotAllowed,
    OutsideAllowedTime,
    RateLimited,
}

impl DenialReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExplicitlyDenied => "explicitly_denied",
            Self::NotAllowed => "not_allowed",
            Self::OutsideAllowedTime => "outside_allowed_time",
            Self::RateLimited => "rate_limited",
        }
    }
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "result", content = "reason")]
pub enum AccessOutcome {
    Granted,
    Denied(DenialReason),
    /// Access was permitted but the backend read failed
    Failed,
}

impl AccessOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Granted => "granted",
            Self::Denied(_) => "denied",
            Self::Failed => "failed",
        }
    }
}

/// One payload read, successful or not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessAuditEntry {
    pub at: DateTime<Utc>,
    pub principal: String,
    pub secret: String,
    /// Requested selector, e.g. `latest` or a version number
    pub selector: String,
    /// Resolved version id when the read succeeded
    pub version_id: Option<String>,
    pub outcome: AccessOutcome,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    // 2026-03-04 was a Wednesday.
    fn wednesday_at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 4, hour, 15, 0).unwrap()
    }

    #[test]
    fn test_denial_wins_over_wildcard() {
        let policy = AccessPolicy {
            allowed_principals: vec![ANY_PRINCIPAL.to_string()],
            denied_principals: vec!["ci-bot".to_string()],
            ..Default::default()
        };
        assert_eq!(
            policy.evaluate("ci-bot", wednesday_at(10)),
            Err(DenialReason::ExplicitlyDenied)
        );
        assert_eq!(policy.evaluate("payments", wednesday_at(10)), Ok(()));
    }

    #[test]
    fn test_unlisted_principal_rejected() {
        let policy = AccessPolicy::allow(["payments"]);
        assert_eq!(policy.evaluate("reporting", wednesday_at(10)), Err(DenialReason::NotAllowed));
        assert_eq!(
            AccessPolicy::default().evaluate("payments", wednesday_at(10)),
            Err(DenialReason::NotAllowed)
        );
    }

    #[test]
    fn test_business_hours_window() {
        let policy = AccessPolicy {
            allowed_hours: (9..18).collect(),
            allowed_days: vec![1, 2, 3, 4, 5],
            ..AccessPolicy::allow(["payments"])
        };
        assert_eq!(policy.evaluate("payments", wednesday_at(9)), Ok(()));
        assert_eq!(
            policy.evaluate("payments", wednesday_at(22)),
            Err(DenialReason::OutsideAllowedTime)
        );

        let sunday = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();
        assert_eq!(policy.evaluate("payments", sunday), Err(DenialReason::OutsideAllowedTime));
    }

    #[test]
    fn test_out_of_range_time_entries_reported() {
        let policy = AccessPolicy {
            allowed_hours: vec![8, 24],
            allowed_days: vec![7],
            ..Default::default()
        };
        assert_eq!(policy.invalid_time_entries(), vec!["hour 24", "day 7"]);
    }
}
