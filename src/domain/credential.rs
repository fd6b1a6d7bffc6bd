//! Short-lived access credentials.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::secrets::SecretString;

/// Tokens expiring within this window are treated as already expired.
pub const DEFAULT_EXPIRY_GRACE: Duration = Duration::from_secs(30);

/// Where a credential came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CredentialSourceKind {
    Static,
    Executable,
    MetadataService,
}

impl CredentialSourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Static => "STATIC",
            Self::Executable => "EXECUTABLE",
            Self::MetadataService => "METADATA_SERVICE",
        }
    }
}

impl fmt::Display for CredentialSourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A resolved bearer token. The value is redacted in Debug and serialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CredentialToken {
    pub value: SecretString,
    pub expires_at: DateTime<Utc>,
    pub source: CredentialSourceKind,
}

impl CredentialToken {
    pub fn new(
        value: impl Into<SecretString>,
        expires_at: DateTime<Utc>,
        source: CredentialSourceKind,
    ) -> Self {
        Self { value: value.into(), expires_at, source }
    }

    /// Usable iff `expires_at` is later than `now + grace`.
    pub fn is_usable_at(&self, now: DateTime<Utc>, grace: Duration) -> bool {
        let grace = chrono::Duration::from_std(grace).unwrap_or(chrono::Duration::MAX);
        match now.checked_add_signed(grace) {
            Some(deadline) => self.expires_at > deadline,
            None => false,
        }
    }

    pub fn is_usable(&self, grace: Duration) -> bool {
        self.is_usable_at(Utc::now(), grace)
    }

    /// `Authorization` header value.
    pub fn bearer_header(&self) -> String {
        format!("Bearer {}", self.value.expose_secret())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grace_window() {
        let now = Utc::now();
        let token = CredentialToken::new(
            "abc",
            now + chrono::Duration::seconds(20),
            CredentialSourceKind::Static,
        );
        assert!(!token.is_usable_at(now, DEFAULT_EXPIRY_GRACE));
        assert!(token.is_usable_at(now, Duration::from_secs(10)));

        let long = CredentialToken::new(
            "abc",
            now + chrono::Duration::hours(1),
            CredentialSourceKind::Executable,
        );
        assert!(long.is_usable_at(now, DEFAULT_EXPIRY_GRACE));
    }

    #[test]
    fn test_token_never_leaks_value() {
        let token = CredentialToken::new(
            "super-secret-token",
            Utc::now(),
            CredentialSourceKind::MetadataService,
        );
        assert!(!format!("{:?}", token).contains("super-secret-token"));
        assert!(!serde_json::to_string(&token).unwrap().contains("super-secret-token"));
        assert_eq!(token.bearer_header(), "Bearer super-secret-token");
    }

    #[test]
    fn test_source_kind_display() {
        assert_eq!(CredentialSourceKind::MetadataService.to_string(), "METADATA_SERVICE");
    }
}
