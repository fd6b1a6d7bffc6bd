//! Token extraction from executable output and metadata responses.
//!
//! JSON documents are searched for the configured token field first, then the
//! names used by the common providers (`access_token` for GCP and Azure,
//! `Token` for AWS). Expiry is read from `expires_at`, `Expiration`,
//! `expires_in` or `expires_on`; without one the source's default TTL applies.

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use serde_json::Value;
use std::fmt;

use crate::domain::{CredentialSourceKind, CredentialToken};
use crate::errors::{Result, VaultkeeperError};

use super::source::OutputFormat;

const TOKEN_FIELDS: &[&str] = &["access_token", "token", "Token", "AccessToken"];

/// Parse a token document produced by a credential source.
pub fn parse_token(
    kind: CredentialSourceKind,
    body: &str,
    format: OutputFormat,
    token_field: Option<&str>,
    default_ttl_seconds: u64,
    now: DateTime<Utc>,
) -> Result<CredentialToken> {
    let default_expiry = i64::try_from(default_ttl_seconds)
        .ok()
        .and_then(|seconds| after(now, seconds))
        .ok_or_else(|| VaultkeeperError::credential_source(kind, "expiry out of range"))?;

    match format {
        OutputFormat::Text => {
            let token = body.trim();
            if token.is_empty() {
                return Err(VaultkeeperError::credential_source(kind, "empty token output"));
            }
            Ok(CredentialToken::new(token, default_expiry, kind))
        }
        OutputFormat::Json => {
            let doc: Value = serde_json::from_str(body.trim()).map_err(|e| {
                VaultkeeperError::credential_source(kind, format!("invalid JSON output: {}", e))
            })?;

            if doc.get("success").and_then(Value::as_bool) == Some(false) {
                let code = doc.get("code").and_then(Value::as_str).unwrap_or("unknown");
                let message = doc.get("message").and_then(Value::as_str).unwrap_or("");
                return Err(VaultkeeperError::credential_source(
                    kind,
                    format!("source reported failure ({}): {}", code, message),
                ));
            }

            let token = token_field
                .into_iter()
                .chain(TOKEN_FIELDS.iter().copied())
                .find_map(|field| doc.get(field).and_then(Value::as_str))
                .filter(|t| !t.is_empty())
                .ok_or_else(|| {
                    VaultkeeperError::credential_source(kind, "no token field in output")
                })?;

            let expires_at = parse_expiry(&doc, now)
                .map_err(|e| VaultkeeperError::credential_source(kind, e.to_string()))?
                .unwrap_or(default_expiry);
            Ok(CredentialToken::new(token, expires_at, kind))
        }
    }
}

#[derive(Debug)]
enum ExpiryError {
    Unparseable(&'static str),
    OutOfRange(&'static str),
}

impl fmt::Display for ExpiryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unparseable(field) => write!(f, "unparseable expiry in field '{}'", field),
            Self::OutOfRange(field) => write!(f, "expiry out of range in field '{}'", field),
        }
    }
}

/// `now + seconds`, or `None` if the result does not fit a timestamp.
fn after(now: DateTime<Utc>, seconds: i64) -> Option<DateTime<Utc>> {
    ChronoDuration::try_seconds(seconds).and_then(|delta| now.checked_add_signed(delta))
}

fn parse_expiry(
    doc: &Value,
    now: DateTime<Utc>,
) -> std::result::Result<Option<DateTime<Utc>>, ExpiryError> {
    for field in ["expires_at", "Expiration", "expiration", "expiration_time"] {
        if let Some(value) = doc.get(field) {
            return absolute_time(value).map(Some).ok_or(ExpiryError::Unparseable(field));
        }
    }

    if let Some(value) = doc.get("expires_in") {
        let seconds = as_i64(value).ok_or(ExpiryError::Unparseable("expires_in"))?;
        return after(now, seconds).map(Some).ok_or(ExpiryError::OutOfRange("expires_in"));
    }

    // Azure IMDS returns expires_on as epoch seconds encoded as a string.
    if let Some(value) = doc.get("expires_on") {
        let seconds = as_i64(value).ok_or(ExpiryError::Unparseable("expires_on"))?;
        return Utc
            .timestamp_opt(seconds, 0)
            .single()
            .map(Some)
            .ok_or(ExpiryError::OutOfRange("expires_on"));
    }

    Ok(None)
}

fn absolute_time(value: &Value) -> Option<DateTime<Utc>> {
    if let Some(s) = value.as_str() {
        if let Ok(parsed) = DateTime::parse_from_rfc3339(s) {
            return Some(parsed.with_timezone(&Utc));
        }
    }
    as_i64(value).and_then(|secs| Utc.timestamp_opt(secs, 0).single())
}

fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
