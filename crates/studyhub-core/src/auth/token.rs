//! Offline decoding of access credential claims.
//!
//! Access credentials are JWTs issued by the platform. The client only reads
//! the payload to know who is signed in and when the credential runs out; the
//! signature is never checked here and the decoded claims must not be used to
//! make authorization decisions. The server remains the only authority.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("expected three dot-separated segments, found {0}")]
    Structure(usize),

    #[error("payload is not valid base64url: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("payload is not a valid claims object: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("subject id {0:?} is not numeric")]
    Subject(String),

    #[error("expiry {0} is out of range")]
    Expiry(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Roles {
    pub is_staff: bool,
    pub is_superuser: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub subject_id: i64,
    pub username: Option<String>,
    pub roles: Roles,
    pub expires_at: DateTime<Utc>,
}

impl Claims {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn time_until_expiry(&self) -> Duration {
        self.expires_at - Utc::now()
    }

    /// Get minutes remaining until expiry (for display)
    pub fn minutes_until_expiry(&self) -> i64 {
        self.time_until_expiry().num_minutes().max(0)
    }

    pub fn is_staff(&self) -> bool {
        self.roles.is_staff || self.roles.is_superuser
    }

    pub fn is_admin(&self) -> bool {
        self.roles.is_superuser
    }

    /// Name to show in prompts; falls back to the numeric id.
    pub fn display_name(&self) -> String {
        self.username
            .clone()
            .unwrap_or_else(|| format!("user #{}", self.subject_id))
    }
}

// Older token issuers put the id in as a number, newer ones as a string.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SubjectId {
    Number(i64),
    Text(String),
}

#[derive(Debug, Deserialize)]
struct RawClaims {
    user_id: SubjectId,
    exp: i64,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    is_staff: bool,
    #[serde(default)]
    is_superuser: bool,
}

/// Decode the claims of an access credential without verifying it.
pub fn decode(access: &str) -> Result<Claims, DecodeError> {
    let segments: Vec<&str> = access.split('.').collect();
    if segments.len() != 3 || segments.iter().any(|s| s.is_empty()) {
        return Err(DecodeError::Structure(segments.len()));
    }

    let payload = URL_SAFE_NO_PAD.decode(segments[1].trim_end_matches('='))?;
    let raw: RawClaims = serde_json::from_slice(&payload)?;

    let subject_id = match raw.user_id {
        SubjectId::Number(id) => id,
        SubjectId::Text(text) => text
            .parse()
            .map_err(|_| DecodeError::Subject(text.clone()))?,
    };

    let expires_at = Utc
        .timestamp_opt(raw.exp, 0)
        .single()
        .ok_or(DecodeError::Expiry(raw.exp))?;

    Ok(Claims {
        subject_id,
        username: raw.username,
        roles: Roles {
            is_staff: raw.is_staff,
            is_superuser: raw.is_superuser,
        },
        expires_at,
    })
}
