use thiserror::Error;

use crate::auth::{DecodeError, StoreError};

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Unauthorized - credential was rejected")]
    Unauthorized,

    #[error("Session renewal rejected: {0}")]
    RenewalRejected(String),

    #[error("Session renewal failed, server unreachable: {0}")]
    RenewalUnreachable(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Credential storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Malformed access credential: {0}")]
    Decode(#[from] DecodeError),
}

/// Why a renewal failed. Cloned once per waiter so every caller blocked on the
/// same renewal sees the same failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RenewalError {
    #[error("no refresh credential is stored")]
    MissingRefreshCredential,

    #[error("refresh credential rejected (status {status})")]
    Rejected { status: u16 },

    #[error("{0}")]
    Unreachable(String),

    #[error("renewal response was malformed: {0}")]
    Malformed(String),

    #[error("renewed credentials could not be stored: {0}")]
    Storage(String),

    #[error("renewal was abandoned before it settled")]
    Abandoned,

    /// The session was signed out or replaced while the renewal was in flight.
    #[error("session ended while it was being renewed")]
    Superseded,
}

impl From<RenewalError> for ApiError {
    fn from(err: RenewalError) -> Self {
        match err {
            RenewalError::Unreachable(_) | RenewalError::Abandoned => {
                ApiError::RenewalUnreachable(err.to_string())
            }
            RenewalError::MissingRefreshCredential
            | RenewalError::Rejected { .. }
            | RenewalError::Malformed(_)
            | RenewalError::Storage(_) => ApiError::RenewalRejected(err.to_string()),
            RenewalError::Superseded => ApiError::Unauthorized,
        }
    }
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
        }
    }

    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let truncated = Self::truncate_body(body);
        match status.as_u16() {
            401 => ApiError::Unauthorized,
            403 => ApiError::AccessDenied(truncated),
            404 => ApiError::NotFound(truncated),
            429 => ApiError::RateLimited,
            500..=599 => ApiError::ServerError(truncated),
            _ => ApiError::InvalidResponse(format!("Status {}: {}", status, truncated)),
        }
    }

    /// True when the session could not be renewed and local credentials were
    /// dropped. The user has to sign in again.
    pub fn is_fatal_auth(&self) -> bool {
        matches!(
            self,
            ApiError::RenewalRejected(_) | ApiError::RenewalUnreachable(_)
        )
    }
}
