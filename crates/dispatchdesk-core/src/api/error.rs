use std::sync::Arc;

use reqwest::StatusCode;
use thiserror::Error;

use crate::auth::StoreError;

/// Errors surfaced to callers of the session client and the authenticated
/// request wrapper.
///
/// Clone is required so one refresh outcome can be handed to every caller
/// waiting on it; the non-Clone sources are held behind `Arc`.
#[derive(Error, Debug, Clone)]
pub enum ApiError {
    #[error("Invalid username or password")]
    InvalidCredentials,

    #[error("Session expired - please log in again")]
    SessionExpired,

    #[error("Network error: {0}")]
    NetworkError(Arc<reqwest::Error>),

    #[error("Upstream error {status}: {body}")]
    Upstream { status: StatusCode, body: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Credential storage error: {0}")]
    Storage(Arc<StoreError>),
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        ApiError::NetworkError(Arc::new(err))
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::Storage(Arc::new(err))
    }
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            return body.to_string();
        }
        let mut end = MAX_ERROR_BODY_LENGTH;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
    }

    /// Wrap a non-success response from a protected endpoint.
    pub fn from_status(status: StatusCode, body: &str) -> Self {
        ApiError::Upstream {
            status,
            body: Self::truncate_body(body),
        }
    }

    /// Status code of an upstream (business-level) failure.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ApiError::Upstream { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// True when the caller is expected to send the user back to login.
    pub fn requires_login(&self) -> bool {
        matches!(self, ApiError::SessionExpired)
    }

    pub fn is_network(&self) -> bool {
        matches!(self, ApiError::NetworkError(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_status_keeps_short_body() {
        let err = ApiError::from_status(StatusCode::NOT_FOUND, r#"{"detail":"not found"}"#);
        assert_eq!(err.status(), Some(StatusCode::NOT_FOUND));
        match err {
            ApiError::Upstream { body, .. } => assert_eq!(body, r#"{"detail":"not found"}"#),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_from_status_truncates_long_body() {
        let body = "x".repeat(MAX_ERROR_BODY_LENGTH + 100);
        match ApiError::from_status(StatusCode::INTERNAL_SERVER_ERROR, &body) {
            ApiError::Upstream { body, .. } => {
                assert!(body.starts_with(&"x".repeat(MAX_ERROR_BODY_LENGTH)));
                assert!(body.ends_with("(truncated, 600 total bytes)"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        // Cyrillic characters are two bytes each
        let body = "ж".repeat(MAX_ERROR_BODY_LENGTH);
        let truncated = ApiError::truncate_body(&body);
        assert!(truncated.contains("truncated"));
    }

    #[test]
    fn test_requires_login() {
        assert!(ApiError::SessionExpired.requires_login());
        assert!(!ApiError::InvalidCredentials.requires_login());
        assert!(!ApiError::from_status(StatusCode::FORBIDDEN, "").requires_login());
    }
}
