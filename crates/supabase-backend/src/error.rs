//! Error types for the Supabase backend
//!
//! Construction failures get their own enum. Request failures are mapped
//! onto the capability traits' error types (`ProviderError`, `RecordError`)
//! with the status, machine code and message preserved.

use identity::{ProviderError, RecordError};
use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid Supabase URL: {0}")]
    InvalidUrl(String),

    #[error("failed to build HTTP client: {0}")]
    Http(#[from] reqwest::Error),
}

/// Result alias for client construction
pub type Result<T> = std::result::Result<T, Error>;

/// Union of the error body shapes both services return.
///
/// Auth: `{"code":400,"error_code":"invalid_credentials","msg":"..."}`, or
/// the older `{"error":"invalid_grant","error_description":"..."}`.
/// Rest: `{"code":"PGRST116","message":"...","details":"..."}`.
#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    code: Option<serde_json::Value>,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

/// Status, machine code and human message extracted from an error response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ApiFailure {
    pub status: u16,
    pub code: Option<String>,
    pub message: String,
}

impl ApiFailure {
    /// Parse an error response body. Unparseable bodies keep their raw text
    /// as the message.
    pub(crate) fn parse(status: u16, body: &str) -> Self {
        let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_default();
        let error_text = parsed
            .error
            .as_ref()
            .and_then(|e| e.as_str())
            .map(str::to_string);

        // A numeric `code` is just the HTTP status echoed back.
        let code = parsed
            .error_code
            .or_else(|| {
                parsed
                    .code
                    .as_ref()
                    .and_then(|c| c.as_str())
                    .map(str::to_string)
            })
            .or_else(|| {
                parsed
                    .error_description
                    .as_ref()
                    .and(error_text.clone())
            });

        let message = parsed
            .msg
            .or(parsed.message)
            .or(parsed.error_description)
            .or(error_text)
            .unwrap_or_else(|| {
                let trimmed = body.trim();
                if trimmed.is_empty() {
                    format!("request failed with status {status}")
                } else {
                    trimmed.to_string()
                }
            });

        Self {
            status,
            code,
            message,
        }
    }

    pub(crate) fn into_provider_error(self) -> ProviderError {
        ProviderError::Api {
            status: Some(self.status),
            code: self.code,
            message: self.message,
        }
    }

    pub(crate) fn into_record_error(self) -> RecordError {
        RecordError::Rejected {
            status: Some(self.status),
            code: self.code,
            message: self.message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_current_auth_shape() {
        let failure = ApiFailure::parse(
            400,
            r#"{"code":400,"error_code":"invalid_credentials","msg":"Invalid login credentials"}"#,
        );
        assert_eq!(failure.code.as_deref(), Some("invalid_credentials"));
        assert_eq!(failure.message, "Invalid login credentials");
    }

    #[test]
    fn parses_legacy_auth_shape() {
        let failure = ApiFailure::parse(
            400,
            r#"{"error":"invalid_grant","error_description":"Email not confirmed"}"#,
        );
        assert_eq!(failure.code.as_deref(), Some("invalid_grant"));
        assert_eq!(failure.message, "Email not confirmed");
    }

    #[test]
    fn parses_rest_shape() {
        let failure = ApiFailure::parse(
            409,
            r#"{"code":"23505","message":"duplicate key value violates unique constraint","details":null}"#,
        );
        assert_eq!(failure.code.as_deref(), Some("23505"));
        assert!(failure.message.starts_with("duplicate key"));
    }

    #[test]
    fn non_json_body_becomes_message() {
        let failure = ApiFailure::parse(502, "Bad Gateway");
        assert_eq!(failure.code, None);
        assert_eq!(failure.message, "Bad Gateway");

        let empty = ApiFailure::parse(503, "");
        assert_eq!(empty.message, "request failed with status 503");
    }

    #[test]
    fn rate_limit_status_is_kept() {
        let err = ApiFailure::parse(429, r#"{"msg":"Too many requests"}"#).into_provider_error();
        assert!(matches!(err, ProviderError::Api { status: Some(429), .. }));
    }
}
