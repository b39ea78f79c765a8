//! Error taxonomy for authentication operations
//!
//! Display strings are the user-facing messages surfaced by the session
//! controller; `category()` is the stable machine label used in logs and
//! metrics.

use std::time::Duration;

use identity::RecordError;

/// Errors from authentication operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("Invalid email or password. Please check your credentials.")]
    InvalidCredentials,

    #[error("Please verify your email address before signing in.")]
    EmailUnconfirmed,

    #[error("This email is already registered. Please sign in instead.")]
    EmailAlreadyRegistered,

    #[error("Password is too weak: {0}")]
    WeakPassword(String),

    #[error("Invalid email address format.")]
    InvalidEmailFormat,

    #[error("Network connection failed. Please check your internet and try again. ({0})")]
    NetworkUnreachable(String),

    #[error("Too many attempts. Please try again later.")]
    TooManyRequests,

    #[error("operation timed out after {}s", .0.as_secs_f64())]
    Timeout(Duration),

    #[error("Sign-in was cancelled")]
    UserCancelled,

    #[error("Sign-in was dismissed")]
    UserDismissed,

    #[error("OAuth error: {0}")]
    OAuth(String),

    #[error("No authentication tokens received: {0}")]
    MissingTokens(String),

    #[error("No refresh token found")]
    NoRefreshToken,

    #[error("Token refresh failed: {0}")]
    RefreshFailed(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("operation superseded by a newer session change")]
    Superseded,

    #[error("user record error: {0}")]
    Record(#[from] RecordError),

    #[error("credential storage error: {0}")]
    Storage(String),

    #[error("{0}")]
    Unknown(String),
}

impl Error {
    /// Stable label for logs and metrics.
    pub fn category(&self) -> &'static str {
        match self {
            Error::InvalidCredentials => "invalid_credentials",
            Error::EmailUnconfirmed => "email_unconfirmed",
            Error::EmailAlreadyRegistered => "email_already_registered",
            Error::WeakPassword(_) => "weak_password",
            Error::InvalidEmailFormat => "invalid_email_format",
            Error::NetworkUnreachable(_) => "network_unreachable",
            Error::TooManyRequests => "too_many_requests",
            Error::Timeout(_) => "timeout",
            Error::UserCancelled => "user_cancelled",
            Error::UserDismissed => "user_dismissed",
            Error::OAuth(_) => "oauth_error",
            Error::MissingTokens(_) => "missing_tokens",
            Error::NoRefreshToken => "no_refresh_token",
            Error::RefreshFailed(_) => "refresh_failed",
            Error::NotFound(_) => "not_found",
            Error::Superseded => "superseded",
            Error::Record(_) => "record_error",
            Error::Storage(_) => "storage_error",
            Error::Unknown(_) => "unknown",
        }
    }

    /// A normal user decline rather than a failure.
    pub fn is_decline(&self) -> bool {
        matches!(self, Error::UserCancelled | Error::UserDismissed)
    }
}

/// Result alias for auth operations.
pub type Result<T> = std::result::Result<T, Error>;
