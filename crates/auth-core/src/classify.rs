//! Translation of identity provider errors into the auth error taxonomy
//!
//! The hosted provider does not expose machine-readable codes for every
//! failure, so classification prefers the structured channel (error code,
//! then HTTP status) and only then falls back to matching known phrases in
//! the message. This is the single place that knows provider wording.

use identity::ProviderError;

use crate::error::Error;

/// Broad classes the provider can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Class {
    InvalidCredentials,
    EmailUnconfirmed,
    EmailAlreadyRegistered,
    WeakPassword,
    InvalidEmailFormat,
    Network,
    TooManyRequests,
}

/// Structured error codes, checked first.
const CODES: &[(&str, Class)] = &[
    ("invalid_credentials", Class::InvalidCredentials),
    ("invalid_grant", Class::InvalidCredentials),
    ("email_not_confirmed", Class::EmailUnconfirmed),
    ("user_already_exists", Class::EmailAlreadyRegistered),
    ("email_exists", Class::EmailAlreadyRegistered),
    ("weak_password", Class::WeakPassword),
    ("email_address_invalid", Class::InvalidEmailFormat),
    ("over_request_rate_limit", Class::TooManyRequests),
    ("over_email_send_rate_limit", Class::TooManyRequests),
];

/// Message fragments, checked in order when no code matched.
const PATTERNS: &[(&str, Class)] = &[
    ("invalid login credentials", Class::InvalidCredentials),
    ("invalid email or password", Class::InvalidCredentials),
    ("email not confirmed", Class::EmailUnconfirmed),
    ("user already registered", Class::EmailAlreadyRegistered),
    ("already been registered", Class::EmailAlreadyRegistered),
    ("password should be at least", Class::WeakPassword),
    ("unable to validate email address", Class::InvalidEmailFormat),
    ("invalid email", Class::InvalidEmailFormat),
    ("network", Class::Network),
    ("failed to fetch", Class::Network),
    ("too many requests", Class::TooManyRequests),
    ("rate limit", Class::TooManyRequests),
];

fn class_for_code(code: &str) -> Option<Class> {
    CODES
        .iter()
        .find(|(c, _)| c.eq_ignore_ascii_case(code))
        .map(|(_, class)| *class)
}

fn class_for_message(message: &str) -> Option<Class> {
    let lower = message.to_lowercase();
    PATTERNS
        .iter()
        .find(|(pattern, _)| lower.contains(pattern))
        .map(|(_, class)| *class)
}

fn into_error(class: Class, message: &str) -> Error {
    match class {
        Class::InvalidCredentials => Error::InvalidCredentials,
        Class::EmailUnconfirmed => Error::EmailUnconfirmed,
        Class::EmailAlreadyRegistered => Error::EmailAlreadyRegistered,
        Class::WeakPassword => Error::WeakPassword(message.to_string()),
        Class::InvalidEmailFormat => Error::InvalidEmailFormat,
        Class::Network => Error::NetworkUnreachable(message.to_string()),
        Class::TooManyRequests => Error::TooManyRequests,
    }
}

/// Classify a provider error into the auth taxonomy.
///
/// Order: transport failures, structured code, HTTP 429, message phrases.
/// Anything unrecognized becomes `Unknown` carrying the provider's message.
pub fn classify_provider_error(error: &ProviderError) -> Error {
    match error {
        ProviderError::Network(message) => Error::NetworkUnreachable(message.clone()),
        ProviderError::NoSession => Error::NotFound("no active session".into()),
        ProviderError::Decode(message) => Error::Unknown(message.clone()),
        ProviderError::Api {
            status,
            code,
            message,
        } => {
            if let Some(class) = code.as_deref().and_then(class_for_code) {
                return into_error(class, message);
            }
            if *status == Some(429) {
                return Error::TooManyRequests;
            }
            match class_for_message(message) {
                Some(class) => into_error(class, message),
                None if message.is_empty() => {
                    Error::Unknown("An error occurred. Please try again.".into())
                }
                None => Error::Unknown(message.clone()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api(status: Option<u16>, code: Option<&str>, message: &str) -> ProviderError {
        ProviderError::Api {
            status,
            code: code.map(str::to_string),
            message: message.to_string(),
        }
    }

    #[test]
    fn structured_code_wins_over_message() {
        let err = api(Some(400), Some("email_not_confirmed"), "Invalid login credentials");
        assert!(matches!(classify_provider_error(&err), Error::EmailUnconfirmed));
    }

    #[test]
    fn invalid_credentials_message() {
        let err = api(Some(400), None, "Invalid login credentials");
        assert!(matches!(classify_provider_error(&err), Error::InvalidCredentials));
    }

    #[test]
    fn unconfirmed_message_case_insensitive() {
        let err = api(None, None, "EMAIL NOT CONFIRMED");
        assert!(matches!(classify_provider_error(&err), Error::EmailUnconfirmed));
    }

    #[test]
    fn duplicate_registration() {
        let err = api(Some(422), None, "User already registered");
        assert!(matches!(
            classify_provider_error(&err),
            Error::EmailAlreadyRegistered
        ));
    }

    #[test]
    fn weak_password_keeps_provider_text() {
        let err = api(Some(422), None, "Password should be at least 6 characters");
        match classify_provider_error(&err) {
            Error::WeakPassword(msg) => assert!(msg.contains("at least 6")),
            other => panic!("expected WeakPassword, got {other:?}"),
        }
    }

    #[test]
    fn invalid_email_format() {
        let err = api(Some(400), None, "Unable to validate email address: invalid format");
        assert!(matches!(classify_provider_error(&err), Error::InvalidEmailFormat));
    }

    #[test]
    fn status_429_is_rate_limit() {
        let err = api(Some(429), None, "slow down");
        assert!(matches!(classify_provider_error(&err), Error::TooManyRequests));
    }

    #[test]
    fn rate_limit_code() {
        let err = api(Some(400), Some("over_request_rate_limit"), "");
        assert!(matches!(classify_provider_error(&err), Error::TooManyRequests));
    }

    #[test]
    fn transport_failure_is_network() {
        let err = ProviderError::Network("dns error".into());
        assert!(matches!(
            classify_provider_error(&err),
            Error::NetworkUnreachable(_)
        ));
    }

    #[test]
    fn network_phrase_in_message() {
        let err = api(None, None, "Network request failed");
        assert!(matches!(
            classify_provider_error(&err),
            Error::NetworkUnreachable(_)
        ));
    }

    #[test]
    fn unknown_message_is_preserved() {
        let err = api(Some(500), None, "database is on fire");
        match classify_provider_error(&err) {
            Error::Unknown(msg) => assert_eq!(msg, "database is on fire"),
            other => panic!("expected Unknown, got {other:?}"),
        }
    }

    #[test]
    fn empty_message_gets_generic_text() {
        let err = api(Some(500), None, "");
        match classify_provider_error(&err) {
            Error::Unknown(msg) => assert_eq!(msg, "An error occurred. Please try again."),
            other => panic!("expected Unknown, got {other:?}"),
        }
    }
}
