//! OAuth redirect URLs and callback token extraction
//!
//! The hosted provider finishes an OAuth sign-in by redirecting to the
//! application's callback URL with the token pair attached, normally in the
//! fragment (`#access_token=..&refresh_token=..`) and occasionally in the
//! query string. Errors arrive the same way as `error` / `error_description`.

use identity::TokenPair;
use serde::Deserialize;
use url::form_urlencoded;

use crate::constants::{CALLBACK_PATH, DEFAULT_DEV_URL};
use crate::error::{Error, Result};

/// How the host process is running, which decides the redirect URL.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RunMode {
    /// Development sandbox reached through an experience URL.
    Development {
        #[serde(default)]
        experience_url: Option<String>,
    },
    /// Installed build with its own URL scheme.
    Installed { scheme: String },
    /// Local listener on 127.0.0.1, used by the command-line host.
    Loopback { port: u16 },
}

impl RunMode {
    /// Callback URL the provider must redirect to in this mode.
    pub fn redirect_url(&self) -> String {
        match self {
            RunMode::Development { experience_url } => {
                let base = experience_url
                    .as_deref()
                    .filter(|u| !u.is_empty())
                    .unwrap_or(DEFAULT_DEV_URL)
                    .trim_end_matches('/');
                format!("{base}/--/{CALLBACK_PATH}")
            }
            RunMode::Installed { scheme } => format!("{scheme}://{CALLBACK_PATH}"),
            RunMode::Loopback { port } => format!("http://127.0.0.1:{port}/{CALLBACK_PATH}"),
        }
    }
}

/// Split `url` into its query and fragment components (either may be empty).
fn components(url: &str) -> (&str, &str) {
    let (before_fragment, fragment) = url.split_once('#').unwrap_or((url, ""));
    let query = before_fragment
        .split_once('?')
        .map(|(_, q)| q)
        .unwrap_or("");
    (query, fragment)
}

/// Extract the token pair from an OAuth callback URL.
///
/// Parameters are read from the fragment when it has any, otherwise from the
/// query string. An `error_description` (or bare `error`) wins over tokens
/// and yields `Error::OAuth`; a missing or empty token yields
/// `Error::MissingTokens`.
pub fn extract_callback_tokens(url: &str) -> Result<TokenPair> {
    let (query, fragment) = components(url);
    let source = if fragment.is_empty() { query } else { fragment };
    if source.is_empty() {
        return Err(Error::MissingTokens(
            "callback URL carries no parameters".into(),
        ));
    }

    let mut access_token = None;
    let mut refresh_token = None;
    let mut error_code = None;
    let mut error_description = None;

    for (key, value) in form_urlencoded::parse(source.as_bytes()) {
        let value = value.into_owned();
        if value.is_empty() {
            continue;
        }
        match key.as_ref() {
            "access_token" => access_token = Some(value),
            "refresh_token" => refresh_token = Some(value),
            "error" => error_code = Some(value),
            "error_description" => error_description = Some(value),
            _ => {}
        }
    }

    if let Some(reason) = error_description.or(error_code) {
        return Err(Error::OAuth(reason));
    }

    match (access_token, refresh_token) {
        (Some(access), Some(refresh)) => Ok(TokenPair::new(access, refresh)),
        (None, _) => Err(Error::MissingTokens("access_token absent".into())),
        (_, None) => Err(Error::MissingTokens("refresh_token absent".into())),
    }
}

/// Whether `url` looks like a callback for this application.
///
/// Used by passive entry points to ignore unrelated deep links.
pub fn is_callback_url(url: &str) -> bool {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.trim_end_matches('/').ends_with(CALLBACK_PATH)
}
