//! OAuth sign-in through an external browser
//!
//! Two entry points share one completion path:
//!
//! 1. Active: [`OAuthCompleter::browse`] asks the provider for an
//!    authorization URL, hands it to an [`AuthBrowser`] and waits for the
//!    redirect back to our callback URL.
//! 2. Passive: a callback URL delivered to the process out of band (a deep
//!    link) goes straight to [`OAuthCompleter::complete_from_url`].
//!
//! Completion extracts the token pair, installs it with the provider and
//! syncs the user record.

use std::sync::Arc;
use std::time::Duration;

use auth_core::constants::OAUTH_QUERY_PARAMS;
use auth_core::{Error, Result, RunMode, UserRecordSynchronizer, extract_callback_tokens};
use identity::{AuthorizationOptions, BoxFuture, IdentityProvider};
use tracing::{debug, info};

use crate::remote;
use crate::state::Session;

/// How a browser auth session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrowserOutcome {
    /// The browser was redirected to the callback; `url` is the full callback URL.
    Success { url: String },
    /// The user cancelled explicitly.
    Cancel,
    /// The browser was closed or timed out without a redirect.
    Dismiss,
    /// Anything else the platform reports.
    Other(String),
}

/// Opens an interactive browser session for an OAuth flow.
pub trait AuthBrowser: Send + Sync {
    /// Show `auth_url` and resolve once the browser lands on `redirect_url`
    /// (or the user gives up).
    fn open_auth_session<'a>(
        &'a self,
        auth_url: &'a str,
        redirect_url: &'a str,
    ) -> BoxFuture<'a, BrowserOutcome>;
}

/// Browser for hosts that cannot show one; every attempt is dismissed.
pub struct NoBrowser;

impl AuthBrowser for NoBrowser {
    fn open_auth_session<'a>(
        &'a self,
        _auth_url: &'a str,
        _redirect_url: &'a str,
    ) -> BoxFuture<'a, BrowserOutcome> {
        Box::pin(async { BrowserOutcome::Dismiss })
    }
}

/// Drives both OAuth entry points.
#[derive(Clone)]
pub struct OAuthCompleter {
    provider: Arc<dyn IdentityProvider>,
    synchronizer: UserRecordSynchronizer,
    browser: Arc<dyn AuthBrowser>,
    run_mode: RunMode,
    timeout: Duration,
}

impl OAuthCompleter {
    pub fn new(
        provider: Arc<dyn IdentityProvider>,
        synchronizer: UserRecordSynchronizer,
        browser: Arc<dyn AuthBrowser>,
        run_mode: RunMode,
        timeout: Duration,
    ) -> Self {
        Self {
            provider,
            synchronizer,
            browser,
            run_mode,
            timeout,
        }
    }

    pub fn redirect_url(&self) -> String {
        self.run_mode.redirect_url()
    }

    /// Run the browser round trip for `provider_name` and return the callback URL.
    pub async fn browse(&self, provider_name: &str) -> Result<String> {
        let redirect_url = self.redirect_url();
        let options = AuthorizationOptions {
            skip_browser_redirect: true,
            query_params: OAUTH_QUERY_PARAMS
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        };

        let auth_url = remote::call(
            self.timeout,
            self.provider
                .authorization_url(provider_name, &redirect_url, &options),
        )
        .await?;
        if auth_url.is_empty() {
            return Err(Error::OAuth("no authorization URL received".into()));
        }

        info!(provider = provider_name, redirect_url = %redirect_url, "opening browser for OAuth sign-in");
        match self.browser.open_auth_session(&auth_url, &redirect_url).await {
            BrowserOutcome::Success { url } => {
                debug!("browser returned to callback URL");
                Ok(url)
            }
            BrowserOutcome::Cancel => Err(Error::UserCancelled),
            BrowserOutcome::Dismiss => Err(Error::UserDismissed),
            BrowserOutcome::Other(kind) => Err(Error::OAuth(format!(
                "unexpected browser result: {kind}"
            ))),
        }
    }

    /// Turn a callback URL into a session.
    ///
    /// The returned session carries the pair the provider now holds, which
    /// differs from the callback's pair if the provider had to refresh.
    pub async fn complete_from_url(&self, url: &str) -> Result<Session> {
        let tokens = extract_callback_tokens(url)?;
        let grant = remote::call(self.timeout, self.provider.set_session(&tokens)).await?;
        let user = remote::within(
            self.timeout,
            self.synchronizer.sync(&grant.principal, None),
        )
        .await?;
        info!(principal_id = %grant.principal.id, "OAuth session established");
        Ok(Session::new(user, grant.tokens))
    }
}
