//! Shared HTTP client state
//!
//! One `SupabaseClient` speaks to both services of a Supabase project:
//! the auth API under `/auth/v1` and the table API under `/rest/v1`. It
//! holds the session installed by the last sign-in, refresh or
//! `set_session`, and table requests run as that user when there is one.

use std::time::Duration;

use common::Secret;
use identity::{Principal, PrincipalChange, PrincipalChangeKind, TokenPair};
use reqwest::{Method, RequestBuilder};
use tokio::sync::{RwLock, broadcast};
use url::Url;

use crate::error::{Error, Result};

/// Capacity of the principal change channel. Slow listeners see `Lagged`.
const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// The session this client currently acts as.
#[derive(Debug, Clone)]
pub(crate) struct CurrentSession {
    pub principal: Principal,
    pub tokens: TokenPair,
}

/// HTTP implementation of `IdentityProvider` and `RecordStore` for a
/// Supabase project.
pub struct SupabaseClient {
    pub(crate) http: reqwest::Client,
    base_url: Url,
    anon_key: Secret<String>,
    pub(crate) session: RwLock<Option<CurrentSession>>,
    changes: broadcast::Sender<PrincipalChange>,
}

impl SupabaseClient {
    /// Build a client for the project at `base_url` (e.g.
    /// `https://abc.supabase.co`). `timeout` bounds every HTTP request.
    pub fn new(base_url: &str, anon_key: Secret<String>, timeout: Duration) -> Result<Self> {
        let mut base_url =
            Url::parse(base_url).map_err(|e| Error::InvalidUrl(format!("{base_url}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(Error::InvalidUrl(format!("{base_url}: not a base URL")));
        }
        // `Url::join` replaces the last segment unless the path ends in '/'.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let http = reqwest::Client::builder().timeout(timeout).build()?;
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);

        Ok(Self {
            http,
            base_url,
            anon_key,
            session: RwLock::new(None),
            changes,
        })
    }

    /// Project URL this client talks to.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Resolve `path` (relative, no leading slash) against the project URL.
    pub(crate) fn endpoint(&self, path: &str) -> std::result::Result<Url, url::ParseError> {
        self.base_url.join(path)
    }

    /// Request carrying the project key, authorized as `bearer` or, without
    /// one, as the anonymous role.
    pub(crate) fn request(&self, method: Method, url: Url, bearer: Option<&str>) -> RequestBuilder {
        let key = self.anon_key.expose();
        self.http
            .request(method, url)
            .header("apikey", key.as_str())
            .bearer_auth(bearer.unwrap_or(key.as_str()))
    }

    /// Access token of the installed session, if any.
    pub(crate) async fn access_token(&self) -> Option<String> {
        self.session
            .read()
            .await
            .as_ref()
            .map(|s| s.tokens.access_token.clone())
    }

    pub(crate) async fn install(&self, principal: Principal, tokens: TokenPair) {
        *self.session.write().await = Some(CurrentSession { principal, tokens });
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<PrincipalChange> {
        self.changes.subscribe()
    }

    pub(crate) fn emit(
        &self,
        kind: PrincipalChangeKind,
        principal: Option<Principal>,
        tokens: Option<TokenPair>,
    ) {
        // No receivers is not an error.
        let _ = self.changes.send(PrincipalChange {
            kind,
            principal,
            tokens,
        });
    }
}
