//! Capability abstractions for the remote identity provider and record store
//!
//! Defines the `IdentityProvider` trait that decouples session logic from the
//! hosted authentication backend, and the `RecordStore` trait for the
//! application's relational user table. The `memory` module implements both
//! in-process; `supabase-backend` implements them over HTTP.

pub mod memory;

pub use memory::{MemoryIdentityProvider, MemoryRecordStore};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use tokio::sync::broadcast;

/// Boxed future returned by the capability traits.
///
/// `Pin<Box<dyn Future>>` keeps both traits dyn-compatible so callers can hold
/// `Arc<dyn IdentityProvider>` and swap in test doubles.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Profile metadata the identity provider keeps alongside a principal.
///
/// Every field is optional: OAuth providers fill `full_name`/`name` and
/// `avatar_url`, password sign-up fills `first_name`/`last_name`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrincipalMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

/// The identity provider's authentication record for a user.
///
/// `id` is immutable and is the join key to the application user record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default, rename = "user_metadata")]
    pub metadata: PrincipalMetadata,
}

/// Access/refresh token pair issued by the identity provider.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

impl TokenPair {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
        }
    }
}

impl fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenPair")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .finish()
    }
}

/// Successful authentication: the principal plus its live token pair.
#[derive(Debug, Clone)]
pub struct AuthGrant {
    pub principal: Principal,
    pub tokens: TokenPair,
}

/// Result of a sign-up call.
///
/// `tokens` is `None` when the provider requires email confirmation before
/// issuing a session.
#[derive(Debug, Clone)]
pub struct SignUpOutcome {
    pub principal: Principal,
    pub tokens: Option<TokenPair>,
}

/// Why the provider's current principal changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrincipalChangeKind {
    SignedIn,
    SignedOut,
    TokenRefreshed,
    UserUpdated,
}

impl PrincipalChangeKind {
    /// Label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            PrincipalChangeKind::SignedIn => "signed_in",
            PrincipalChangeKind::SignedOut => "signed_out",
            PrincipalChangeKind::TokenRefreshed => "token_refreshed",
            PrincipalChangeKind::UserUpdated => "user_updated",
        }
    }
}

/// Notification emitted by the provider whenever its principal changes.
///
/// `tokens` carries the pair the provider now holds, when it has one.
#[derive(Debug, Clone)]
pub struct PrincipalChange {
    pub kind: PrincipalChangeKind,
    pub principal: Option<Principal>,
    pub tokens: Option<TokenPair>,
}

/// Options for building an OAuth authorization URL.
#[derive(Debug, Clone, Default)]
pub struct AuthorizationOptions {
    /// The caller opens the browser itself; the provider must only return the URL.
    pub skip_browser_redirect: bool,
    /// Extra query parameters forwarded to the external provider.
    pub query_params: Vec<(String, String)>,
}

/// Errors from identity provider calls.
///
/// `Api` preserves whatever structure the provider returned (status, machine
/// code, message) so the caller's classifier can prefer codes over text.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("network error: {0}")]
    Network(String),

    #[error("identity provider rejected request: {message}")]
    Api {
        status: Option<u16>,
        code: Option<String>,
        message: String,
    },

    #[error("no active session")]
    NoSession,

    #[error("malformed provider response: {0}")]
    Decode(String),
}

impl ProviderError {
    /// Build an `Api` error with only a message.
    pub fn api(message: impl Into<String>) -> Self {
        ProviderError::Api {
            status: None,
            code: None,
            message: message.into(),
        }
    }
}

/// Result alias for identity provider operations.
pub type Result<T> = std::result::Result<T, ProviderError>;

/// Abstraction over the hosted authentication service.
///
/// Every method may suspend on network I/O. Implementations own their own
/// notion of "current session" (installed by sign-in, `set_session` or
/// refresh, removed by sign-out) and report changes on `principal_changes`.
pub trait IdentityProvider: Send + Sync {
    /// Identifier for logging (e.g. "supabase", "memory").
    fn id(&self) -> &str;

    /// Password grant.
    fn sign_in_with_password<'a>(
        &'a self,
        email: &'a str,
        password: &'a str,
    ) -> BoxFuture<'a, Result<AuthGrant>>;

    /// Create a principal. No tokens means email confirmation is pending.
    fn sign_up<'a>(
        &'a self,
        email: &'a str,
        password: &'a str,
        metadata: &'a PrincipalMetadata,
    ) -> BoxFuture<'a, Result<SignUpOutcome>>;

    /// End the provider-side session.
    fn sign_out(&self) -> BoxFuture<'_, Result<()>>;

    /// Exchange a refresh token for a new pair.
    fn refresh_session<'a>(&'a self, refresh_token: &'a str) -> BoxFuture<'a, Result<TokenPair>>;

    /// The principal of the current session, if any.
    fn current_principal(&self) -> BoxFuture<'_, Result<Option<Principal>>>;

    /// URL the browser must visit to sign in with an external provider.
    fn authorization_url<'a>(
        &'a self,
        provider: &'a str,
        redirect_url: &'a str,
        options: &'a AuthorizationOptions,
    ) -> BoxFuture<'a, Result<String>>;

    /// Install an externally obtained token pair as the current session.
    ///
    /// Returns the resolved principal together with the pair now in force,
    /// which differs from the input if the provider had to refresh.
    fn set_session<'a>(&'a self, tokens: &'a TokenPair) -> BoxFuture<'a, Result<AuthGrant>>;

    /// Subscribe to principal changes. Dropping the receiver unsubscribes.
    fn principal_changes(&self) -> broadcast::Receiver<PrincipalChange>;

    /// Send a password reset email that links back to `redirect_url`.
    fn reset_password_for_email<'a>(
        &'a self,
        email: &'a str,
        redirect_url: &'a str,
    ) -> BoxFuture<'a, Result<()>>;

    /// Replace the current principal's metadata.
    fn update_principal_metadata<'a>(
        &'a self,
        metadata: &'a PrincipalMetadata,
    ) -> BoxFuture<'a, Result<()>>;
}

/// Equality filter on a single column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    pub column: String,
    pub value: String,
}

impl Filter {
    pub fn eq(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
        }
    }

    /// Whether a JSON row satisfies this filter.
    pub fn matches(&self, row: &serde_json::Value) -> bool {
        match row.get(&self.column) {
            Some(serde_json::Value::String(s)) => *s == self.value,
            Some(other) if !other.is_null() => other.to_string() == self.value,
            _ => false,
        }
    }
}

/// Errors from the application record store.
///
/// `NotFound` is the expected "no matching row" signal; everything else is a
/// genuine data-layer failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RecordError {
    #[error("no matching row")]
    NotFound,

    #[error("record store unreachable: {0}")]
    Network(String),

    #[error("record store rejected request: {message}")]
    Rejected {
        status: Option<u16>,
        code: Option<String>,
        message: String,
    },

    #[error("malformed row: {0}")]
    Decode(String),
}

/// Abstraction over the application's relational tables.
pub trait RecordStore: Send + Sync {
    /// Exactly one row matching `filter`, or `RecordError::NotFound`.
    fn find_one<'a>(
        &'a self,
        table: &'a str,
        filter: &'a Filter,
    ) -> BoxFuture<'a, std::result::Result<serde_json::Value, RecordError>>;

    /// Insert a row and return it as stored.
    fn insert<'a>(
        &'a self,
        table: &'a str,
        row: serde_json::Value,
    ) -> BoxFuture<'a, std::result::Result<serde_json::Value, RecordError>>;

    /// Merge `patch` into the row matching `filter` and return the result.
    fn update<'a>(
        &'a self,
        table: &'a str,
        filter: &'a Filter,
        patch: serde_json::Value,
    ) -> BoxFuture<'a, std::result::Result<serde_json::Value, RecordError>>;
}
