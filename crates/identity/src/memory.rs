//! In-process identity provider and record store
//!
//! Both types keep all state behind a tokio `Mutex` and mimic the observable
//! behavior of a hosted backend closely enough to drive the session
//! controller end to end: provider-style error messages, rotating refresh
//! tokens, JWT-shaped access tokens with an `exp` claim, principal change
//! notifications. Latency, hangs and failures can be injected per instance.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use tokio::sync::{Mutex, broadcast};
use tracing::debug;

use crate::{
    AuthGrant, AuthorizationOptions, BoxFuture, Filter, IdentityProvider, Principal,
    PrincipalChange, PrincipalChangeKind, PrincipalMetadata, ProviderError, RecordError,
    RecordStore, Result, SignUpOutcome, TokenPair,
};

/// Capacity of the principal change channel.
const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// Minimum password length enforced on sign-up, matching the hosted default.
const MIN_PASSWORD_LEN: usize = 6;

struct Account {
    password: String,
    principal: Principal,
    confirmed: bool,
}

struct Behavior {
    require_confirmation: bool,
    latency: Duration,
    hang: bool,
    unreachable: bool,
    fail_sign_out: bool,
    token_ttl: Duration,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            require_confirmation: false,
            latency: Duration::ZERO,
            hang: false,
            unreachable: false,
            fail_sign_out: false,
            token_ttl: Duration::from_secs(3600),
        }
    }
}

#[derive(Default)]
struct ProviderState {
    /// Accounts keyed by lowercase email.
    accounts: HashMap<String, Account>,
    /// access token -> principal id
    access_tokens: HashMap<String, String>,
    /// refresh token -> principal id
    refresh_tokens: HashMap<String, String>,
    current: Option<(Principal, TokenPair)>,
    password_resets: Vec<(String, String)>,
    issued: u64,
    next_principal: u64,
    behavior: Behavior,
}

impl ProviderState {
    fn principal_by_id(&self, id: &str) -> Option<Principal> {
        self.accounts
            .values()
            .find(|a| a.principal.id == id)
            .map(|a| a.principal.clone())
    }

    fn issue_tokens(&mut self, principal_id: &str) -> TokenPair {
        self.issued += 1;
        let exp = chrono::Utc::now().timestamp() + self.behavior.token_ttl.as_secs() as i64;
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
        let claims = serde_json::json!({
            "sub": principal_id,
            "exp": exp,
            "jti": self.issued,
        });
        let payload = URL_SAFE_NO_PAD.encode(claims.to_string().as_bytes());
        let access = format!("{header}.{payload}.memory");
        let refresh = format!("rt-{}", self.issued);
        self.access_tokens
            .insert(access.clone(), principal_id.to_string());
        self.refresh_tokens
            .insert(refresh.clone(), principal_id.to_string());
        TokenPair::new(access, refresh)
    }

    fn create_principal(&mut self, email: &str, metadata: PrincipalMetadata) -> Principal {
        self.next_principal += 1;
        Principal {
            id: format!("uid-{}", self.next_principal),
            email: Some(email.to_string()),
            phone: None,
            metadata,
        }
    }
}

/// In-memory identity provider.
pub struct MemoryIdentityProvider {
    state: Mutex<ProviderState>,
    changes: broadcast::Sender<PrincipalChange>,
    sign_out_calls: AtomicUsize,
}

impl Default for MemoryIdentityProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryIdentityProvider {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(ProviderState::default()),
            changes,
            sign_out_calls: AtomicUsize::new(0),
        }
    }

    /// Require email confirmation: sign-up returns no tokens and password
    /// login fails until `confirm_email` is called.
    pub fn with_email_confirmation(mut self, required: bool) -> Self {
        self.state.get_mut().behavior.require_confirmation = required;
        self
    }

    /// Lifetime of issued access tokens (encoded in their `exp` claim).
    pub fn with_token_ttl(mut self, ttl: Duration) -> Self {
        self.state.get_mut().behavior.token_ttl = ttl;
        self
    }

    /// Delay every call by `latency`.
    pub async fn set_latency(&self, latency: Duration) {
        self.state.lock().await.behavior.latency = latency;
    }

    /// Make every subsequent call suspend forever.
    pub async fn set_hang(&self, hang: bool) {
        self.state.lock().await.behavior.hang = hang;
    }

    /// Fail every subsequent call with a network error.
    pub async fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().await.behavior.unreachable = unreachable;
    }

    /// Fail sign-out with a network error (local state is left untouched).
    pub async fn set_fail_sign_out(&self, fail: bool) {
        self.state.lock().await.behavior.fail_sign_out = fail;
    }

    /// Register a confirmed account.
    pub async fn add_account(
        &self,
        email: &str,
        password: &str,
        metadata: PrincipalMetadata,
    ) -> Principal {
        let mut state = self.state.lock().await;
        let principal = state.create_principal(email, metadata);
        state.accounts.insert(
            email.to_lowercase(),
            Account {
                password: password.to_string(),
                principal: principal.clone(),
                confirmed: true,
            },
        );
        principal
    }

    /// Mark an account's email as confirmed.
    pub async fn confirm_email(&self, email: &str) {
        if let Some(account) = self.state.lock().await.accounts.get_mut(&email.to_lowercase()) {
            account.confirmed = true;
        }
    }

    /// Tokens an external OAuth provider would hand back in the callback URL.
    ///
    /// Creates the principal on first sight, like a hosted backend does for
    /// OAuth sign-ins.
    pub async fn oauth_tokens(&self, email: &str, metadata: PrincipalMetadata) -> TokenPair {
        let mut state = self.state.lock().await;
        let key = email.to_lowercase();
        let principal_id = match state.accounts.get(&key) {
            Some(account) => account.principal.id.clone(),
            None => {
                let principal = state.create_principal(email, metadata);
                let id = principal.id.clone();
                state.accounts.insert(
                    key,
                    Account {
                        password: String::new(),
                        principal,
                        confirmed: true,
                    },
                );
                id
            }
        };
        state.issue_tokens(&principal_id)
    }

    /// Invalidate every outstanding refresh token.
    pub async fn revoke_refresh_tokens(&self) {
        self.state.lock().await.refresh_tokens.clear();
    }

    /// Emit a change as if the provider detected it on its own.
    pub fn simulate_change(&self, change: PrincipalChange) {
        let _ = self.changes.send(change);
    }

    /// Token pair of the provider-side session, if any.
    pub async fn current_tokens(&self) -> Option<TokenPair> {
        self.state
            .lock()
            .await
            .current
            .as_ref()
            .map(|(_, t)| t.clone())
    }

    /// Password reset requests received so far, as `(email, redirect_url)`.
    pub async fn password_resets(&self) -> Vec<(String, String)> {
        self.state.lock().await.password_resets.clone()
    }

    /// Number of sign-out calls received, successful or not.
    pub fn sign_out_calls(&self) -> usize {
        self.sign_out_calls.load(Ordering::Relaxed)
    }

    /// Apply configured latency/hang/unreachable behavior.
    async fn network(&self) -> Result<()> {
        let (latency, hang, unreachable) = {
            let state = self.state.lock().await;
            (
                state.behavior.latency,
                state.behavior.hang,
                state.behavior.unreachable,
            )
        };
        if hang {
            std::future::pending::<()>().await;
        }
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if unreachable {
            return Err(ProviderError::Network("network request failed".into()));
        }
        Ok(())
    }

    fn emit(&self, kind: PrincipalChangeKind, principal: Option<Principal>, tokens: Option<TokenPair>) {
        debug!(kind = kind.label(), "memory provider principal change");
        let _ = self.changes.send(PrincipalChange {
            kind,
            principal,
            tokens,
        });
    }
}

fn api_error(status: u16, code: &str, message: &str) -> ProviderError {
    ProviderError::Api {
        status: Some(status),
        code: Some(code.to_string()),
        message: message.to_string(),
    }
}

impl IdentityProvider for MemoryIdentityProvider {
    fn id(&self) -> &str {
        "memory"
    }

    fn sign_in_with_password<'a>(
        &'a self,
        email: &'a str,
        password: &'a str,
    ) -> BoxFuture<'a, Result<AuthGrant>> {
        Box::pin(async move {
            self.network().await?;
            let mut state = self.state.lock().await;
            let (principal, confirmed) = match state.accounts.get(&email.to_lowercase()) {
                Some(account) if account.password == password && !account.password.is_empty() => {
                    (account.principal.clone(), account.confirmed)
                }
                _ => {
                    return Err(api_error(400, "invalid_credentials", "Invalid login credentials"));
                }
            };
            if !confirmed {
                return Err(api_error(400, "email_not_confirmed", "Email not confirmed"));
            }
            let tokens = state.issue_tokens(&principal.id);
            state.current = Some((principal.clone(), tokens.clone()));
            drop(state);
            self.emit(
                PrincipalChangeKind::SignedIn,
                Some(principal.clone()),
                Some(tokens.clone()),
            );
            Ok(AuthGrant { principal, tokens })
        })
    }

    fn sign_up<'a>(
        &'a self,
        email: &'a str,
        password: &'a str,
        metadata: &'a PrincipalMetadata,
    ) -> BoxFuture<'a, Result<SignUpOutcome>> {
        Box::pin(async move {
            self.network().await?;
            let mut state = self.state.lock().await;
            let key = email.to_lowercase();
            if state.accounts.contains_key(&key) {
                return Err(api_error(422, "user_already_exists", "User already registered"));
            }
            if password.chars().count() < MIN_PASSWORD_LEN {
                return Err(api_error(
                    422,
                    "weak_password",
                    "Password should be at least 6 characters",
                ));
            }
            let principal = state.create_principal(email, metadata.clone());
            let confirmed = !state.behavior.require_confirmation;
            state.accounts.insert(
                key,
                Account {
                    password: password.to_string(),
                    principal: principal.clone(),
                    confirmed,
                },
            );
            if !confirmed {
                return Ok(SignUpOutcome {
                    principal,
                    tokens: None,
                });
            }
            let tokens = state.issue_tokens(&principal.id);
            state.current = Some((principal.clone(), tokens.clone()));
            drop(state);
            self.emit(
                PrincipalChangeKind::SignedIn,
                Some(principal.clone()),
                Some(tokens.clone()),
            );
            Ok(SignUpOutcome {
                principal,
                tokens: Some(tokens),
            })
        })
    }

    fn sign_out(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.sign_out_calls.fetch_add(1, Ordering::Relaxed);
            let current = self.state.lock().await.current.take();
            self.emit(PrincipalChangeKind::SignedOut, None, None);

            self.network().await?;
            let mut state = self.state.lock().await;
            if state.behavior.fail_sign_out {
                return Err(ProviderError::Network("sign out request failed".into()));
            }
            if let Some((_, tokens)) = current {
                state.access_tokens.remove(&tokens.access_token);
                state.refresh_tokens.remove(&tokens.refresh_token);
            }
            Ok(())
        })
    }

    fn refresh_session<'a>(&'a self, refresh_token: &'a str) -> BoxFuture<'a, Result<TokenPair>> {
        Box::pin(async move {
            self.network().await?;
            let mut state = self.state.lock().await;
            let principal_id = state.refresh_tokens.remove(refresh_token).ok_or_else(|| {
                api_error(
                    400,
                    "refresh_token_not_found",
                    "Invalid Refresh Token: Refresh Token Not Found",
                )
            })?;
            let principal = state
                .principal_by_id(&principal_id)
                .ok_or_else(|| api_error(404, "user_not_found", "User not found"))?;
            let tokens = state.issue_tokens(&principal_id);
            state.current = Some((principal.clone(), tokens.clone()));
            drop(state);
            self.emit(
                PrincipalChangeKind::TokenRefreshed,
                Some(principal),
                Some(tokens.clone()),
            );
            Ok(tokens)
        })
    }

    fn current_principal(&self) -> BoxFuture<'_, Result<Option<Principal>>> {
        Box::pin(async move {
            self.network().await?;
            let state = self.state.lock().await;
            Ok(state.current.as_ref().map(|(p, _)| p.clone()))
        })
    }

    fn authorization_url<'a>(
        &'a self,
        provider: &'a str,
        redirect_url: &'a str,
        options: &'a AuthorizationOptions,
    ) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            self.network().await?;
            let mut url = format!("memory://authorize?provider={provider}&redirect_to={redirect_url}");
            for (key, value) in &options.query_params {
                url.push_str(&format!("&{key}={value}"));
            }
            Ok(url)
        })
    }

    fn set_session<'a>(&'a self, tokens: &'a TokenPair) -> BoxFuture<'a, Result<AuthGrant>> {
        Box::pin(async move {
            self.network().await?;
            let mut state = self.state.lock().await;
            let known = state.access_tokens.get(&tokens.access_token).cloned();
            let (principal_id, tokens) = match known {
                Some(id) => (id, tokens.clone()),
                None => match state.refresh_tokens.remove(&tokens.refresh_token) {
                    Some(id) => {
                        let rotated = state.issue_tokens(&id);
                        (id, rotated)
                    }
                    None => return Err(api_error(401, "bad_jwt", "invalid JWT")),
                },
            };
            let principal = state
                .principal_by_id(&principal_id)
                .ok_or_else(|| api_error(404, "user_not_found", "User not found"))?;
            state.current = Some((principal.clone(), tokens.clone()));
            drop(state);
            self.emit(
                PrincipalChangeKind::SignedIn,
                Some(principal.clone()),
                Some(tokens.clone()),
            );
            Ok(AuthGrant { principal, tokens })
        })
    }

    fn principal_changes(&self) -> broadcast::Receiver<PrincipalChange> {
        self.changes.subscribe()
    }

    fn reset_password_for_email<'a>(
        &'a self,
        email: &'a str,
        redirect_url: &'a str,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.network().await?;
            self.state
                .lock()
                .await
                .password_resets
                .push((email.to_string(), redirect_url.to_string()));
            Ok(())
        })
    }

    fn update_principal_metadata<'a>(
        &'a self,
        metadata: &'a PrincipalMetadata,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.network().await?;
            let mut state = self.state.lock().await;
            let (principal, tokens) = state.current.clone().ok_or(ProviderError::NoSession)?;
            let mut updated = principal.clone();
            merge_metadata(&mut updated.metadata, metadata);
            if let Some(account) = state
                .accounts
                .values_mut()
                .find(|a| a.principal.id == principal.id)
            {
                account.principal = updated.clone();
            }
            state.current = Some((updated.clone(), tokens));
            drop(state);
            self.emit(PrincipalChangeKind::UserUpdated, Some(updated), None);
            Ok(())
        })
    }
}

/// Overwrite fields of `target` that are set in `source`.
fn merge_metadata(target: &mut PrincipalMetadata, source: &PrincipalMetadata) {
    if source.first_name.is_some() {
        target.first_name = source.first_name.clone();
    }
    if source.last_name.is_some() {
        target.last_name = source.last_name.clone();
    }
    if source.full_name.is_some() {
        target.full_name = source.full_name.clone();
    }
    if source.name.is_some() {
        target.name = source.name.clone();
    }
    if source.avatar_url.is_some() {
        target.avatar_url = source.avatar_url.clone();
    }
}

/// In-memory record store with latency and one-shot failure injection.
pub struct MemoryRecordStore {
    tables: Mutex<HashMap<String, Vec<serde_json::Value>>>,
    fail_next: Mutex<Option<RecordError>>,
    latency: Mutex<Duration>,
    next_id: AtomicU64,
}

impl Default for MemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(HashMap::new()),
            fail_next: Mutex::new(None),
            latency: Mutex::new(Duration::ZERO),
            next_id: AtomicU64::new(1),
        }
    }

    /// Delay every call by `latency`.
    pub async fn set_latency(&self, latency: Duration) {
        *self.latency.lock().await = latency;
    }

    /// Fail the next operation (of any kind) with `error`.
    pub async fn fail_next(&self, error: RecordError) {
        *self.fail_next.lock().await = Some(error);
    }

    /// Snapshot of every row in `table`.
    pub async fn rows(&self, table: &str) -> Vec<serde_json::Value> {
        self.tables
            .lock()
            .await
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of rows in `table` matching `filter`.
    pub async fn count(&self, table: &str, filter: &Filter) -> usize {
        self.tables
            .lock()
            .await
            .get(table)
            .map(|rows| rows.iter().filter(|r| filter.matches(r)).count())
            .unwrap_or(0)
    }

    async fn before_call(&self) -> std::result::Result<(), RecordError> {
        let latency = *self.latency.lock().await;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        match self.fail_next.lock().await.take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

impl RecordStore for MemoryRecordStore {
    fn find_one<'a>(
        &'a self,
        table: &'a str,
        filter: &'a Filter,
    ) -> BoxFuture<'a, std::result::Result<serde_json::Value, RecordError>> {
        Box::pin(async move {
            self.before_call().await?;
            let tables = self.tables.lock().await;
            let mut matches = tables
                .get(table)
                .into_iter()
                .flatten()
                .filter(|row| filter.matches(row));
            let first = matches.next().cloned().ok_or(RecordError::NotFound)?;
            if matches.next().is_some() {
                return Err(RecordError::Rejected {
                    status: Some(406),
                    code: Some("PGRST116".into()),
                    message: "JSON object requested, multiple rows returned".into(),
                });
            }
            Ok(first)
        })
    }

    fn insert<'a>(
        &'a self,
        table: &'a str,
        row: serde_json::Value,
    ) -> BoxFuture<'a, std::result::Result<serde_json::Value, RecordError>> {
        Box::pin(async move {
            self.before_call().await?;
            let mut row = row;
            let object = row
                .as_object_mut()
                .ok_or_else(|| RecordError::Decode("row must be a JSON object".into()))?;
            if !object.contains_key("id") {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                object.insert("id".into(), serde_json::Value::from(id));
            }
            self.tables
                .lock()
                .await
                .entry(table.to_string())
                .or_default()
                .push(row.clone());
            Ok(row)
        })
    }

    fn update<'a>(
        &'a self,
        table: &'a str,
        filter: &'a Filter,
        patch: serde_json::Value,
    ) -> BoxFuture<'a, std::result::Result<serde_json::Value, RecordError>> {
        Box::pin(async move {
            self.before_call().await?;
            let patch = patch
                .as_object()
                .cloned()
                .ok_or_else(|| RecordError::Decode("patch must be a JSON object".into()))?;
            let mut tables = self.tables.lock().await;
            let mut updated = None;
            for row in tables.get_mut(table).into_iter().flatten() {
                if !filter.matches(row) {
                    continue;
                }
                if let Some(object) = row.as_object_mut() {
                    for (key, value) in &patch {
                        object.insert(key.clone(), value.clone());
                    }
                }
                if updated.is_none() {
                    updated = Some(row.clone());
                }
            }
            updated.ok_or(RecordError::NotFound)
        })
    }
}
