//! Auth session controller
//!
//! Owns the session lifecycle: password login, registration, logout,
//! refresh, cold-start restore and OAuth completion. Collaborators are
//! injected as trait objects so the controller runs against the hosted
//! backend in production and in-memory doubles in tests.
//!
//! Concurrency model:
//! - Session-changing operations are serialized by `ops`.
//! - Every operation captures the session `epoch` when it starts. `logout`
//!   bumps the epoch before queueing for `ops`, so an operation that was
//!   already running when logout was requested cannot install its result:
//!   its commit sees a newer epoch and fails with `Error::Superseded`.
//! - Phase changes go through the pure state machine in `state`, under the
//!   `inner` lock, and the credential I/O it asks for happens before the new
//!   phase is installed.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, Weak};
use std::time::{Duration, Instant};

use auth_core::constants::DEFAULT_TIMEOUT;
use auth_core::{
    CredentialStore, Error, ProfileOverrides, ProfileUpdate, Result, Role, RunMode, TokenVault,
    UserRecord, UserRecordSynchronizer, is_callback_url, validate_email, validate_password,
};
use chrono::{DateTime, Utc};
use identity::{
    IdentityProvider, PrincipalChange, PrincipalChangeKind, PrincipalMetadata, RecordStore,
    TokenPair,
};
use serde::Serialize;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use crate::broadcast::{AuthStateBroadcaster, Subscription};
use crate::oauth::{AuthBrowser, OAuthCompleter};
use crate::remote;
use crate::state::{Session, SessionAction, SessionEvent, SessionPhase, handle_event};

/// Tunables for [`AuthSessionController`].
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Upper bound on each remote round trip.
    pub timeout: Duration,
    /// Decides the OAuth redirect URL.
    pub run_mode: RunMode,
    /// Where password reset emails link back to.
    pub password_reset_redirect: String,
    /// Re-sync the user record when the provider reports a token refresh.
    pub resync_on_token_refresh: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            run_mode: RunMode::Development {
                experience_url: None,
            },
            password_reset_redirect: "schoolapp://reset-password".into(),
            resync_on_token_refresh: true,
        }
    }
}

/// Profile details collected at sign-up.
#[derive(Debug, Clone, Default)]
pub struct RegistrationDetails {
    pub first_name: String,
    pub last_name: String,
    pub role: Role,
    pub phone: Option<String>,
}

impl RegistrationDetails {
    fn metadata(&self) -> PrincipalMetadata {
        PrincipalMetadata {
            first_name: Some(self.first_name.clone()),
            last_name: Some(self.last_name.clone()),
            full_name: Some(
                format!("{} {}", self.first_name, self.last_name)
                    .trim()
                    .to_string(),
            ),
            ..Default::default()
        }
    }

    fn overrides(&self) -> ProfileOverrides {
        ProfileOverrides {
            first_name: Some(self.first_name.clone()),
            last_name: Some(self.last_name.clone()),
            role: Some(self.role),
            phone: self.phone.clone(),
            avatar: None,
        }
    }
}

/// Result of [`AuthSessionController::register`].
#[derive(Debug, Clone)]
pub enum Registration {
    /// The provider issued a session straight away.
    Active(Session),
    /// The account exists but its email must be confirmed before login.
    ConfirmationPending(UserRecord),
}

impl Registration {
    pub fn user(&self) -> &UserRecord {
        match self {
            Registration::Active(session) => &session.user,
            Registration::ConfirmationPending(user) => user,
        }
    }

    pub fn email_confirmation_required(&self) -> bool {
        matches!(self, Registration::ConfirmationPending(_))
    }

    /// The access token, or `""` while confirmation is pending.
    pub fn access_token(&self) -> &str {
        match self {
            Registration::Active(session) => &session.access_token,
            Registration::ConfirmationPending(_) => "",
        }
    }

    pub fn session(&self) -> Option<&Session> {
        match self {
            Registration::Active(session) => Some(session),
            Registration::ConfirmationPending(_) => None,
        }
    }
}

/// Snapshot of the controller's observable state.
#[derive(Clone, Serialize)]
pub struct AuthState {
    pub user: Option<UserRecord>,
    #[serde(skip)]
    pub access_token: Option<String>,
    #[serde(skip)]
    pub refresh_token: Option<String>,
    pub is_authenticated: bool,
    pub is_loading: bool,
    pub error: Option<String>,
    pub email_confirmation_pending: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub phase: &'static str,
}

impl fmt::Debug for AuthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthState")
            .field("phase", &self.phase)
            .field(
                "user",
                &self.user.as_ref().map(|u| u.auth_principal_id.as_str()),
            )
            .field("has_tokens", &self.access_token.is_some())
            .field("is_loading", &self.is_loading)
            .field("error", &self.error)
            .finish()
    }
}

#[derive(Default)]
struct Inner {
    phase: SessionPhase,
    in_flight: usize,
    error: Option<String>,
}

impl Inner {
    fn snapshot(&self) -> AuthState {
        let session = self.phase.session();
        AuthState {
            user: self.phase.user().cloned(),
            access_token: session.map(|s| s.access_token.clone()),
            refresh_token: session.map(|s| s.refresh_token.clone()),
            is_authenticated: session.is_some(),
            is_loading: self.in_flight > 0,
            error: self.error.clone(),
            email_confirmation_pending: matches!(
                self.phase,
                SessionPhase::AwaitingConfirmation { .. }
            ),
            expires_at: session.and_then(|s| s.expires_at),
            phase: self.phase.label(),
        }
    }
}

/// Failures worth keeping stored tokens for: the provider never judged them.
fn is_transient(error: &Error) -> bool {
    matches!(
        error,
        Error::NetworkUnreachable(_) | Error::Timeout(_) | Error::TooManyRequests
    )
}

/// Coordinates authentication against the identity provider, the user
/// record store and local credential storage.
pub struct AuthSessionController {
    provider: Arc<dyn IdentityProvider>,
    synchronizer: UserRecordSynchronizer,
    vault: TokenVault,
    oauth: OAuthCompleter,
    broadcaster: AuthStateBroadcaster,
    config: ControllerConfig,
    inner: Mutex<Inner>,
    ops: Mutex<()>,
    epoch: AtomicU64,
    listener: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl AuthSessionController {
    pub fn new(
        provider: Arc<dyn IdentityProvider>,
        records: Arc<dyn RecordStore>,
        credentials: Arc<dyn CredentialStore>,
        browser: Arc<dyn AuthBrowser>,
        config: ControllerConfig,
    ) -> Arc<Self> {
        let synchronizer = UserRecordSynchronizer::new(records);
        let oauth = OAuthCompleter::new(
            provider.clone(),
            synchronizer.clone(),
            browser,
            config.run_mode.clone(),
            config.timeout,
        );
        Arc::new(Self {
            provider,
            synchronizer,
            vault: TokenVault::new(credentials),
            oauth,
            broadcaster: AuthStateBroadcaster::new(),
            config,
            inner: Mutex::new(Inner::default()),
            ops: Mutex::new(()),
            epoch: AtomicU64::new(0),
            listener: std::sync::Mutex::new(None),
        })
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    // --- Operations ---

    /// Password login.
    pub async fn login(&self, email: &str, password: &str) -> Result<Session> {
        self.run("login", async {
            validate_email(email)?;
            validate_password(password)?;
            let epoch = self.current_epoch();
            let _op = self.ops.lock().await;

            let grant = remote::call(
                self.config.timeout,
                self.provider.sign_in_with_password(email.trim(), password),
            )
            .await?;
            let user = remote::within(
                self.config.timeout,
                self.synchronizer.sync(&grant.principal, None),
            )
            .await?;
            info!(principal_id = %grant.principal.id, role = %user.role, "password login succeeded");
            self.establish(epoch, Session::new(user, grant.tokens)).await
        })
        .await
    }

    /// Create an account and its user record.
    pub async fn register(
        &self,
        email: &str,
        password: &str,
        details: &RegistrationDetails,
    ) -> Result<Registration> {
        self.run("register", async {
            validate_email(email)?;
            validate_password(password)?;
            let epoch = self.current_epoch();
            let _op = self.ops.lock().await;

            let metadata = details.metadata();
            let outcome = remote::call(
                self.config.timeout,
                self.provider.sign_up(email.trim(), password, &metadata),
            )
            .await?;
            let overrides = details.overrides();
            let user = remote::within(
                self.config.timeout,
                self.synchronizer.sync(&outcome.principal, Some(&overrides)),
            )
            .await?;

            match outcome.tokens {
                Some(tokens) => {
                    info!(principal_id = %outcome.principal.id, "registration produced a session");
                    let session = self.establish(epoch, Session::new(user, tokens)).await?;
                    Ok(Registration::Active(session))
                }
                None => {
                    info!(principal_id = %outcome.principal.id, "registration awaiting email confirmation");
                    self.commit(epoch, SessionEvent::ConfirmationRequired(user.clone()))
                        .await?;
                    Ok(Registration::ConfirmationPending(user))
                }
            }
        })
        .await
    }

    /// End the session locally and at the provider.
    ///
    /// Local state and stored credentials are cleared even when the remote
    /// sign-out fails or times out.
    pub async fn logout(&self) -> Result<()> {
        self.run("logout", async {
            self.epoch.fetch_add(1, Ordering::SeqCst);
            let _op = self.ops.lock().await;

            let signed_out = remote::call(self.config.timeout, self.provider.sign_out()).await;
            if let Err(e) = &signed_out {
                warn!(error = %e, "remote sign-out failed, clearing local session anyway");
            }
            {
                let mut inner = self.inner.lock().await;
                self.apply(&mut inner, SessionEvent::SignedOut).await?;
            }
            // A successful sign-out is announced by the provider itself.
            if signed_out.is_err() {
                self.broadcaster.publish(None);
            }
            Ok(())
        })
        .await
    }

    /// Exchange the stored refresh token for a new pair.
    ///
    /// Any failure clears the session.
    pub async fn refresh(&self) -> Result<Session> {
        self.run("refresh", async {
            let epoch = self.current_epoch();
            let _op = self.ops.lock().await;
            match self.refresh_locked(epoch).await {
                Ok(session) => Ok(session),
                Err(Error::Superseded) => Err(Error::Superseded),
                Err(e) => {
                    if self.invalidate(epoch).await {
                        self.broadcaster.publish(None);
                    }
                    Err(match e {
                        Error::NoRefreshToken => Error::NoRefreshToken,
                        other => Error::RefreshFailed(other.to_string()),
                    })
                }
            }
        })
        .await
    }

    async fn refresh_locked(&self, epoch: u64) -> Result<Session> {
        let refresh_token = self
            .vault
            .refresh_token()
            .await?
            .ok_or(Error::NoRefreshToken)?;
        let tokens = remote::call(
            self.config.timeout,
            self.provider.refresh_session(&refresh_token),
        )
        .await?;

        let current = self.inner.lock().await.phase.session().cloned();
        match current {
            Some(session) => {
                let rotated = Session::new(session.user, tokens.clone());
                self.commit(epoch, SessionEvent::TokensRotated(tokens))
                    .await?;
                debug!(principal_id = %rotated.user.auth_principal_id, "tokens rotated");
                Ok(rotated)
            }
            // Stored tokens but no in-memory session: resolve the principal.
            None => {
                let grant =
                    remote::call(self.config.timeout, self.provider.set_session(&tokens)).await?;
                let user = remote::within(
                    self.config.timeout,
                    self.synchronizer.sync(&grant.principal, None),
                )
                .await?;
                self.establish(epoch, Session::new(user, grant.tokens))
                    .await
            }
        }
    }

    /// Restore the session persisted by an earlier run.
    ///
    /// Nothing stored yields `Error::NotFound`. Tokens the provider rejects
    /// are cleared; tokens that could not be checked (network, timeout) are
    /// kept for the next attempt.
    pub async fn load_persisted_session(&self) -> Result<Session> {
        self.run("load_persisted_session", async {
            let epoch = self.current_epoch();
            let _op = self.ops.lock().await;

            let Some(tokens) = self.vault.load().await? else {
                self.invalidate(epoch).await;
                return Err(Error::NotFound("no persisted session".into()));
            };

            let grant =
                match remote::call(self.config.timeout, self.provider.set_session(&tokens)).await {
                    Ok(grant) => grant,
                    Err(e) if is_transient(&e) => return Err(e),
                    Err(e) => {
                        info!(error = %e, "persisted tokens rejected, clearing them");
                        self.invalidate(epoch).await;
                        return Err(e);
                    }
                };
            let user = remote::within(
                self.config.timeout,
                self.synchronizer.sync(&grant.principal, None),
            )
            .await?;
            info!(principal_id = %grant.principal.id, "persisted session restored");
            self.establish(epoch, Session::new(user, grant.tokens))
                .await
        })
        .await
    }

    /// OAuth sign-in with `provider_name` through the configured browser.
    pub async fn oauth_sign_in(&self, provider_name: &str) -> Result<Session> {
        self.run("oauth_sign_in", async {
            let epoch = self.current_epoch();
            // The browser round trip can take minutes; don't hold `ops` for it.
            let callback_url = self.oauth.browse(provider_name).await?;

            let _op = self.ops.lock().await;
            self.ensure_current(epoch)?;
            let session = self.oauth.complete_from_url(&callback_url).await?;
            self.establish(epoch, session).await
        })
        .await
    }

    /// Passive OAuth entry point for a callback URL delivered as a deep link.
    ///
    /// Links that are not auth callbacks are ignored and yield `Ok(None)`.
    pub async fn handle_deep_link(&self, url: &str) -> Result<Option<Session>> {
        if !is_callback_url(url) {
            debug!("ignoring deep link that is not an auth callback");
            return Ok(None);
        }
        self.run("deep_link", async {
            let epoch = self.current_epoch();
            let _op = self.ops.lock().await;
            let session = self.oauth.complete_from_url(url).await?;
            self.establish(epoch, session).await.map(Some)
        })
        .await
    }

    /// Ask the provider to email a password reset link.
    pub async fn forgot_password(&self, email: &str) -> Result<()> {
        self.run("forgot_password", async {
            validate_email(email)?;
            remote::call(
                self.config.timeout,
                self.provider
                    .reset_password_for_email(email.trim(), &self.config.password_reset_redirect),
            )
            .await
        })
        .await
    }

    /// The provider's current principal's user record, read fresh.
    pub async fn current_user(&self) -> Result<Option<UserRecord>> {
        self.run("current_user", async {
            let principal =
                remote::call(self.config.timeout, self.provider.current_principal()).await?;
            match principal {
                Some(principal) => {
                    remote::within(self.config.timeout, self.synchronizer.fetch(&principal.id))
                        .await
                }
                None => Ok(None),
            }
        })
        .await
    }

    /// Edit the signed-in user's profile.
    ///
    /// Name changes are mirrored into the provider's metadata; failing that
    /// is logged and does not fail the edit.
    pub async fn update_profile(&self, update: &ProfileUpdate) -> Result<UserRecord> {
        self.run("update_profile", async {
            let epoch = self.current_epoch();
            let _op = self.ops.lock().await;
            let principal_id = match self.inner.lock().await.phase.session() {
                Some(session) => session.user.auth_principal_id.clone(),
                None => return Err(Error::NotFound("no active session".into())),
            };

            let user = remote::within(
                self.config.timeout,
                self.synchronizer.update_profile(&principal_id, update),
            )
            .await?;

            if update.touches_name() {
                let metadata = PrincipalMetadata {
                    first_name: Some(user.first_name.clone()),
                    last_name: Some(user.last_name.clone()),
                    full_name: Some(user.display_name()),
                    ..Default::default()
                };
                if let Err(e) = remote::call(
                    self.config.timeout,
                    self.provider.update_principal_metadata(&metadata),
                )
                .await
                {
                    warn!(error = %e, "failed to mirror name change into provider metadata");
                }
            }

            self.commit(epoch, SessionEvent::UserUpdated(user.clone()))
                .await?;
            Ok(user)
        })
        .await
    }

    // --- Queries ---

    pub async fn state(&self) -> AuthState {
        self.inner.lock().await.snapshot()
    }

    pub async fn session(&self) -> Option<Session> {
        self.inner.lock().await.phase.session().cloned()
    }

    pub async fn access_token(&self) -> Option<String> {
        self.inner
            .lock()
            .await
            .phase
            .session()
            .map(|s| s.access_token.clone())
    }

    pub async fn clear_error(&self) {
        self.inner.lock().await.error = None;
    }

    // --- Notifications ---

    /// Register for auth-state changes reported by the provider.
    ///
    /// Delivery requires [`start_auth_listener`](Self::start_auth_listener).
    pub fn subscribe_to_auth_changes<F>(&self, callback: F) -> Subscription
    where
        F: Fn(Option<&UserRecord>) + Send + Sync + 'static,
    {
        self.broadcaster.subscribe(callback)
    }

    /// Start consuming the provider's principal changes. Idempotent.
    pub fn start_auth_listener(self: &Arc<Self>) {
        let mut slot = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let changes = self.provider.principal_changes();
        *slot = Some(tokio::spawn(listen(Arc::downgrade(self), changes)));
        info!(provider = self.provider.id(), "auth listener started");
    }

    pub fn stop_auth_listener(&self) {
        if let Some(handle) = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
            info!("auth listener stopped");
        }
    }

    async fn on_principal_change(&self, change: PrincipalChange) {
        let kind = change.kind.label();
        let Some(principal) = change.principal else {
            debug!(kind, "provider reports no principal");
            self.broadcaster.publish(None);
            return;
        };

        if change.kind == PrincipalChangeKind::TokenRefreshed {
            if let Some(tokens) = change.tokens {
                self.adopt_rotated_tokens(&principal.id, tokens).await;
            }
            if !self.config.resync_on_token_refresh {
                return;
            }
        }

        match remote::within(self.config.timeout, self.synchronizer.sync(&principal, None)).await
        {
            Ok(user) => {
                let mut inner = self.inner.lock().await;
                if let Err(e) = self
                    .apply(&mut inner, SessionEvent::UserUpdated(user.clone()))
                    .await
                {
                    warn!(error = %e, "failed to apply synced user record");
                }
                drop(inner);
                debug!(kind, principal_id = %principal.id, "auth change synced");
                self.broadcaster.publish(Some(&user));
            }
            Err(e) => {
                warn!(kind, principal_id = %principal.id, error = %e, "user record sync failed after auth change");
                self.broadcaster.publish(None);
            }
        }
    }

    /// Take a pair the provider rotated on its own, if it belongs to the
    /// signed-in principal and outlives the pair we hold.
    async fn adopt_rotated_tokens(&self, principal_id: &str, tokens: TokenPair) {
        let mut inner = self.inner.lock().await;
        let Some(session) = inner.phase.session() else {
            return;
        };
        let newer = match (
            auth_core::jwt::expires_at(&tokens.access_token),
            session.expires_at,
        ) {
            (Some(new), Some(held)) => new > held,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if session.user.auth_principal_id != principal_id || !newer {
            return;
        }
        if let Err(e) = self
            .apply(&mut inner, SessionEvent::TokensRotated(tokens))
            .await
        {
            warn!(error = %e, "failed to persist provider-rotated tokens");
        }
    }

    // --- Internals ---

    fn current_epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    fn ensure_current(&self, epoch: u64) -> Result<()> {
        if self.current_epoch() == epoch {
            Ok(())
        } else {
            Err(Error::Superseded)
        }
    }

    /// Wrap an operation with loading/error bookkeeping, a span and metrics.
    async fn run<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let op_id = Uuid::new_v4();
        let span = info_span!("auth_operation", operation, op_id = %op_id);
        async move {
            let started = Instant::now();
            self.inner.lock().await.in_flight += 1;

            let result = fut.await;

            {
                let mut inner = self.inner.lock().await;
                inner.in_flight = inner.in_flight.saturating_sub(1);
                match &result {
                    Ok(_) => inner.error = None,
                    Err(Error::Superseded) => {}
                    Err(e) => inner.error = Some(e.to_string()),
                }
            }

            let outcome = match &result {
                Ok(_) => {
                    debug!("operation succeeded");
                    "success"
                }
                Err(e) if e.is_decline() => {
                    info!(reason = e.category(), "operation declined by user");
                    e.category()
                }
                Err(Error::Superseded) => {
                    info!("operation superseded by logout");
                    "superseded"
                }
                Err(e) => {
                    warn!(error = %e, category = e.category(), "operation failed");
                    e.category()
                }
            };
            crate::metrics::record_operation(operation, outcome, started.elapsed().as_secs_f64());
            result
        }
        .instrument(span)
        .await
    }

    /// Apply `event` if no logout happened since `epoch` was captured.
    async fn commit(&self, epoch: u64, event: SessionEvent) -> Result<()> {
        let mut inner = self.inner.lock().await;
        self.ensure_current(epoch)?;
        self.apply(&mut inner, event).await
    }

    /// Install `session`, or report that a logout got there first.
    async fn establish(&self, epoch: u64, session: Session) -> Result<Session> {
        match self
            .commit(epoch, SessionEvent::Established(session.clone()))
            .await
        {
            Ok(()) => Ok(session),
            Err(Error::Superseded) => {
                // The provider may hold the session the logout meant to end.
                if let Err(e) = remote::call(self.config.timeout, self.provider.sign_out()).await {
                    debug!(error = %e, "sign-out of superseded session failed");
                }
                Err(Error::Superseded)
            }
            Err(e) => Err(e),
        }
    }

    /// Clear the session if no logout happened since `epoch`. Returns whether
    /// anything was cleared by this call.
    async fn invalidate(&self, epoch: u64) -> bool {
        let mut inner = self.inner.lock().await;
        if self.ensure_current(epoch).is_err() {
            return false;
        }
        let was_active = !matches!(inner.phase, SessionPhase::LoggedOut);
        if let Err(e) = self.apply(&mut inner, SessionEvent::Invalidated).await {
            warn!(error = %e, "failed to clear session");
        }
        was_active
    }

    /// Run the state machine and the credential I/O it asks for.
    ///
    /// The new phase is installed only after tokens are persisted; clearing
    /// credentials always installs it and only logs storage failures.
    async fn apply(&self, inner: &mut Inner, event: SessionEvent) -> Result<()> {
        let from = inner.phase.label();
        let (next, action) = handle_event(inner.phase.clone(), event);
        match action {
            SessionAction::PersistTokens(tokens) => self.vault.save(&tokens).await?,
            SessionAction::ClearCredentials => {
                if let Err(e) = self.vault.clear().await {
                    warn!(error = %e, "failed to clear stored credentials");
                }
            }
            SessionAction::None => {}
        }
        if from != next.label() {
            info!(from, to = next.label(), "session phase changed");
        }
        inner.phase = next;
        Ok(())
    }
}

impl Drop for AuthSessionController {
    fn drop(&mut self) {
        if let Some(handle) = self
            .listener
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

/// Listener task body: forward provider changes until the controller is gone.
async fn listen(
    controller: Weak<AuthSessionController>,
    mut changes: broadcast::Receiver<PrincipalChange>,
) {
    loop {
        let change = match changes.recv().await {
            Ok(change) => change,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "auth listener fell behind, some changes were dropped");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let Some(controller) = controller.upgrade() else {
            break;
        };
        controller.on_principal_change(change).await;
    }
    debug!("auth listener exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oauth::{BrowserOutcome, NoBrowser};
    use auth_core::constants::{AUTH_PRINCIPAL_COLUMN, USERS_TABLE};
    use auth_core::{MemoryCredentialStore, ProfileUpdate};
    use identity::{BoxFuture, Filter, MemoryIdentityProvider, MemoryRecordStore, RecordError};
    use tokio::sync::mpsc;

    const PASSWORD: &str = "Passw0rd!";

    struct Harness {
        provider: Arc<MemoryIdentityProvider>,
        records: Arc<MemoryRecordStore>,
        credentials: Arc<MemoryCredentialStore>,
        controller: Arc<AuthSessionController>,
    }

    impl Harness {
        fn new() -> Self {
            Self::with(MemoryIdentityProvider::new(), ControllerConfig::default(), Arc::new(NoBrowser))
        }

        fn with(
            provider: MemoryIdentityProvider,
            config: ControllerConfig,
            browser: Arc<dyn AuthBrowser>,
        ) -> Self {
            let provider = Arc::new(provider);
            let records = Arc::new(MemoryRecordStore::new());
            let credentials = Arc::new(MemoryCredentialStore::new());
            let controller = AuthSessionController::new(
                provider.clone(),
                records.clone(),
                credentials.clone(),
                browser,
                config,
            );
            Self {
                provider,
                records,
                credentials,
                controller,
            }
        }

        /// A second controller over the same backends, as after a restart.
        fn restart(&self) -> Arc<AuthSessionController> {
            AuthSessionController::new(
                self.provider.clone(),
                self.records.clone(),
                self.credentials.clone(),
                Arc::new(NoBrowser),
                ControllerConfig::default(),
            )
        }

        async fn account(&self, email: &str) {
            self.provider
                .add_account(
                    email,
                    PASSWORD,
                    PrincipalMetadata {
                        first_name: Some("Test".into()),
                        last_name: Some("Teacher".into()),
                        ..Default::default()
                    },
                )
                .await;
        }

        async fn stored(&self) -> Option<TokenPair> {
            TokenVault::new(self.credentials.clone()).load().await.unwrap()
        }
    }

    fn details(first: &str, last: &str, role: Role) -> RegistrationDetails {
        RegistrationDetails {
            first_name: first.into(),
            last_name: last.into(),
            role,
            phone: None,
        }
    }

    /// Subscriber that forwards the delivered email (or None) to a channel.
    fn recorder(
        controller: &AuthSessionController,
    ) -> (Subscription, mpsc::UnboundedReceiver<Option<String>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sub = controller.subscribe_to_auth_changes(move |user| {
            let _ = tx.send(user.map(|u| u.email.clone()));
        });
        (sub, rx)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Option<String>>) -> Option<String> {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no auth-state notification delivered")
            .expect("subscriber channel closed")
    }

    // --- Login / logout ---

    #[tokio::test]
    async fn login_then_logout_leaves_no_tokens() {
        let h = Harness::new();
        h.account("t@school.test").await;

        let session = h.controller.login("t@school.test", PASSWORD).await.unwrap();
        assert_eq!(session.user.first_name, "Test");
        let state = h.controller.state().await;
        assert!(state.is_authenticated);
        assert!(!state.is_loading);
        assert_eq!(state.phase, "logged_in");
        assert_eq!(h.stored().await.unwrap(), session.tokens());

        h.controller.logout().await.unwrap();
        let state = h.controller.state().await;
        assert!(!state.is_authenticated);
        assert!(state.user.is_none());
        assert!(state.access_token.is_none());
        assert!(h.stored().await.is_none());
        assert!(h.credentials.is_empty().await);
    }

    #[tokio::test]
    async fn wrong_password_is_invalid_credentials_and_sets_error() {
        let h = Harness::new();
        h.account("t@school.test").await;

        let err = h.controller.login("t@school.test", "wrong-pass").await.unwrap_err();
        assert!(matches!(err, Error::InvalidCredentials));

        let state = h.controller.state().await;
        assert_eq!(state.phase, "logged_out");
        assert_eq!(
            state.error.as_deref(),
            Some("Invalid email or password. Please check your credentials.")
        );

        h.controller.clear_error().await;
        assert!(h.controller.state().await.error.is_none());
    }

    #[tokio::test]
    async fn invalid_input_is_rejected_before_any_remote_call() {
        let h = Harness::new();
        h.provider.set_unreachable(true).await;

        assert!(matches!(
            h.controller.login("not-an-email", PASSWORD).await,
            Err(Error::InvalidEmailFormat)
        ));
        assert!(matches!(
            h.controller.login("t@school.test", "123").await,
            Err(Error::WeakPassword(_))
        ));
    }

    #[tokio::test]
    async fn unconfirmed_email_cannot_log_in() {
        let h = Harness::with(
            MemoryIdentityProvider::new().with_email_confirmation(true),
            ControllerConfig::default(),
            Arc::new(NoBrowser),
        );
        h.controller
            .register("new@school.test", PASSWORD, &details("A", "B", Role::Student))
            .await
            .unwrap();

        let err = h.controller.login("new@school.test", PASSWORD).await.unwrap_err();
        assert!(matches!(err, Error::EmailUnconfirmed));
    }

    #[tokio::test(start_paused = true)]
    async fn hung_provider_times_out_and_state_is_unchanged() {
        let h = Harness::new();
        h.account("t@school.test").await;
        h.provider.set_hang(true).await;

        let err = h.controller.login("t@school.test", PASSWORD).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(d) if d == DEFAULT_TIMEOUT));

        let state = h.controller.state().await;
        assert_eq!(state.phase, "logged_out");
        assert!(!state.is_loading);
        assert!(h.stored().await.is_none());
    }

    #[tokio::test]
    async fn unreachable_provider_is_network_error() {
        let h = Harness::new();
        h.account("t@school.test").await;
        h.provider.set_unreachable(true).await;

        let err = h.controller.login("t@school.test", PASSWORD).await.unwrap_err();
        assert!(matches!(err, Error::NetworkUnreachable(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn logout_takes_precedence_over_in_flight_login() {
        let h = Harness::new();
        h.account("t@school.test").await;
        h.provider.set_latency(Duration::from_millis(200)).await;

        let controller = h.controller.clone();
        let login = tokio::spawn(async move { controller.login("t@school.test", PASSWORD).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        h.controller.logout().await.unwrap();
        let login_result = login.await.unwrap();

        assert!(matches!(login_result, Err(Error::Superseded)));
        let state = h.controller.state().await;
        assert_eq!(state.phase, "logged_out");
        assert!(state.error.is_none());
        assert!(h.stored().await.is_none());
        assert!(h.provider.current_tokens().await.is_none());
    }

    #[tokio::test]
    async fn logout_clears_locally_when_remote_sign_out_fails() {
        let h = Harness::new();
        h.account("t@school.test").await;
        h.controller.login("t@school.test", PASSWORD).await.unwrap();
        h.provider.set_fail_sign_out(true).await;

        let (_sub, mut rx) = recorder(&h.controller);
        h.controller.logout().await.unwrap();

        assert_eq!(h.controller.state().await.phase, "logged_out");
        assert!(h.stored().await.is_none());
        assert_eq!(next(&mut rx).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn logout_clears_locally_when_remote_sign_out_hangs() {
        let h = Harness::new();
        h.account("t@school.test").await;
        h.controller.login("t@school.test", PASSWORD).await.unwrap();
        h.provider.set_hang(true).await;

        h.controller.logout().await.unwrap();
        assert_eq!(h.controller.state().await.phase, "logged_out");
        assert!(h.stored().await.is_none());
    }

    // --- Registration ---

    #[tokio::test]
    async fn register_with_confirmation_required() {
        let h = Harness::with(
            MemoryIdentityProvider::new().with_email_confirmation(true),
            ControllerConfig::default(),
            Arc::new(NoBrowser),
        );

        let registration = h
            .controller
            .register("new@x.com", PASSWORD, &details("A", "B", Role::Student))
            .await
            .unwrap();

        assert!(registration.email_confirmation_required());
        assert_eq!(registration.access_token(), "");
        assert_eq!(registration.user().role, Role::Student);
        assert_eq!(registration.user().first_name, "A");

        let filter = Filter::eq(AUTH_PRINCIPAL_COLUMN, registration.user().auth_principal_id.clone());
        assert_eq!(h.records.count(USERS_TABLE, &filter).await, 1);
        assert!(h.stored().await.is_none());

        let state = h.controller.state().await;
        assert!(state.email_confirmation_pending);
        assert!(!state.is_authenticated);
        assert_eq!(state.user.unwrap().email, "new@x.com");
    }

    #[tokio::test]
    async fn register_without_confirmation_logs_in() {
        let h = Harness::new();
        let registration = h
            .controller
            .register("t@school.test", PASSWORD, &details("Grace", "Hopper", Role::Teacher))
            .await
            .unwrap();

        assert!(!registration.email_confirmation_required());
        let session = registration.session().unwrap();
        assert_eq!(session.user.role, Role::Teacher);
        assert!(!registration.access_token().is_empty());
        assert_eq!(h.stored().await.unwrap(), session.tokens());
        assert!(h.controller.state().await.is_authenticated);
    }

    #[tokio::test]
    async fn duplicate_registration_is_reported() {
        let h = Harness::new();
        h.account("t@school.test").await;

        let err = h
            .controller
            .register("t@school.test", PASSWORD, &details("A", "B", Role::Parent))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EmailAlreadyRegistered));
    }

    #[tokio::test]
    async fn record_store_failure_fails_login_without_session() {
        let h = Harness::new();
        h.account("t@school.test").await;
        h.records
            .fail_next(RecordError::Network("connection reset".into()))
            .await;

        let err = h.controller.login("t@school.test", PASSWORD).await.unwrap_err();
        assert!(matches!(err, Error::Record(RecordError::Network(_))));
        assert_eq!(h.controller.state().await.phase, "logged_out");
        assert!(h.stored().await.is_none());
    }

    // --- Refresh / restore ---

    #[tokio::test]
    async fn refresh_rotates_and_persists_tokens() {
        let h = Harness::new();
        h.account("t@school.test").await;
        let first = h.controller.login("t@school.test", PASSWORD).await.unwrap();

        let refreshed = h.controller.refresh().await.unwrap();
        assert_ne!(refreshed.refresh_token, first.refresh_token);
        assert_eq!(refreshed.user.auth_principal_id, first.user.auth_principal_id);
        assert_eq!(h.stored().await.unwrap(), refreshed.tokens());
        assert_eq!(
            h.controller.access_token().await.as_deref(),
            Some(refreshed.access_token.as_str())
        );
    }

    #[tokio::test]
    async fn refresh_failure_clears_the_session() {
        let h = Harness::new();
        h.account("t@school.test").await;
        h.controller.login("t@school.test", PASSWORD).await.unwrap();
        h.provider.revoke_refresh_tokens().await;

        let err = h.controller.refresh().await.unwrap_err();
        assert!(matches!(err, Error::RefreshFailed(_)));
        assert_eq!(h.controller.state().await.phase, "logged_out");
        assert!(h.stored().await.is_none());
    }

    #[tokio::test]
    async fn refresh_without_stored_token() {
        let h = Harness::new();
        let err = h.controller.refresh().await.unwrap_err();
        assert!(matches!(err, Error::NoRefreshToken));
        assert_eq!(h.controller.state().await.phase, "logged_out");
    }

    #[tokio::test]
    async fn load_with_nothing_stored_is_not_found() {
        let h = Harness::new();
        let err = h.controller.load_persisted_session().await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert_eq!(h.controller.state().await.phase, "logged_out");
    }

    #[tokio::test]
    async fn persisted_session_survives_restart() {
        let h = Harness::new();
        h.account("t@school.test").await;
        let original = h.controller.login("t@school.test", PASSWORD).await.unwrap();

        let restarted = h.restart();
        let restored = restarted.load_persisted_session().await.unwrap();
        assert_eq!(restored.user.auth_principal_id, original.user.auth_principal_id);
        assert!(restarted.state().await.is_authenticated);

        let filter = Filter::eq(AUTH_PRINCIPAL_COLUMN, original.user.auth_principal_id.clone());
        assert_eq!(h.records.count(USERS_TABLE, &filter).await, 1);
    }

    #[tokio::test]
    async fn rejected_persisted_tokens_are_cleared() {
        let h = Harness::new();
        TokenVault::new(h.credentials.clone())
            .save(&TokenPair::new("forged.token.value", "rt-forged"))
            .await
            .unwrap();

        assert!(h.controller.load_persisted_session().await.is_err());
        assert!(h.stored().await.is_none());
    }

    #[tokio::test]
    async fn unverifiable_persisted_tokens_are_kept() {
        let h = Harness::new();
        h.account("t@school.test").await;
        h.controller.login("t@school.test", PASSWORD).await.unwrap();
        h.provider.set_unreachable(true).await;

        let restarted = h.restart();
        let err = restarted.load_persisted_session().await.unwrap_err();
        assert!(matches!(err, Error::NetworkUnreachable(_)));
        assert!(h.stored().await.is_some());
    }

    // --- OAuth ---

    struct CallbackBrowser {
        url: String,
    }

    impl AuthBrowser for CallbackBrowser {
        fn open_auth_session<'a>(
            &'a self,
            _auth_url: &'a str,
            _redirect_url: &'a str,
        ) -> BoxFuture<'a, BrowserOutcome> {
            Box::pin(async move {
                BrowserOutcome::Success {
                    url: self.url.clone(),
                }
            })
        }
    }

    fn callback_url(tokens: &TokenPair) -> String {
        format!(
            "schoolapp://auth/callback#access_token={}&refresh_token={}&token_type=bearer",
            tokens.access_token, tokens.refresh_token
        )
    }

    fn oauth_metadata() -> PrincipalMetadata {
        PrincipalMetadata {
            full_name: Some("Ada Lovelace".into()),
            avatar_url: Some("https://img.test/ada.png".into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn oauth_sign_in_through_the_browser() {
        let provider = MemoryIdentityProvider::new();
        let tokens = provider.oauth_tokens("ada@school.test", oauth_metadata()).await;
        let h = Harness::with(
            provider,
            ControllerConfig::default(),
            Arc::new(CallbackBrowser {
                url: callback_url(&tokens),
            }),
        );

        let session = h.controller.oauth_sign_in("google").await.unwrap();
        assert_eq!(session.user.first_name, "Ada");
        assert_eq!(session.user.avatar.as_deref(), Some("https://img.test/ada.png"));
        assert_eq!(session.user.role, Role::Student);
        assert!(h.controller.state().await.is_authenticated);
        assert!(h.stored().await.is_some());
    }

    #[tokio::test]
    async fn dismissed_browser_is_a_decline() {
        let h = Harness::new();
        let err = h.controller.oauth_sign_in("google").await.unwrap_err();
        assert!(matches!(err, Error::UserDismissed));
        assert!(err.is_decline());
        assert_eq!(h.controller.state().await.phase, "logged_out");
    }

    #[tokio::test]
    async fn passive_deep_link_completes_a_session() {
        let h = Harness::new();
        let tokens = h.provider.oauth_tokens("ada@school.test", oauth_metadata()).await;

        let session = h
            .controller
            .handle_deep_link(&callback_url(&tokens))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.user.email, "ada@school.test");
        assert!(h.controller.state().await.is_authenticated);
    }

    #[tokio::test]
    async fn unrelated_deep_link_is_ignored() {
        let h = Harness::new();
        let result = h
            .controller
            .handle_deep_link("schoolapp://classes/42")
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn deep_link_with_oauth_error_leaves_state_alone() {
        let h = Harness::new();
        let err = h
            .controller
            .handle_deep_link("schoolapp://auth/callback#error=access_denied&error_description=User+denied")
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "OAuth error: User denied");
        assert_eq!(h.controller.state().await.phase, "logged_out");
    }

    // --- Profile / misc ---

    #[tokio::test]
    async fn update_profile_changes_record_and_state() {
        let h = Harness::new();
        h.account("t@school.test").await;
        h.controller.login("t@school.test", PASSWORD).await.unwrap();

        let update = ProfileUpdate {
            first_name: Some("Renamed".into()),
            phone: Some("555-0100".into()),
            ..Default::default()
        };
        let user = h.controller.update_profile(&update).await.unwrap();
        assert_eq!(user.first_name, "Renamed");
        assert_eq!(user.last_name, "Teacher");

        let state = h.controller.state().await;
        assert_eq!(state.user.unwrap().phone.as_deref(), Some("555-0100"));

        let principal = h.provider.current_principal().await.unwrap().unwrap();
        assert_eq!(principal.metadata.full_name.as_deref(), Some("Renamed Teacher"));
    }

    #[tokio::test]
    async fn update_profile_requires_a_session() {
        let h = Harness::new();
        let err = h
            .controller
            .update_profile(&ProfileUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn forgot_password_uses_configured_redirect() {
        let h = Harness::new();
        h.account("t@school.test").await;
        h.controller.forgot_password("t@school.test").await.unwrap();

        assert_eq!(
            h.provider.password_resets().await,
            vec![(
                "t@school.test".to_string(),
                "schoolapp://reset-password".to_string()
            )]
        );
    }

    #[tokio::test]
    async fn current_user_reads_the_record_for_the_provider_principal() {
        let h = Harness::new();
        assert!(h.controller.current_user().await.unwrap().is_none());

        h.account("t@school.test").await;
        h.controller.login("t@school.test", PASSWORD).await.unwrap();
        let user = h.controller.current_user().await.unwrap().unwrap();
        assert_eq!(user.email, "t@school.test");
    }

    // --- Listener ---

    #[tokio::test]
    async fn listener_delivers_user_then_none() {
        let h = Harness::new();
        h.account("t@school.test").await;
        let (_sub, mut rx) = recorder(&h.controller);
        h.controller.start_auth_listener();

        h.controller.login("t@school.test", PASSWORD).await.unwrap();
        assert_eq!(next(&mut rx).await.as_deref(), Some("t@school.test"));

        h.controller.logout().await.unwrap();
        assert_eq!(next(&mut rx).await, None);
    }

    #[tokio::test]
    async fn listener_and_login_keep_one_record_per_principal() {
        let h = Harness::new();
        let principal = h
            .provider
            .add_account("t@school.test", PASSWORD, PrincipalMetadata::default())
            .await;
        h.records.set_latency(Duration::from_millis(20)).await;
        let (_sub, mut rx) = recorder(&h.controller);
        h.controller.start_auth_listener();

        h.controller.login("t@school.test", PASSWORD).await.unwrap();
        assert_eq!(next(&mut rx).await.as_deref(), Some("t@school.test"));
        h.controller.logout().await.unwrap();
        h.controller.login("t@school.test", PASSWORD).await.unwrap();

        let filter = Filter::eq(AUTH_PRINCIPAL_COLUMN, principal.id.as_str());
        assert_eq!(h.records.count(USERS_TABLE, &filter).await, 1);
        assert_eq!(h.controller.state().await.phase, "logged_in");
    }

    #[tokio::test]
    async fn sync_failure_during_auth_change_delivers_none() {
        let h = Harness::new();
        let principal = h
            .provider
            .add_account("t@school.test", PASSWORD, PrincipalMetadata::default())
            .await;
        let (_sub, mut rx) = recorder(&h.controller);
        h.controller.start_auth_listener();

        h.records
            .fail_next(RecordError::Network("connection reset".into()))
            .await;
        h.provider.simulate_change(PrincipalChange {
            kind: PrincipalChangeKind::UserUpdated,
            principal: Some(principal),
            tokens: None,
        });

        assert_eq!(next(&mut rx).await, None);
    }

    #[tokio::test]
    async fn token_refresh_resyncs_by_default() {
        let h = Harness::new();
        h.account("t@school.test").await;
        let (_sub, mut rx) = recorder(&h.controller);
        h.controller.start_auth_listener();

        h.controller.login("t@school.test", PASSWORD).await.unwrap();
        assert_eq!(next(&mut rx).await.as_deref(), Some("t@school.test"));

        h.controller.refresh().await.unwrap();
        assert_eq!(next(&mut rx).await.as_deref(), Some("t@school.test"));
    }

    #[tokio::test]
    async fn unsubscribed_callback_is_not_called() {
        let h = Harness::new();
        h.account("t@school.test").await;
        let (first, mut first_rx) = recorder(&h.controller);
        let (_second, mut second_rx) = recorder(&h.controller);
        first.unsubscribe();
        h.controller.start_auth_listener();

        h.controller.login("t@school.test", PASSWORD).await.unwrap();
        assert_eq!(next(&mut second_rx).await.as_deref(), Some("t@school.test"));
        assert!(first_rx.try_recv().is_err());
    }
}
