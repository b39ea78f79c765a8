//! Session state machine
//!
//! Pure state machine: receives events, returns (new_phase, action).
//! The controller executes the credential I/O implied by each action and
//! only then installs the new phase.

use std::fmt;

use auth_core::UserRecord;
use chrono::{DateTime, Utc};
use identity::TokenPair;

/// A live authenticated session.
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    pub user: UserRecord,
    pub access_token: String,
    pub refresh_token: String,
    /// Decoded from the access token's `exp` claim when it is a JWT.
    pub expires_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(user: UserRecord, tokens: TokenPair) -> Self {
        Self {
            user,
            expires_at: auth_core::jwt::expires_at(&tokens.access_token),
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
        }
    }

    pub fn tokens(&self) -> TokenPair {
        TokenPair::new(self.access_token.clone(), self.refresh_token.clone())
    }

    fn rotate(&mut self, tokens: TokenPair) {
        self.expires_at = auth_core::jwt::expires_at(&tokens.access_token);
        self.access_token = tokens.access_token;
        self.refresh_token = tokens.refresh_token;
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("user", &self.user.auth_principal_id)
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Where the controller is in the session lifecycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SessionPhase {
    #[default]
    LoggedOut,
    /// Registered, but the provider wants the email confirmed before
    /// issuing tokens.
    AwaitingConfirmation { user: UserRecord },
    LoggedIn { session: Session },
}

impl SessionPhase {
    pub fn label(&self) -> &'static str {
        match self {
            SessionPhase::LoggedOut => "logged_out",
            SessionPhase::AwaitingConfirmation { .. } => "awaiting_confirmation",
            SessionPhase::LoggedIn { .. } => "logged_in",
        }
    }

    pub fn session(&self) -> Option<&Session> {
        match self {
            SessionPhase::LoggedIn { session } => Some(session),
            _ => None,
        }
    }

    pub fn user(&self) -> Option<&UserRecord> {
        match self {
            SessionPhase::LoggedIn { session } => Some(&session.user),
            SessionPhase::AwaitingConfirmation { user } => Some(user),
            SessionPhase::LoggedOut => None,
        }
    }
}

/// Events that drive phase transitions.
#[derive(Debug)]
pub enum SessionEvent {
    /// Tokens and a synced user record were obtained.
    Established(Session),
    /// Sign-up succeeded without a session.
    ConfirmationRequired(UserRecord),
    /// The provider issued a new pair for the current session.
    TokensRotated(TokenPair),
    /// The current user's record changed.
    UserUpdated(UserRecord),
    /// Stored tokens turned out to be unusable.
    Invalidated,
    /// Explicit logout.
    SignedOut,
}

/// Credential I/O the caller must perform before installing the new phase.
#[derive(Debug, PartialEq, Eq)]
pub enum SessionAction {
    PersistTokens(TokenPair),
    ClearCredentials,
    None,
}

/// Handle a transition. Pure function: no I/O.
pub fn handle_event(phase: SessionPhase, event: SessionEvent) -> (SessionPhase, SessionAction) {
    match (phase, event) {
        // --- Any phase: a new session replaces whatever was there ---
        (_, SessionEvent::Established(session)) => {
            let tokens = session.tokens();
            (
                SessionPhase::LoggedIn { session },
                SessionAction::PersistTokens(tokens),
            )
        }

        (_, SessionEvent::ConfirmationRequired(user)) => (
            SessionPhase::AwaitingConfirmation { user },
            SessionAction::ClearCredentials,
        ),

        // --- LoggedIn ---
        (SessionPhase::LoggedIn { mut session }, SessionEvent::TokensRotated(tokens)) => {
            session.rotate(tokens.clone());
            (
                SessionPhase::LoggedIn { session },
                SessionAction::PersistTokens(tokens),
            )
        }

        (SessionPhase::LoggedIn { mut session }, SessionEvent::UserUpdated(user))
            if session.user.auth_principal_id == user.auth_principal_id =>
        {
            session.user = user;
            (SessionPhase::LoggedIn { session }, SessionAction::None)
        }

        // --- Any phase: teardown ---
        (_, SessionEvent::Invalidated | SessionEvent::SignedOut) => {
            (SessionPhase::LoggedOut, SessionAction::ClearCredentials)
        }

        // --- Unhandled: stay put ---
        (phase, _event) => (phase, SessionAction::None),
    }
}
