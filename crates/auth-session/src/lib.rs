//! Authentication session lifecycle for the school client
//!
//! The [`AuthSessionController`] coordinates the identity provider, the user
//! record store and local credential storage:
//!
//! 1. Password login / registration → user record synced → tokens persisted
//! 2. OAuth via browser or passive deep link → same completion path
//! 3. Cold start → persisted tokens re-installed with the provider
//! 4. Refresh (on demand or by the background task) → rotated tokens persisted;
//!    any failure clears the session
//! 5. Logout → always clears local state, and wins over in-flight operations
//!
//! Provider-reported principal changes are fanned out to subscribers by the
//! auth listener through [`AuthStateBroadcaster`].

pub mod broadcast;
pub mod controller;
pub mod metrics;
pub mod oauth;
pub mod refresh;
pub mod remote;
pub mod state;

pub use broadcast::{AuthStateBroadcaster, Subscription};
pub use controller::{
    AuthSessionController, AuthState, ControllerConfig, Registration, RegistrationDetails,
};
pub use oauth::{AuthBrowser, BrowserOutcome, NoBrowser, OAuthCompleter};
pub use refresh::spawn_refresh_task;
pub use state::{Session, SessionAction, SessionEvent, SessionPhase, handle_event};
