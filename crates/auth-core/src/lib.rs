//! Building blocks for the school auth session
//!
//! Everything here is independent of session state: the error taxonomy and
//! provider-error classifier, credential storage, user-record
//! synchronization, OAuth callback parsing, input validation and token
//! expiry decoding. `auth-session` composes them into the controller.

pub mod callback;
pub mod classify;
pub mod constants;
pub mod credentials;
pub mod error;
pub mod jwt;
pub mod sync;
pub mod validation;

pub use callback::{RunMode, extract_callback_tokens, is_callback_url};
pub use classify::classify_provider_error;
pub use credentials::{CredentialStore, FileCredentialStore, MemoryCredentialStore, TokenVault};
pub use error::{Error, Result};
pub use sync::{ProfileOverrides, ProfileUpdate, Role, UserRecord, UserRecordSynchronizer};
pub use validation::{validate_email, validate_password};
