//! Fixed names and defaults shared by the auth crates

use std::time::Duration;

/// Credential store key holding the current access token.
pub const ACCESS_TOKEN_KEY: &str = "access_token";

/// Credential store key holding the current refresh token.
pub const REFRESH_TOKEN_KEY: &str = "refresh_token";

/// Application table holding one profile row per principal.
pub const USERS_TABLE: &str = "users";

/// Column of `USERS_TABLE` joining a row to its principal.
pub const AUTH_PRINCIPAL_COLUMN: &str = "auth_user_id";

/// Upper bound on any single remote round trip.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Development sandbox URL used when the host does not report one.
pub const DEFAULT_DEV_URL: &str = "exp://localhost:8081";

/// Path every redirect URL ends in.
pub const CALLBACK_PATH: &str = "auth/callback";

/// Minimum accepted password length.
pub const MIN_PASSWORD_LEN: usize = 6;

/// Extra authorization parameters requesting a refresh token and a consent
/// screen from the external provider.
pub const OAUTH_QUERY_PARAMS: &[(&str, &str)] = &[("access_type", "offline"), ("prompt", "consent")];
