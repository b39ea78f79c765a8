//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The Supabase anon key is loaded from the SUPABASE_ANON_KEY env var or
//! `anon_key_file`, never stored in the TOML directly.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use auth_core::RunMode;
use auth_session::ControllerConfig;
use common::Secret;
use serde::Deserialize;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub supabase: SupabaseConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub oauth: OAuthConfig,
    #[serde(default)]
    pub agent: AgentConfig,
}

/// Hosted project settings
#[derive(Debug, Deserialize)]
pub struct SupabaseConfig {
    pub url: String,
    #[serde(skip)]
    pub anon_key: Option<Secret<String>>,
    /// Path to a file containing the anon key (alternative to SUPABASE_ANON_KEY)
    #[serde(default)]
    pub anon_key_file: Option<PathBuf>,
}

/// Session behaviour
#[derive(Debug, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_credentials_path")]
    pub credentials_path: PathBuf,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_reset_redirect")]
    pub password_reset_redirect: String,
    #[serde(default = "default_true")]
    pub resync_on_token_refresh: bool,
}

/// OAuth redirect settings. `mode` selects the redirect URL shape.
#[derive(Debug, Deserialize)]
pub struct OAuthConfig {
    #[serde(flatten)]
    pub run_mode: RunMode,
    #[serde(default = "default_browser_timeout")]
    pub browser_timeout_secs: u64,
}

/// Long-running agent settings (`serve`)
#[derive(Debug, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,
    #[serde(default = "default_refresh_threshold")]
    pub refresh_threshold_secs: u64,
}

fn default_credentials_path() -> PathBuf {
    PathBuf::from("school-auth-credentials.json")
}

fn default_timeout() -> u64 {
    10
}

fn default_reset_redirect() -> String {
    "schoolapp://reset-password".into()
}

fn default_true() -> bool {
    true
}

fn default_browser_timeout() -> u64 {
    300
}

fn default_loopback_port() -> u16 {
    54321
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8787))
}

fn default_max_connections() -> usize {
    64
}

fn default_refresh_interval() -> u64 {
    60
}

fn default_refresh_threshold() -> u64 {
    300
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            credentials_path: default_credentials_path(),
            timeout_secs: default_timeout(),
            password_reset_redirect: default_reset_redirect(),
            resync_on_token_refresh: true,
        }
    }
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            run_mode: RunMode::Loopback {
                port: default_loopback_port(),
            },
            browser_timeout_secs: default_browser_timeout(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            max_connections: default_max_connections(),
            refresh_interval_secs: default_refresh_interval(),
            refresh_threshold_secs: default_refresh_threshold(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Anon key resolution order:
    /// 1. SUPABASE_ANON_KEY env var
    /// 2. anon_key_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.validate()?;

        if let Ok(key) = std::env::var("SUPABASE_ANON_KEY") {
            config.supabase.anon_key = Some(Secret::new(key));
        } else if let Some(ref key_file) = config.supabase.anon_key_file {
            let key = std::fs::read_to_string(key_file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read anon_key_file {}: {e}",
                    key_file.display()
                ))
            })?;
            let key = key.trim().to_owned();
            if !key.is_empty() {
                config.supabase.anon_key = Some(Secret::new(key));
            }
        }

        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        let url = &self.supabase.url;
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(common::Error::Config(format!(
                "supabase.url must start with http:// or https://, got: {url}"
            )));
        }
        if self.auth.timeout_secs == 0 {
            return Err(common::Error::Config(
                "auth.timeout_secs must be greater than 0".into(),
            ));
        }
        if self.oauth.browser_timeout_secs == 0 {
            return Err(common::Error::Config(
                "oauth.browser_timeout_secs must be greater than 0".into(),
            ));
        }
        match &self.oauth.run_mode {
            RunMode::Installed { scheme } if scheme.trim().is_empty() => {
                return Err(common::Error::Config(
                    "oauth.scheme must not be empty".into(),
                ));
            }
            RunMode::Loopback { port: 0 } => {
                return Err(common::Error::Config(
                    "oauth.port must be a fixed port registered with the provider".into(),
                ));
            }
            _ => {}
        }
        if self.agent.max_connections == 0 {
            return Err(common::Error::Config(
                "agent.max_connections must be greater than 0".into(),
            ));
        }
        if self.agent.refresh_interval_secs == 0 {
            return Err(common::Error::Config(
                "agent.refresh_interval_secs must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    /// The anon key, which every backend request needs.
    pub fn anon_key(&self) -> common::Result<&Secret<String>> {
        self.supabase.anon_key.as_ref().ok_or_else(|| {
            common::Error::MissingSecret(
                "set SUPABASE_ANON_KEY or supabase.anon_key_file".into(),
            )
        })
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.auth.timeout_secs)
    }

    pub fn browser_timeout(&self) -> Duration {
        Duration::from_secs(self.oauth.browser_timeout_secs)
    }

    /// Settings for the session controller.
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            timeout: self.timeout(),
            run_mode: self.oauth.run_mode.clone(),
            password_reset_redirect: self.auth.password_reset_redirect.clone(),
            resync_on_token_refresh: self.auth.resync_on_token_refresh,
        }
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&Path>) -> PathBuf {
        if let Some(p) = cli_path {
            return p.to_path_buf();
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("school-auth.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Serializes tests that touch process environment variables.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// SAFETY: Callers must hold ENV_MUTEX to prevent concurrent env mutation.
    unsafe fn set_env(key: &str, val: &str) {
        unsafe { std::env::set_var(key, val) };
    }

    unsafe fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) };
    }

    fn write_config(dir: &tempfile::TempDir, contents: &str) -> PathBuf {
        let path = dir.path().join("school-auth.toml");
        std::fs::write(&path, contents).unwrap();
        path
    }

    const MINIMAL: &str = r#"
[supabase]
url = "https://abc.supabase.co"
"#;

    #[test]
    fn minimal_config_uses_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("SUPABASE_ANON_KEY") };
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&write_config(&dir, MINIMAL)).unwrap();

        assert_eq!(config.auth.timeout_secs, 10);
        assert!(config.auth.resync_on_token_refresh);
        assert_eq!(
            config.oauth.run_mode,
            RunMode::Loopback { port: 54321 }
        );
        assert_eq!(config.agent.listen_addr.to_string(), "127.0.0.1:8787");
        assert!(config.supabase.anon_key.is_none());
        assert!(matches!(
            config.anon_key(),
            Err(common::Error::MissingSecret(_))
        ));
    }

    #[test]
    fn full_config_parses_every_section() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("SUPABASE_ANON_KEY") };
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[supabase]
url = "https://abc.supabase.co"

[auth]
credentials_path = "/var/lib/school-auth/credentials.json"
timeout_secs = 5
password_reset_redirect = "https://school.example/reset"
resync_on_token_refresh = false

[oauth]
mode = "installed"
scheme = "schoolapp"
browser_timeout_secs = 120

[agent]
listen_addr = "127.0.0.1:9000"
max_connections = 8
refresh_interval_secs = 30
refresh_threshold_secs = 120
"#,
        );

        let config = Config::load(&path).unwrap();
        let controller = config.controller_config();
        assert_eq!(controller.timeout, Duration::from_secs(5));
        assert!(!controller.resync_on_token_refresh);
        assert_eq!(controller.run_mode.redirect_url(), "schoolapp://auth/callback");
        assert_eq!(config.browser_timeout(), Duration::from_secs(120));
        assert_eq!(config.agent.max_connections, 8);
    }

    #[test]
    fn anon_key_from_env_overrides_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("anon_key");
        std::fs::write(&key_path, "file-key\n").unwrap();
        let path = write_config(
            &dir,
            &format!(
                "[supabase]\nurl = \"https://abc.supabase.co\"\nanon_key_file = \"{}\"\n",
                key_path.display()
            ),
        );

        unsafe { remove_env("SUPABASE_ANON_KEY") };
        let config = Config::load(&path).unwrap();
        assert_eq!(config.anon_key().unwrap().expose(), "file-key");

        unsafe { set_env("SUPABASE_ANON_KEY", "env-key") };
        let config = Config::load(&path).unwrap();
        assert_eq!(config.anon_key().unwrap().expose(), "env-key");
        unsafe { remove_env("SUPABASE_ANON_KEY") };
    }

    #[test]
    fn missing_anon_key_file_is_an_error() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("SUPABASE_ANON_KEY") };
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            "[supabase]\nurl = \"https://abc.supabase.co\"\nanon_key_file = \"/nonexistent/anon_key\"\n",
        );
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn invalid_values_are_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let cases = [
            ("[supabase]\nurl = \"abc.supabase.co\"\n", "supabase.url"),
            (
                "[supabase]\nurl = \"https://abc.supabase.co\"\n[auth]\ntimeout_secs = 0\n",
                "timeout_secs",
            ),
            (
                "[supabase]\nurl = \"https://abc.supabase.co\"\n[oauth]\nmode = \"loopback\"\nport = 0\n",
                "oauth.port",
            ),
            (
                "[supabase]\nurl = \"https://abc.supabase.co\"\n[oauth]\nmode = \"installed\"\nscheme = \" \"\n",
                "oauth.scheme",
            ),
            (
                "[supabase]\nurl = \"https://abc.supabase.co\"\n[agent]\nmax_connections = 0\n",
                "max_connections",
            ),
        ];
        for (toml, needle) in cases {
            let err = Config::load(&write_config(&dir, toml)).unwrap_err();
            assert!(
                err.to_string().contains(needle),
                "expected error mentioning {needle}, got: {err}"
            );
        }
    }

    #[test]
    fn missing_file_and_bad_toml_fail() {
        assert!(Config::load(Path::new("/nonexistent/school-auth.toml")).is_err());

        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "not valid {{{{ toml");
        assert!(matches!(Config::load(&path), Err(common::Error::Toml(_))));
    }

    #[test]
    fn resolve_path_precedence() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("CONFIG_PATH", "/env/school-auth.toml") };
        assert_eq!(
            Config::resolve_path(Some(Path::new("/cli/wins.toml"))),
            PathBuf::from("/cli/wins.toml")
        );
        assert_eq!(
            Config::resolve_path(None),
            PathBuf::from("/env/school-auth.toml")
        );
        unsafe { remove_env("CONFIG_PATH") };
        assert_eq!(Config::resolve_path(None), PathBuf::from("school-auth.toml"));
    }
}
