//! Credential storage for the current token pair
//!
//! `CredentialStore` is a small string key-value capability; the session
//! controller only ever uses the two fixed keys in `constants`. The file
//! implementation keeps a JSON object on disk and writes it atomically
//! (temp file + rename, mode 0600) so a crash mid-write never leaves a torn
//! file. A tokio Mutex serializes writers.
//!
//! `TokenVault` is the typed view the controller works with.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use identity::{BoxFuture, TokenPair};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::constants::{ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY};
use crate::error::{Error, Result};

/// Durable string key-value store for secrets.
///
/// Each call is atomic per key; nothing spans several keys.
pub trait CredentialStore: Send + Sync {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>>>;

    fn set<'a>(&'a self, key: &'a str, value: String) -> BoxFuture<'a, Result<()>>;

    /// Remove `key`. Removing an absent key is not an error.
    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<()>>;
}

/// File-backed credential store.
pub struct FileCredentialStore {
    path: PathBuf,
    state: Mutex<HashMap<String, String>>,
}

impl FileCredentialStore {
    /// Load the store from `path`.
    ///
    /// A missing file is a cold start: the store is created empty and written
    /// out so later loads take the normal path.
    pub async fn load(path: PathBuf) -> Result<Self> {
        let state = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Storage(format!("reading credential file: {e}")))?;
            let entries: HashMap<String, String> = serde_json::from_str(&contents)
                .map_err(|e| Error::Storage(format!("parsing credential file: {e}")))?;
            info!(path = %path.display(), keys = entries.len(), "loaded credential file");
            entries
        } else {
            info!(path = %path.display(), "credential file not found, starting empty");
            let entries = HashMap::new();
            write_atomic(&path, &entries).await?;
            entries
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CredentialStore for FileCredentialStore {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>>> {
        Box::pin(async move { Ok(self.state.lock().await.get(key).cloned()) })
    }

    fn set<'a>(&'a self, key: &'a str, value: String) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            state.insert(key.to_string(), value);
            debug!(key, "stored credential");
            write_atomic(&self.path, &state).await
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            if state.remove(key).is_some() {
                debug!(key, "deleted credential");
                write_atomic(&self.path, &state).await?;
            }
            Ok(())
        })
    }
}

/// Write the store to `path` atomically with 0600 permissions.
async fn write_atomic(path: &Path, data: &HashMap<String, String>) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| Error::Storage(format!("serializing credentials: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Storage("credential path has no parent directory".into()))?;

    let tmp_path = dir.join(format!(".credentials.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Storage(format!("writing temp credential file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Storage(format!("setting credential file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Storage(format!("renaming temp credential file: {e}")))?;

    debug!(path = %path.display(), "persisted credentials");
    Ok(())
}

/// Process-local credential store.
#[derive(Default)]
pub struct MemoryCredentialStore {
    state: Mutex<HashMap<String, String>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub async fn len(&self) -> usize {
        self.state.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>>> {
        Box::pin(async move { Ok(self.state.lock().await.get(key).cloned()) })
    }

    fn set<'a>(&'a self, key: &'a str, value: String) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.state.lock().await.insert(key.to_string(), value);
            Ok(())
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.state.lock().await.remove(key);
            Ok(())
        })
    }
}

/// Typed access to the persisted token pair.
#[derive(Clone)]
pub struct TokenVault {
    store: std::sync::Arc<dyn CredentialStore>,
}

impl TokenVault {
    pub fn new(store: std::sync::Arc<dyn CredentialStore>) -> Self {
        Self { store }
    }

    /// The persisted pair, if both halves are present and non-empty.
    ///
    /// A half-written pair (crash between the two writes) reads as `None`,
    /// the same as never having logged in.
    pub async fn load(&self) -> Result<Option<TokenPair>> {
        let access = non_empty(self.store.get(ACCESS_TOKEN_KEY).await?);
        let refresh = non_empty(self.store.get(REFRESH_TOKEN_KEY).await?);
        Ok(match (access, refresh) {
            (Some(access), Some(refresh)) => Some(TokenPair::new(access, refresh)),
            _ => None,
        })
    }

    /// The persisted refresh token alone.
    pub async fn refresh_token(&self) -> Result<Option<String>> {
        Ok(non_empty(self.store.get(REFRESH_TOKEN_KEY).await?))
    }

    pub async fn save(&self, tokens: &TokenPair) -> Result<()> {
        self.store
            .set(ACCESS_TOKEN_KEY, tokens.access_token.clone())
            .await?;
        self.store
            .set(REFRESH_TOKEN_KEY, tokens.refresh_token.clone())
            .await
    }

    /// Remove both keys. Both deletes are attempted even if the first fails.
    pub async fn clear(&self) -> Result<()> {
        let access = self.store.delete(ACCESS_TOKEN_KEY).await;
        let refresh = self.store.delete(REFRESH_TOKEN_KEY).await;
        access.and(refresh)
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}
