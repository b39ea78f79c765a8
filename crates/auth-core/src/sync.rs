//! Principal to user-record reconciliation
//!
//! Every successful authentication path (password login, registration,
//! OAuth completion, provider change notifications) funnels through
//! [`UserRecordSynchronizer::sync`], which guarantees the application's
//! `users` table holds exactly one row per principal and keeps its display
//! fields current.
//!
//! Field precedence is overrides, then values derived from the principal,
//! then defaults. Defaults only apply on insert: an update writes just the
//! fields that have a value, so a later OAuth login without name metadata
//! never blanks a stored name and never resets a role.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use identity::{Filter, Principal, RecordError, RecordStore};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::constants::{AUTH_PRINCIPAL_COLUMN, USERS_TABLE};
use crate::error::{Error, Result};

/// Application role of a user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Teacher,
    #[default]
    Student,
    Parent,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Teacher => "teacher",
            Role::Student => "student",
            Role::Parent => "parent",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "admin" => Ok(Role::Admin),
            "teacher" => Ok(Role::Teacher),
            "student" => Ok(Role::Student),
            "parent" => Ok(Role::Parent),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// The application-level profile row for a principal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    #[serde(rename = "auth_user_id")]
    pub auth_principal_id: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub role: Role,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default = "active_default")]
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn active_default() -> bool {
    true
}

impl UserRecord {
    /// "First Last", or whichever half is present.
    pub fn display_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }
}

/// Caller-supplied values that win over anything derived from the principal.
///
/// Used for registration details and for explicit profile edits. Empty
/// strings count as "no value".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileOverrides {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub role: Option<Role>,
    pub phone: Option<String>,
    pub avatar: Option<String>,
}

/// Fields accepted by [`UserRecordSynchronizer::update_profile`].
pub type ProfileUpdate = ProfileOverrides;

impl ProfileOverrides {
    /// Whether no field carries a value.
    pub fn is_empty(&self) -> bool {
        present(&self.first_name).is_none()
            && present(&self.last_name).is_none()
            && self.role.is_none()
            && present(&self.phone).is_none()
            && present(&self.avatar).is_none()
    }

    /// Whether the update touches the name fields mirrored into provider metadata.
    pub fn touches_name(&self) -> bool {
        present(&self.first_name).is_some() || present(&self.last_name).is_some()
    }
}

/// Display fields derivable from a principal alone.
#[derive(Debug, Default)]
struct Derived {
    email: Option<String>,
    first_name: Option<String>,
    last_name: Option<String>,
    phone: Option<String>,
    avatar: Option<String>,
}

impl Derived {
    fn from_principal(principal: &Principal) -> Self {
        let metadata = &principal.metadata;
        // OAuth providers send a single display name; split it on the first space.
        let display = present(&metadata.full_name).or_else(|| present(&metadata.name));
        let (split_first, split_last) = match display {
            Some(name) => match name.trim().split_once(char::is_whitespace) {
                Some((first, rest)) => (non_blank(first), non_blank(rest.trim())),
                None => (non_blank(name.trim()), None),
            },
            None => (None, None),
        };

        Self {
            email: present(&principal.email).map(str::to_string),
            first_name: present(&metadata.first_name)
                .map(str::to_string)
                .or(split_first),
            last_name: present(&metadata.last_name)
                .map(str::to_string)
                .or(split_last),
            phone: present(&principal.phone).map(str::to_string),
            avatar: present(&metadata.avatar_url).map(str::to_string),
        }
    }
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.trim().is_empty())
}

fn non_blank(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

fn timestamp(now: DateTime<Utc>) -> Value {
    Value::String(now.to_rfc3339_opts(SecondsFormat::Micros, true))
}

/// Insert `value` under `key` only when it has one.
fn put(payload: &mut Map<String, Value>, key: &str, value: Option<&str>) {
    if let Some(value) = value {
        payload.insert(key.to_string(), Value::String(value.to_string()));
    }
}

fn decode(row: Value) -> Result<UserRecord> {
    serde_json::from_value(row).map_err(|e| Error::Record(RecordError::Decode(e.to_string())))
}

/// Reconciles principals with rows in the `users` table.
///
/// Clones share one write lock, so the find and the insert of concurrent
/// syncs never interleave.
#[derive(Clone)]
pub struct UserRecordSynchronizer {
    store: Arc<dyn RecordStore>,
    write_lock: Arc<Mutex<()>>,
}

impl UserRecordSynchronizer {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            store,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    fn filter(principal_id: &str) -> Filter {
        Filter::eq(AUTH_PRINCIPAL_COLUMN, principal_id)
    }

    /// Ensure a row exists for `principal` and refresh its display fields.
    ///
    /// Returns the row as stored. Data-layer failures other than "no
    /// matching row" are returned unchanged as `Error::Record`.
    pub async fn sync(
        &self,
        principal: &Principal,
        overrides: Option<&ProfileOverrides>,
    ) -> Result<UserRecord> {
        // Held until the write lands; the table has no uniqueness on the
        // principal column.
        let _guard = self.write_lock.lock().await;
        let filter = Self::filter(&principal.id);
        let existing = match self.store.find_one(USERS_TABLE, &filter).await {
            Ok(row) => Some(row),
            Err(RecordError::NotFound) => None,
            Err(e) => return Err(Error::Record(e)),
        };

        let derived = Derived::from_principal(principal);
        let empty = ProfileOverrides::default();
        let overrides = overrides.unwrap_or(&empty);
        let now = Utc::now();

        let first_name = present(&overrides.first_name).or(derived.first_name.as_deref());
        let last_name = present(&overrides.last_name).or(derived.last_name.as_deref());
        let phone = present(&overrides.phone).or(derived.phone.as_deref());
        let avatar = present(&overrides.avatar).or(derived.avatar.as_deref());

        let mut payload = Map::new();
        put(&mut payload, "email", derived.email.as_deref());
        put(&mut payload, "first_name", first_name);
        put(&mut payload, "last_name", last_name);
        put(&mut payload, "phone", phone);
        put(&mut payload, "avatar", avatar);
        put(&mut payload, "role", overrides.role.map(|r| r.as_str()));
        payload.insert("updated_at".into(), timestamp(now));

        let row = if existing.is_some() {
            debug!(principal_id = %principal.id, fields = payload.len(), "updating user record");
            self.store
                .update(USERS_TABLE, &filter, Value::Object(payload))
                .await?
        } else {
            payload.insert(
                AUTH_PRINCIPAL_COLUMN.into(),
                Value::String(principal.id.clone()),
            );
            payload
                .entry("email")
                .or_insert_with(|| Value::String(String::new()));
            payload
                .entry("first_name")
                .or_insert_with(|| Value::String("User".into()));
            payload
                .entry("last_name")
                .or_insert_with(|| Value::String(String::new()));
            payload
                .entry("role")
                .or_insert_with(|| Value::String(Role::default().as_str().into()));
            payload.entry("phone").or_insert(Value::Null);
            payload.entry("avatar").or_insert(Value::Null);
            payload.insert("is_active".into(), Value::Bool(true));
            payload.insert("created_at".into(), timestamp(now));

            info!(principal_id = %principal.id, "creating user record");
            self.store
                .insert(USERS_TABLE, Value::Object(payload))
                .await?
        };

        decode(row)
    }

    /// The row for `principal_id`, if one exists.
    pub async fn fetch(&self, principal_id: &str) -> Result<Option<UserRecord>> {
        match self
            .store
            .find_one(USERS_TABLE, &Self::filter(principal_id))
            .await
        {
            Ok(row) => decode(row).map(Some),
            Err(RecordError::NotFound) => Ok(None),
            Err(e) => Err(Error::Record(e)),
        }
    }

    /// Apply an explicit profile edit to an existing row.
    pub async fn update_profile(
        &self,
        principal_id: &str,
        update: &ProfileUpdate,
    ) -> Result<UserRecord> {
        let mut patch = Map::new();
        put(&mut patch, "first_name", present(&update.first_name));
        put(&mut patch, "last_name", present(&update.last_name));
        put(&mut patch, "phone", present(&update.phone));
        put(&mut patch, "avatar", present(&update.avatar));
        put(&mut patch, "role", update.role.map(|r| r.as_str()));
        patch.insert("updated_at".into(), timestamp(Utc::now()));

        match self
            .store
            .update(USERS_TABLE, &Self::filter(principal_id), Value::Object(patch))
            .await
        {
            Ok(row) => decode(row),
            Err(RecordError::NotFound) => {
                Err(Error::NotFound(format!("user record for {principal_id}")))
            }
            Err(e) => Err(Error::Record(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use identity::{MemoryRecordStore, PrincipalMetadata};

    fn principal(id: &str, metadata: PrincipalMetadata) -> Principal {
        Principal {
            id: id.into(),
            email: Some(format!("{id}@school.test")),
            phone: None,
            metadata,
        }
    }

    fn oauth_metadata(full_name: &str) -> PrincipalMetadata {
        PrincipalMetadata {
            full_name: Some(full_name.into()),
            avatar_url: Some("https://img.test/a.png".into()),
            ..Default::default()
        }
    }

    fn setup() -> (Arc<MemoryRecordStore>, UserRecordSynchronizer) {
        let store = Arc::new(MemoryRecordStore::new());
        let sync = UserRecordSynchronizer::new(store.clone());
        (store, sync)
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_first_syncs_create_one_row() {
        let (store, sync) = setup();
        store.set_latency(std::time::Duration::from_millis(20)).await;
        let other = sync.clone();
        let p = principal("uid-1", oauth_metadata("Ada Lovelace"));

        let (a, b) = tokio::join!(sync.sync(&p, None), other.sync(&p, None));
        assert_eq!(a.unwrap().auth_principal_id, "uid-1");
        assert_eq!(b.unwrap().first_name, "Ada");

        assert_eq!(store.rows(USERS_TABLE).await.len(), 1);
        assert!(sync.fetch("uid-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn first_sight_inserts_with_defaults() {
        let (_, sync) = setup();
        let p = principal("uid-1", PrincipalMetadata::default());

        let record = sync.sync(&p, None).await.unwrap();
        assert_eq!(record.auth_principal_id, "uid-1");
        assert_eq!(record.email, "uid-1@school.test");
        assert_eq!(record.first_name, "User");
        assert_eq!(record.last_name, "");
        assert_eq!(record.role, Role::Student);
        assert!(record.is_active);
        assert!(record.avatar.is_none());
    }

    #[tokio::test]
    async fn full_name_is_split_and_avatar_derived() {
        let (_, sync) = setup();
        let p = principal("uid-1", oauth_metadata("Ada King Lovelace"));

        let record = sync.sync(&p, None).await.unwrap();
        assert_eq!(record.first_name, "Ada");
        assert_eq!(record.last_name, "King Lovelace");
        assert_eq!(record.avatar.as_deref(), Some("https://img.test/a.png"));
    }

    #[tokio::test]
    async fn overrides_beat_derived_values() {
        let (_, sync) = setup();
        let p = principal("uid-1", oauth_metadata("Ada Lovelace"));
        let overrides = ProfileOverrides {
            first_name: Some("Augusta".into()),
            role: Some(Role::Teacher),
            phone: Some("+44 1".into()),
            ..Default::default()
        };

        let record = sync.sync(&p, Some(&overrides)).await.unwrap();
        assert_eq!(record.first_name, "Augusta");
        assert_eq!(record.last_name, "Lovelace");
        assert_eq!(record.role, Role::Teacher);
        assert_eq!(record.phone.as_deref(), Some("+44 1"));
    }

    #[tokio::test]
    async fn sync_is_idempotent_up_to_updated_at() {
        let (_, sync) = setup();
        let p = principal("uid-1", oauth_metadata("Ada Lovelace"));

        let first = sync.sync(&p, None).await.unwrap();
        let second = sync.sync(&p, None).await.unwrap();

        assert!(second.updated_at >= first.updated_at);
        let normalize = |r: UserRecord| UserRecord {
            updated_at: first.created_at,
            ..r
        };
        assert_eq!(normalize(first.clone()), normalize(second));
    }

    #[tokio::test]
    async fn exactly_one_record_after_many_syncs() {
        let (store, sync) = setup();
        let p = principal("uid-1", PrincipalMetadata::default());

        for _ in 0..5 {
            sync.sync(&p, None).await.unwrap();
        }
        let filter = Filter::eq(AUTH_PRINCIPAL_COLUMN, "uid-1");
        assert_eq!(store.count(USERS_TABLE, &filter).await, 1);
    }

    #[tokio::test]
    async fn update_keeps_role_and_names_without_metadata() {
        let (_, sync) = setup();
        let registered = principal(
            "uid-1",
            PrincipalMetadata {
                first_name: Some("Grace".into()),
                last_name: Some("Hopper".into()),
                ..Default::default()
            },
        );
        let overrides = ProfileOverrides {
            role: Some(Role::Admin),
            ..Default::default()
        };
        sync.sync(&registered, Some(&overrides)).await.unwrap();

        let bare = principal("uid-1", PrincipalMetadata::default());
        let record = sync.sync(&bare, None).await.unwrap();
        assert_eq!(record.first_name, "Grace");
        assert_eq!(record.last_name, "Hopper");
        assert_eq!(record.role, Role::Admin);
    }

    #[tokio::test]
    async fn data_layer_failure_propagates_unchanged() {
        let (store, sync) = setup();
        store
            .fail_next(RecordError::Network("connection reset".into()))
            .await;

        let err = sync
            .sync(&principal("uid-1", PrincipalMetadata::default()), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Record(RecordError::Network(_))));
    }

    #[tokio::test]
    async fn fetch_missing_is_none() {
        let (_, sync) = setup();
        assert!(sync.fetch("uid-404").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_profile_patches_only_given_fields() {
        let (_, sync) = setup();
        let p = principal("uid-1", oauth_metadata("Ada Lovelace"));
        sync.sync(&p, None).await.unwrap();

        let update = ProfileUpdate {
            phone: Some("555-0100".into()),
            ..Default::default()
        };
        let record = sync.update_profile("uid-1", &update).await.unwrap();
        assert_eq!(record.phone.as_deref(), Some("555-0100"));
        assert_eq!(record.first_name, "Ada");
    }

    #[tokio::test]
    async fn update_profile_without_record_is_not_found() {
        let (_, sync) = setup();
        let err = sync
            .update_profile("uid-404", &ProfileUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn role_parses_case_insensitively() {
        assert_eq!("Teacher".parse::<Role>().unwrap(), Role::Teacher);
        assert!("janitor".parse::<Role>().is_err());
        assert_eq!(
            serde_json::to_value(Role::Parent).unwrap(),
            serde_json::json!("parent")
        );
    }
}
