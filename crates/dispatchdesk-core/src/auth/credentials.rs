//! Credential storage backends.
//!
//! Every backend holds one `Credentials` snapshot and swaps it whole, so a
//! reader never sees a new access token paired with a stale refresh token.
//! Persisted snapshots use the storage keys `access_token`, `refresh_token`,
//! `user` and `updated_at`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keyring::Entry;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::models::User;

/// Session file name in the data directory
const SESSION_FILE: &str = "session.json";

/// Keychain service name
pub const KEYRING_SERVICE: &str = "dispatchdesk";

/// Keychain account holding the session snapshot
const KEYRING_ACCOUNT: &str = "session";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize credentials: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Keychain error: {0}")]
    Keyring(#[from] keyring::Error),
}

/// Snapshot of everything the client knows about the current session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<User>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// A single write against a `CredentialStore`.
#[derive(Debug, Clone, PartialEq)]
pub enum CredentialField {
    AccessToken(Option<String>),
    RefreshToken(Option<String>),
    /// Replace the access/refresh pair in one write.
    Tokens {
        access: String,
        refresh: Option<String>,
    },
    /// Start over with a freshly issued pair. The cached user is dropped in
    /// the same write, since it belonged to the previous session.
    NewSession {
        access: String,
        refresh: Option<String>,
    },
    User(Option<User>),
}

fn non_empty(token: Option<String>) -> Option<String> {
    token.filter(|t| !t.is_empty())
}

impl Credentials {
    /// Access token suitable for a bearer header. Empty strings count as absent.
    pub fn access_token(&self) -> Option<&str> {
        self.access_token.as_deref().filter(|t| !t.is_empty())
    }

    pub fn refresh_token(&self) -> Option<&str> {
        self.refresh_token.as_deref().filter(|t| !t.is_empty())
    }

    pub fn is_empty(&self) -> bool {
        self.access_token().is_none() && self.refresh_token().is_none() && self.user.is_none()
    }

    pub fn apply(&mut self, field: CredentialField) {
        match field {
            CredentialField::AccessToken(token) => {
                self.access_token = non_empty(token);
                self.updated_at = Some(Utc::now());
            }
            CredentialField::RefreshToken(token) => {
                self.refresh_token = non_empty(token);
                self.updated_at = Some(Utc::now());
            }
            CredentialField::Tokens { access, refresh } => {
                self.access_token = non_empty(Some(access));
                self.refresh_token = non_empty(refresh);
                self.updated_at = Some(Utc::now());
            }
            CredentialField::NewSession { access, refresh } => {
                self.access_token = non_empty(Some(access));
                self.refresh_token = non_empty(refresh);
                self.user = None;
                self.updated_at = Some(Utc::now());
            }
            CredentialField::User(user) => self.user = user,
        }
    }

    /// Minutes since the tokens were last written, if ever.
    pub fn age_minutes(&self) -> Option<i64> {
        self.updated_at.map(|at| (Utc::now() - at).num_minutes())
    }

    pub fn age_display(&self) -> String {
        let Some(minutes) = self.age_minutes() else {
            return "never".to_string();
        };
        if minutes < 1 {
            // Also covers clock skew
            "just now".to_string()
        } else if minutes < 60 {
            format!("{}m ago", minutes)
        } else if minutes < 1440 {
            format!("{}h ago", minutes / 60)
        } else {
            format!("{}d ago", minutes / 1440)
        }
    }
}

/// Durable holder for the session's credentials and user profile.
///
/// Tokens are opaque here; backends never inspect or validate them.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get(&self) -> Result<Credentials, StoreError>;

    async fn set(&self, field: CredentialField) -> Result<(), StoreError>;

    /// Remove access token, refresh token and user in one step.
    async fn clear(&self) -> Result<(), StoreError>;
}

// ============================================================================
// In-memory store
// ============================================================================

/// Process-local store. Survives nothing; used in tests and for `memory` backend.
#[derive(Default)]
pub struct MemoryCredentialStore {
    state: RwLock<Credentials>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credentials(credentials: Credentials) -> Self {
        Self {
            state: RwLock::new(credentials),
        }
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn get(&self) -> Result<Credentials, StoreError> {
        Ok(self.state.read().await.clone())
    }

    async fn set(&self, field: CredentialField) -> Result<(), StoreError> {
        self.state.write().await.apply(field);
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        *self.state.write().await = Credentials::default();
        Ok(())
    }
}

// ============================================================================
// File store
// ============================================================================

/// Store backed by `session.json` in a data directory.
///
/// Writes go to a temporary file that is renamed over the old one, so a
/// process that reloads mid-write sees either the old or the new snapshot.
pub struct FileCredentialStore {
    path: PathBuf,
    state: Mutex<Credentials>,
}

impl FileCredentialStore {
    /// Open the store in `dir`, loading any session saved by a previous run.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = dir.as_ref().join(SESSION_FILE);
        let state = Self::read(&path)?;
        debug!(path = %path.display(), has_session = !state.is_empty(), "Opened session file");
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(path: &Path) -> Result<Credentials, StoreError> {
        if !path.exists() {
            return Ok(Credentials::default());
        }
        let contents = std::fs::read_to_string(path)?;
        match serde_json::from_str(&contents) {
            Ok(credentials) => Ok(credentials),
            Err(e) => {
                // A corrupt file means no usable session, not a hard failure
                warn!(error = %e, path = %path.display(), "Ignoring unreadable session file");
                Ok(Credentials::default())
            }
        }
    }

    fn write(&self, credentials: &Credentials) -> Result<(), StoreError> {
        if credentials.is_empty() {
            return self.remove();
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(credentials)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, contents)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn remove(&self) -> Result<(), StoreError> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn get(&self) -> Result<Credentials, StoreError> {
        Ok(self.state.lock().await.clone())
    }

    async fn set(&self, field: CredentialField) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        next.apply(field);
        self.write(&next)?;
        *state = next;
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        *state = Credentials::default();
        self.remove()
    }
}

// ============================================================================
// Keychain store
// ============================================================================

/// Store backed by a single OS keychain entry holding the JSON snapshot.
///
/// One entry rather than one per field keeps `clear()` a single operation.
pub struct KeyringCredentialStore {
    entry: Entry,
    state: Mutex<Credentials>,
}

impl KeyringCredentialStore {
    pub fn open(service: &str) -> Result<Self, StoreError> {
        let entry = Entry::new(service, KEYRING_ACCOUNT)?;
        let state = match entry.get_password() {
            Ok(secret) => serde_json::from_str(&secret).unwrap_or_else(|e| {
                warn!(error = %e, "Ignoring unreadable keychain session");
                Credentials::default()
            }),
            Err(keyring::Error::NoEntry) => Credentials::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            entry,
            state: Mutex::new(state),
        })
    }

    fn delete(&self) -> Result<(), StoreError> {
        match self.entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl CredentialStore for KeyringCredentialStore {
    async fn get(&self) -> Result<Credentials, StoreError> {
        Ok(self.state.lock().await.clone())
    }

    async fn set(&self, field: CredentialField) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        next.apply(field);
        if next.is_empty() {
            self.delete()?;
        } else {
            self.entry.set_password(&serde_json::to_string(&next)?)?;
        }
        *state = next;
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        *state = Credentials::default();
        self.delete()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn alice() -> User {
        User {
            id: 7,
            username: "alice".to_string(),
            role: "driver".to_string(),
        }
    }

    #[tokio::test]
    async fn test_memory_store_set_and_clear() {
        let store = MemoryCredentialStore::new();
        store
            .set(CredentialField::Tokens {
                access: "A1".to_string(),
                refresh: Some("R1".to_string()),
            })
            .await
            .unwrap();
        store.set(CredentialField::User(Some(alice()))).await.unwrap();

        let creds = store.get().await.unwrap();
        assert_eq!(creds.access_token(), Some("A1"));
        assert_eq!(creds.refresh_token(), Some("R1"));
        assert_eq!(creds.user, Some(alice()));

        store.clear().await.unwrap();
        let creds = store.get().await.unwrap();
        assert!(creds.is_empty());
        assert_eq!(creds, Credentials::default());
    }

    #[tokio::test]
    async fn test_empty_tokens_are_stored_as_absent() {
        let store = MemoryCredentialStore::new();
        store
            .set(CredentialField::Tokens {
                access: String::new(),
                refresh: Some(String::new()),
            })
            .await
            .unwrap();
        let creds = store.get().await.unwrap();
        assert_eq!(creds.access_token, None);
        assert_eq!(creds.refresh_token, None);
    }

    #[test]
    fn test_empty_token_from_disk_is_absent() {
        let creds: Credentials =
            serde_json::from_str(r#"{"access_token": "", "refresh_token": "R1"}"#).unwrap();
        assert_eq!(creds.access_token(), None);
        assert_eq!(creds.refresh_token(), Some("R1"));
    }

    #[test]
    fn test_single_field_updates_leave_others() {
        let mut creds = Credentials::default();
        creds.apply(CredentialField::Tokens {
            access: "A1".to_string(),
            refresh: Some("R1".to_string()),
        });
        creds.apply(CredentialField::AccessToken(Some("A2".to_string())));
        assert_eq!(creds.access_token(), Some("A2"));
        assert_eq!(creds.refresh_token(), Some("R1"));

        creds.apply(CredentialField::RefreshToken(None));
        assert_eq!(creds.refresh_token(), None);
        assert_eq!(creds.access_token(), Some("A2"));
    }

    #[test]
    fn test_new_session_drops_previous_user() {
        let mut creds = Credentials::default();
        creds.apply(CredentialField::Tokens {
            access: "A1".to_string(),
            refresh: Some("R1".to_string()),
        });
        creds.apply(CredentialField::User(Some(alice())));

        creds.apply(CredentialField::NewSession {
            access: "B1".to_string(),
            refresh: None,
        });
        assert_eq!(creds.access_token(), Some("B1"));
        assert_eq!(creds.refresh_token(), None);
        assert_eq!(creds.user, None);
    }

    #[test]
    fn test_storage_keys() {
        let mut creds = Credentials::default();
        creds.apply(CredentialField::Tokens {
            access: "A1".to_string(),
            refresh: Some("R1".to_string()),
        });
        creds.apply(CredentialField::User(Some(alice())));
        let value = serde_json::to_value(&creds).unwrap();
        assert_eq!(value["access_token"], "A1");
        assert_eq!(value["refresh_token"], "R1");
        assert_eq!(value["user"]["username"], "alice");
        assert!(value.get("updated_at").is_some());
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileCredentialStore::open(dir.path()).unwrap();
            store
                .set(CredentialField::Tokens {
                    access: "A1".to_string(),
                    refresh: Some("R1".to_string()),
                })
                .await
                .unwrap();
            store.set(CredentialField::User(Some(alice()))).await.unwrap();
            assert!(store.path().exists());
        }

        let reopened = FileCredentialStore::open(dir.path()).unwrap();
        let creds = reopened.get().await.unwrap();
        assert_eq!(creds.access_token(), Some("A1"));
        assert_eq!(creds.refresh_token(), Some("R1"));
        assert_eq!(creds.user, Some(alice()));
    }

    #[tokio::test]
    async fn test_file_store_clear_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::open(dir.path()).unwrap();
        store
            .set(CredentialField::AccessToken(Some("A1".to_string())))
            .await
            .unwrap();
        assert!(store.path().exists());

        store.clear().await.unwrap();
        assert!(!store.path().exists());
        assert!(store.get().await.unwrap().is_empty());

        let reopened = FileCredentialStore::open(dir.path()).unwrap();
        assert!(reopened.get().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_store_ignores_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(SESSION_FILE), "not json").unwrap();
        let store = FileCredentialStore::open(dir.path()).unwrap();
        assert!(store.get().await.unwrap().is_empty());
    }

    #[test]
    fn test_age_display() {
        let mut creds = Credentials::default();
        assert_eq!(creds.age_display(), "never");

        creds.updated_at = Some(Utc::now());
        assert_eq!(creds.age_display(), "just now");

        creds.updated_at = Some(Utc::now() - Duration::minutes(5));
        assert_eq!(creds.age_display(), "5m ago");

        creds.updated_at = Some(Utc::now() - Duration::minutes(125));
        assert_eq!(creds.age_display(), "2h ago");

        creds.updated_at = Some(Utc::now() - Duration::days(3));
        assert_eq!(creds.age_display(), "3d ago");
    }
}
