//! Application configuration management.
//!
//! This module handles loading and saving the client configuration: the
//! backend URL, timeouts, how the refresh credential travels, and where
//! credentials are persisted.
//!
//! Configuration is stored at `~/.config/dispatchdesk/config.json`. Selected
//! fields can be overridden from the environment (see `apply_env_overrides`).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::auth::{
    CredentialStore, FileCredentialStore, KeyringCredentialStore, MemoryCredentialStore,
    KEYRING_SERVICE,
};

/// Application name used for config/data directory paths
const APP_NAME: &str = "dispatchdesk";

/// Config file name
const CONFIG_FILE: &str = "config.json";

const DEFAULT_API_URL: &str = "http://localhost:8000";

/// HTTP request timeout in seconds.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Upper bound on a refresh exchange. Every caller waiting on the refresh is
/// held this long at most.
const DEFAULT_REFRESH_TIMEOUT_SECS: u64 = 10;

const ENV_API_URL: &str = "DISPATCHDESK_API_URL";
const ENV_REFRESH_TRANSPORT: &str = "DISPATCHDESK_REFRESH_TRANSPORT";
const ENV_CREDENTIAL_BACKEND: &str = "DISPATCHDESK_CREDENTIAL_BACKEND";

/// How the refresh credential reaches `/auth/refresh/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefreshTransport {
    /// `{"refresh_token": ...}` in the request body; the token is stored client-side.
    #[default]
    Body,
    /// HttpOnly cookie set by the backend; the client never sees the token.
    Cookie,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialBackend {
    #[default]
    File,
    Keyring,
    Memory,
}

impl std::str::FromStr for RefreshTransport {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "body" => Ok(Self::Body),
            "cookie" => Ok(Self::Cookie),
            other => anyhow::bail!("Unknown refresh transport '{}'", other),
        }
    }
}

impl std::str::FromStr for CredentialBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" => Ok(Self::File),
            "keyring" => Ok(Self::Keyring),
            "memory" => Ok(Self::Memory),
            other => anyhow::bail!("Unknown credential backend '{}'", other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_url: String,
    pub request_timeout_secs: u64,
    pub refresh_timeout_secs: u64,
    pub refresh_transport: RefreshTransport,
    pub credential_backend: CredentialBackend,
    pub last_username: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            refresh_timeout_secs: DEFAULT_REFRESH_TIMEOUT_SECS,
            refresh_transport: RefreshTransport::default(),
            credential_backend: CredentialBackend::default(),
            last_username: None,
        }
    }
}

impl Config {
    /// Load from the default location, then apply environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_path()?)?;
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse config file {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    /// Remember the last username in the config file. Environment overrides
    /// in effect for this run are not written back.
    pub fn remember_username(username: &str) -> Result<()> {
        let path = Self::config_path()?;
        let mut stored = Self::load_from(&path)?;
        stored.last_username = Some(username.to_string());
        stored.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Overlay `DISPATCHDESK_*` environment variables. Unparseable values are
    /// logged and ignored.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(ENV_API_URL).filter(|u| !u.is_empty()) {
            self.api_url = url;
        }
        if let Some(value) = lookup(ENV_REFRESH_TRANSPORT) {
            match value.parse() {
                Ok(transport) => self.refresh_transport = transport,
                Err(e) => warn!(error = %e, "Ignoring {}", ENV_REFRESH_TRANSPORT),
            }
        }
        if let Some(value) = lookup(ENV_CREDENTIAL_BACKEND) {
            match value.parse() {
                Ok(backend) => self.credential_backend = backend,
                Err(e) => warn!(error = %e, "Ignoring {}", ENV_CREDENTIAL_BACKEND),
            }
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.refresh_timeout_secs)
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Directory holding the persisted session and log files.
    pub fn data_dir(&self) -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(APP_NAME))
    }

    /// Open the credential store selected by `credential_backend`.
    pub fn open_credential_store(&self) -> Result<Arc<dyn CredentialStore>> {
        let store: Arc<dyn CredentialStore> = match self.credential_backend {
            CredentialBackend::File => Arc::new(
                FileCredentialStore::open(self.data_dir()?)
                    .context("Failed to open session file")?,
            ),
            CredentialBackend::Keyring => Arc::new(
                KeyringCredentialStore::open(KEYRING_SERVICE)
                    .context("Failed to open keychain entry")?,
            ),
            CredentialBackend::Memory => Arc::new(MemoryCredentialStore::new()),
        };
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("config.json")).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.api_url, "http://localhost:8000");
        assert_eq!(config.refresh_transport, RefreshTransport::Body);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"api_url": "https://dispatch.example", "refresh_transport": "cookie"}"#)
            .unwrap();
        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.api_url, "https://dispatch.example");
        assert_eq!(config.refresh_transport, RefreshTransport::Cookie);
        assert_eq!(config.request_timeout_secs, DEFAULT_REQUEST_TIMEOUT_SECS);
        assert_eq!(config.credential_backend, CredentialBackend::File);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let config = Config {
            last_username: Some("alice".to_string()),
            credential_backend: CredentialBackend::Memory,
            ..Config::default()
        };
        config.save_to(&path).unwrap();
        assert_eq!(Config::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            (ENV_API_URL, "http://10.0.0.2:8000"),
            (ENV_REFRESH_TRANSPORT, "Cookie"),
            (ENV_CREDENTIAL_BACKEND, "bogus"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(config.api_url, "http://10.0.0.2:8000");
        assert_eq!(config.refresh_transport, RefreshTransport::Cookie);
        // Invalid value is ignored
        assert_eq!(config.credential_backend, CredentialBackend::File);
    }
}
