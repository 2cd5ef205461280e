//! Application configuration management.
//!
//! Configuration holds the backend location, the auth routes, timeouts and
//! where the session is kept. It is stored at
//! `~/.config/creditdesk/config.json`; a missing file means defaults.
//! `CREDITDESK_API_URL` and `CREDITDESK_SESSION_BACKEND` override the file.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::api::{ClientConfig, REFRESH_TOKEN_PATH, SIGN_IN_ROUTE};
use crate::auth::{FileSessionStore, KeyringSessionStore, MemorySessionStore, SessionStore};

/// Application name used for config/cache directory paths
const APP_NAME: &str = "creditdesk";

/// Config file name
const CONFIG_FILE: &str = "config.json";

pub const API_URL_ENV: &str = "CREDITDESK_API_URL";
pub const SESSION_BACKEND_ENV: &str = "CREDITDESK_SESSION_BACKEND";

/// Where the session is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionBackend {
    #[default]
    File,
    Keyring,
    Memory,
}

impl FromStr for SessionBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" => Ok(Self::File),
            "keyring" => Ok(Self::Keyring),
            "memory" => Ok(Self::Memory),
            other => Err(anyhow::anyhow!("Unknown session backend: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub base_url: String,
    pub sign_in_route: String,
    pub refresh_path: String,
    pub request_timeout_secs: u64,
    pub refresh_timeout_secs: u64,
    pub session_backend: SessionBackend,
}

impl Default for Config {
    fn default() -> Self {
        let client = ClientConfig::default();
        Self {
            base_url: client.base_url,
            sign_in_route: SIGN_IN_ROUTE.to_string(),
            refresh_path: REFRESH_TOKEN_PATH.to_string(),
            request_timeout_secs: client.request_timeout.as_secs(),
            refresh_timeout_secs: client.refresh_timeout.as_secs(),
            session_backend: SessionBackend::default(),
        }
    }
}

impl Config {
    /// Load the config file (if any), then apply environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_path()?)?;
        config.apply_overrides(
            std::env::var(API_URL_ENV).ok(),
            std::env::var(SESSION_BACKEND_ENV).ok(),
        )?;
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("Invalid config file: {}", path.display()))?;
        Ok(config)
    }

    /// Reject values the client cannot work with.
    ///
    /// A blank `refresh_path` would match every route and turn every
    /// failure into a logout.
    pub fn validate(&self) -> Result<()> {
        if self.refresh_path.trim().trim_end_matches('/').is_empty() {
            anyhow::bail!("refresh_path must not be empty");
        }
        if self.base_url.trim().is_empty() {
            anyhow::bail!("base_url must not be empty");
        }
        Ok(())
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Apply values taken from the environment; blank values are ignored.
    pub fn apply_overrides(&mut self, api_url: Option<String>, backend: Option<String>) -> Result<()> {
        if let Some(url) = api_url.filter(|u| !u.trim().is_empty()) {
            self.base_url = url.trim().to_string();
        }
        if let Some(backend) = backend.filter(|b| !b.trim().is_empty()) {
            self.session_backend = backend
                .parse()
                .with_context(|| format!("Invalid {}", SESSION_BACKEND_ENV))?;
        }
        self.validate()
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            base_url: self.base_url.clone(),
            refresh_path: self.refresh_path.clone(),
            sign_in_route: self.sign_in_route.clone(),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            refresh_timeout: Duration::from_secs(self.refresh_timeout_secs),
        }
    }

    /// Open the configured session backend.
    pub fn session_store(&self) -> Result<Arc<dyn SessionStore>> {
        Ok(match self.session_backend {
            SessionBackend::File => Arc::new(FileSessionStore::new(self.cache_dir()?)),
            SessionBackend::Keyring => Arc::new(KeyringSessionStore::new()),
            SessionBackend::Memory => Arc::new(MemorySessionStore::new()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("config.json")).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.refresh_path, "/api/auth/refresh-token");
        assert_eq!(config.sign_in_route, "/auth/signin");
        assert_eq!(config.refresh_timeout_secs, 30);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"base_url":"https://admin.example.com","session_backend":"keyring"}"#).unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.base_url, "https://admin.example.com");
        assert_eq!(config.session_backend, SessionBackend::Keyring);
        assert_eq!(config.request_timeout_secs, 30);
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("config.json");
        let config = Config {
            refresh_timeout_secs: 5,
            ..Config::default()
        };
        config.save_to(&path).unwrap();
        assert_eq!(Config::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_overrides() {
        let mut config = Config::default();
        config
            .apply_overrides(Some(" http://api.test ".to_string()), Some("Memory".to_string()))
            .unwrap();
        assert_eq!(config.base_url, "http://api.test");
        assert_eq!(config.session_backend, SessionBackend::Memory);

        config.apply_overrides(Some(String::new()), None).unwrap();
        assert_eq!(config.base_url, "http://api.test");

        assert!(config.apply_overrides(None, Some("cloud".to_string())).is_err());
    }

    #[test]
    fn test_blank_refresh_path_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"refresh_path":""}"#).unwrap();
        assert!(Config::load_from(&path).is_err());

        std::fs::write(&path, r#"{"refresh_path":"/"}"#).unwrap();
        assert!(Config::load_from(&path).is_err());

        let mut config = Config {
            refresh_path: "  ".to_string(),
            ..Config::default()
        };
        assert!(config.apply_overrides(None, None).is_err());

        config.refresh_path = REFRESH_TOKEN_PATH.to_string();
        assert!(config.apply_overrides(None, None).is_ok());
    }

    #[test]
    fn test_client_config_conversion() {
        let config = Config {
            refresh_timeout_secs: 7,
            ..Config::default()
        };
        let client = config.client_config();
        assert_eq!(client.refresh_timeout, Duration::from_secs(7));
        assert_eq!(client.refresh_path, REFRESH_TOKEN_PATH);
    }
}
