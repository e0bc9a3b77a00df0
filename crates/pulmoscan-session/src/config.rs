//! Client configuration.
//!
//! Settings live at `~/.config/pulmoscan/config.json`; every field has a
//! default so a missing or partial file works. `PULMOSCAN_*` environment
//! variables override the file.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::auth::{FileStorage, KeyringStorage, MemoryStorage, RenewalPolicy, SessionStorage};

/// Application name used for config/cache directory paths
const APP_NAME: &str = "pulmoscan";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Where the credential pair is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    #[default]
    File,
    Keyring,
    Memory,
}

impl std::str::FromStr for StorageKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "file" => Ok(StorageKind::File),
            "keyring" => Ok(StorageKind::Keyring),
            "memory" => Ok(StorageKind::Memory),
            other => bail!("Unknown storage kind: {}", other),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base URL of the PulmoScan API, e.g. `http://127.0.0.1:8000/api/`.
    pub api_base_url: String,
    /// Authorization endpoints, relative to `api_base_url`.
    pub auth_path: String,
    pub request_timeout_secs: u64,
    /// Background renewal period. Keep it below the access token lifetime
    /// (the server issues 5 minute tokens by default).
    pub renewal_interval_secs: u64,
    /// The renewal timer refreshes tokens expiring within this window.
    pub renewal_skew_secs: i64,
    pub renewal_jitter_secs: u64,
    /// Requests refresh tokens expiring within this window before sending.
    pub request_skew_secs: i64,
    pub storage: StorageKind,
    pub last_username: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: "http://127.0.0.1:8000/api/".to_string(),
            auth_path: "auth/".to_string(),
            request_timeout_secs: 30,
            renewal_interval_secs: 240,
            renewal_skew_secs: 60,
            renewal_jitter_secs: 5,
            request_skew_secs: 1,
            storage: StorageKind::File,
            last_username: None,
        }
    }
}

/// Directory-like URL: `join` appends to it instead of replacing the last segment.
fn with_trailing_slash(url: &str) -> String {
    if url.ends_with('/') {
        url.to_string()
    } else {
        format!("{}/", url)
    }
}

impl Config {
    /// Load the config file (or defaults) and apply environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_path()?)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_from(path: &std::path::Path) -> Result<Self> {
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
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
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

    /// Apply `PULMOSCAN_*` overrides looked up through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T, F>(lookup: &F, key: &str, slot: &mut T) -> Result<()>
        where
            T: std::str::FromStr,
            T::Err: std::fmt::Display,
            F: Fn(&str) -> Option<String>,
        {
            if let Some(raw) = lookup(key) {
                *slot = raw
                    .trim()
                    .parse()
                    .map_err(|e| anyhow::anyhow!("Invalid {}={:?}: {}", key, raw, e))?;
            }
            Ok(())
        }

        if let Some(url) = lookup("PULMOSCAN_API_BASE_URL") {
            self.api_base_url = url;
        }
        if let Some(path) = lookup("PULMOSCAN_AUTH_PATH") {
            self.auth_path = path;
        }
        parsed(&lookup, "PULMOSCAN_REQUEST_TIMEOUT_SECS", &mut self.request_timeout_secs)?;
        parsed(&lookup, "PULMOSCAN_RENEWAL_INTERVAL_SECS", &mut self.renewal_interval_secs)?;
        parsed(&lookup, "PULMOSCAN_RENEWAL_SKEW_SECS", &mut self.renewal_skew_secs)?;
        parsed(&lookup, "PULMOSCAN_RENEWAL_JITTER_SECS", &mut self.renewal_jitter_secs)?;
        parsed(&lookup, "PULMOSCAN_REQUEST_SKEW_SECS", &mut self.request_skew_secs)?;
        parsed(&lookup, "PULMOSCAN_STORAGE", &mut self.storage)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.api_base()?;
        self.auth_base()?;
        if self.renewal_interval_secs == 0 {
            bail!("renewal_interval_secs must be positive");
        }
        if self.renewal_skew_secs < 0 || self.request_skew_secs < 0 {
            bail!("expiry skew windows must not be negative");
        }
        Ok(())
    }

    pub fn api_base(&self) -> Result<Url> {
        Url::parse(&with_trailing_slash(&self.api_base_url))
            .with_context(|| format!("Invalid API base URL: {}", self.api_base_url))
    }

    pub fn auth_base(&self) -> Result<Url> {
        self.api_base()?
            .join(&with_trailing_slash(self.auth_path.trim_start_matches('/')))
            .with_context(|| format!("Invalid auth path: {}", self.auth_path))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn request_skew(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.request_skew_secs)
    }

    pub fn renewal_policy(&self) -> RenewalPolicy {
        RenewalPolicy {
            interval: Duration::from_secs(self.renewal_interval_secs),
            skew: chrono::Duration::seconds(self.renewal_skew_secs),
            jitter: Duration::from_secs(self.renewal_jitter_secs),
        }
    }

    /// Open the configured session storage backend.
    pub fn open_storage(&self) -> Result<Arc<dyn SessionStorage>> {
        Ok(match self.storage {
            StorageKind::File => Arc::new(FileStorage::new(self.cache_dir()?)),
            StorageKind::Keyring => Arc::new(KeyringStorage::new()),
            StorageKind::Memory => Arc::new(MemoryStorage::new()),
        })
    }
}
