//! Durable backends for the serialized credential pair.
//!
//! Every backend holds exactly one value under one key. The store reads it
//! once at startup and rewrites it on every mutation.

use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use keyring::Entry;

/// Session file name in cache directory
const SESSION_FILE: &str = "session.json";

const KEYRING_SERVICE: &str = "pulmoscan";
const KEYRING_KEY: &str = "session";

pub trait SessionStorage: Send + Sync {
    /// Read the persisted value, `None` if nothing has been stored.
    fn read(&self) -> Result<Option<String>>;

    fn write(&self, value: &str) -> Result<()>;

    /// Remove the persisted value. Removing an absent value succeeds.
    fn remove(&self) -> Result<()>;
}

/// JSON file in the application cache directory.
pub struct FileStorage {
    cache_dir: PathBuf,
}

impl FileStorage {
    pub fn new(cache_dir: PathBuf) -> Self {
        Self { cache_dir }
    }

    pub fn path(&self) -> PathBuf {
        self.cache_dir.join(SESSION_FILE)
    }
}

impl SessionStorage for FileStorage {
    fn read(&self) -> Result<Option<String>> {
        let path = self.path();
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&path).context("Failed to read session file")?;
        Ok(Some(contents))
    }

    fn write(&self, value: &str) -> Result<()> {
        let path = self.path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create session directory")?;
        }
        // Readers only ever see a complete file.
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, value).context("Failed to write session file")?;
        std::fs::rename(&tmp, &path).context("Failed to replace session file")?;
        Ok(())
    }

    fn remove(&self) -> Result<()> {
        let path = self.path();
        if path.exists() {
            std::fs::remove_file(path).context("Failed to remove session file")?;
        }
        Ok(())
    }
}

/// Single entry in the OS keychain.
pub struct KeyringStorage {
    service: String,
}

impl KeyringStorage {
    pub fn new() -> Self {
        Self {
            service: KEYRING_SERVICE.to_string(),
        }
    }

    fn entry(&self) -> Result<Entry> {
        Entry::new(&self.service, KEYRING_KEY).context("Failed to create keyring entry")
    }
}

impl Default for KeyringStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStorage for KeyringStorage {
    fn read(&self) -> Result<Option<String>> {
        match self.entry()?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e).context("Failed to read session from keychain"),
        }
    }

    fn write(&self, value: &str) -> Result<()> {
        self.entry()?
            .set_password(value)
            .context("Failed to store session in keychain")
    }

    fn remove(&self) -> Result<()> {
        match self.entry()?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e).context("Failed to delete session from keychain"),
        }
    }
}

/// Process-local storage. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryStorage {
    value: Mutex<Option<String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with a value already "persisted", as if from a previous run.
    pub fn with_value(value: impl Into<String>) -> Self {
        Self {
            value: Mutex::new(Some(value.into())),
        }
    }

    pub fn value(&self) -> Option<String> {
        self.slot().clone()
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        self.value
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl SessionStorage for MemoryStorage {
    fn read(&self) -> Result<Option<String>> {
        Ok(self.value())
    }

    fn write(&self, value: &str) -> Result<()> {
        *self.slot() = Some(value.to_string());
        Ok(())
    }

    fn remove(&self) -> Result<()> {
        *self.slot() = None;
        Ok(())
    }
}
