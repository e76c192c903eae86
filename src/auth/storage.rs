//! Persistent key-value storage for session state
//!
//! Session state survives restarts through a small string-keyed store. The
//! OS keyring is preferred; a JSON file in the user data directory is the
//! fallback when no keyring service is reachable.

use crate::error::AppError;
use fs2::FileExt;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Keyring service name and data directory name
pub const SERVICE_NAME: &str = "datagate";

const STORE_FILE: &str = "session.json";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Corrupt store file: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error("Keyring error: {0}")]
    Keyring(String),
    #[error("No data directory available")]
    NoDataDir,
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        AppError::StorageError(err.to_string())
    }
}

/// String-keyed persistent store
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    /// Removing a missing key is not an error
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// Process-local store, lost on exit
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.values.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.values.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.values.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.values.lock().remove(key);
        Ok(())
    }
}

/// JSON object on disk, rewritten atomically under an exclusive lock
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<data dir>/datagate/session.json`
    pub fn default_path() -> Result<PathBuf, StoreError> {
        let data_dir = dirs::data_dir().ok_or(StoreError::NoDataDir)?;
        Ok(data_dir.join(SERVICE_NAME).join(STORE_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_map(&self) -> Result<BTreeMap<String, String>, StoreError> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let contents = fs::read_to_string(&self.path)?;
        if contents.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        Ok(serde_json::from_str(&contents)?)
    }

    fn write_map(&self, map: &BTreeMap<String, String>) -> Result<(), StoreError> {
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, serde_json::to_string_pretty(map)?)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(&tmp_path)?.permissions();
            perms.set_mode(0o600);
            fs::set_permissions(&tmp_path, perms)?;
        }

        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    /// Read-modify-write under the lock file
    fn update<F>(&self, edit: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut BTreeMap<String, String>) -> bool,
    {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let lock_path = self.path.with_extension("lock");
        let lock_file = fs::File::create(&lock_path)?;
        lock_file.lock_exclusive()?;

        let result = self.read_map().and_then(|mut map| {
            if edit(&mut map) {
                self.write_map(&map)
            } else {
                Ok(())
            }
        });

        lock_file.unlock()?;
        result
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.read_map()?.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.update(|map| {
            map.insert(key.to_string(), value.to_string());
            true
        })
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        if !self.path.exists() {
            return Ok(());
        }
        self.update(|map| map.remove(key).is_some())
    }
}

/// OS keyring; each key is its own entry under the service
#[derive(Debug, Clone)]
pub struct KeyringStore {
    service: String,
}

impl KeyringStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, key: &str) -> Result<keyring::Entry, StoreError> {
        keyring::Entry::new(&self.service, key).map_err(|e| StoreError::Keyring(e.to_string()))
    }

    /// Probe the keyring with a throwaway entry
    pub fn is_available(&self) -> bool {
        let probe = "_availability_probe";
        let Ok(entry) = self.entry(probe) else {
            return false;
        };
        if entry.set_password("probe").is_err() {
            return false;
        }
        let readable = entry.get_password().is_ok();
        let _ = entry.delete_password();
        readable
    }
}

impl KeyValueStore for KeyringStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match self.entry(key)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(StoreError::Keyring(e.to_string())),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.entry(key)?
            .set_password(value)
            .map_err(|e| StoreError::Keyring(e.to_string()))
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        match self.entry(key)?.delete_password() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(StoreError::Keyring(e.to_string())),
        }
    }
}

/// Open the keyring store if usable, otherwise a file store at
/// `fallback` (or the default data-dir path)
pub fn open_default_store(fallback: Option<&Path>) -> Result<Arc<dyn KeyValueStore>, StoreError> {
    let keyring = KeyringStore::new(SERVICE_NAME);
    if keyring.is_available() {
        debug!("Using OS keyring for session storage");
        return Ok(Arc::new(keyring));
    }

    let path = match fallback {
        Some(path) => path.to_path_buf(),
        None => FileStore::default_path()?,
    };
    warn!("OS keyring unavailable, storing session in {}", path.display());
    Ok(Arc::new(FileStore::new(path)))
}
