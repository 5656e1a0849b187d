//! Secure backing store for device secrets.
//!
//! Every secret the agent holds goes through [`SecretStore`], a namespaced
//! get/set/delete interface over string values. Three implementations:
//!
//! - [`KeyringStore`]: production. A single OS keyring entry
//!   `tether/credentials` holding a JSON map, so a rebuilt binary triggers at
//!   most one macOS keychain prompt instead of one per secret.
//! - [`FileStore`]: `TETHER_ENV=test|system_test`. A `0600` JSON file.
//! - [`MemoryStore`]: in-process fake for tests, with a switch to simulate
//!   an unavailable vault.
//!
//! # Graceful Degradation
//!
//! macOS keychain may block access when the binary signature changes. The
//! keyring store distinguishes:
//! - Entry missing (normal first run) -> empty map
//! - Data corrupted -> logged, empty map
//! - Locked / access denied / no backend -> [`StoreError::Unavailable`]
//!
//! A failed load is remembered for [`KEYRING_UNAVAILABLE_BACKOFF`] so callers
//! on async workers do not pay the blocking retry on every request.

use keyring::Entry;
use std::collections::{BTreeMap, HashMap};
use std::fs;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::StoreError;

/// Consolidated keyring entry name.
const KEYRING_CREDENTIALS: &str = "credentials";

/// Number of retry attempts for keyring access.
const KEYRING_RETRY_ATTEMPTS: u32 = 2;
/// Delay between retry attempts in milliseconds.
const KEYRING_RETRY_DELAY_MS: u64 = 500;
/// How long a failed keyring load is reported without touching the keyring.
pub const KEYRING_UNAVAILABLE_BACKOFF: Duration = Duration::from_secs(30);

/// Namespaced secret storage.
///
/// Absence is `Ok(None)`; only a store that cannot be reached is an error.
pub trait SecretStore: Send + Sync + std::fmt::Debug {
    /// Read a secret.
    fn get(&self, namespace: &str, key: &str) -> Result<Option<String>, StoreError>;
    /// Write a secret, replacing any previous value.
    fn set(&self, namespace: &str, key: &str, value: &str) -> Result<(), StoreError>;
    /// Remove a secret. Removing a missing key is not an error.
    fn delete(&self, namespace: &str, key: &str) -> Result<(), StoreError>;
    /// Apply several writes in one namespace as a single unit: either every
    /// change lands or none does. `None` deletes the key.
    fn set_many(&self, namespace: &str, changes: &[(&str, Option<&str>)]) -> Result<(), StoreError>;
}

/// Flattened `namespace/key` map persisted by the keyring and file stores.
type SecretMap = BTreeMap<String, String>;

fn slot(namespace: &str, key: &str) -> String {
    format!("{namespace}/{key}")
}

/// Apply `changes` to a flattened map, returning whether anything changed.
fn apply_changes(map: &mut SecretMap, namespace: &str, changes: &[(&str, Option<&str>)]) -> bool {
    let mut dirty = false;
    for (key, value) in changes {
        let slot = slot(namespace, key);
        dirty |= match value {
            Some(value) => map.insert(slot, value.to_string()).as_deref() != Some(*value),
            None => map.remove(&slot).is_some(),
        };
    }
    dirty
}

/// Categorized keyring access errors.
#[derive(Debug)]
enum KeyringAccessError {
    /// Keyring is locked and requires user interaction to unlock.
    Locked(String),
    /// Entry does not exist (normal for first run).
    NotFound,
    /// Access denied, likely due to binary signature change.
    AccessDenied(String),
    /// Data exists but is corrupted or unparseable.
    Corrupted(String),
    /// Other/unknown error.
    Other(String),
}

impl std::fmt::Display for KeyringAccessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Locked(msg) => write!(f, "Keyring locked: {msg}"),
            Self::NotFound => write!(f, "Keyring entry not found"),
            Self::AccessDenied(msg) => write!(f, "Keyring access denied: {msg}"),
            Self::Corrupted(msg) => write!(f, "Keyring data corrupted: {msg}"),
            Self::Other(msg) => write!(f, "Keyring error: {msg}"),
        }
    }
}

/// Categorize a keyring error for better user feedback.
fn categorize_keyring_error(err: &keyring::Error) -> KeyringAccessError {
    match err {
        keyring::Error::NoEntry => return KeyringAccessError::NotFound,
        keyring::Error::BadEncoding(_) => {
            return KeyringAccessError::Corrupted(format!("{err}"));
        }
        keyring::Error::NoStorageAccess(_) => {
            return KeyringAccessError::AccessDenied(format!("{err:?}"));
        }
        _ => {}
    }

    let msg = format!("{err:?}");
    let msg_lower = msg.to_lowercase();

    if msg_lower.contains("user interaction") || msg_lower.contains("user canceled") {
        return KeyringAccessError::Locked(msg);
    }

    if msg_lower.contains("denied")
        || msg_lower.contains("codesign")
        || msg_lower.contains("authorization")
        || msg_lower.contains("not allowed")
    {
        return KeyringAccessError::AccessDenied(msg);
    }

    KeyringAccessError::Other(msg)
}

/// Production store backed by the OS keyring.
///
/// The decoded map is cached after the first successful load; writes go
/// through to the keyring before the cache is updated.
#[derive(Debug)]
pub struct KeyringStore {
    service: String,
    cache: Mutex<Cached>,
}

#[derive(Debug, Default)]
enum Cached {
    #[default]
    Empty,
    Loaded(SecretMap),
    Failed { at: Instant, error: StoreError },
}

/// Whether a load that failed at `failed_at` should still be reported as-is.
fn in_backoff(failed_at: Instant, now: Instant) -> bool {
    now.saturating_duration_since(failed_at) < KEYRING_UNAVAILABLE_BACKOFF
}

impl KeyringStore {
    /// Create a store under the given keyring service name.
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            cache: Mutex::new(Cached::Empty),
        }
    }

    fn entry(&self) -> Result<Entry, StoreError> {
        Entry::new(&self.service, KEYRING_CREDENTIALS)
            .map_err(|e| StoreError::Unavailable(format!("Failed to create keyring entry: {e:?}")))
    }

    /// Load from keyring with retry logic for transient failures.
    fn load_with_retry(&self) -> Result<SecretMap, StoreError> {
        let mut last_error: Option<KeyringAccessError> = None;

        for attempt in 0..KEYRING_RETRY_ATTEMPTS {
            if attempt > 0 {
                log::debug!(
                    "Retrying keyring access (attempt {}/{})",
                    attempt + 1,
                    KEYRING_RETRY_ATTEMPTS
                );
                thread::sleep(Duration::from_millis(KEYRING_RETRY_DELAY_MS));
            }

            match self.try_load() {
                Ok(map) => return Ok(map),
                Err(KeyringAccessError::NotFound) => {
                    log::debug!("No credentials found in keyring, starting empty");
                    return Ok(SecretMap::new());
                }
                // Corrupted data won't fix itself; the next write replaces it.
                Err(err @ KeyringAccessError::Corrupted(_)) => {
                    log::warn!("{err}; treating stored secrets as empty");
                    return Ok(SecretMap::new());
                }
                Err(err) => {
                    log::debug!("Keyring access attempt {} failed: {}", attempt + 1, err);
                    last_error = Some(err);
                }
            }
        }

        let err = last_error.unwrap_or(KeyringAccessError::Other("unknown".to_string()));
        if matches!(err, KeyringAccessError::AccessDenied(_)) {
            log::info!(
                "Hint: binary signature may have changed. \
                 Unlock your keychain or re-provision the device."
            );
        }
        Err(StoreError::Unavailable(err.to_string()))
    }

    fn try_load(&self) -> Result<SecretMap, KeyringAccessError> {
        let entry = Entry::new(&self.service, KEYRING_CREDENTIALS)
            .map_err(|e| KeyringAccessError::Other(format!("Failed to create entry: {e:?}")))?;

        match entry.get_password() {
            Ok(json) => serde_json::from_str(&json)
                .map_err(|e| KeyringAccessError::Corrupted(format!("JSON parse error: {e}"))),
            Err(e) => Err(categorize_keyring_error(&e)),
        }
    }

    fn save(&self, map: &SecretMap) -> Result<(), StoreError> {
        let entry = self.entry()?;
        if map.is_empty() {
            match entry.delete_credential() {
                Ok(()) | Err(keyring::Error::NoEntry) => return Ok(()),
                Err(e) => {
                    return Err(StoreError::Unavailable(format!(
                        "Failed to delete keyring entry: {e:?}"
                    )))
                }
            }
        }
        let json = serde_json::to_string(map)
            .map_err(|e| StoreError::Corrupted(format!("serialize: {e}")))?;
        entry.set_password(&json).map_err(|e| {
            StoreError::Unavailable(format!("Failed to store credentials in keyring: {e:?}"))
        })?;
        log::debug!("Saved consolidated credentials to OS keyring");
        Ok(())
    }

    fn with_map<T>(
        &self,
        f: impl FnOnce(&mut SecretMap) -> (bool, T),
    ) -> Result<T, StoreError> {
        let mut cache = self
            .cache
            .lock()
            .map_err(|_poisoned| StoreError::Unavailable("keyring cache poisoned".into()))?;
        let mut map = match std::mem::take(&mut *cache) {
            Cached::Loaded(map) => map,
            Cached::Failed { at, error } if in_backoff(at, Instant::now()) => {
                *cache = Cached::Failed {
                    at,
                    error: error.clone(),
                };
                return Err(error);
            }
            Cached::Empty | Cached::Failed { .. } => match self.load_with_retry() {
                Ok(map) => map,
                Err(error) => {
                    *cache = Cached::Failed {
                        at: Instant::now(),
                        error: error.clone(),
                    };
                    return Err(error);
                }
            },
        };
        let snapshot = map.clone();
        let (dirty, out) = f(&mut map);
        if dirty {
            if let Err(e) = self.save(&map) {
                *cache = Cached::Loaded(snapshot);
                return Err(e);
            }
        }
        *cache = Cached::Loaded(map);
        Ok(out)
    }
}

impl SecretStore for KeyringStore {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<String>, StoreError> {
        self.with_map(|map| (false, map.get(&slot(namespace, key)).cloned()))
    }

    fn set(&self, namespace: &str, key: &str, value: &str) -> Result<(), StoreError> {
        self.with_map(|map| {
            let prev = map.insert(slot(namespace, key), value.to_string());
            (prev.as_deref() != Some(value), ())
        })
    }

    fn delete(&self, namespace: &str, key: &str) -> Result<(), StoreError> {
        self.with_map(|map| (map.remove(&slot(namespace, key)).is_some(), ()))
    }

    fn set_many(&self, namespace: &str, changes: &[(&str, Option<&str>)]) -> Result<(), StoreError> {
        self.with_map(|map| (apply_changes(map, namespace, changes), ()))
    }
}

/// File-backed store used in test environments.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStore {
    /// Create a store persisting to `path` (created on first write).
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<SecretMap, StoreError> {
        if !self.path.exists() {
            return Ok(SecretMap::new());
        }
        let content = fs::read_to_string(&self.path)
            .map_err(|e| StoreError::Unavailable(format!("{}: {e}", self.path.display())))?;
        serde_json::from_str(&content).map_err(|e| StoreError::Corrupted(e.to_string()))
    }

    fn save(&self, map: &SecretMap) -> Result<(), StoreError> {
        let io_err = |e: std::io::Error| StoreError::Unavailable(format!("{}: {e}", self.path.display()));
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let json = serde_json::to_string_pretty(map)
            .map_err(|e| StoreError::Corrupted(e.to_string()))?;
        fs::write(&self.path, json).map_err(io_err)?;

        #[cfg(unix)]
        fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600)).map_err(io_err)?;

        Ok(())
    }

    fn locked<T>(&self, f: impl FnOnce() -> Result<T, StoreError>) -> Result<T, StoreError> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_poisoned| StoreError::Unavailable("file store lock poisoned".into()))?;
        f()
    }
}

impl SecretStore for FileStore {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<String>, StoreError> {
        self.locked(|| Ok(self.load()?.get(&slot(namespace, key)).cloned()))
    }

    fn set(&self, namespace: &str, key: &str, value: &str) -> Result<(), StoreError> {
        self.locked(|| {
            let mut map = self.load()?;
            map.insert(slot(namespace, key), value.to_string());
            self.save(&map)
        })
    }

    fn delete(&self, namespace: &str, key: &str) -> Result<(), StoreError> {
        self.locked(|| {
            let mut map = self.load()?;
            if map.remove(&slot(namespace, key)).is_some() {
                self.save(&map)?;
            }
            Ok(())
        })
    }

    fn set_many(&self, namespace: &str, changes: &[(&str, Option<&str>)]) -> Result<(), StoreError> {
        self.locked(|| {
            let mut map = self.load()?;
            if apply_changes(&mut map, namespace, changes) {
                self.save(&map)?;
            }
            Ok(())
        })
    }
}

#[derive(Debug, Default)]
struct MemoryInner {
    values: HashMap<String, String>,
    unavailable: bool,
}

/// In-memory store for tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    /// Empty, available store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the OS vault refusing access (or recovering).
    pub fn set_unavailable(&self, unavailable: bool) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.unavailable = unavailable;
        }
    }

    /// Number of stored secrets.
    pub fn len(&self) -> usize {
        self.inner.lock().map(|inner| inner.values.len()).unwrap_or(0)
    }

    /// Whether nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn with<T>(&self, f: impl FnOnce(&mut HashMap<String, String>) -> T) -> Result<T, StoreError> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_poisoned| StoreError::Unavailable("memory store poisoned".into()))?;
        if inner.unavailable {
            return Err(StoreError::Unavailable("permission denied".into()));
        }
        Ok(f(&mut inner.values))
    }
}

impl SecretStore for MemoryStore {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<String>, StoreError> {
        self.with(|values| values.get(&slot(namespace, key)).cloned())
    }

    fn set(&self, namespace: &str, key: &str, value: &str) -> Result<(), StoreError> {
        self.with(|values| {
            values.insert(slot(namespace, key), value.to_string());
        })
    }

    fn delete(&self, namespace: &str, key: &str) -> Result<(), StoreError> {
        self.with(|values| {
            values.remove(&slot(namespace, key));
        })
    }

    fn set_many(&self, namespace: &str, changes: &[(&str, Option<&str>)]) -> Result<(), StoreError> {
        self.with(|values| {
            for (key, value) in changes {
                match value {
                    Some(value) => values.insert(slot(namespace, key), value.to_string()),
                    None => values.remove(&slot(namespace, key)),
                };
            }
        })
    }
}

/// Pick the store for the current environment: keyring in production,
/// `credentials.json` under `config_dir` in test modes.
pub fn default_store(config_dir: &Path) -> Arc<dyn SecretStore> {
    if crate::env::should_skip_keyring() {
        log::debug!("Using file-backed secret store (test environment)");
        Arc::new(FileStore::new(config_dir.join("credentials.json")))
    } else {
        Arc::new(KeyringStore::new(crate::env::APP_NAME))
    }
}
