//! Persistent geostamp cache over an injected key-value store.
//!
//! The cache is a single global slot: every controller sharing a store and key
//! sees the same entry. Unreadable or malformed entries count as a miss and
//! are left in place until the next successful capture overwrites them.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{GeoError, GeoResult, Geostamp};

/// String-keyed, string-valued persistent storage.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> GeoResult<Option<String>>;
    fn set(&self, key: &str, value: &str) -> GeoResult<()>;
    fn delete(&self, key: &str) -> GeoResult<()>;
}

impl<T: KeyValueStore + ?Sized> KeyValueStore for std::sync::Arc<T> {
    fn get(&self, key: &str) -> GeoResult<Option<String>> {
        (**self).get(key)
    }
    fn set(&self, key: &str, value: &str) -> GeoResult<()> {
        (**self).set(key, value)
    }
    fn delete(&self, key: &str) -> GeoResult<()> {
        (**self).delete(key)
    }
}

/// In-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> GeoResult<std::sync::MutexGuard<'_, BTreeMap<String, String>>> {
        self.values
            .lock()
            .map_err(|_| GeoError::Storage("memory store lock poisoned".to_string()))
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> GeoResult<Option<String>> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> GeoResult<()> {
        self.lock()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> GeoResult<()> {
        self.lock()?.remove(key);
        Ok(())
    }
}

/// Store backed by a single JSON object file.
///
/// Writes go to a sibling temp file and are renamed into place.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    fn read_all(&self) -> GeoResult<BTreeMap<String, String>> {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) if raw.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(raw) => serde_json::from_str(&raw).map_err(|e| {
                GeoError::Storage(format!("Corrupt store {}: {e}", self.path.display()))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(GeoError::Io(e)),
        }
    }

    fn write_all(&self, values: &BTreeMap<String, String>) -> GeoResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(values)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn modify(&self, f: impl FnOnce(&mut BTreeMap<String, String>)) -> GeoResult<()> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| GeoError::Storage("file store lock poisoned".to_string()))?;
        // A corrupt file is replaced rather than blocking every future write.
        // Any other read failure leaves the file alone.
        let mut values = match self.read_all() {
            Err(GeoError::Storage(reason)) => {
                tracing::warn!("{reason}, rewriting");
                BTreeMap::new()
            }
            other => other?,
        };
        f(&mut values);
        self.write_all(&values)
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> GeoResult<Option<String>> {
        Ok(self.read_all()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> GeoResult<()> {
        self.modify(|values| {
            values.insert(key.to_string(), value.to_string());
        })
    }

    fn delete(&self, key: &str) -> GeoResult<()> {
        self.modify(|values| {
            values.remove(key);
        })
    }
}

/// A cached geostamp and the moment it was persisted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub geostamp: Geostamp,
    pub stored_at: DateTime<Utc>,
}

impl CacheEntry {
    /// Valid while `now - stored_at < ttl`.
    pub fn is_fresh(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        let age = now.signed_duration_since(self.stored_at);
        match chrono::Duration::from_std(ttl) {
            Ok(ttl) => age < ttl,
            Err(_) => true,
        }
    }
}

/// TTL-aware view of the geostamp slot in a [`KeyValueStore`].
pub struct GeostampCache<S> {
    store: S,
    key: String,
    ttl: Duration,
}

impl<S: KeyValueStore> GeostampCache<S> {
    pub fn new(store: S, key: impl Into<String>, ttl: Duration) -> Self {
        Self {
            store,
            key: key.into(),
            ttl,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Read the entry regardless of age. Failures are a miss.
    pub fn load(&self) -> Option<CacheEntry> {
        let raw = match self.store.get(&self.key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!("Geostamp cache read failed, treating as miss: {e}");
                return None;
            }
        };
        match serde_json::from_str::<CacheEntry>(&raw) {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::warn!("Malformed geostamp cache entry under '{}': {e}", self.key);
                None
            }
        }
    }

    /// The cached geostamp if it is younger than the TTL.
    pub fn load_fresh(&self, now: DateTime<Utc>) -> Option<Geostamp> {
        let entry = self.load()?;
        if entry.is_fresh(now, self.ttl) {
            Some(entry.geostamp)
        } else {
            tracing::debug!("Geostamp cache entry stored at {} is stale", entry.stored_at);
            None
        }
    }

    pub fn store(&self, geostamp: Geostamp, now: DateTime<Utc>) -> GeoResult<()> {
        let entry = CacheEntry {
            geostamp,
            stored_at: now,
        };
        self.store.set(&self.key, &serde_json::to_string(&entry)?)
    }

    /// Remove the slot entirely, valid or not.
    pub fn purge(&self) -> GeoResult<()> {
        self.store.delete(&self.key)
    }
}
