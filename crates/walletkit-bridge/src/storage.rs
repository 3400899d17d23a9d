//! Durable storage boundary.
//!
//! The script persists its own state through the key-value functions it is
//! given; undelivered events go to the pending-event table. Both traits are
//! synchronous and are called from the blocking pool.
//!
//! The script and the host share one key-value store through
//! [`ScopedStore`] views, so the script can neither read nor clear the
//! host's wallet records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use walletkit_error::{Result, WalletKitError};

/// An event that could not be delivered when it arrived
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingEvent {
    /// Correlation id of the event
    pub id: String,
    /// Event type tag
    #[serde(rename = "type")]
    pub event_type: String,
    /// Event payload as JSON text
    pub data: String,
    /// When the event first arrived
    pub timestamp: DateTime<Utc>,
    /// Failed replay attempts
    #[serde(default)]
    pub retry_count: u32,
}

/// String key-value storage
pub trait KeyValueStore: Send + Sync {
    /// Reads a value
    fn get(&self, key: &str) -> Result<Option<String>>;
    /// Writes a value
    fn set(&self, key: &str, value: &str) -> Result<()>;
    /// Deletes a value
    fn remove(&self, key: &str) -> Result<()>;
    /// Deletes every value
    fn clear(&self) -> Result<()>;
    /// Deletes every value whose key starts with `prefix`
    fn remove_prefixed(&self, prefix: &str) -> Result<()>;
}

/// Table of undelivered events
pub trait PendingEventStore: Send + Sync {
    /// Inserts or replaces the record with the same id
    fn save(&self, event: &PendingEvent) -> Result<()>;
    /// All records, oldest first
    fn load_all(&self) -> Result<Vec<PendingEvent>>;
    /// Deletes a record; deleting a missing id succeeds
    fn delete(&self, id: &str) -> Result<()>;
}

/// Key prefix of the script's key-value view
pub const SCRIPT_SCOPE: &str = "script:";

/// Key prefix of the host's own key-value view
pub const HOST_SCOPE: &str = "host:";

/// A key-value view confined to keys under one prefix.
///
/// `clear` only removes keys of this view.
pub struct ScopedStore {
    inner: Arc<dyn KeyValueStore>,
    prefix: String,
}

impl ScopedStore {
    /// Views the keys of `inner` starting with `prefix`
    pub fn new(inner: Arc<dyn KeyValueStore>, prefix: impl Into<String>) -> Self {
        Self {
            inner,
            prefix: prefix.into(),
        }
    }

    fn key(&self, key: &str) -> String {
        format!("{}{key}", self.prefix)
    }
}

impl KeyValueStore for ScopedStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        self.inner.get(&self.key(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.inner.set(&self.key(key), value)
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.inner.remove(&self.key(key))
    }

    fn clear(&self) -> Result<()> {
        self.inner.remove_prefixed(&self.prefix)
    }

    fn remove_prefixed(&self, prefix: &str) -> Result<()> {
        self.inner.remove_prefixed(&self.key(prefix))
    }
}

impl std::fmt::Debug for ScopedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedStore")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

/// The storage handles the engine needs
#[derive(Clone)]
pub struct StorageHandles {
    /// Key-value storage exposed to the script
    pub kv: Arc<dyn KeyValueStore>,
    /// Key-value storage for host-owned state such as wallet records
    pub wallets: Arc<dyn KeyValueStore>,
    /// Pending-event table
    pub events: Arc<dyn PendingEventStore>,
}

impl StorageHandles {
    /// Uses one store for every role, split into script and host scopes
    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: KeyValueStore + PendingEventStore + 'static,
    {
        let kv: Arc<dyn KeyValueStore> = store.clone();
        Self {
            kv: Arc::new(ScopedStore::new(Arc::clone(&kv), SCRIPT_SCOPE)),
            wallets: Arc::new(ScopedStore::new(kv, HOST_SCOPE)),
            events: store,
        }
    }

    /// Fresh in-memory storage
    pub fn in_memory() -> Self {
        Self::from_store(Arc::new(MemoryStore::new()))
    }
}

impl std::fmt::Debug for StorageHandles {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageHandles").finish_non_exhaustive()
    }
}

fn upsert(events: &mut Vec<PendingEvent>, event: &PendingEvent) {
    match events.iter_mut().find(|e| e.id == event.id) {
        Some(existing) => *existing = event.clone(),
        None => events.push(event.clone()),
    }
}

fn poisoned<T>(_: T) -> WalletKitError {
    WalletKitError::storage("storage lock poisoned")
}

/// Storage held in memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<BTreeMap<String, String>>,
    events: Mutex<Vec<PendingEvent>>,
}

impl MemoryStore {
    /// Creates an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.lock().map_err(poisoned)?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.values
            .lock()
            .map_err(poisoned)?
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.values.lock().map_err(poisoned)?.remove(key);
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.values.lock().map_err(poisoned)?.clear();
        Ok(())
    }

    fn remove_prefixed(&self, prefix: &str) -> Result<()> {
        self.values
            .lock()
            .map_err(poisoned)?
            .retain(|key, _| !key.starts_with(prefix));
        Ok(())
    }
}

impl PendingEventStore for MemoryStore {
    fn save(&self, event: &PendingEvent) -> Result<()> {
        upsert(&mut *self.events.lock().map_err(poisoned)?, event);
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<PendingEvent>> {
        Ok(self.events.lock().map_err(poisoned)?.clone())
    }

    fn delete(&self, id: &str) -> Result<()> {
        self.events.lock().map_err(poisoned)?.retain(|e| e.id != id);
        Ok(())
    }
}

const VALUES_FILE: &str = "storage.json";
const EVENTS_FILE: &str = "pending_events.json";

/// Storage kept as JSON files in a directory.
///
/// `storage.json` holds the key-value map, `pending_events.json` the
/// pending-event table. Every write replaces the file through a rename.
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl FileStore {
    /// Opens (and creates) the storage directory
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| {
            WalletKitError::storage(format!("Failed to create {}: {e}", dir.display()))
        })?;
        Ok(Self {
            dir,
            lock: Mutex::new(()),
        })
    }

    /// The storage directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn read<T: serde::de::DeserializeOwned + Default>(&self, name: &str) -> Result<T> {
        let path = self.dir.join(name);
        match std::fs::read_to_string(&path) {
            Ok(text) if text.trim().is_empty() => Ok(T::default()),
            Ok(text) => serde_json::from_str(&text).map_err(|e| {
                WalletKitError::storage(format!("Corrupt {}: {e}", path.display()))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
            Err(e) => Err(WalletKitError::storage(format!(
                "Failed to read {}: {e}",
                path.display()
            ))),
        }
    }

    fn write<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        let path = self.dir.join(name);
        let tmp = self.dir.join(format!("{name}.tmp"));
        let json = serde_json::to_vec_pretty(value)?;
        std::fs::write(&tmp, json)
            .and_then(|_| std::fs::rename(&tmp, &path))
            .map_err(|e| WalletKitError::storage(format!("Failed to write {}: {e}", path.display())))
    }

    fn update_values<R>(&self, f: impl FnOnce(&mut BTreeMap<String, String>) -> R) -> Result<R> {
        let _guard = self.lock.lock().map_err(poisoned)?;
        let mut values: BTreeMap<String, String> = self.read(VALUES_FILE)?;
        let result = f(&mut values);
        self.write(VALUES_FILE, &values)?;
        Ok(result)
    }

    fn update_events(&self, f: impl FnOnce(&mut Vec<PendingEvent>)) -> Result<()> {
        let _guard = self.lock.lock().map_err(poisoned)?;
        let mut events: Vec<PendingEvent> = self.read(EVENTS_FILE)?;
        f(&mut events);
        self.write(EVENTS_FILE, &events)
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let _guard = self.lock.lock().map_err(poisoned)?;
        let values: BTreeMap<String, String> = self.read(VALUES_FILE)?;
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.update_values(|values| {
            values.insert(key.to_string(), value.to_string());
        })
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.update_values(|values| {
            values.remove(key);
        })
    }

    fn clear(&self) -> Result<()> {
        self.update_values(BTreeMap::clear)
    }

    fn remove_prefixed(&self, prefix: &str) -> Result<()> {
        self.update_values(|values| values.retain(|key, _| !key.starts_with(prefix)))
    }
}

impl PendingEventStore for FileStore {
    fn save(&self, event: &PendingEvent) -> Result<()> {
        self.update_events(|events| upsert(events, event))
    }

    fn load_all(&self) -> Result<Vec<PendingEvent>> {
        let _guard = self.lock.lock().map_err(poisoned)?;
        self.read(EVENTS_FILE)
    }

    fn delete(&self, id: &str) -> Result<()> {
        self.update_events(|events| events.retain(|e| e.id != id))
    }
}
