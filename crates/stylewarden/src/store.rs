//! Persistent key-value store used for cache entries and settings.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::types::StoreError;

/// A flat string-to-string store. Values are written whole; last write wins.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    fn set(&self, key: &str, value: String) -> Result<(), StoreError>;

    /// Remove `key`, returning whether it existed.
    fn remove(&self, key: &str) -> Result<bool, StoreError>;

    /// All keys, in sorted order.
    fn keys(&self) -> Vec<String>;
}

fn lock(map: &Mutex<BTreeMap<String, String>>) -> MutexGuard<'_, BTreeMap<String, String>> {
    map.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// In-memory store. Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    map: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        lock(&self.map).get(key).cloned()
    }

    fn set(&self, key: &str, value: String) -> Result<(), StoreError> {
        lock(&self.map).insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool, StoreError> {
        Ok(lock(&self.map).remove(key).is_some())
    }

    fn keys(&self) -> Vec<String> {
        lock(&self.map).keys().cloned().collect()
    }
}

/// JSON-file-backed store. Every mutation re-reads the file, applies the
/// change, and rewrites the whole map, so several handles on one path keep
/// each other's keys.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    map: Mutex<BTreeMap<String, String>>,
}

impl FileStore {
    /// Open (or lazily create) the store at `path`.
    ///
    /// An unreadable or corrupt file is logged and treated as empty; it is
    /// replaced on the next write.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let map = read_map(&path)?.unwrap_or_default();
        Ok(Self {
            path,
            map: Mutex::new(map),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Pick up writes made through other handles. A corrupt file leaves the
    /// in-memory view as it was.
    fn refresh(&self, map: &mut BTreeMap<String, String>) -> Result<(), StoreError> {
        if let Some(on_disk) = read_map(&self.path)? {
            *map = on_disk;
        }
        Ok(())
    }

    fn persist(&self, map: &BTreeMap<String, String>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_vec_pretty(map)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// `Ok(None)` for a corrupt file; a missing file is an empty map.
fn read_map(path: &Path) -> Result<Option<BTreeMap<String, String>>, StoreError> {
    match std::fs::read_to_string(path) {
        Ok(data) => match serde_json::from_str(&data) {
            Ok(map) => Ok(Some(map)),
            Err(e) => {
                tracing::warn!("Store file {} is corrupt ({e}), ignoring it", path.display());
                Ok(None)
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Some(BTreeMap::new())),
        Err(e) => Err(e.into()),
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Option<String> {
        lock(&self.map).get(key).cloned()
    }

    fn set(&self, key: &str, value: String) -> Result<(), StoreError> {
        let mut map = lock(&self.map);
        self.refresh(&mut map)?;
        map.insert(key.to_string(), value);
        self.persist(&map)
    }

    fn remove(&self, key: &str) -> Result<bool, StoreError> {
        let mut map = lock(&self.map);
        self.refresh(&mut map)?;
        if map.remove(key).is_none() {
            return Ok(false);
        }
        self.persist(&map)?;
        Ok(true)
    }

    fn keys(&self) -> Vec<String> {
        lock(&self.map).keys().cloned().collect()
    }
}
