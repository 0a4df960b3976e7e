use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::{AppError, AppResult};

/// Settings key for the saved reference-layer path.
pub const KEY_REFERENCE_LAYER: &str = "reference_layer";

/// Backing storage for a [`StoreHandle`]. Writes stay in memory until
/// `save` persists them.
pub trait PreferenceStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
    fn remove(&self, key: &str);
    fn save(&self) -> AppResult<()>;
}

#[derive(Default)]
struct MemoryStore {
    data: Mutex<BTreeMap<String, String>>,
}

impl PreferenceStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.data
            .lock()
            .map(|guard| guard.get(key).cloned())
            .unwrap_or_default()
    }

    fn set(&self, key: &str, value: &str) {
        if let Ok(mut guard) = self.data.lock() {
            guard.insert(key.to_string(), value.to_string());
        }
    }

    fn remove(&self, key: &str) {
        if let Ok(mut guard) = self.data.lock() {
            guard.remove(key);
        }
    }

    fn save(&self) -> AppResult<()> {
        Ok(())
    }
}

/// Flat string map persisted as a JSON object. `save` replaces the file
/// atomically: write a sibling temp file, fsync, then rename over.
struct JsonFileStore {
    path: PathBuf,
    data: Mutex<BTreeMap<String, String>>,
}

impl JsonFileStore {
    fn open(path: &Path) -> AppResult<Self> {
        let data = if path.exists() {
            let bytes = std::fs::read(path).map_err(|err| {
                AppError::from(err)
                    .with_context("operation", "prefs_read")
                    .with_context("path", path.display().to_string())
            })?;
            serde_json::from_slice(&bytes).map_err(|err| {
                AppError::from(err)
                    .with_context("operation", "prefs_decode")
                    .with_context("path", path.display().to_string())
            })?
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            path: path.to_path_buf(),
            data: Mutex::new(data),
        })
    }
}

impl PreferenceStore for JsonFileStore {
    fn get(&self, key: &str) -> Option<String> {
        self.data
            .lock()
            .map(|guard| guard.get(key).cloned())
            .unwrap_or_default()
    }

    fn set(&self, key: &str, value: &str) {
        if let Ok(mut guard) = self.data.lock() {
            guard.insert(key.to_string(), value.to_string());
        }
    }

    fn remove(&self, key: &str) {
        if let Ok(mut guard) = self.data.lock() {
            guard.remove(key);
        }
    }

    fn save(&self) -> AppResult<()> {
        let snapshot = self
            .data
            .lock()
            .map(|guard| guard.clone())
            .map_err(|_| AppError::new("STORE/POISONED", "Preference store lock poisoned."))?;
        let serialized = serde_json::to_vec_pretty(&snapshot)
            .map_err(|err| AppError::from(err).with_context("operation", "prefs_encode"))?;

        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "prefs_create_dir")
                .with_context("path", parent.display().to_string())
        })?;

        let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "prefs_tmp_create")
                .with_context("path", parent.display().to_string())
        })?;
        tmp.write_all(&serialized).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "prefs_tmp_write")
                .with_context("path", tmp.path().display().to_string())
        })?;
        tmp.as_file().sync_all().map_err(|err| {
            AppError::from(err)
                .with_context("operation", "prefs_tmp_sync")
                .with_context("path", tmp.path().display().to_string())
        })?;
        tmp.persist(&self.path).map_err(|err| {
            AppError::from(err.error)
                .with_context("operation", "prefs_rename")
                .with_context("to", self.path.display().to_string())
        })?;
        Ok(())
    }
}

/// Shared handle to a string key/value preference store.
#[derive(Clone)]
pub struct StoreHandle {
    inner: Arc<dyn PreferenceStore + Send + Sync>,
}

impl StoreHandle {
    pub fn in_memory() -> Self {
        Self {
            inner: Arc::new(MemoryStore::default()),
        }
    }

    pub fn from_store(store: Arc<dyn PreferenceStore + Send + Sync>) -> Self {
        Self { inner: store }
    }

    pub fn json_file(path: impl AsRef<Path>) -> AppResult<Self> {
        Ok(Self {
            inner: Arc::new(JsonFileStore::open(path.as_ref())?),
        })
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.inner.get(key)
    }

    pub fn set(&self, key: &str, value: &str) {
        self.inner.set(key, value);
    }

    pub fn remove(&self, key: &str) {
        self.inner.remove(key);
    }

    pub fn save(&self) -> AppResult<()> {
        self.inner.save()
    }
}
