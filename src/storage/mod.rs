use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::prefs::StoreHandle;
use crate::{AppError, AppResult};

pub mod logging;
pub mod paths;

pub use paths::PathResolver;

pub const LEGACY_ROOT_ENV: &str = "STORAGE_LEGACY_ROOT";
pub const SCOPED_ROOT_ENV: &str = "STORAGE_SCOPED_ROOT";
pub const STATE_DIR_ENV: &str = "STORAGE_STATE_DIR";

const APP_ID: &str = "org.fieldforms.collect";
const LEGACY_DIR_NAME: &str = "fieldforms";

/// Meta-store key for the active-root flag.
pub const KEY_SCOPED_STORAGE_USED: &str = "scoped_storage_used";
/// Meta-store key for the last automatic attempt, epoch millis.
pub const KEY_LAST_AUTOMATIC_ATTEMPT: &str = "last_automatic_migration_attempt";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageRoot {
    Legacy,
    Scoped,
}

impl StorageRoot {
    pub const fn as_str(self) -> &'static str {
        match self {
            StorageRoot::Legacy => "legacy",
            StorageRoot::Scoped => "scoped",
        }
    }
}

impl fmt::Display for StorageRoot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Subdirectory {
    Forms,
    Instances,
    Cache,
    Metadata,
    Settings,
    Layers,
}

impl Subdirectory {
    pub const ALL: [Subdirectory; 6] = [
        Subdirectory::Forms,
        Subdirectory::Instances,
        Subdirectory::Cache,
        Subdirectory::Metadata,
        Subdirectory::Settings,
        Subdirectory::Layers,
    ];

    /// Directory name on disk.
    pub const fn as_str(self) -> &'static str {
        match self {
            Subdirectory::Forms => "forms",
            Subdirectory::Instances => "instances",
            Subdirectory::Cache => ".cache",
            Subdirectory::Metadata => "metadata",
            Subdirectory::Settings => "settings",
            Subdirectory::Layers => "layers",
        }
    }

    pub fn iter() -> impl Iterator<Item = Subdirectory> {
        Self::ALL.into_iter()
    }
}

/// Filesystem locations of both candidate roots plus the app-private state
/// directory, which lives outside of either root so it survives a move.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLayout {
    legacy_base: PathBuf,
    scoped_base: PathBuf,
    state_dir: PathBuf,
}

impl StorageLayout {
    pub fn new(
        legacy_base: impl Into<PathBuf>,
        scoped_base: impl Into<PathBuf>,
        state_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            legacy_base: legacy_base.into(),
            scoped_base: scoped_base.into(),
            state_dir: state_dir.into(),
        }
    }

    /// Resolve the layout from the environment, falling back to per-user
    /// defaults.
    pub fn from_env() -> AppResult<Self> {
        let legacy = match std::env::var_os(LEGACY_ROOT_ENV) {
            Some(value) => PathBuf::from(value),
            None => dirs::home_dir()
                .ok_or_else(|| {
                    AppError::new("CONFIG/NO_HOME_DIR", "Unable to determine home directory.")
                })?
                .join(LEGACY_DIR_NAME),
        };

        let data_dir = dirs::data_dir();
        let app_dir = || {
            data_dir.clone().map(|dir| dir.join(APP_ID)).ok_or_else(|| {
                AppError::new(
                    "CONFIG/NO_DATA_DIR",
                    "Unable to determine application data directory.",
                )
            })
        };

        let scoped = match std::env::var_os(SCOPED_ROOT_ENV) {
            Some(value) => PathBuf::from(value),
            None => app_dir()?.join("files"),
        };
        let state = match std::env::var_os(STATE_DIR_ENV) {
            Some(value) => PathBuf::from(value),
            None => app_dir()?.join("state"),
        };

        Ok(Self::new(legacy, scoped, state))
    }

    pub fn base(&self, root: StorageRoot) -> &Path {
        match root {
            StorageRoot::Legacy => &self.legacy_base,
            StorageRoot::Scoped => &self.scoped_base,
        }
    }

    pub fn dir(&self, root: StorageRoot, subdir: Subdirectory) -> PathBuf {
        self.base(root).join(subdir.as_str())
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// Create every subdirectory of `root`.
    pub fn ensure_dirs(&self, root: StorageRoot) -> AppResult<()> {
        for subdir in Subdirectory::iter() {
            let dir = self.dir(root, subdir);
            std::fs::create_dir_all(&dir).map_err(|err| {
                AppError::from(err)
                    .with_context("operation", "ensure_storage_dirs")
                    .with_context("root", root.as_str())
                    .with_context("subdir", subdir.as_str())
            })?;
        }
        Ok(())
    }
}

/// The active-root flag and the paths it resolves against.
///
/// Clones share the same flag. Only the migrator flips it; every flip is
/// persisted to the meta store before it becomes visible.
#[derive(Clone)]
pub struct StorageConfig {
    layout: Arc<StorageLayout>,
    meta: StoreHandle,
    scoped: Arc<AtomicBool>,
}

impl StorageConfig {
    pub fn load(layout: StorageLayout, meta: StoreHandle) -> Self {
        let scoped = meta
            .get(KEY_SCOPED_STORAGE_USED)
            .map(|value| value == "true")
            .unwrap_or(false);
        Self {
            layout: Arc::new(layout),
            meta,
            scoped: Arc::new(AtomicBool::new(scoped)),
        }
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    pub fn resolver(&self) -> PathResolver {
        PathResolver::new(self.layout.clone())
    }

    pub fn is_scoped_storage_used(&self) -> bool {
        self.scoped.load(Ordering::SeqCst)
    }

    pub fn active_root(&self) -> StorageRoot {
        if self.is_scoped_storage_used() {
            StorageRoot::Scoped
        } else {
            StorageRoot::Legacy
        }
    }

    pub fn active_dir(&self, subdir: Subdirectory) -> PathBuf {
        self.layout.dir(self.active_root(), subdir)
    }

    pub(crate) fn set_active_root(&self, root: StorageRoot) -> AppResult<()> {
        let value = matches!(root, StorageRoot::Scoped);
        let previous = self.meta.get(KEY_SCOPED_STORAGE_USED);
        self.meta
            .set(KEY_SCOPED_STORAGE_USED, if value { "true" } else { "false" });
        if let Err(err) = self.meta.save() {
            match previous {
                Some(prev) => self.meta.set(KEY_SCOPED_STORAGE_USED, &prev),
                None => self.meta.remove(KEY_SCOPED_STORAGE_USED),
            }
            return Err(err.with_context("operation", "persist_active_root"));
        }
        self.scoped.store(value, Ordering::SeqCst);
        tracing::info!(
            target: "storage_migration",
            event = "active_root_changed",
            root = root.as_str(),
        );
        Ok(())
    }

    /// Flip the flag in memory and in the meta store even if persisting
    /// fails. Used when rolling back, where the live handles already point at
    /// `root`. The value stays pending in the meta store so the next
    /// successful save carries it to disk.
    pub(crate) fn force_active_root(&self, root: StorageRoot) -> AppResult<()> {
        let value = matches!(root, StorageRoot::Scoped);
        self.meta
            .set(KEY_SCOPED_STORAGE_USED, if value { "true" } else { "false" });
        self.scoped.store(value, Ordering::SeqCst);
        tracing::warn!(
            target: "storage_migration",
            event = "active_root_forced",
            root = root.as_str(),
        );
        self.meta
            .save()
            .map_err(|err| err.with_context("operation", "persist_forced_active_root"))
    }

    pub fn last_automatic_attempt(&self) -> Option<DateTime<Utc>> {
        self.meta
            .get(KEY_LAST_AUTOMATIC_ATTEMPT)
            .and_then(|raw| raw.parse::<i64>().ok())
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
    }

    pub(crate) fn record_automatic_attempt(&self, at: DateTime<Utc>) -> AppResult<()> {
        self.meta
            .set(KEY_LAST_AUTOMATIC_ATTEMPT, &at.timestamp_millis().to_string());
        self.meta
            .save()
            .map_err(|err| err.with_context("operation", "persist_last_attempt"))
    }
}
