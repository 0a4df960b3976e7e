#![allow(clippy::unwrap_used, clippy::expect_used, dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use storage_migration::events::{EventSink, ReferenceCache};
use storage_migration::jobs::JobRegistry;
use storage_migration::prefs::{PreferenceStore, StoreHandle, KEY_REFERENCE_LAYER};
use storage_migration::repo::{
    FormPaths, FormRecord, FormsRepository, InstanceRecord, InstancesRepository,
    RepositoryHandles, RepositoryOpener, SqliteRepositoryOpener, Visitor,
};
use storage_migration::{
    AppError, AppResult, Collaborators, MigrationOptions, StorageConfig, StorageLayout,
    StorageMigrator, StorageRoot,
};
use tempfile::TempDir;

pub const BASIC_FORM_ID: &str = "form-basic";
pub const BASIC_INSTANCE_ID: &str = "instance-basic";
pub const STATUS_DATE: i64 = 1_609_459_200_000;

#[derive(Default)]
pub struct RecordingEvents {
    pub fired: Mutex<Vec<(String, String)>>,
}

impl EventSink for RecordingEvents {
    fn fire(&self, name: &str, value: &str) {
        self.fired
            .lock()
            .unwrap()
            .push((name.to_string(), value.to_string()));
    }
}

#[derive(Default)]
pub struct CountingReferences {
    pub resets: AtomicUsize,
}

impl ReferenceCache for CountingReferences {
    fn reset(&self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
    }
}

/// Sandboxed legacy and scoped roots plus every collaborator a migrator needs.
pub struct Fixture {
    pub dir: TempDir,
    pub layout: StorageLayout,
    pub meta: StoreHandle,
    pub settings: StoreHandle,
    pub jobs: JobRegistry,
    pub events: Arc<RecordingEvents>,
    pub references: Arc<CountingReferences>,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let layout = StorageLayout::new(
            dir.path().join("sdcard").join("fieldforms"),
            dir.path().join("app").join("files"),
            dir.path().join("state"),
        );
        let meta = StoreHandle::json_file(layout.state_dir().join("meta.json")).unwrap();
        let settings = StoreHandle::json_file(layout.state_dir().join("settings.json")).unwrap();
        Self {
            dir,
            layout,
            meta,
            settings,
            jobs: JobRegistry::new(),
            events: Arc::new(RecordingEvents::default()),
            references: Arc::new(CountingReferences::default()),
        }
    }

    pub fn legacy(&self) -> PathBuf {
        self.layout.base(StorageRoot::Legacy).to_path_buf()
    }

    pub fn scoped(&self) -> PathBuf {
        self.layout.base(StorageRoot::Scoped).to_path_buf()
    }

    pub fn sqlite_opener(&self) -> Arc<SqliteRepositoryOpener> {
        Arc::new(SqliteRepositoryOpener::new(Arc::new(self.layout.clone())))
    }

    /// Options that never consult the real filesystem for free space.
    pub fn options() -> MigrationOptions {
        MigrationOptions {
            available_space_override: Some(u64::MAX),
            ..MigrationOptions::default()
        }
    }

    /// Populate the legacy root the way an unmigrated install looks: files on
    /// disk and absolute paths in the repositories and settings.
    pub async fn seed_legacy(&self) -> Result<()> {
        self.layout.ensure_dirs(StorageRoot::Legacy)?;
        let legacy = self.legacy();
        fs::create_dir_all(legacy.join("forms/basic-media"))?;
        fs::create_dir_all(legacy.join("instances/basic_2021"))?;
        fs::write(legacy.join("forms/basic.xml"), b"<h:html/>")?;
        fs::write(legacy.join("forms/basic-media/logo.png"), b"png")?;
        fs::write(legacy.join("instances/basic_2021/basic.xml"), b"<data/>")?;
        fs::write(legacy.join(".cache/basic.formdef"), b"formdef")?;
        fs::write(legacy.join("layers/city.mbtiles"), b"tiles")?;
        fs::write(legacy.join("metadata/itemsets.db"), b"itemsets")?;

        let handles = self.sqlite_opener().open(StorageRoot::Legacy).await?;
        handles
            .forms
            .insert(&FormRecord {
                id: BASIC_FORM_ID.to_string(),
                form_id: "basic".to_string(),
                form_file_path: path_text(legacy.join("forms/basic.xml")),
                form_media_path: path_text(legacy.join("forms/basic-media")),
                cache_file_path: Some(path_text(legacy.join(".cache/basic.formdef"))),
            })
            .await?;
        handles
            .instances
            .insert(&InstanceRecord {
                id: BASIC_INSTANCE_ID.to_string(),
                instance_file_path: path_text(legacy.join("instances/basic_2021/basic.xml")),
                last_status_change_date: STATUS_DATE,
            })
            .await?;
        handles.close().await;

        self.settings
            .set(KEY_REFERENCE_LAYER, &path_text(legacy.join("layers/city.mbtiles")));
        self.settings.save()?;
        Ok(())
    }

    /// Add another legacy form, stored the way older installs did: a bare
    /// file name with no root prefix.
    pub async fn seed_extra_form(&self, name: &str) -> Result<()> {
        let legacy = self.legacy();
        fs::write(legacy.join("forms").join(format!("{name}.xml")), b"<h:html/>")?;
        fs::create_dir_all(legacy.join("forms").join(format!("{name}-media")))?;
        let handles = self.sqlite_opener().open(StorageRoot::Legacy).await?;
        handles
            .forms
            .insert(&FormRecord {
                id: format!("form-{name}"),
                form_id: name.to_string(),
                form_file_path: format!("{name}.xml"),
                form_media_path: format!("{name}-media"),
                cache_file_path: None,
            })
            .await?;
        handles.close().await;
        Ok(())
    }

    /// Add a legacy form whose paths are stored relative to the root
    /// itself (`forms/<name>.xml`), as some older installs wrote them.
    pub async fn seed_root_relative_form(&self, name: &str) -> Result<()> {
        let legacy = self.legacy();
        fs::create_dir_all(legacy.join("forms").join(format!("{name}-media")))?;
        fs::write(legacy.join("forms").join(format!("{name}.xml")), b"<h:html/>")?;
        fs::write(legacy.join(".cache").join(format!("{name}.formdef")), b"formdef")?;
        let handles = self.sqlite_opener().open(StorageRoot::Legacy).await?;
        handles
            .forms
            .insert(&FormRecord {
                id: format!("form-{name}"),
                form_id: name.to_string(),
                form_file_path: format!("forms/{name}.xml"),
                form_media_path: format!("forms/{name}-media"),
                cache_file_path: Some(format!(".cache/{name}.formdef")),
            })
            .await?;
        handles.close().await;
        Ok(())
    }

    /// An unmigrated install that stored every path relative to the legacy
    /// root or its subdirectory rather than absolute.
    pub async fn seed_relative_legacy(&self) -> Result<()> {
        self.layout.ensure_dirs(StorageRoot::Legacy)?;
        self.seed_root_relative_form("basic").await?;
        let legacy = self.legacy();
        fs::create_dir_all(legacy.join("instances/basic_2021"))?;
        fs::write(legacy.join("instances/basic_2021/basic.xml"), b"<data/>")?;
        let handles = self.sqlite_opener().open(StorageRoot::Legacy).await?;
        handles
            .instances
            .insert(&InstanceRecord {
                id: BASIC_INSTANCE_ID.to_string(),
                instance_file_path: "basic_2021/basic.xml".to_string(),
                last_status_change_date: STATUS_DATE,
            })
            .await?;
        handles.close().await;
        Ok(())
    }

    pub async fn migrator(&self) -> Result<Arc<StorageMigrator>> {
        self.migrator_with(self.sqlite_opener(), Self::options())
            .await
    }

    pub async fn migrator_with(
        &self,
        opener: Arc<dyn RepositoryOpener>,
        options: MigrationOptions,
    ) -> Result<Arc<StorageMigrator>> {
        let config = StorageConfig::load(self.layout.clone(), self.meta.clone());
        let collaborators = Collaborators {
            settings: self.settings.clone(),
            opener,
            jobs: Arc::new(self.jobs.clone()),
            events: self.events.clone(),
            references: self.references.clone(),
        };
        Ok(Arc::new(
            StorageMigrator::open(config, collaborators, options).await?,
        ))
    }

    pub fn fired(&self) -> Vec<(String, String)> {
        self.events.fired.lock().unwrap().clone()
    }
}

pub fn path_text(path: PathBuf) -> String {
    path.to_string_lossy().into_owned()
}

pub async fn all_forms(handles: &RepositoryHandles) -> Result<Vec<FormRecord>> {
    let mut rows = Vec::new();
    handles
        .forms
        .for_each(&mut |record: &FormRecord| {
            rows.push(record.clone());
            Ok(())
        })
        .await?;
    Ok(rows)
}

pub async fn all_instances(handles: &RepositoryHandles) -> Result<Vec<InstanceRecord>> {
    let mut rows = Vec::new();
    handles
        .instances
        .for_each(&mut |record: &InstanceRecord| {
            rows.push(record.clone());
            Ok(())
        })
        .await?;
    Ok(rows)
}

/// Fails the Nth forms write against the scoped root.
pub struct FailingFormsOpener {
    pub inner: Arc<SqliteRepositoryOpener>,
    pub fail_on_write: usize,
}

#[async_trait]
impl RepositoryOpener for FailingFormsOpener {
    async fn open(&self, root: StorageRoot) -> AppResult<RepositoryHandles> {
        let mut handles = self.inner.open(root).await?;
        if root == StorageRoot::Scoped {
            handles.forms = Arc::new(FailingForms {
                inner: handles.forms.clone(),
                fail_on_write: self.fail_on_write,
                writes: AtomicUsize::new(0),
            });
        }
        Ok(handles)
    }
}

struct FailingForms {
    inner: Arc<dyn FormsRepository>,
    fail_on_write: usize,
    writes: AtomicUsize,
}

#[async_trait]
impl FormsRepository for FailingForms {
    async fn for_each(&self, visitor: &mut Visitor<'_, FormRecord>) -> AppResult<()> {
        self.inner.for_each(visitor).await
    }

    async fn update_by_id(&self, id: &str, paths: &FormPaths) -> AppResult<()> {
        let write = self.writes.fetch_add(1, Ordering::SeqCst) + 1;
        if write == self.fail_on_write {
            return Err(AppError::new("TEST/INJECTED", "injected write failure"));
        }
        self.inner.update_by_id(id, paths).await
    }

    async fn get(&self, id: &str) -> AppResult<Option<FormRecord>> {
        self.inner.get(id).await
    }

    async fn insert(&self, record: &FormRecord) -> AppResult<()> {
        self.inner.insert(record).await
    }

    async fn checkpoint(&self) -> AppResult<()> {
        self.inner.checkpoint().await
    }

    async fn close(&self) {
        self.inner.close().await;
    }
}

/// Refuses to open anything under the scoped root.
pub struct ScopedUnavailableOpener {
    pub inner: Arc<SqliteRepositoryOpener>,
}

#[async_trait]
impl RepositoryOpener for ScopedUnavailableOpener {
    async fn open(&self, root: StorageRoot) -> AppResult<RepositoryHandles> {
        if root == StorageRoot::Scoped {
            return Err(AppError::new("TEST/UNAVAILABLE", "scoped root unavailable"));
        }
        self.inner.open(root).await
    }
}

/// In-memory preference store that refuses the listed saves (1-based).
pub struct SaveFailingStore {
    data: Mutex<BTreeMap<String, String>>,
    failing: HashSet<usize>,
    saves: AtomicUsize,
}

impl SaveFailingStore {
    pub fn new(failing: impl IntoIterator<Item = usize>) -> Self {
        Self {
            data: Mutex::new(BTreeMap::new()),
            failing: failing.into_iter().collect(),
            saves: AtomicUsize::new(0),
        }
    }

    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

impl PreferenceStore for SaveFailingStore {
    fn get(&self, key: &str) -> Option<String> {
        self.data.lock().unwrap().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        self.data
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
    }

    fn remove(&self, key: &str) {
        self.data.lock().unwrap().remove(key);
    }

    fn save(&self) -> AppResult<()> {
        let save = self.saves.fetch_add(1, Ordering::SeqCst) + 1;
        if self.failing.contains(&save) {
            return Err(AppError::new("TEST/SAVE_REFUSED", "injected save failure"));
        }
        Ok(())
    }
}
