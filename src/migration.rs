use std::path::Path;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};
use tokio::task::{self, JoinHandle};
use walkdir::WalkDir;

use crate::copier::DirectoryCopier;
use crate::eraser::{EraseTarget, StorageEraser, ITEMSETS_DB};
use crate::events::{EventSink, ReferenceCache, EVENT_STORAGE_MIGRATION};
use crate::gate::{MigrationGate, DEFAULT_RETRY_INTERVAL_HOURS};
use crate::jobs::{BackgroundJobRegistry, JobTag};
use crate::prefs::{StoreHandle, KEY_REFERENCE_LAYER};
use crate::repo::{RepositoryHandles, RepositoryOpener};
use crate::rewriter::RepositoryPathRewriter;
use crate::state::{MigrationGuard, MigrationPhase, MigrationResult, MigrationStateHandle};
use crate::storage::{StorageConfig, StorageRoot, Subdirectory};
use crate::{AppError, AppResult};

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct MigrationOptions {
    /// Minimum spacing between automatic attempts.
    pub retry_interval: Duration,
    /// Extra headroom as a fraction of the legacy root's size.
    pub space_margin_ratio: f64,
    /// Fixed headroom on top of the ratio.
    pub space_margin_bytes: u64,
    /// Pretend the destination has this many free bytes.
    pub available_space_override: Option<u64>,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            retry_interval: Duration::hours(DEFAULT_RETRY_INTERVAL_HOURS),
            space_margin_ratio: 0.1,
            space_margin_bytes: 10 * MIB,
            available_space_override: None,
        }
    }
}

impl MigrationOptions {
    pub fn required_bytes(&self, used: u64) -> u64 {
        let ratio = (used as f64 * self.space_margin_ratio).ceil() as u64;
        used.saturating_add(ratio).saturating_add(self.space_margin_bytes)
    }
}

/// The application-side collaborators a migrator drives.
#[derive(Clone)]
pub struct Collaborators {
    pub settings: StoreHandle,
    pub opener: Arc<dyn RepositoryOpener>,
    pub jobs: Arc<dyn BackgroundJobRegistry>,
    pub events: Arc<dyn EventSink>,
    pub references: Arc<dyn ReferenceCache>,
}

/// Moves the whole data store from the legacy root to the scoped root.
///
/// Owns the only write access to the active-root flag and the live
/// repository handles. Dependents fetch handles through [`repositories`]
/// on each use instead of holding on to them across a migration.
///
/// [`repositories`]: StorageMigrator::repositories
pub struct StorageMigrator {
    config: StorageConfig,
    settings: StoreHandle,
    opener: Arc<dyn RepositoryOpener>,
    repositories: RwLock<Arc<RepositoryHandles>>,
    jobs: Arc<dyn BackgroundJobRegistry>,
    events: Arc<dyn EventSink>,
    references: Arc<dyn ReferenceCache>,
    state: MigrationStateHandle,
    gate: MigrationGate,
    options: MigrationOptions,
}

impl StorageMigrator {
    /// Open repositories against whichever root is currently active.
    pub async fn open(
        config: StorageConfig,
        collaborators: Collaborators,
        options: MigrationOptions,
    ) -> AppResult<Self> {
        let root = config.active_root();
        let handles = collaborators
            .opener
            .open(root)
            .await
            .map_err(|err| err.with_context("operation", "open_repositories"))?;
        let state = MigrationStateHandle::new();
        state.seed_last_attempt(config.last_automatic_attempt());
        Ok(Self {
            gate: MigrationGate::new(options.retry_interval),
            config,
            settings: collaborators.settings,
            opener: collaborators.opener,
            repositories: RwLock::new(Arc::new(handles)),
            jobs: collaborators.jobs,
            events: collaborators.events,
            references: collaborators.references,
            state,
            options,
        })
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn state(&self) -> &MigrationStateHandle {
        &self.state
    }

    pub fn gate(&self) -> &MigrationGate {
        &self.gate
    }

    /// Handles bound to the currently active root.
    pub fn repositories(&self) -> Arc<RepositoryHandles> {
        self.repositories
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Run a migration on a tokio worker.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<Option<MigrationResult>> {
        tokio::spawn(async move { self.migrate().await })
    }

    /// Claim the in-progress flag, gate, record the attempt, then migrate.
    /// Returns `None` when another migration is already running or the gate
    /// declines; neither case records an attempt.
    pub async fn migrate_if_due(&self, now: DateTime<Utc>) -> Option<MigrationResult> {
        let guard = self.begin()?;
        let snapshot = self.state.snapshot();
        if !self
            .gate
            .should_auto_migrate(&snapshot, self.config.is_scoped_storage_used(), now)
        {
            tracing::debug!(
                target: "storage_migration",
                event = "auto_migration_skipped",
                scoped = self.config.is_scoped_storage_used(),
            );
            return None;
        }
        self.state.record_attempt(now);
        if let Err(err) = self.config.record_automatic_attempt(now) {
            tracing::warn!(
                target: "storage_migration",
                event = "record_attempt_failed",
                code = err.code(),
                error = %err,
            );
        }
        Some(self.run_guarded(guard).await)
    }

    /// Run one migration. Returns `None` only if another migration holds the
    /// in-progress flag; every other outcome is a [`MigrationResult`].
    pub async fn migrate(&self) -> Option<MigrationResult> {
        let guard = self.begin()?;
        Some(self.run_guarded(guard).await)
    }

    fn begin(&self) -> Option<MigrationGuard> {
        match self.state.try_begin() {
            Ok(guard) => Some(guard),
            Err(err) => {
                tracing::warn!(
                    target: "storage_migration",
                    event = "migration_rejected",
                    code = err.code(),
                );
                None
            }
        }
    }

    async fn run_guarded(&self, guard: MigrationGuard) -> MigrationResult {
        tracing::info!(target: "storage_migration", event = "migration_started");

        let result = self.run().await;

        self.events.fire(EVENT_STORAGE_MIGRATION, result.as_str());
        tracing::info!(
            target: "storage_migration",
            event = "migration_finished",
            result = result.as_str(),
            root = self.config.active_root().as_str(),
        );
        guard.finish(result, Utc::now());
        result
    }

    async fn run(&self) -> MigrationResult {
        if self.config.is_scoped_storage_used() {
            tracing::info!(target: "storage_migration", event = "already_migrated");
            return MigrationResult::Success;
        }

        if let Some(failed) = self.check_preconditions().await {
            return failed;
        }

        self.state.set_phase(MigrationPhase::Copying);
        if let Err(err) = self.copy_legacy_root().await {
            tracing::error!(
                target: "storage_migration",
                event = "copy_aborted",
                code = err.code(),
                error = %err,
            );
            return MigrationResult::MovingFilesFailed;
        }

        self.state.set_phase(MigrationPhase::SwitchingRoot);
        if let Err(err) = self.switch_to(StorageRoot::Scoped).await {
            tracing::error!(
                target: "storage_migration",
                event = "switch_failed",
                code = err.code(),
                error = %err,
            );
            self.roll_back().await;
            return MigrationResult::MovingFilesFailed;
        }

        self.state.set_phase(MigrationPhase::Rewriting);
        if let Err(err) = self.rewrite_paths().await {
            tracing::error!(
                target: "storage_migration",
                event = "rewrite_failed",
                code = err.code(),
                error = %err,
                context = ?err.context(),
            );
            self.roll_back().await;
            return MigrationResult::MovingFilesFailed;
        }

        self.state.set_phase(MigrationPhase::Succeeded);
        self.clean_up_after_success();
        MigrationResult::Success
    }

    async fn check_preconditions(&self) -> Option<MigrationResult> {
        self.state.set_phase(MigrationPhase::CheckingPreconditions);
        StorageEraser::new(self.config.layout()).clear(StorageRoot::Scoped, EraseTarget::All);

        if self.jobs.is_running(JobTag::FormUploader) {
            return Some(MigrationResult::FormUploaderRunning);
        }
        if self.jobs.is_running(JobTag::FormDownloader) {
            return Some(MigrationResult::FormDownloaderRunning);
        }

        match self.has_enough_space().await {
            Ok(true) => None,
            Ok(false) => Some(MigrationResult::NotEnoughSpace),
            Err(err) => {
                tracing::error!(
                    target: "storage_migration",
                    event = "space_check_failed",
                    code = err.code(),
                    error = %err,
                );
                Some(MigrationResult::MovingFilesFailed)
            }
        }
    }

    async fn has_enough_space(&self) -> AppResult<bool> {
        let layout = self.config.layout().clone();
        let used = task::spawn_blocking(move || directory_size(layout.base(StorageRoot::Legacy)))
            .await
            .map_err(|err| {
                AppError::new("MIGRATION/TASK", "Size estimate task panicked")
                    .with_context("error", err.to_string())
            })??;
        let required = self.options.required_bytes(used);
        let available = match self.options.available_space_override {
            Some(bytes) => bytes,
            None => free_disk_space(self.config.layout().base(StorageRoot::Scoped))?,
        };
        tracing::info!(
            target: "storage_migration",
            event = "space_check",
            used_bytes = used,
            required_bytes = required,
            available_bytes = available,
        );
        Ok(available >= required)
    }

    async fn copy_legacy_root(&self) -> AppResult<()> {
        self.repositories()
            .checkpoint()
            .await
            .map_err(|err| err.with_context("operation", "checkpoint_repositories"))?;
        let layout = self.config.layout().clone();
        let copied = task::spawn_blocking(move || {
            DirectoryCopier::new(&layout).copy(StorageRoot::Legacy, StorageRoot::Scoped)
        })
        .await
        .map_err(|err| {
            AppError::new("MIGRATION/TASK", "Copy task panicked")
                .with_context("error", err.to_string())
        })?;
        if copied {
            Ok(())
        } else {
            Err(AppError::new("COPY/FAILED", "Copying the legacy root failed."))
        }
    }

    async fn switch_to(&self, root: StorageRoot) -> AppResult<()> {
        self.config.set_active_root(root)?;
        self.reopen_repositories(root).await
    }

    /// Open fresh handles against `root`, swap them in, then close the old
    /// ones. On failure the previous handles stay in place.
    async fn reopen_repositories(&self, root: StorageRoot) -> AppResult<()> {
        let fresh = self
            .opener
            .open(root)
            .await
            .map_err(|err| err.with_context("operation", "reopen_repositories"))?;
        let previous = {
            let mut guard = self.repositories.write().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *guard, Arc::new(fresh))
        };
        previous.close().await;
        tracing::info!(
            target: "storage_migration",
            event = "repositories_reopened",
            root = root.as_str(),
        );
        Ok(())
    }

    async fn rewrite_paths(&self) -> AppResult<()> {
        let repositories = self.repositories();
        let rewriter = RepositoryPathRewriter::new(self.config.resolver());
        let (from, to) = (StorageRoot::Legacy, StorageRoot::Scoped);
        rewriter
            .rewrite_forms(repositories.forms.as_ref(), from, to)
            .await?;
        rewriter
            .rewrite_instances(repositories.instances.as_ref(), from, to)
            .await?;
        rewriter.rewrite_setting(
            &self.settings,
            KEY_REFERENCE_LAYER,
            Subdirectory::Layers,
            from,
            to,
        )?;
        Ok(())
    }

    /// Point everything back at the untouched legacy root. The scoped copy is
    /// left where it is.
    async fn roll_back(&self) {
        self.state.set_phase(MigrationPhase::RollingBack);
        if let Err(err) = self.config.set_active_root(StorageRoot::Legacy) {
            tracing::warn!(
                target: "storage_migration",
                event = "rollback_flag_failed",
                code = err.code(),
                error = %err,
            );
            // The in-memory flag must follow the handles back to legacy.
            if let Err(err) = self.config.force_active_root(StorageRoot::Legacy) {
                tracing::error!(
                    target: "storage_migration",
                    event = "rollback_flag_unpersisted",
                    code = err.code(),
                    error = %err,
                );
            }
        }
        if self.repositories().root != StorageRoot::Legacy {
            if let Err(err) = self.reopen_repositories(StorageRoot::Legacy).await {
                tracing::error!(
                    target: "storage_migration",
                    event = "rollback_reopen_failed",
                    code = err.code(),
                    error = %err,
                );
            }
        }
        tracing::warn!(target: "storage_migration", event = "rolled_back");
    }

    fn clean_up_after_success(&self) {
        self.references.reset();
        let layout = self.config.layout();
        let eraser = StorageEraser::new(layout);
        eraser.clear(
            StorageRoot::Scoped,
            EraseTarget::File(Subdirectory::Metadata, ITEMSETS_DB.to_string()),
        );
        eraser.clear(StorageRoot::Legacy, EraseTarget::All);
        if let Err(err) = layout.ensure_dirs(StorageRoot::Scoped) {
            tracing::warn!(
                target: "storage_migration",
                event = "ensure_dirs_failed",
                code = err.code(),
                error = %err,
            );
        }
    }
}

/// Total size of regular files under `root`, following symlinks that point
/// at files the same way the copier does. A missing root is empty.
pub fn directory_size(root: &Path) -> AppResult<u64> {
    if !root.exists() {
        return Ok(0);
    }
    let mut total: u64 = 0;
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(|err| {
            AppError::new("MIGRATION/SIZE", err.to_string())
                .with_context("operation", "directory_size")
        })?;
        let file_type = entry.file_type();
        if file_type.is_dir() {
            continue;
        }
        if file_type.is_symlink() && !entry.path().is_file() {
            continue;
        }
        let len = std::fs::metadata(entry.path())
            .map_err(|err| AppError::from(err).with_context("operation", "directory_size"))?
            .len();
        total = total.saturating_add(len);
    }
    Ok(total)
}

/// Free bytes on the filesystem that holds `target`, or would hold it once
/// created.
fn free_disk_space(target: &Path) -> AppResult<u64> {
    let existing = target
        .ancestors()
        .find(|candidate| candidate.exists())
        .unwrap_or_else(|| Path::new("."));
    fs2::available_space(existing).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "available_space")
            .with_context("path", existing.display().to_string())
    })
}
