use crate::prefs::StoreHandle;
use crate::repo::{
    FormPaths, FormRecord, FormsRepository, InstanceRecord, InstanceUpdate, InstancesRepository,
};
use crate::storage::{PathResolver, StorageRoot, Subdirectory};
use crate::{AppError, AppResult};

/// Re-bases every stored path from one root onto another.
///
/// Records are collected first and written back one by one afterwards, so a
/// write never runs while the read cursor is open. The first failure aborts
/// the whole rewrite; callers roll back by switching roots, never by undoing
/// individual rows.
#[derive(Debug, Clone)]
pub struct RepositoryPathRewriter {
    resolver: PathResolver,
}

impl RepositoryPathRewriter {
    pub fn new(resolver: PathResolver) -> Self {
        Self { resolver }
    }

    /// The stored (relative) form of `path` once it has moved to `to`.
    pub fn rebase_stored(
        &self,
        from: StorageRoot,
        to: StorageRoot,
        subdir: Subdirectory,
        path: &str,
    ) -> String {
        let moved = self.resolver.rebase(from, to, subdir, path);
        self.resolver.relative(to, subdir, &moved)
    }

    pub async fn rewrite_forms(
        &self,
        forms: &dyn FormsRepository,
        from: StorageRoot,
        to: StorageRoot,
    ) -> AppResult<usize> {
        let mut updates: Vec<(String, FormPaths)> = Vec::new();
        forms
            .for_each(&mut |record: &FormRecord| {
                require_non_empty("forms", "form_file_path", &record.id, &record.form_file_path)?;
                require_non_empty("forms", "form_media_path", &record.id, &record.form_media_path)?;
                updates.push((
                    record.id.clone(),
                    FormPaths {
                        form_file_path: self.rebase_stored(
                            from,
                            to,
                            Subdirectory::Forms,
                            &record.form_file_path,
                        ),
                        form_media_path: self.rebase_stored(
                            from,
                            to,
                            Subdirectory::Forms,
                            &record.form_media_path,
                        ),
                        cache_file_path: record
                            .cache_file_path
                            .as_deref()
                            .map(|path| self.rebase_stored(from, to, Subdirectory::Cache, path)),
                    },
                ));
                Ok(())
            })
            .await
            .map_err(|err| rewrite_error(err, "forms", "read"))?;

        for (id, paths) in &updates {
            forms
                .update_by_id(id, paths)
                .await
                .map_err(|err| rewrite_error(err, "forms", "write").with_context("id", id.clone()))?;
        }
        tracing::info!(
            target: "storage_migration",
            event = "rewrite_complete",
            table = "forms",
            rows = updates.len(),
        );
        Ok(updates.len())
    }

    pub async fn rewrite_instances(
        &self,
        instances: &dyn InstancesRepository,
        from: StorageRoot,
        to: StorageRoot,
    ) -> AppResult<usize> {
        let mut updates: Vec<(String, InstanceUpdate)> = Vec::new();
        instances
            .for_each(&mut |record: &InstanceRecord| {
                require_non_empty(
                    "instances",
                    "instance_file_path",
                    &record.id,
                    &record.instance_file_path,
                )?;
                updates.push((
                    record.id.clone(),
                    InstanceUpdate {
                        instance_file_path: self.rebase_stored(
                            from,
                            to,
                            Subdirectory::Instances,
                            &record.instance_file_path,
                        ),
                        last_status_change_date: record.last_status_change_date,
                    },
                ));
                Ok(())
            })
            .await
            .map_err(|err| rewrite_error(err, "instances", "read"))?;

        for (id, update) in &updates {
            instances.update_by_id(id, update).await.map_err(|err| {
                rewrite_error(err, "instances", "write").with_context("id", id.clone())
            })?;
        }
        tracing::info!(
            target: "storage_migration",
            event = "rewrite_complete",
            table = "instances",
            rows = updates.len(),
        );
        Ok(updates.len())
    }

    /// Re-base a single path-valued setting. Absent or empty values are left
    /// alone. Returns whether the setting changed.
    pub fn rewrite_setting(
        &self,
        settings: &StoreHandle,
        key: &str,
        subdir: Subdirectory,
        from: StorageRoot,
        to: StorageRoot,
    ) -> AppResult<bool> {
        let current = match settings.get(key) {
            Some(value) if !value.is_empty() => value,
            _ => return Ok(false),
        };
        let rebased = self.rebase_stored(from, to, subdir, &current);
        if rebased == current {
            return Ok(false);
        }
        settings.set(key, &rebased);
        settings.save().map_err(|err| {
            settings.set(key, &current);
            err.with_context("operation", "rewrite_setting")
                .with_context("key", key.to_string())
        })?;
        Ok(true)
    }
}

fn require_non_empty(table: &str, column: &str, id: &str, value: &str) -> AppResult<()> {
    if value.is_empty() {
        return Err(
            AppError::new("REWRITE/EMPTY_PATH", format!("{table}.{column} is empty"))
                .with_context("column", column.to_string())
                .with_context("id", id.to_string()),
        );
    }
    Ok(())
}

fn rewrite_error(err: AppError, table: &str, stage: &str) -> AppError {
    err.with_context("operation", "rewrite_paths")
        .with_context("table", table.to_string())
        .with_context("stage", stage.to_string())
}
