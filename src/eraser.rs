use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::migration_log;
use crate::storage::{StorageLayout, StorageRoot, Subdirectory};
use crate::{AppError, AppResult};

/// Itemset cache database, derived from form media and rebuilt on demand.
pub const ITEMSETS_DB: &str = "itemsets.db";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EraseTarget {
    /// The whole root, including the root directory itself.
    All,
    File(Subdirectory, String),
}

/// Best-effort deletion of data under a storage root. Failures are logged
/// and swallowed; user data integrity never depends on cleanup succeeding.
#[derive(Debug, Clone)]
pub struct StorageEraser<'a> {
    layout: &'a StorageLayout,
}

impl<'a> StorageEraser<'a> {
    pub fn new(layout: &'a StorageLayout) -> Self {
        Self { layout }
    }

    pub fn clear(&self, root: StorageRoot, target: EraseTarget) {
        let path = self.path_for(root, &target);
        match self.try_clear(root, &target) {
            Ok(()) => migration_log!(
                level: info,
                event: "erase_complete",
                root = root.as_str(),
                path = &path,
                erase_target = target_label(&target),
            ),
            Err(err) => migration_log!(
                level: warn,
                event: "erase_failed",
                root = root.as_str(),
                path = &path,
                erase_target = target_label(&target),
                code = err.code(),
                message = err.message(),
            ),
        }
    }

    pub fn try_clear(&self, root: StorageRoot, target: &EraseTarget) -> AppResult<()> {
        let path = self.path_for(root, target);
        let result = match target {
            EraseTarget::All => remove_dir_all_if_exists(&path),
            EraseTarget::File(_, _) => remove_file_if_exists(&path),
        };
        result.map_err(|err| {
            AppError::from(err)
                .with_context("operation", "storage_erase")
                .with_context("root", root.as_str())
                .with_context("target", target_label(target))
        })
    }

    fn path_for(&self, root: StorageRoot, target: &EraseTarget) -> PathBuf {
        match target {
            EraseTarget::All => self.layout.base(root).to_path_buf(),
            EraseTarget::File(subdir, name) => self.layout.dir(root, *subdir).join(name),
        }
    }
}

fn target_label(target: &EraseTarget) -> &'static str {
    match target {
        EraseTarget::All => "all",
        EraseTarget::File(_, _) => "file",
    }
}

fn remove_dir_all_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

fn remove_file_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}
