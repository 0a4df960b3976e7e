use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use walkdir::WalkDir;

use crate::migration_log;
use crate::storage::{StorageLayout, StorageRoot};
use crate::AppError;

#[derive(Debug, Error)]
pub enum CopyError {
    #[error("destination {dst} lies inside source {src}")]
    Nested { src: PathBuf, dst: PathBuf },
    #[error("failed to walk {path}: {source}")]
    Walk {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },
    #[error("failed to {op} {path}: {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl From<CopyError> for AppError {
    fn from(err: CopyError) -> Self {
        let code = match &err {
            CopyError::Nested { .. } => "COPY/NESTED_ROOTS",
            CopyError::Walk { .. } => "COPY/WALK",
            CopyError::Io { .. } => "COPY/IO",
        };
        AppError::new(code, err.to_string())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopySummary {
    pub dirs: u64,
    pub files: u64,
    pub bytes: u64,
}

/// Recursively copies one storage root over another.
///
/// Existing destination files are overwritten, so a retry after a partial
/// failure converges. Nothing at the source is ever removed, and nothing at
/// the destination is cleaned up on failure.
#[derive(Debug, Clone)]
pub struct DirectoryCopier<'a> {
    layout: &'a StorageLayout,
}

impl<'a> DirectoryCopier<'a> {
    pub fn new(layout: &'a StorageLayout) -> Self {
        Self { layout }
    }

    pub fn copy(&self, from: StorageRoot, to: StorageRoot) -> bool {
        match self.try_copy(from, to) {
            Ok(summary) => {
                tracing::info!(
                    target: "storage_migration",
                    event = "copy_complete",
                    from = from.as_str(),
                    to = to.as_str(),
                    dirs = summary.dirs,
                    files = summary.files,
                    bytes = summary.bytes,
                );
                true
            }
            Err(err) => {
                let err = AppError::from(err);
                tracing::error!(
                    target: "storage_migration",
                    event = "copy_failed",
                    from = from.as_str(),
                    to = to.as_str(),
                    code = err.code(),
                    error = %err,
                );
                false
            }
        }
    }

    pub fn try_copy(&self, from: StorageRoot, to: StorageRoot) -> Result<CopySummary, CopyError> {
        copy_tree(self.layout.base(from), self.layout.base(to))
    }
}

pub fn copy_tree(src: &Path, dst: &Path) -> Result<CopySummary, CopyError> {
    if dst.starts_with(src) {
        return Err(CopyError::Nested {
            src: src.to_path_buf(),
            dst: dst.to_path_buf(),
        });
    }

    let mut summary = CopySummary::default();
    fs::create_dir_all(dst).map_err(|source| CopyError::Io {
        op: "create",
        path: dst.to_path_buf(),
        source,
    })?;
    if !src.exists() {
        return Ok(summary);
    }

    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(|source| CopyError::Walk {
            path: src.to_path_buf(),
            source,
        })?;
        let relative = match entry.path().strip_prefix(src) {
            Ok(rel) if rel.as_os_str().is_empty() => continue,
            Ok(rel) => rel,
            Err(_) => continue,
        };
        let target = dst.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target).map_err(|source| CopyError::Io {
                op: "create",
                path: target.clone(),
                source,
            })?;
            summary.dirs += 1;
            continue;
        }

        // Symlinks are only followed when they point at a regular file.
        if file_type.is_symlink() && !entry.path().is_file() {
            migration_log!(
                level: warn,
                event: "copy_skip_symlink",
                root = "source",
                path = entry.path(),
            );
            continue;
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|source| CopyError::Io {
                op: "create",
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let bytes = fs::copy(entry.path(), &target).map_err(|source| CopyError::Io {
            op: "copy",
            path: entry.path().to_path_buf(),
            source,
        })?;
        summary.files += 1;
        summary.bytes = summary.bytes.saturating_add(bytes);
    }

    Ok(summary)
}
