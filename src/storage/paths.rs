use std::path::{Path, MAIN_SEPARATOR};
use std::sync::Arc;

use super::{StorageLayout, StorageRoot, Subdirectory};

/// Converts between absolute paths under a storage root and paths relative to
/// one of its subdirectories.
///
/// Pure string manipulation: nothing here touches the filesystem and nothing
/// fails. Historical records may hold bare file names, paths under the other
/// root, or otherwise malformed values; those are handed back unchanged.
#[derive(Debug, Clone)]
pub struct PathResolver {
    layout: Arc<StorageLayout>,
}

impl PathResolver {
    pub fn new(layout: Arc<StorageLayout>) -> Self {
        Self { layout }
    }

    /// `root/subdir` as a string without a trailing separator.
    pub fn dir_path(&self, root: StorageRoot, subdir: Subdirectory) -> String {
        let dir = self.layout.dir(root, subdir);
        let text = dir.to_string_lossy();
        let trimmed = text.trim_end_matches(is_separator);
        if trimmed.is_empty() {
            text.into_owned()
        } else {
            trimmed.to_string()
        }
    }

    /// Strip the `root/subdir` prefix from `absolute_path`.
    ///
    /// Older installs also stored paths relative to the root itself
    /// (`forms/basic.xml`); for relative input a leading `subdir/` segment is
    /// stripped as well.
    pub fn relative(&self, root: StorageRoot, subdir: Subdirectory, absolute_path: &str) -> String {
        let prefix = self.dir_path(root, subdir);
        match absolute_path.strip_prefix(prefix.as_str()) {
            Some("") => String::new(),
            Some(rest) if rest.starts_with(is_separator) => rest[1..].to_string(),
            _ if !Path::new(absolute_path).is_absolute() => {
                strip_subdir_segment(subdir, absolute_path).to_string()
            }
            // Legacy compat: not under this directory (other root, or a
            // sibling that merely shares the prefix text).
            _ => absolute_path.to_string(),
        }
    }

    /// Prepend the `root/subdir` prefix to `relative_path`.
    pub fn absolute(&self, root: StorageRoot, subdir: Subdirectory, relative_path: &str) -> String {
        let prefix = self.dir_path(root, subdir);
        if relative_path.is_empty() {
            return prefix;
        }
        // Legacy compat: already absolute, nothing sensible to prepend.
        if Path::new(relative_path).is_absolute() {
            return relative_path.to_string();
        }
        format!("{prefix}{MAIN_SEPARATOR}{relative_path}")
    }

    /// Re-base `path` from `from/subdir` onto `to/subdir` without assuming
    /// whether it is currently stored absolute or relative.
    pub fn rebase(
        &self,
        from: StorageRoot,
        to: StorageRoot,
        subdir: Subdirectory,
        path: &str,
    ) -> String {
        self.absolute(to, subdir, &self.relative(from, subdir, path))
    }
}

fn is_separator(c: char) -> bool {
    c == '/' || c == MAIN_SEPARATOR
}

/// Legacy compat: `forms/basic.xml` under `Forms` becomes `basic.xml`. Bare
/// names and anything else pass through unchanged.
fn strip_subdir_segment(subdir: Subdirectory, path: &str) -> &str {
    match path.strip_prefix(subdir.as_str()) {
        Some(rest) if rest.starts_with(is_separator) => &rest[1..],
        _ => path,
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn resolver() -> PathResolver {
        PathResolver::new(Arc::new(StorageLayout::new(
            "/sdcard/fieldforms",
            "/data/app/files",
            "/data/app/state",
        )))
    }

    #[test]
    fn strips_root_and_subdir_prefix() {
        let r = resolver();
        assert_eq!(
            r.relative(
                StorageRoot::Legacy,
                Subdirectory::Forms,
                "/sdcard/fieldforms/forms/basic.xml"
            ),
            "basic.xml"
        );
        assert_eq!(
            r.relative(
                StorageRoot::Legacy,
                Subdirectory::Instances,
                "/sdcard/fieldforms/instances/basic_2021/basic.xml"
            ),
            "basic_2021/basic.xml"
        );
    }

    #[test]
    fn bare_and_foreign_paths_are_returned_unchanged() {
        let r = resolver();
        assert_eq!(
            r.relative(StorageRoot::Legacy, Subdirectory::Forms, "basic.xml"),
            "basic.xml"
        );
        assert_eq!(
            r.relative(
                StorageRoot::Legacy,
                Subdirectory::Forms,
                "/data/app/files/forms/basic.xml"
            ),
            "/data/app/files/forms/basic.xml"
        );
        // Shares the textual prefix but is a sibling directory.
        assert_eq!(
            r.relative(
                StorageRoot::Legacy,
                Subdirectory::Forms,
                "/sdcard/fieldforms/forms-old/basic.xml"
            ),
            "/sdcard/fieldforms/forms-old/basic.xml"
        );
        assert_eq!(r.relative(StorageRoot::Legacy, Subdirectory::Forms, ""), "");
    }

    #[test]
    fn root_relative_paths_lose_their_subdir_segment() {
        let r = resolver();
        assert_eq!(
            r.relative(StorageRoot::Legacy, Subdirectory::Forms, "forms/basic.xml"),
            "basic.xml"
        );
        assert_eq!(
            r.relative(
                StorageRoot::Legacy,
                Subdirectory::Instances,
                "instances/basic_2021/basic.xml"
            ),
            "basic_2021/basic.xml"
        );
        assert_eq!(
            r.relative(StorageRoot::Legacy, Subdirectory::Cache, ".cache/basic.formdef"),
            "basic.formdef"
        );
        // Only the matching subdirectory is stripped.
        assert_eq!(
            r.relative(StorageRoot::Legacy, Subdirectory::Forms, "formsets/basic.xml"),
            "formsets/basic.xml"
        );
        assert_eq!(
            r.relative(StorageRoot::Legacy, Subdirectory::Layers, "forms/basic.xml"),
            "forms/basic.xml"
        );
        assert_eq!(
            r.rebase(
                StorageRoot::Legacy,
                StorageRoot::Scoped,
                Subdirectory::Forms,
                "forms/basic.xml"
            ),
            "/data/app/files/forms/basic.xml"
        );
    }

    #[test]
    fn absolute_prepends_active_prefix() {
        let r = resolver();
        assert_eq!(
            r.absolute(StorageRoot::Scoped, Subdirectory::Layers, "roads.mbtiles"),
            "/data/app/files/layers/roads.mbtiles"
        );
        assert_eq!(
            r.absolute(StorageRoot::Scoped, Subdirectory::Layers, ""),
            "/data/app/files/layers"
        );
    }

    #[test]
    fn absolute_leaves_absolute_input_alone() {
        let r = resolver();
        assert_eq!(
            r.absolute(StorageRoot::Scoped, Subdirectory::Forms, "/elsewhere/a.xml"),
            "/elsewhere/a.xml"
        );
    }

    #[test]
    fn rebase_moves_between_roots() {
        let r = resolver();
        let moved = r.rebase(
            StorageRoot::Legacy,
            StorageRoot::Scoped,
            Subdirectory::Forms,
            "/sdcard/fieldforms/forms/basic-media",
        );
        assert_eq!(
            r.relative(StorageRoot::Scoped, Subdirectory::Forms, &moved),
            "basic-media"
        );
        assert!(moved.starts_with("/data/app/files"));
    }

    fn subdir_strategy() -> impl Strategy<Value = Subdirectory> {
        prop::sample::select(Subdirectory::ALL.to_vec())
    }

    fn root_strategy() -> impl Strategy<Value = StorageRoot> {
        prop_oneof![Just(StorageRoot::Legacy), Just(StorageRoot::Scoped)]
    }

    proptest! {
        #[test]
        fn relative_then_absolute_roundtrips(
            root in root_strategy(),
            subdir in subdir_strategy(),
            parts in prop::collection::vec("[A-Za-z0-9_ .-]{1,12}", 1..5),
        ) {
            let r = resolver();
            let path = r.absolute(root, subdir, &parts.join("/"));
            let rel = r.relative(root, subdir, &path);
            prop_assert_eq!(r.absolute(root, subdir, &rel), path);
        }
    }
}
