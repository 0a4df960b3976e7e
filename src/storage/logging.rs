use std::path::Path;

use sha2::{Digest, Sha256};

/// SHA-256 of the path's textual form. Paths under shared storage can carry
/// user-entered names, so logs only ever see the digest.
pub fn hash_path(p: &Path) -> String {
    let mut h = Sha256::new();
    h.update(p.as_os_str().to_string_lossy().as_bytes());
    format!("{:x}", h.finalize())
}

pub fn hash_for_logging<P>(path: P) -> String
where
    P: AsRef<Path>,
{
    hash_path(path.as_ref())
}

#[macro_export]
macro_rules! migration_log {
    (
        level: $level:ident,
        event: $event:expr,
        root = $root:expr,
        path = $path:expr
        $(, $field:ident = $value:expr)*
        $(,)?
    ) => {{
        let hashed_path = $crate::storage::logging::hash_for_logging($path);
        tracing::$level!(
            target: "storage_migration",
            event = $event,
            root = $root,
            path_hash = %hashed_path,
            $($field = $value,)*
        );
    }};
}
