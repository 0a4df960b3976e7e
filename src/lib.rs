//! Relocates the on-device data store from the legacy root to the scoped
//! root and re-bases every persisted path so nothing hard-codes a root.

pub mod copier;
pub mod error;
pub mod eraser;
pub mod events;
pub mod gate;
pub mod jobs;
pub mod logging;
pub mod migration;
pub mod prefs;
pub mod repo;
pub mod rewriter;
pub mod state;
pub mod storage;

pub use error::{AppError, AppResult};
pub use migration::{Collaborators, MigrationOptions, StorageMigrator};
pub use state::{MigrationPhase, MigrationResult, MigrationStateHandle};
pub use storage::{StorageConfig, StorageLayout, StorageRoot, Subdirectory};
