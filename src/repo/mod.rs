use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::storage::StorageRoot;
use crate::AppResult;

pub mod sqlite;

pub use sqlite::SqliteRepositoryOpener;

/// A form definition. Path fields are stored relative to their subdirectory:
/// `form_file_path` and `form_media_path` to FORMS, `cache_file_path` to CACHE.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormRecord {
    pub id: String,
    pub form_id: String,
    pub form_file_path: String,
    pub form_media_path: String,
    pub cache_file_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormPaths {
    pub form_file_path: String,
    pub form_media_path: String,
    pub cache_file_path: Option<String>,
}

/// A filled-in form. `instance_file_path` is relative to INSTANCES.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub id: String,
    pub instance_file_path: String,
    /// Epoch millis. Shares the update statement with the path but is never
    /// changed by a migration.
    pub last_status_change_date: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceUpdate {
    pub instance_file_path: String,
    pub last_status_change_date: i64,
}

pub type Visitor<'a, T> = dyn FnMut(&T) -> AppResult<()> + Send + 'a;

#[async_trait]
pub trait FormsRepository: Send + Sync {
    /// Visit every record. The first visitor or read error stops iteration.
    async fn for_each(&self, visitor: &mut Visitor<'_, FormRecord>) -> AppResult<()>;
    async fn update_by_id(&self, id: &str, paths: &FormPaths) -> AppResult<()>;
    async fn get(&self, id: &str) -> AppResult<Option<FormRecord>>;
    async fn insert(&self, record: &FormRecord) -> AppResult<()>;

    /// Flush anything buffered outside the main data file so the root can
    /// be copied byte-for-byte.
    async fn checkpoint(&self) -> AppResult<()> {
        Ok(())
    }

    async fn close(&self) {}
}

#[async_trait]
pub trait InstancesRepository: Send + Sync {
    async fn for_each(&self, visitor: &mut Visitor<'_, InstanceRecord>) -> AppResult<()>;
    async fn update_by_id(&self, id: &str, update: &InstanceUpdate) -> AppResult<()>;
    async fn get(&self, id: &str) -> AppResult<Option<InstanceRecord>>;
    async fn insert(&self, record: &InstanceRecord) -> AppResult<()>;

    async fn checkpoint(&self) -> AppResult<()> {
        Ok(())
    }

    async fn close(&self) {}
}

/// Live repository connections bound to one storage root.
#[derive(Clone)]
pub struct RepositoryHandles {
    pub root: StorageRoot,
    pub forms: Arc<dyn FormsRepository>,
    pub instances: Arc<dyn InstancesRepository>,
}

impl RepositoryHandles {
    pub async fn checkpoint(&self) -> AppResult<()> {
        self.forms.checkpoint().await?;
        self.instances.checkpoint().await
    }

    pub async fn close(&self) {
        self.forms.close().await;
        self.instances.close().await;
    }
}

/// Builds fresh repository connections against a given root.
#[async_trait]
pub trait RepositoryOpener: Send + Sync {
    async fn open(&self, root: StorageRoot) -> AppResult<RepositoryHandles>;
}
