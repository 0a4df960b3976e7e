use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Pool, Row, Sqlite};

use super::{
    FormPaths, FormRecord, FormsRepository, InstanceRecord, InstanceUpdate, InstancesRepository,
    RepositoryHandles, RepositoryOpener, Visitor,
};
use crate::storage::{StorageLayout, StorageRoot, Subdirectory};
use crate::{AppError, AppResult};

pub const FORMS_DB: &str = "forms.db";
pub const INSTANCES_DB: &str = "instances.db";

const FORMS_SCHEMA: &str = "CREATE TABLE IF NOT EXISTS forms (
    id TEXT PRIMARY KEY,
    form_id TEXT NOT NULL,
    form_file_path TEXT,
    form_media_path TEXT,
    cache_file_path TEXT
)";

const INSTANCES_SCHEMA: &str = "CREATE TABLE IF NOT EXISTS instances (
    id TEXT PRIMARY KEY,
    instance_file_path TEXT,
    last_status_change_date INTEGER NOT NULL
)";

/// Opens the SQLite-backed repositories kept under `<root>/metadata/`.
///
/// Because the databases live inside the root, copying the root copies the
/// metadata too, and each root's rows only ever describe that root's files.
#[derive(Debug, Clone)]
pub struct SqliteRepositoryOpener {
    layout: Arc<StorageLayout>,
}

impl SqliteRepositoryOpener {
    pub fn new(layout: Arc<StorageLayout>) -> Self {
        Self { layout }
    }

    pub fn db_path(&self, root: StorageRoot, name: &str) -> PathBuf {
        self.layout.dir(root, Subdirectory::Metadata).join(name)
    }
}

#[async_trait]
impl RepositoryOpener for SqliteRepositoryOpener {
    async fn open(&self, root: StorageRoot) -> AppResult<RepositoryHandles> {
        let forms_pool = open_pool(&self.db_path(root, FORMS_DB), FORMS_SCHEMA).await?;
        let instances_pool =
            match open_pool(&self.db_path(root, INSTANCES_DB), INSTANCES_SCHEMA).await {
                Ok(pool) => pool,
                Err(err) => {
                    forms_pool.close().await;
                    return Err(err);
                }
            };
        tracing::debug!(
            target: "storage_migration",
            event = "repositories_opened",
            root = root.as_str(),
        );
        Ok(RepositoryHandles {
            root,
            forms: Arc::new(SqliteFormsRepository { pool: forms_pool }),
            instances: Arc::new(SqliteInstancesRepository {
                pool: instances_pool,
            }),
        })
    }
}

async fn open_pool(path: &Path, schema: &str) -> AppResult<Pool<Sqlite>> {
    let with_path = |err: AppError| {
        err.with_context("operation", "open_repository")
            .with_context("path", path.display().to_string())
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|err| with_path(err.into()))?;
    }

    let opts = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .busy_timeout(Duration::from_millis(5000));

    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(opts)
        .await
        .map_err(|err| with_path(err.into()))?;
    if let Err(err) = sqlx::query(schema).execute(&pool).await {
        pool.close().await;
        return Err(with_path(err.into()));
    }
    Ok(pool)
}

fn required_path(row: &SqliteRow, table: &str, column: &str) -> AppResult<String> {
    let value: Option<String> = row.try_get(column)?;
    value.ok_or_else(|| {
        let id: String = row.try_get("id").unwrap_or_default();
        AppError::new("REPO/NULL_PATH", format!("{table}.{column} is unexpectedly null"))
            .with_context("table", table.to_string())
            .with_context("column", column.to_string())
            .with_context("id", id)
    })
}

fn form_from_row(row: &SqliteRow) -> AppResult<FormRecord> {
    Ok(FormRecord {
        id: row.try_get("id")?,
        form_id: row.try_get("form_id")?,
        form_file_path: required_path(row, "forms", "form_file_path")?,
        form_media_path: required_path(row, "forms", "form_media_path")?,
        cache_file_path: row.try_get("cache_file_path")?,
    })
}

fn instance_from_row(row: &SqliteRow) -> AppResult<InstanceRecord> {
    Ok(InstanceRecord {
        id: row.try_get("id")?,
        instance_file_path: required_path(row, "instances", "instance_file_path")?,
        last_status_change_date: row.try_get("last_status_change_date")?,
    })
}

fn not_found(table: &str, id: &str) -> AppError {
    AppError::new("REPO/NOT_FOUND", format!("no {table} row with id {id}"))
        .with_context("table", table.to_string())
        .with_context("id", id.to_string())
}

async fn checkpoint(pool: &Pool<Sqlite>) -> AppResult<()> {
    sqlx::query("PRAGMA wal_checkpoint(TRUNCATE);")
        .execute(pool)
        .await?;
    Ok(())
}

pub struct SqliteFormsRepository {
    pool: Pool<Sqlite>,
}

#[async_trait]
impl FormsRepository for SqliteFormsRepository {
    async fn for_each(&self, visitor: &mut Visitor<'_, FormRecord>) -> AppResult<()> {
        let mut rows = sqlx::query(
            "SELECT id, form_id, form_file_path, form_media_path, cache_file_path
             FROM forms ORDER BY id",
        )
        .fetch(&self.pool);
        while let Some(row) = rows.try_next().await? {
            visitor(&form_from_row(&row)?)?;
        }
        Ok(())
    }

    async fn update_by_id(&self, id: &str, paths: &FormPaths) -> AppResult<()> {
        let res = sqlx::query(
            "UPDATE forms SET form_file_path = ?, form_media_path = ?, cache_file_path = ?
             WHERE id = ?",
        )
        .bind(&paths.form_file_path)
        .bind(&paths.form_media_path)
        .bind(paths.cache_file_path.as_deref())
        .bind(id)
        .execute(&self.pool)
        .await?;
        if res.rows_affected() == 0 {
            return Err(not_found("forms", id));
        }
        Ok(())
    }

    async fn get(&self, id: &str) -> AppResult<Option<FormRecord>> {
        let row = sqlx::query(
            "SELECT id, form_id, form_file_path, form_media_path, cache_file_path
             FROM forms WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(form_from_row).transpose()
    }

    async fn insert(&self, record: &FormRecord) -> AppResult<()> {
        sqlx::query(
            "INSERT INTO forms (id, form_id, form_file_path, form_media_path, cache_file_path)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&record.id)
        .bind(&record.form_id)
        .bind(&record.form_file_path)
        .bind(&record.form_media_path)
        .bind(record.cache_file_path.as_deref())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn checkpoint(&self) -> AppResult<()> {
        checkpoint(&self.pool).await
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

pub struct SqliteInstancesRepository {
    pool: Pool<Sqlite>,
}

#[async_trait]
impl InstancesRepository for SqliteInstancesRepository {
    async fn for_each(&self, visitor: &mut Visitor<'_, InstanceRecord>) -> AppResult<()> {
        let mut rows = sqlx::query(
            "SELECT id, instance_file_path, last_status_change_date
             FROM instances ORDER BY id",
        )
        .fetch(&self.pool);
        while let Some(row) = rows.try_next().await? {
            visitor(&instance_from_row(&row)?)?;
        }
        Ok(())
    }

    async fn update_by_id(&self, id: &str, update: &InstanceUpdate) -> AppResult<()> {
        let res = sqlx::query(
            "UPDATE instances SET instance_file_path = ?, last_status_change_date = ?
             WHERE id = ?",
        )
        .bind(&update.instance_file_path)
        .bind(update.last_status_change_date)
        .bind(id)
        .execute(&self.pool)
        .await?;
        if res.rows_affected() == 0 {
            return Err(not_found("instances", id));
        }
        Ok(())
    }

    async fn get(&self, id: &str) -> AppResult<Option<InstanceRecord>> {
        let row = sqlx::query(
            "SELECT id, instance_file_path, last_status_change_date
             FROM instances WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(instance_from_row).transpose()
    }

    async fn insert(&self, record: &InstanceRecord) -> AppResult<()> {
        sqlx::query(
            "INSERT INTO instances (id, instance_file_path, last_status_change_date)
             VALUES (?, ?, ?)",
        )
        .bind(&record.id)
        .bind(&record.instance_file_path)
        .bind(record.last_status_change_date)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn checkpoint(&self) -> AppResult<()> {
        checkpoint(&self.pool).await
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
