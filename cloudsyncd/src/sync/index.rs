use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool, migrate::Migrator};
use thiserror::Error;
use time::OffsetDateTime;

use super::paths::parent_server_path;
use super::record::{Account, MetadataRecord, RecordId, RecordKind, Selector};
use super::store::{DirectoryRecord, MetadataStore, SliceUpdate};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("XDG data directory is unavailable")]
    MissingDataDir,
    #[error("invalid record kind: {0}")]
    InvalidKind(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedDownload {
    pub account: Account,
    pub record_id: RecordId,
    pub server_path: String,
    pub change_token: Option<String>,
    pub selector: String,
    pub enqueued_at: i64,
}

/// SQLite-backed metadata store.
#[derive(Clone)]
pub struct IndexStore {
    pool: SqlitePool,
}

impl IndexStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn new(database_url: &str) -> Result<Self, StoreError> {
        let pool = SqlitePool::connect(database_url).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    /// Single-connection in-memory database, mostly for tests and dry runs.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub async fn register_account(&self, account: &Account) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO accounts (account, created_at) VALUES (?1, ?2)
             ON CONFLICT(account) DO NOTHING",
        )
        .bind(account.as_str())
        .bind(now_unix())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_accounts(&self) -> Result<Vec<Account>, StoreError> {
        let rows = sqlx::query("SELECT account FROM accounts ORDER BY account ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| {
                row.try_get::<String, _>("account")
                    .map(Account::new)
                    .map_err(StoreError::from)
            })
            .collect()
    }

    pub async fn get_record(
        &self,
        account: &Account,
        id: &RecordId,
    ) -> Result<Option<MetadataRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT id, parent_path, name, kind, change_token, size, modified_at
             FROM records WHERE account = ?1 AND id = ?2",
        )
        .bind(account.as_str())
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    /// Directories whose last successful read is older than `older_than`.
    pub async fn stale_directories(
        &self,
        account: &Account,
        older_than: i64,
    ) -> Result<Vec<DirectoryRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT server_path, parent_path, change_token, last_read_at
             FROM directories
             WHERE account = ?1 AND last_read_at < ?2
             ORDER BY last_read_at ASC, server_path ASC",
        )
        .bind(account.as_str())
        .bind(older_than)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(directory_from_row).collect()
    }

    pub async fn enqueue_download(
        &self,
        account: &Account,
        record: &MetadataRecord,
        selector: &Selector,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO download_queue (account, record_id, server_path, change_token, selector, enqueued_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(account, record_id) DO UPDATE SET
                server_path = excluded.server_path,
                change_token = excluded.change_token,
                selector = excluded.selector,
                enqueued_at = excluded.enqueued_at",
        )
        .bind(account.as_str())
        .bind(record.id.as_str())
        .bind(record.server_path())
        .bind(&record.change_token)
        .bind(selector.as_str())
        .bind(now_unix())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn pending_downloads(
        &self,
        account: &Account,
    ) -> Result<Vec<QueuedDownload>, StoreError> {
        let rows = sqlx::query(
            "SELECT account, record_id, server_path, change_token, selector, enqueued_at
             FROM download_queue WHERE account = ?1 ORDER BY id ASC",
        )
        .bind(account.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(download_from_row).collect()
    }

    /// Pops the oldest queued download for `account`.
    pub async fn take_download(
        &self,
        account: &Account,
    ) -> Result<Option<QueuedDownload>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "SELECT id, account, record_id, server_path, change_token, selector, enqueued_at
             FROM download_queue WHERE account = ?1 ORDER BY id ASC LIMIT 1",
        )
        .bind(account.as_str())
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let id: i64 = row.try_get("id")?;
        let download = download_from_row(&row)?;
        sqlx::query("DELETE FROM download_queue WHERE id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(Some(download))
    }
}

#[async_trait]
impl MetadataStore for IndexStore {
    async fn has_account(&self, account: &Account) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT 1 FROM accounts WHERE account = ?1")
            .bind(account.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn load_slice(
        &self,
        account: &Account,
        parent_path: &str,
    ) -> Result<Vec<MetadataRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, parent_path, name, kind, change_token, size, modified_at
             FROM records
             WHERE account = ?1 AND parent_path = ?2
             ORDER BY name ASC",
        )
        .bind(account.as_str())
        .bind(parent_path)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn apply_slice(
        &self,
        account: &Account,
        parent_path: &str,
        update: &SliceUpdate,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        for record in &update.removed {
            sqlx::query("DELETE FROM records WHERE account = ?1 AND id = ?2")
                .bind(account.as_str())
                .bind(record.id.as_str())
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM download_queue WHERE account = ?1 AND record_id = ?2")
                .bind(account.as_str())
                .bind(record.id.as_str())
                .execute(&mut *tx)
                .await?;
            if record.is_folder() {
                // Everything below a vanished folder goes with it.
                let path = record.server_path();
                let prefix = format!("{path}/");
                sqlx::query(
                    "DELETE FROM download_queue
                     WHERE account = ?1 AND substr(server_path, 1, length(?2)) = ?2",
                )
                .bind(account.as_str())
                .bind(&prefix)
                .execute(&mut *tx)
                .await?;
                sqlx::query(
                    "DELETE FROM records
                     WHERE account = ?1
                        AND (parent_path = ?2 OR substr(parent_path, 1, length(?3)) = ?3)",
                )
                .bind(account.as_str())
                .bind(&path)
                .bind(&prefix)
                .execute(&mut *tx)
                .await?;
                sqlx::query(
                    "DELETE FROM directories
                     WHERE account = ?1
                        AND (server_path = ?2 OR substr(server_path, 1, length(?3)) = ?3)",
                )
                .bind(account.as_str())
                .bind(&path)
                .bind(&prefix)
                .execute(&mut *tx)
                .await?;
            }
        }

        for record in update.added.iter().chain(update.updated.iter()) {
            sqlx::query(
                "INSERT INTO records (account, id, parent_path, name, kind, change_token, size, modified_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(account, id) DO UPDATE SET
                    parent_path = excluded.parent_path,
                    name = excluded.name,
                    kind = excluded.kind,
                    change_token = excluded.change_token,
                    size = excluded.size,
                    modified_at = excluded.modified_at",
            )
            .bind(account.as_str())
            .bind(record.id.as_str())
            .bind(&record.parent_path)
            .bind(&record.name)
            .bind(record.kind.as_str())
            .bind(&record.change_token)
            .bind(record.size)
            .bind(record.modified_at)
            .execute(&mut *tx)
            .await?;
        }

        if let Some(directory) = &update.directory {
            sqlx::query(
                "INSERT INTO directories (account, server_path, parent_path, change_token, last_read_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(account, server_path) DO UPDATE SET
                    parent_path = excluded.parent_path,
                    change_token = COALESCE(excluded.change_token, directories.change_token),
                    last_read_at = excluded.last_read_at",
            )
            .bind(account.as_str())
            .bind(parent_path)
            .bind(parent_server_path(parent_path))
            .bind(&directory.change_token)
            .bind(now_unix())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn directory(
        &self,
        account: &Account,
        server_path: &str,
    ) -> Result<Option<DirectoryRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT server_path, parent_path, change_token, last_read_at
             FROM directories WHERE account = ?1 AND server_path = ?2",
        )
        .bind(account.as_str())
        .bind(server_path)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(directory_from_row).transpose()
    }

    async fn child_directories(
        &self,
        account: &Account,
        parent_path: &str,
    ) -> Result<Vec<DirectoryRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT server_path, parent_path, change_token, last_read_at
             FROM directories WHERE account = ?1 AND parent_path = ?2
             ORDER BY server_path ASC",
        )
        .bind(account.as_str())
        .bind(parent_path)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(directory_from_row).collect()
    }
}

fn record_from_row(row: &SqliteRow) -> Result<MetadataRecord, StoreError> {
    let kind: String = row.try_get("kind")?;
    Ok(MetadataRecord {
        id: RecordId::new(row.try_get::<String, _>("id")?),
        parent_path: row.try_get("parent_path")?,
        name: row.try_get("name")?,
        kind: RecordKind::parse(&kind).ok_or(StoreError::InvalidKind(kind))?,
        change_token: row.try_get("change_token")?,
        size: row.try_get("size")?,
        modified_at: row.try_get("modified_at")?,
    })
}

fn directory_from_row(row: &SqliteRow) -> Result<DirectoryRecord, StoreError> {
    Ok(DirectoryRecord {
        server_path: row.try_get("server_path")?,
        parent_path: row.try_get("parent_path")?,
        change_token: row.try_get("change_token")?,
        last_read_at: row.try_get("last_read_at")?,
    })
}

fn download_from_row(row: &SqliteRow) -> Result<QueuedDownload, StoreError> {
    Ok(QueuedDownload {
        account: Account::new(row.try_get::<String, _>("account")?),
        record_id: RecordId::new(row.try_get::<String, _>("record_id")?),
        server_path: row.try_get("server_path")?,
        change_token: row.try_get("change_token")?,
        selector: row.try_get("selector")?,
        enqueued_at: row.try_get("enqueued_at")?,
    })
}

pub fn default_db_path() -> Result<PathBuf, StoreError> {
    let mut path = dirs::data_dir().ok_or(StoreError::MissingDataDir)?;
    path.push("cloudsync");
    path.push("index.db");
    Ok(path)
}

pub(crate) fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}
