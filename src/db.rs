use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::time::Duration;

use crate::config::DatabaseConfig;
use crate::error::{AppError, Result};

/// Catalog write transaction
pub type WriteTx = Transaction<'static, Sqlite>;

/// Database connection pool wrapper
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Create a new database connection
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(&config.path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(config.busy_timeout_ms))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    /// Get the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Begin a transaction that already holds the SQLite write lock.
    ///
    /// A deferred SQLite transaction that reads before it writes can fail with
    /// `SQLITE_BUSY_SNAPSHOT` when another writer commits in between. Touching
    /// `catalog_lock` first makes every catalog mutation serialize on the write
    /// lock (waiting up to the busy timeout) and see the latest committed state.
    pub async fn begin_write(&self) -> Result<WriteTx> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE catalog_lock SET tick = tick + 1 WHERE id = 1")
            .execute(&mut *tx)
            .await?;
        Ok(tx)
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS catalog_lock (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                tick INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("INSERT OR IGNORE INTO catalog_lock (id, tick) VALUES (1, 0)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS quotas (
                owner_id TEXT PRIMARY KEY,
                ceiling INTEGER NOT NULL CHECK (ceiling >= 0),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS blobs (
                id TEXT PRIMARY KEY,
                digest TEXT NOT NULL UNIQUE,
                size INTEGER NOT NULL,
                locator TEXT NOT NULL,
                ref_count INTEGER NOT NULL CHECK (ref_count >= 0),
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS folders (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                name TEXT NOT NULL,
                parent_id TEXT,
                trashed INTEGER NOT NULL DEFAULT 0,
                trashed_at TEXT,
                created_at TEXT NOT NULL,
                FOREIGN KEY (parent_id) REFERENCES folders(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS files (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                name TEXT NOT NULL,
                folder_id TEXT,
                blob_id TEXT NOT NULL,
                mime_type TEXT NOT NULL,
                tags TEXT NOT NULL DEFAULT '[]',
                trashed INTEGER NOT NULL DEFAULT 0,
                trashed_at TEXT,
                download_count INTEGER NOT NULL DEFAULT 0,
                preview_eligible INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                FOREIGN KEY (folder_id) REFERENCES folders(id),
                FOREIGN KEY (blob_id) REFERENCES blobs(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS file_versions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                file_id TEXT NOT NULL,
                version_number INTEGER NOT NULL,
                blob_id TEXT NOT NULL,
                mime_type TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE (file_id, version_number),
                FOREIGN KEY (file_id) REFERENCES files(id),
                FOREIGN KEY (blob_id) REFERENCES blobs(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // One live file per (owner, name, folder); trashed files may collide
        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_files_live_coordinate
            ON files(owner_id, name, COALESCE(folder_id, ''))
            WHERE trashed = 0
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Create indexes
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_files_owner_trashed ON files(owner_id, trashed)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_files_folder_id ON files(folder_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_files_blob_id ON files(blob_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_file_versions_blob_id ON file_versions(blob_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_folders_owner_id ON folders(owner_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_folders_parent_id ON folders(parent_id)")
            .execute(&self.pool)
            .await?;

        tracing::info!("Database migrations completed");
        Ok(())
    }
}

impl AppError {
    /// Whether a failed catalog transaction may simply be retried.
    ///
    /// Covers SQLite busy/locked results and uniqueness races; none of these
    /// are surfaced to callers while retries remain.
    pub fn is_transient(&self) -> bool {
        match self {
            AppError::Database(sqlx::Error::Database(db)) => {
                db.is_unique_violation()
                    || matches!(db.code().as_deref(), Some("5") | Some("6") | Some("517"))
            }
            AppError::Database(sqlx::Error::PoolTimedOut) => true,
            _ => false,
        }
    }
}
