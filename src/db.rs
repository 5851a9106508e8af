//! `SQLite` file backing the `download_history` table.
//!
//! Every connection of the pool is configured the same way through
//! [`SqliteConnectOptions`]: WAL journal, `synchronous = NORMAL` and a busy
//! timeout. Setting these with a one-off `PRAGMA` query would only reach the
//! connection that happened to run it.
//!
//! # Example
//!
//! ```no_run
//! use downloader_core::Database;
//! use downloader_core::history::SqliteHistoryStore;
//! use std::path::Path;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let db = Database::new(Path::new("/var/lib/downloader/history.db")).await?;
//! let store = SqliteHistoryStore::new(db);
//! # Ok(())
//! # }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use thiserror::Error;
use tracing::{debug, instrument};

/// History sees one insert per finished task; a second connection lets a
/// listing run while that insert holds the write lock.
const MAX_CONNECTIONS: u32 = 2;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors opening the history database.
#[derive(Error, Debug)]
pub enum DbError {
    /// The directory holding the database file could not be created.
    #[error("cannot create history directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failed to connect to the database.
    #[error("failed to open history database: {0}")]
    Connection(#[from] sqlx::Error),

    /// Failed to create or upgrade the `download_history` schema.
    #[error("failed to migrate history schema: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// Pool of connections to the history database, schema up to date.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Opens the history database at `db_path`, creating the file and its
    /// parent directories if needed, then runs pending migrations.
    ///
    /// The path is handed to `SQLite` as is, so names containing `?`, `#` or
    /// spaces are fine.
    ///
    /// # Errors
    ///
    /// Returns `DbError::CreateDir` if the parent directory cannot be
    /// created, `DbError::Connection` if the file cannot be opened and
    /// `DbError::Migration` if the schema cannot be brought up to date.
    #[instrument(skip(db_path), fields(path = %db_path.display()))]
    pub async fn new(db_path: &Path) -> Result<Self, DbError> {
        if let Some(parent) = db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| DbError::CreateDir {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(BUSY_TIMEOUT);
        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;
        debug!("history database ready");
        Ok(Self { pool })
    }

    /// Opens a private in-memory history database.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Connection` if the connection fails,
    /// or `DbError::Migration` if migrations fail.
    #[instrument]
    pub async fn new_in_memory() -> Result<Self, DbError> {
        // One connection: every `:memory:` connection is its own database.
        let options: SqliteConnectOptions = "sqlite::memory:".parse()?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Journal mode reported by `SQLite`, lowercased (`"wal"`, `"memory"`).
    ///
    /// # Errors
    ///
    /// Returns `DbError::Connection` if the query fails.
    pub async fn journal_mode(&self) -> Result<String, DbError> {
        let (mode,): (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(&self.pool)
            .await?;
        Ok(mode.to_ascii_lowercase())
    }

    /// Closes every connection, checkpointing the WAL into the main file.
    #[instrument(skip(self))]
    pub async fn close(self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    async fn insert(db: &Database, status: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO download_history (url, file_path, file_name, file_size, status) \
             VALUES ('https://example.com/a', '/tmp/a', 'a', 1, ?)",
        )
        .bind(status)
        .execute(db.pool())
        .await
        .map(|_| ())
    }

    #[tokio::test]
    async fn test_database_history_table_exists() {
        let db = Database::new_in_memory().await.unwrap();

        let (tables,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master \
             WHERE type = 'table' AND name = 'download_history'",
        )
        .fetch_one(db.pool())
        .await
        .unwrap();

        assert_eq!(tables, 1);
        insert(&db, "Completed").await.unwrap();
    }

    #[tokio::test]
    async fn test_database_status_check_constraint() {
        let db = Database::new_in_memory().await.unwrap();

        for status in ["Paused", "Downloading", "completed"] {
            assert!(
                insert(&db, status).await.is_err(),
                "{status} must be rejected by the CHECK constraint"
            );
        }
    }

    #[tokio::test]
    async fn test_database_file_uses_wal_on_every_connection() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db = Database::new(&temp_dir.path().join("history.db"))
            .await
            .unwrap();

        // Hold one connection so the next query goes through the other.
        let _held = db.pool().acquire().await.unwrap();
        assert_eq!(db.journal_mode().await.unwrap(), "wal");
        let (timeout,): (i64,) = sqlx::query_as("PRAGMA busy_timeout")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(timeout, 5000);
    }

    #[tokio::test]
    async fn test_database_creates_parent_dirs_for_odd_names() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir
            .path()
            .join("state dir #1")
            .join("history?.db");

        let db = Database::new(&path).await.unwrap();
        insert(&db, "Failed").await.unwrap();
        db.close().await;

        assert!(path.exists());
        let reopened = Database::new(&path).await.unwrap();
        let (rows,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM download_history")
            .fetch_one(reopened.pool())
            .await
            .unwrap();
        assert_eq!(rows, 1);
    }
}
