//! `SQLite` history backend.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::SecondsFormat;
use sqlx::FromRow;
use tracing::{instrument, warn};

use super::{DownloadRecord, HistoryError, HistoryStore, RecordStatus, parse_iso_time};
use crate::db::Database;

/// History stored in the `download_history` table.
#[derive(Debug, Clone)]
pub struct SqliteHistoryStore {
    db: Database,
}

#[derive(Debug, FromRow)]
struct HistoryRow {
    id: i64,
    url: String,
    file_path: String,
    file_name: String,
    file_size: i64,
    start_time: Option<String>,
    finish_time: Option<String>,
    status: String,
}

impl HistoryRow {
    fn into_record(self) -> Option<DownloadRecord> {
        let status = match self.status.parse::<RecordStatus>() {
            Ok(status) => status,
            Err(e) => {
                warn!(id = self.id, error = %e, "skipping history row");
                return None;
            }
        };
        Some(DownloadRecord {
            url: self.url,
            file_path: PathBuf::from(self.file_path),
            file_name: self.file_name,
            file_size: u64::try_from(self.file_size).unwrap_or(0),
            start_time: self.start_time.as_deref().and_then(parse_iso_time),
            finish_time: self.finish_time.as_deref().and_then(parse_iso_time),
            status,
        })
    }
}

impl SqliteHistoryStore {
    /// Wraps an open database; migrations have already run.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

fn iso(time: Option<chrono::DateTime<chrono::Utc>>) -> Option<String> {
    time.map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
}

#[async_trait]
impl HistoryStore for SqliteHistoryStore {
    #[instrument(skip(self, record), fields(url = %record.url))]
    async fn add_record(&self, record: DownloadRecord) -> Result<(), HistoryError> {
        sqlx::query(
            "INSERT INTO download_history \
             (url, file_path, file_name, file_size, start_time, finish_time, status) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.url)
        .bind(record.file_path.to_string_lossy().into_owned())
        .bind(&record.file_name)
        .bind(i64::try_from(record.file_size).unwrap_or(i64::MAX))
        .bind(iso(record.start_time))
        .bind(iso(record.finish_time))
        .bind(record.status.as_str())
        .execute(self.db.pool())
        .await
        .map_err(HistoryError::database)?;
        Ok(())
    }

    async fn get_history(&self) -> Result<Vec<DownloadRecord>, HistoryError> {
        let rows = sqlx::query_as::<_, HistoryRow>(
            "SELECT id, url, file_path, file_name, file_size, start_time, finish_time, status \
             FROM download_history ORDER BY id ASC",
        )
        .fetch_all(self.db.pool())
        .await
        .map_err(HistoryError::database)?;
        Ok(rows.into_iter().filter_map(HistoryRow::into_record).collect())
    }

    async fn clear_history(&self) -> Result<(), HistoryError> {
        sqlx::query("DELETE FROM download_history")
            .execute(self.db.pool())
            .await
            .map_err(HistoryError::database)?;
        Ok(())
    }

    async fn delete_record(&self, index: usize) -> Result<bool, HistoryError> {
        let offset = i64::try_from(index).map_err(HistoryError::database)?;
        let result = sqlx::query(
            "DELETE FROM download_history WHERE id = \
             (SELECT id FROM download_history ORDER BY id ASC LIMIT 1 OFFSET ?)",
        )
        .bind(offset)
        .execute(self.db.pool())
        .await
        .map_err(HistoryError::database)?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;

    fn record(name: &str) -> DownloadRecord {
        DownloadRecord {
            url: format!("https://example.com/{name}"),
            file_path: PathBuf::from(format!("/downloads/{name}")),
            file_name: name.to_string(),
            file_size: 2048,
            start_time: Some(Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()),
            finish_time: Some(Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 9).unwrap()),
            status: RecordStatus::Completed,
        }
    }

    async fn store() -> SqliteHistoryStore {
        SqliteHistoryStore::new(Database::new_in_memory().await.unwrap())
    }

    #[tokio::test]
    async fn test_sqlite_store_add_and_get_preserves_fields() {
        let store = store().await;
        store.add_record(record("a.iso")).await.unwrap();

        let history = store.get_history().await.unwrap();

        assert_eq!(history, vec![record("a.iso")]);
    }

    #[tokio::test]
    async fn test_sqlite_store_delete_by_index() {
        let store = store().await;
        for name in ["a", "b", "c"] {
            store.add_record(record(name)).await.unwrap();
        }

        assert!(store.delete_record(0).await.unwrap());
        assert!(!store.delete_record(7).await.unwrap());

        let names: Vec<_> = store
            .get_history()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.file_name)
            .collect();
        assert_eq!(names, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_sqlite_store_clear() {
        let store = store().await;
        store.add_record(record("a")).await.unwrap();
        store.clear_history().await.unwrap();
        assert!(store.get_history().await.unwrap().is_empty());
    }
}
