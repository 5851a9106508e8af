//! JSON-file history backend.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use super::{DownloadRecord, HistoryError, HistoryStore};

/// History kept as a pretty-printed JSON array in a single file.
///
/// The file is read once on open and rewritten after every change. A failed
/// write rolls the in-memory list back, so memory and disk stay in step.
#[derive(Debug)]
pub struct JsonHistoryStore {
    path: PathBuf,
    records: Mutex<Vec<DownloadRecord>>,
}

impl JsonHistoryStore {
    /// Opens (or creates) the history file at `path`.
    ///
    /// Entries that fail to decode are skipped with a warning; a missing or
    /// empty file yields an empty history.
    ///
    /// # Errors
    ///
    /// Returns `HistoryError::Io` if the parent directory cannot be created
    /// or the file cannot be read, and `HistoryError::Json` if the file is
    /// not a JSON array.
    #[instrument(skip(path), fields(path = %path.as_ref().display()))]
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, HistoryError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| HistoryError::io(parent, e))?;
        }

        let records = match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Vec::new(),
            Ok(bytes) => decode(&path, &bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(HistoryError::io(&path, e)),
        };
        debug!(count = records.len(), "history loaded");

        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    /// Location of the history file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn save(&self, records: &[DownloadRecord]) -> Result<(), HistoryError> {
        let json =
            serde_json::to_vec_pretty(records).map_err(|e| HistoryError::json(&self.path, e))?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| HistoryError::io(&tmp, e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| HistoryError::io(&self.path, e))
    }
}

fn decode(path: &Path, bytes: &[u8]) -> Result<Vec<DownloadRecord>, HistoryError> {
    let values: Vec<serde_json::Value> =
        serde_json::from_slice(bytes).map_err(|e| HistoryError::json(path, e))?;
    Ok(values
        .into_iter()
        .filter_map(|value| match serde_json::from_value(value) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(error = %e, "skipping unreadable history entry");
                None
            }
        })
        .collect())
}

#[async_trait]
impl HistoryStore for JsonHistoryStore {
    async fn add_record(&self, record: DownloadRecord) -> Result<(), HistoryError> {
        let mut records = self.records.lock().await;
        records.push(record);
        if let Err(e) = self.save(&records).await {
            records.pop();
            return Err(e);
        }
        Ok(())
    }

    async fn get_history(&self) -> Result<Vec<DownloadRecord>, HistoryError> {
        Ok(self.records.lock().await.clone())
    }

    async fn clear_history(&self) -> Result<(), HistoryError> {
        let mut records = self.records.lock().await;
        let previous = std::mem::take(&mut *records);
        if let Err(e) = self.save(&records).await {
            *records = previous;
            return Err(e);
        }
        Ok(())
    }

    async fn delete_record(&self, index: usize) -> Result<bool, HistoryError> {
        let mut records = self.records.lock().await;
        if index >= records.len() {
            return Ok(false);
        }
        let removed = records.remove(index);
        if let Err(e) = self.save(&records).await {
            records.insert(index, removed);
            return Err(e);
        }
        Ok(true)
    }
}
