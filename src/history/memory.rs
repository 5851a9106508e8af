//! In-memory history backend.

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{DownloadRecord, HistoryError, HistoryStore};

/// History that lives only as long as the process.
#[derive(Debug, Default)]
pub struct MemoryHistoryStore {
    records: Mutex<Vec<DownloadRecord>>,
}

impl MemoryHistoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn add_record(&self, record: DownloadRecord) -> Result<(), HistoryError> {
        self.records.lock().await.push(record);
        Ok(())
    }

    async fn get_history(&self) -> Result<Vec<DownloadRecord>, HistoryError> {
        Ok(self.records.lock().await.clone())
    }

    async fn clear_history(&self) -> Result<(), HistoryError> {
        self.records.lock().await.clear();
        Ok(())
    }

    async fn delete_record(&self, index: usize) -> Result<bool, HistoryError> {
        let mut records = self.records.lock().await;
        if index < records.len() {
            records.remove(index);
            Ok(true)
        } else {
            Ok(false)
        }
    }
}
