//! Task registry: creates tasks, routes their lifecycle events and drops
//! them once they finish.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::config::Settings;
use crate::download::{DownloadTask, MAX_CHUNK_COUNT, TaskContext, TaskEvent};
use crate::request::DownloadRequest;

/// Errors that can occur when creating tasks.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Chunk count outside `1..=MAX_CHUNK_COUNT`.
    #[error("invalid chunk count {value}: must be between 1 and {MAX_CHUNK_COUNT}")]
    InvalidChunkCount {
        /// The rejected value.
        value: usize,
    },

    /// URL that is not absolute http(s).
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The rejected URL.
        url: String,
    },

    /// Tasks need a Tokio runtime for their driver.
    #[error("no Tokio runtime available to drive download tasks")]
    Runtime,
}

/// Lifecycle notifications published by the registry.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    /// A task was created and is tracked by the registry.
    TaskAdded(DownloadTask),
    /// The task reached a terminal state and was dropped by the registry.
    TaskFinished {
        /// Task id.
        id: u64,
    },
    /// The task failed. Always followed by `TaskFinished` for the same id.
    TaskError {
        /// Task id.
        id: u64,
        /// Error text of the task.
        message: String,
    },
}

type Listeners = Arc<Mutex<Vec<mpsc::UnboundedSender<RegistryEvent>>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn emit(listeners: &Listeners, event: &RegistryEvent) {
    lock(listeners).retain(|tx| tx.send(event.clone()).is_ok());
}

/// Owns live tasks and their shared collaborators.
///
/// All tasks share one HTTP client, one worker pool and one history store,
/// handed in through the [`TaskContext`].
#[derive(Debug)]
pub struct TaskRegistry {
    context: TaskContext,
    settings: Settings,
    tasks: Arc<Mutex<HashMap<u64, DownloadTask>>>,
    listeners: Listeners,
    next_id: AtomicU64,
}

impl TaskRegistry {
    #[must_use]
    pub fn new(context: TaskContext, settings: Settings) -> Self {
        debug!(
            workers = context.pool.workers(),
            download_dir = %settings.download_dir.display(),
            "creating task registry"
        );
        Self {
            context,
            settings,
            tasks: Arc::new(Mutex::new(HashMap::new())),
            listeners: Arc::new(Mutex::new(Vec::new())),
            next_id: AtomicU64::new(1),
        }
    }

    #[must_use]
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Registers a new observer of registry events.
    #[must_use]
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<RegistryEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.listeners).push(tx);
        rx
    }

    /// Creates a pending task downloading `url` to `save_path`.
    ///
    /// Emits [`RegistryEvent::TaskAdded`]. The task is not started.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidChunkCount`] if `chunk_count` is outside
    /// `1..=32`, [`EngineError::InvalidUrl`] for non-http(s) URLs and
    /// [`EngineError::Runtime`] when called outside a Tokio runtime.
    #[instrument(skip(self, save_path), fields(url = %url))]
    pub fn create_task(
        &self,
        url: &str,
        save_path: impl Into<PathBuf>,
        chunk_count: usize,
    ) -> Result<DownloadTask, EngineError> {
        if !(1..=MAX_CHUNK_COUNT).contains(&chunk_count) {
            return Err(EngineError::InvalidChunkCount { value: chunk_count });
        }
        let parsed = Url::parse(url.trim()).map_err(|_| EngineError::InvalidUrl {
            url: url.to_string(),
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(EngineError::InvalidUrl {
                url: url.to_string(),
            });
        }
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(EngineError::Runtime);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let task = DownloadTask::new(
            id,
            parsed.as_str(),
            save_path,
            chunk_count,
            self.context.clone(),
        );
        let events = task.subscribe();
        lock(&self.tasks).insert(id, task.clone());
        tokio::spawn(forward_task_events(
            id,
            events,
            Arc::clone(&self.tasks),
            Arc::clone(&self.listeners),
        ));

        info!(
            task_id = id,
            path = %task.file_path().display(),
            chunk_count,
            "task created"
        );
        emit(&self.listeners, &RegistryEvent::TaskAdded(task.clone()));
        Ok(task)
    }

    /// Creates a task from an inbound request using the configured defaults.
    ///
    /// `chunk_count` falls back to the configured chunk count.
    ///
    /// # Errors
    ///
    /// Same as [`TaskRegistry::create_task`].
    pub fn create_task_from_request(
        &self,
        request: &DownloadRequest,
        chunk_count: Option<usize>,
    ) -> Result<DownloadTask, EngineError> {
        let path = request
            .resolve_path(&self.settings.download_dir)
            .map_err(|_| EngineError::InvalidUrl {
                url: request.url.clone(),
            })?;
        self.create_task(
            &request.url,
            path,
            chunk_count.unwrap_or(self.settings.chunk_count),
        )
    }

    pub fn start_task(&self, task: &DownloadTask) {
        task.start();
    }

    pub fn pause_task(&self, task: &DownloadTask) {
        task.pause();
    }

    pub fn resume_task(&self, task: &DownloadTask) {
        task.resume();
    }

    /// Cancels `task`; `TaskFinished` follows once it has wound down.
    ///
    /// Pass `delete_temp_files = true` to drop the chunk files as well; keep
    /// them to allow a later download of the same destination to resume.
    pub fn cancel_task(&self, task: &DownloadTask, delete_temp_files: bool) {
        task.cancel(delete_temp_files);
    }

    /// Looks up a live task by id.
    #[must_use]
    pub fn get(&self, id: u64) -> Option<DownloadTask> {
        lock(&self.tasks).get(&id).cloned()
    }

    /// Live tasks, ordered by id.
    #[must_use]
    pub fn tasks(&self) -> Vec<DownloadTask> {
        let mut tasks: Vec<_> = lock(&self.tasks).values().cloned().collect();
        tasks.sort_by_key(DownloadTask::id);
        tasks
    }

    /// Number of live tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.tasks).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancels every live task.
    pub fn cancel_all(&self, delete_temp_files: bool) {
        for task in self.tasks() {
            task.cancel(delete_temp_files);
        }
    }
}

async fn forward_task_events(
    id: u64,
    mut events: mpsc::UnboundedReceiver<TaskEvent>,
    tasks: Arc<Mutex<HashMap<u64, DownloadTask>>>,
    listeners: Listeners,
) {
    while let Some(event) = events.recv().await {
        match event {
            TaskEvent::Error(message) => {
                warn!(task_id = id, error = %message, "task error");
                emit(&listeners, &RegistryEvent::TaskError { id, message });
            }
            TaskEvent::Finished => {
                lock(&tasks).remove(&id);
                debug!(task_id = id, "task removed");
                emit(&listeners, &RegistryEvent::TaskFinished { id });
                return;
            }
            TaskEvent::StatusChanged(_) | TaskEvent::Progress(_) => {}
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::history::MemoryHistoryStore;

    fn registry() -> TaskRegistry {
        let context = TaskContext::new(Arc::new(MemoryHistoryStore::new()));
        let settings = Settings {
            download_dir: PathBuf::from("/tmp/registry-tests"),
            ..Settings::default()
        };
        TaskRegistry::new(context, settings)
    }

    #[tokio::test]
    async fn test_create_task_rejects_chunk_count() {
        let registry = registry();
        for value in [0, 33] {
            let result = registry.create_task("https://example.com/a", "/tmp/a", value);
            assert!(
                matches!(result, Err(EngineError::InvalidChunkCount { value: v }) if v == value),
                "value {value}"
            );
        }
    }

    #[tokio::test]
    async fn test_create_task_rejects_bad_urls() {
        let registry = registry();
        for url in ["not a url", "ftp://example.com/file", ""] {
            let result = registry.create_task(url, "/tmp/a", 4);
            assert!(
                matches!(result, Err(EngineError::InvalidUrl { .. })),
                "url {url:?}"
            );
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn test_create_task_requires_runtime() {
        let registry = registry();
        let result = registry.create_task("https://example.com/a", "/tmp/a", 4);
        assert!(matches!(result, Err(EngineError::Runtime)));
    }

    #[tokio::test]
    async fn test_create_task_emits_added_and_tracks_task() {
        let registry = registry();
        let mut events = registry.subscribe();

        let first = registry
            .create_task("https://example.com/one.bin", "/tmp/one.bin", 4)
            .unwrap();
        let second = registry
            .create_task("https://example.com/two.bin", "/tmp/two.bin", 2)
            .unwrap();

        assert_ne!(first.id(), second.id());
        match events.recv().await.unwrap() {
            RegistryEvent::TaskAdded(task) => assert_eq!(task.id(), first.id()),
            other => panic!("expected TaskAdded, got {other:?}"),
        }
        let ids: Vec<_> = registry.tasks().iter().map(DownloadTask::id).collect();
        assert_eq!(ids, vec![first.id(), second.id()]);
        assert!(registry.get(second.id()).is_some());
    }

    #[tokio::test]
    async fn test_cancelled_task_is_removed() {
        let registry = registry();
        let mut events = registry.subscribe();
        let task = registry
            .create_task("https://example.com/a.bin", "/tmp/a.bin", 1)
            .unwrap();
        let _added = events.recv().await.unwrap();

        registry.cancel_task(&task, false);

        match events.recv().await.unwrap() {
            RegistryEvent::TaskFinished { id } => assert_eq!(id, task.id()),
            other => panic!("expected TaskFinished, got {other:?}"),
        }
        assert!(registry.get(task.id()).is_none());
    }

    #[tokio::test]
    async fn test_create_task_from_request_uses_defaults() {
        let registry = registry();
        let request = DownloadRequest::new("https://example.com/files/data.csv");

        let task = registry.create_task_from_request(&request, None).unwrap();

        assert_eq!(
            task.file_path(),
            PathBuf::from("/tmp/registry-tests/data.csv")
        );
        assert_eq!(task.requested_chunk_count(), 5);
    }
}
