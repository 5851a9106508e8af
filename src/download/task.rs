//! One logical download: probe, partition, fetch, merge.
//!
//! A [`DownloadTask`] is a cheap, cloneable handle. Control methods
//! (`start`, `pause`, `resume`, `cancel`) only flip state and stop or submit
//! fetchers; they never wait on the network. Everything that must happen in
//! order (probe results, fetcher reports, merging, history writes) is queued
//! to a per-task driver future which processes one item at a time.
//!
//! # Locking
//!
//! Status and byte counters live behind separate mutexes. When both are
//! needed, status is locked first. Events are built under the lock and
//! published after it is released.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::chunk::plan_chunks;
use super::client::{HttpClient, ProbeResult};
use super::constants::{MERGE_BUFFER_SIZE, PROBE_TIMEOUT, SPEED_SAMPLE_INTERVAL, TRANSFER_TIMEOUT};
use super::error::DownloadError;
use super::fetcher::{ChunkFetcher, FetchEvent};
use super::filename::filename_from_path;
use super::merge::{delete_part_files, merge_chunks};
use super::pool::WorkerPool;
use super::retry::RetryPolicy;
use super::status::{ProgressSnapshot, TaskEvent, TaskStatus};
use crate::history::{DownloadRecord, HistoryStore, RecordStatus};

/// Engine tunables applied to every task.
#[derive(Debug, Clone)]
pub struct TaskOptions {
    /// Bound on the HEAD probe.
    pub probe_timeout: Duration,
    /// Chunk inactivity limit.
    pub transfer_timeout: Duration,
    /// Retry policy handed to every fetcher.
    pub retry_policy: RetryPolicy,
    /// Copy buffer used by the merge.
    pub merge_buffer_size: usize,
    /// Period of the speed sampler.
    pub speed_interval: Duration,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            probe_timeout: PROBE_TIMEOUT,
            transfer_timeout: TRANSFER_TIMEOUT,
            retry_policy: RetryPolicy::default(),
            merge_buffer_size: MERGE_BUFFER_SIZE,
            speed_interval: SPEED_SAMPLE_INTERVAL,
        }
    }
}

/// Collaborators shared by every task of a registry.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub client: HttpClient,
    pub pool: WorkerPool,
    pub history: Arc<dyn HistoryStore>,
    pub options: TaskOptions,
}

impl TaskContext {
    /// Default client, pool and options around `history`.
    #[must_use]
    pub fn new(history: Arc<dyn HistoryStore>) -> Self {
        Self {
            client: HttpClient::new(),
            pool: WorkerPool::default(),
            history,
            options: TaskOptions::default(),
        }
    }
}

#[derive(Debug)]
enum TaskWork {
    Probed {
        generation: u64,
        result: Result<ProbeResult, DownloadError>,
    },
    Fetcher {
        generation: u64,
        index: usize,
        event: FetchEvent,
    },
    Cancelled {
        delete_temp_files: bool,
    },
}

#[derive(Debug, Default)]
struct TaskData {
    total_size: Option<u64>,
    downloaded: u64,
    last_sample: u64,
    speed: u64,
    start_time: Option<DateTime<Utc>>,
    finish_time: Option<DateTime<Utc>>,
    chunk_count: usize,
    fetchers: Vec<Arc<ChunkFetcher>>,
    completed: Vec<bool>,
    finished: usize,
    /// Bumped by every `start()`; reports from older runs are dropped.
    generation: u64,
    last_error: Option<String>,
}

impl TaskData {
    fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            downloaded: self.downloaded,
            total: self.total_size,
            speed: self.speed,
        }
    }
}

#[derive(Debug)]
struct TaskShared {
    id: u64,
    url: String,
    file_path: PathBuf,
    file_name: String,
    requested_chunks: usize,
    client: HttpClient,
    pool: WorkerPool,
    history: Arc<dyn HistoryStore>,
    options: TaskOptions,
    status: Mutex<TaskStatus>,
    data: Mutex<TaskData>,
    sampler: Mutex<Option<CancellationToken>>,
    listeners: Mutex<Vec<mpsc::UnboundedSender<TaskEvent>>>,
    work_tx: mpsc::UnboundedSender<TaskWork>,
    lifetime: CancellationToken,
}

impl Drop for TaskShared {
    fn drop(&mut self) {
        self.lifetime.cancel();
        for fetcher in &lock(&self.data).fetchers {
            fetcher.stop();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to one download.
///
/// Clones share the same task. When the last handle is dropped the driver
/// stops and in-flight fetchers are stopped.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use downloader_core::download::{DownloadTask, TaskContext, TaskEvent};
/// use downloader_core::history::MemoryHistoryStore;
///
/// # async fn example() {
/// let context = TaskContext::new(Arc::new(MemoryHistoryStore::new()));
/// let task = DownloadTask::new(1, "https://example.com/big.iso", "/tmp/big.iso", 4, context);
/// let mut events = task.subscribe();
/// task.start();
/// while let Some(event) = events.recv().await {
///     if event == TaskEvent::Finished {
///         break;
///     }
/// }
/// println!("{} is {}", task.file_name(), task.status());
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct DownloadTask {
    shared: Arc<TaskShared>,
}

impl DownloadTask {
    /// Creates a pending task.
    ///
    /// `chunk_count` is the requested number of chunks; the probe may lower
    /// it to 1.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime, since the task driver is
    /// spawned immediately.
    #[must_use]
    pub fn new(
        id: u64,
        url: impl Into<String>,
        file_path: impl Into<PathBuf>,
        chunk_count: usize,
        context: TaskContext,
    ) -> Self {
        let file_path = file_path.into();
        let (work_tx, work_rx) = mpsc::unbounded_channel();
        let lifetime = CancellationToken::new();
        let shared = Arc::new(TaskShared {
            id,
            url: url.into(),
            file_name: filename_from_path(&file_path),
            file_path,
            requested_chunks: chunk_count.max(1),
            client: context.client,
            pool: context.pool,
            history: context.history,
            options: context.options,
            status: Mutex::new(TaskStatus::Pending),
            data: Mutex::new(TaskData::default()),
            sampler: Mutex::new(None),
            listeners: Mutex::new(Vec::new()),
            work_tx,
            lifetime: lifetime.clone(),
        });
        tokio::spawn(drive(Arc::downgrade(&shared), work_rx, lifetime));
        Self { shared }
    }

    /// Registers a new observer. Events published before the call are not
    /// replayed.
    #[must_use]
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<TaskEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.shared.listeners).push(tx);
        rx
    }

    /// Starts a Pending or Failed task; resumes a Paused one.
    ///
    /// The probe runs in the background; this returns immediately.
    pub fn start(&self) {
        self.shared.start();
    }

    /// Stops every fetcher and moves Downloading to Paused.
    pub fn pause(&self) {
        self.shared.pause();
    }

    /// Resubmits every unfinished fetcher and moves Paused to Downloading.
    pub fn resume(&self) {
        self.shared.resume();
    }

    /// Cancels a task that is not already terminal.
    ///
    /// With `delete_temp_files` the chunk files are removed once every
    /// fetcher has gone idle. History and `Finished` follow asynchronously.
    pub fn cancel(&self, delete_temp_files: bool) {
        self.shared.cancel(delete_temp_files);
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.shared.url
    }

    #[must_use]
    pub fn file_path(&self) -> &Path {
        &self.shared.file_path
    }

    #[must_use]
    pub fn file_name(&self) -> &str {
        &self.shared.file_name
    }

    #[must_use]
    pub fn status(&self) -> TaskStatus {
        self.shared.status()
    }

    /// Probed size; `None` before the probe or when the server omits it.
    #[must_use]
    pub fn total_size(&self) -> Option<u64> {
        lock(&self.shared.data).total_size
    }

    #[must_use]
    pub fn downloaded_size(&self) -> u64 {
        lock(&self.shared.data).downloaded
    }

    /// Bytes per second over the last sample interval.
    #[must_use]
    pub fn speed(&self) -> u64 {
        lock(&self.shared.data).speed
    }

    /// `floor(100 * downloaded / total)`, 0 when the total is unknown.
    #[must_use]
    pub fn progress_percentage(&self) -> u8 {
        let data = lock(&self.shared.data);
        percentage(data.downloaded, data.total_size)
    }

    /// Consistent view of downloaded, total and speed.
    #[must_use]
    pub fn progress(&self) -> ProgressSnapshot {
        lock(&self.shared.data).snapshot()
    }

    #[must_use]
    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        lock(&self.shared.data).start_time
    }

    #[must_use]
    pub fn finish_time(&self) -> Option<DateTime<Utc>> {
        lock(&self.shared.data).finish_time
    }

    /// Message of the error that failed the task.
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        lock(&self.shared.data).last_error.clone()
    }

    /// Effective chunk count; 0 until the probe has completed.
    #[must_use]
    pub fn chunk_count(&self) -> usize {
        lock(&self.shared.data).chunk_count
    }

    #[must_use]
    pub fn requested_chunk_count(&self) -> usize {
        self.shared.requested_chunks
    }
}

fn percentage(downloaded: u64, total: Option<u64>) -> u8 {
    match total {
        Some(total) if total > 0 => {
            let pct = u128::from(downloaded) * 100 / u128::from(total);
            u8::try_from(pct.min(100)).unwrap_or(100)
        }
        _ => 0,
    }
}

async fn drive(
    task: Weak<TaskShared>,
    mut work: mpsc::UnboundedReceiver<TaskWork>,
    lifetime: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            () = lifetime.cancelled() => break,
            next = work.recv() => next,
        };
        let Some(item) = next else { break };
        let Some(shared) = task.upgrade() else { break };
        shared.handle(item).await;
    }
    debug!("task driver stopped");
}

impl TaskShared {
    fn status(&self) -> TaskStatus {
        *lock(&self.status)
    }

    fn is_active(&self) -> bool {
        matches!(self.status(), TaskStatus::Downloading | TaskStatus::Paused)
    }

    /// Moves to `to` if `allowed(current)`; returns whether it did.
    fn transition(&self, allowed: impl FnOnce(TaskStatus) -> bool, to: TaskStatus) -> bool {
        let mut status = lock(&self.status);
        if !allowed(*status) {
            return false;
        }
        debug!(task_id = self.id, from = %*status, to = %to, "status change");
        *status = to;
        true
    }

    fn emit(&self, event: TaskEvent) {
        lock(&self.listeners).retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn fetchers(&self) -> Vec<Arc<ChunkFetcher>> {
        lock(&self.data).fetchers.clone()
    }

    fn start(self: &Arc<Self>) {
        let (generation, previous) = {
            let mut status = lock(&self.status);
            let current = *status;
            match current {
                TaskStatus::Paused => {
                    drop(status);
                    self.resume();
                    return;
                }
                TaskStatus::Pending | TaskStatus::Failed => {}
                other => {
                    debug!(task_id = self.id, status = %other, "start ignored");
                    return;
                }
            }
            let mut data = lock(&self.data);
            let previous: Vec<_> = data.fetchers.drain(..).collect();
            for fetcher in &previous {
                fetcher.stop();
            }
            let generation = data.generation + 1;
            *data = TaskData {
                generation,
                start_time: Some(Utc::now()),
                ..TaskData::default()
            };
            *status = TaskStatus::Downloading;
            (generation, previous)
        };

        info!(task_id = self.id, url = %self.url, "download started");
        self.emit(TaskEvent::StatusChanged(TaskStatus::Downloading));

        let client = self.client.clone();
        let url = self.url.clone();
        let timeout = self.options.probe_timeout;
        let tx = self.work_tx.clone();
        let lifetime = self.lifetime.clone();
        tokio::spawn(async move {
            for fetcher in &previous {
                fetcher.wait_idle().await;
            }
            let result = tokio::select! {
                () = lifetime.cancelled() => return,
                result = client.probe(&url, timeout) => result,
            };
            let _ = tx.send(TaskWork::Probed { generation, result });
        });
    }

    fn pause(&self) {
        if !self.transition(|s| s == TaskStatus::Downloading, TaskStatus::Paused) {
            return;
        }
        self.stop_sampler();
        let fetchers = {
            let mut data = lock(&self.data);
            data.speed = 0;
            data.fetchers.clone()
        };
        for fetcher in &fetchers {
            fetcher.stop();
        }
        info!(task_id = self.id, "download paused");
        self.emit(TaskEvent::StatusChanged(TaskStatus::Paused));
    }

    fn resume(self: &Arc<Self>) {
        if !self.transition(|s| s == TaskStatus::Paused, TaskStatus::Downloading) {
            return;
        }
        let (pending, generation) = {
            let data = lock(&self.data);
            let pending: Vec<_> = data
                .fetchers
                .iter()
                .filter(|f| !data.completed.get(f.index()).copied().unwrap_or(false))
                .cloned()
                .collect();
            (pending, data.generation)
        };
        for fetcher in &pending {
            fetcher.rearm();
        }
        self.start_sampler();
        self.submit(&pending, generation);
        info!(task_id = self.id, chunks = pending.len(), "download resumed");
        self.emit(TaskEvent::StatusChanged(TaskStatus::Downloading));
    }

    fn cancel(&self, delete_temp_files: bool) {
        if !self.transition(|s| !s.is_terminal(), TaskStatus::Cancelled) {
            return;
        }
        self.stop_sampler();
        let fetchers = {
            let mut data = lock(&self.data);
            data.finish_time = Some(Utc::now());
            data.speed = 0;
            data.fetchers.clone()
        };
        for fetcher in &fetchers {
            fetcher.stop();
        }
        info!(task_id = self.id, delete_temp_files, "download cancelled");
        self.emit(TaskEvent::StatusChanged(TaskStatus::Cancelled));
        let _ = self.work_tx.send(TaskWork::Cancelled { delete_temp_files });
    }

    fn submit(&self, fetchers: &[Arc<ChunkFetcher>], generation: u64) {
        for fetcher in fetchers {
            let tx = self.work_tx.clone();
            let job = Arc::clone(fetcher);
            let index = fetcher.index();
            let stop = fetcher.token();
            tokio::spawn(async move {
                if stop.is_cancelled() {
                    return;
                }
                job.run(|event| {
                    let _ = tx.send(TaskWork::Fetcher {
                        generation,
                        index,
                        event,
                    });
                })
                .await;
            });
        }
    }

    fn start_sampler(self: &Arc<Self>) {
        let token = self.lifetime.child_token();
        if let Some(previous) = lock(&self.sampler).replace(token.clone()) {
            previous.cancel();
        }
        let task = Arc::downgrade(self);
        let period = self.options.speed_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(shared) = task.upgrade() else { break };
                shared.sample_speed(period);
            }
        });
    }

    fn stop_sampler(&self) {
        if let Some(token) = lock(&self.sampler).take() {
            token.cancel();
        }
    }

    /// Samples the byte counter and publishes a Progress event.
    ///
    /// The status lock is held until the event is out, so a sample never
    /// trails the `Paused` or terminal status event.
    fn sample_speed(&self, period: Duration) {
        let status = lock(&self.status);
        if *status != TaskStatus::Downloading {
            return;
        }
        let snapshot = {
            let mut data = lock(&self.data);
            let delta = data.downloaded.saturating_sub(data.last_sample);
            data.last_sample = data.downloaded;
            let millis = u64::try_from(period.as_millis()).unwrap_or(u64::MAX).max(1);
            data.speed = delta.saturating_mul(1000) / millis;
            data.snapshot()
        };
        self.emit(TaskEvent::Progress(snapshot));
        drop(status);
    }

    async fn handle(self: &Arc<Self>, work: TaskWork) {
        match work {
            TaskWork::Probed { generation, result } => self.on_probed(generation, result).await,
            TaskWork::Fetcher {
                generation,
                index,
                event,
            } => self.on_fetch_event(generation, index, event).await,
            TaskWork::Cancelled { delete_temp_files } => {
                self.on_cancelled(delete_temp_files).await;
            }
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        lock(&self.data).generation == generation
    }

    #[instrument(skip(self, result), fields(task_id = self.id))]
    async fn on_probed(
        self: &Arc<Self>,
        generation: u64,
        result: Result<ProbeResult, DownloadError>,
    ) {
        if !self.is_current(generation) || !self.is_active() {
            debug!("stale probe result ignored");
            return;
        }
        let probe = match result {
            Ok(probe) => probe,
            Err(e) => {
                self.fail(e.to_string()).await;
                return;
            }
        };

        let mut chunk_count = self.requested_chunks;
        if probe.content_length.is_none() {
            chunk_count = 1;
        } else if !probe.accepts_ranges && chunk_count > 1 {
            info!("server does not accept ranges, using a single chunk");
            chunk_count = 1;
        }

        let fetchers: Vec<Arc<ChunkFetcher>> = plan_chunks(probe.content_length, chunk_count)
            .into_iter()
            .enumerate()
            .map(|(index, range)| {
                Arc::new(ChunkFetcher::new(
                    index,
                    self.url.as_str(),
                    range,
                    &self.file_path,
                    self.client.clone(),
                    self.options.transfer_timeout,
                    self.options.retry_policy.clone(),
                )
                .with_pool(self.pool.clone()))
            })
            .collect();

        let mut on_disk = 0;
        for fetcher in &fetchers {
            on_disk += fetcher.bytes_on_disk().await;
        }

        let snapshot = {
            let mut data = lock(&self.data);
            if data.generation != generation {
                return;
            }
            data.total_size = probe.content_length;
            data.chunk_count = fetchers.len();
            data.completed = vec![false; fetchers.len()];
            data.finished = 0;
            data.downloaded = on_disk;
            data.last_sample = on_disk;
            data.fetchers.clone_from(&fetchers);
            data.snapshot()
        };
        info!(
            total = ?probe.content_length,
            chunks = fetchers.len(),
            resumed_bytes = on_disk,
            "probe complete"
        );
        self.emit(TaskEvent::Progress(snapshot));

        if self.status() == TaskStatus::Downloading {
            self.start_sampler();
            self.submit(&fetchers, generation);
        }
    }

    async fn on_fetch_event(self: &Arc<Self>, generation: u64, index: usize, event: FetchEvent) {
        if !self.is_active() {
            return;
        }
        match event {
            FetchEvent::Progress(bytes) => {
                let status = lock(&self.status);
                let snapshot = {
                    let mut data = lock(&self.data);
                    if data.generation != generation {
                        return;
                    }
                    data.downloaded += bytes;
                    data.snapshot()
                };
                // Frames written just before a pause still count, silently.
                if *status == TaskStatus::Downloading {
                    self.emit(TaskEvent::Progress(snapshot));
                }
            }
            FetchEvent::Completed => {
                let all_done = {
                    let mut data = lock(&self.data);
                    if data.generation != generation {
                        return;
                    }
                    match data.completed.get_mut(index) {
                        Some(done) if !*done => *done = true,
                        _ => return,
                    }
                    data.finished += 1;
                    debug!(
                        task_id = self.id,
                        chunk = index,
                        finished = data.finished,
                        of = data.chunk_count,
                        "chunk finished"
                    );
                    data.finished == data.chunk_count
                };
                if all_done {
                    self.finish_download().await;
                }
            }
            FetchEvent::Failed(message) => {
                if self.is_current(generation) {
                    self.fail(format!("chunk {index}: {message}")).await;
                }
            }
            FetchEvent::Stopped => {
                debug!(task_id = self.id, chunk = index, "chunk stopped");
            }
        }
    }

    async fn finish_download(&self) {
        self.stop_sampler();
        let (chunk_count, total) = {
            let data = lock(&self.data);
            (data.chunk_count, data.total_size)
        };

        let merged = merge_chunks(
            &self.file_path,
            chunk_count,
            total,
            self.options.merge_buffer_size,
        )
        .await;
        delete_part_files(&self.file_path, chunk_count).await;

        let written = match merged {
            Ok(written) => written,
            Err(_) if self.status() == TaskStatus::Cancelled => {
                self.discard_output().await;
                return;
            }
            Err(e) => {
                self.fail(e.to_string()).await;
                return;
            }
        };
        if !self.transition(
            |s| matches!(s, TaskStatus::Downloading | TaskStatus::Paused),
            TaskStatus::Completed,
        ) {
            // Cancelled while merging.
            self.discard_output().await;
            return;
        }

        let snapshot = {
            let mut data = lock(&self.data);
            let total = data.total_size.unwrap_or(written);
            data.total_size = Some(total);
            data.downloaded = total;
            data.speed = 0;
            data.finish_time = Some(Utc::now());
            data.snapshot()
        };
        info!(task_id = self.id, bytes = written, path = %self.file_path.display(), "download completed");
        self.emit(TaskEvent::StatusChanged(TaskStatus::Completed));
        self.emit(TaskEvent::Progress(snapshot));
        self.record_history(RecordStatus::Completed).await;
        self.emit(TaskEvent::Finished);
    }

    async fn discard_output(&self) {
        info!(task_id = self.id, "cancelled during merge, removing output");
        match tokio::fs::remove_file(&self.file_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(task_id = self.id, error = %e, "failed to remove merged file"),
        }
    }

    async fn fail(&self, message: String) {
        if !self.transition(
            |s| {
                matches!(
                    s,
                    TaskStatus::Pending | TaskStatus::Downloading | TaskStatus::Paused
                )
            },
            TaskStatus::Failed,
        ) {
            debug!(task_id = self.id, error = %message, "error after terminal state ignored");
            return;
        }
        self.stop_sampler();
        let fetchers = {
            let mut data = lock(&self.data);
            data.last_error = Some(message.clone());
            data.finish_time = Some(Utc::now());
            data.speed = 0;
            data.fetchers.clone()
        };
        for fetcher in &fetchers {
            fetcher.stop();
        }

        warn!(task_id = self.id, error = %message, "download failed");
        self.emit(TaskEvent::StatusChanged(TaskStatus::Failed));
        self.record_history(RecordStatus::Failed).await;
        self.emit(TaskEvent::Error(message));
        self.emit(TaskEvent::Finished);
    }

    async fn on_cancelled(&self, delete_temp_files: bool) {
        for fetcher in &self.fetchers() {
            fetcher.wait_idle().await;
        }
        if delete_temp_files {
            let chunk_count = lock(&self.data).chunk_count.max(self.requested_chunks);
            delete_part_files(&self.file_path, chunk_count).await;
        }
        self.record_history(RecordStatus::Cancelled).await;
        self.emit(TaskEvent::Finished);
    }

    async fn record_history(&self, status: RecordStatus) {
        let record = {
            let data = lock(&self.data);
            DownloadRecord {
                url: self.url.clone(),
                file_path: self.file_path.clone(),
                file_name: self.file_name.clone(),
                file_size: data.total_size.unwrap_or(data.downloaded),
                start_time: data.start_time,
                finish_time: data.finish_time,
                status,
            }
        };
        if let Err(e) = self.history.add_record(record).await {
            warn!(task_id = self.id, error = %e, "failed to record history");
        }
    }
}
