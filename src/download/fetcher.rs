//! Ranged transfer of a single chunk into its chunk file.
//!
//! A [`ChunkFetcher`] owns one byte range of a download. Each run resumes
//! from whatever is already in the chunk file: the file is opened for append
//! and the request starts at `range.start + bytes_on_disk`. Transient failures
//! are retried in place; a stop request aborts the in-flight request and ends
//! the run without an error.
//!
//! Only dispatching a request and appending a frame to the chunk file take a
//! [`WorkerPool`] worker. Waiting for response headers and body frames does
//! not, so the pool size never caps how many chunks are in flight.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::StatusCode;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::chunk::{ChunkRange, part_file_path};
use super::client::HttpClient;
use super::error::DownloadError;
use super::pool::WorkerPool;
use super::retry::{RetryDecision, RetryPolicy, classify_error};

/// Event reported by a fetcher run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchEvent {
    /// Bytes appended to the chunk file since the previous report.
    Progress(u64),
    /// The whole range is on disk.
    Completed,
    /// The run failed and will not be retried.
    Failed(String),
    /// The run ended because the fetcher was stopped. Not an error.
    Stopped,
}

enum Outcome {
    Completed,
    Stopped,
}

/// Downloads one byte range of `url` into `<final_path>.part<index>`.
///
/// Fetchers are shared behind an `Arc`: the owning task calls [`stop`] and
/// [`rearm`] while a spawned Tokio task executes [`run`]. Runs are
/// serialized, so a resubmitted fetcher never writes concurrently with a
/// stopping one.
///
/// [`stop`]: ChunkFetcher::stop
/// [`rearm`]: ChunkFetcher::rearm
/// [`run`]: ChunkFetcher::run
#[derive(Debug)]
pub struct ChunkFetcher {
    index: usize,
    url: String,
    range: ChunkRange,
    part_path: PathBuf,
    client: HttpClient,
    transfer_timeout: Duration,
    retry_policy: RetryPolicy,
    pool: WorkerPool,
    stop: Mutex<CancellationToken>,
    run_lock: tokio::sync::Mutex<()>,
}

impl ChunkFetcher {
    /// Creates a fetcher for chunk `index` of `final_path`.
    ///
    /// # Arguments
    ///
    /// * `transfer_timeout` - Inactivity limit; renewed by every received frame
    /// * `retry_policy` - Applied to transient failures, counted per run
    #[must_use]
    pub fn new(
        index: usize,
        url: impl Into<String>,
        range: ChunkRange,
        final_path: &Path,
        client: HttpClient,
        transfer_timeout: Duration,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            index,
            url: url.into(),
            range,
            part_path: part_file_path(final_path, index),
            client,
            transfer_timeout,
            retry_policy,
            pool: WorkerPool::new(1),
            stop: Mutex::new(CancellationToken::new()),
            run_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Shares `pool` for request dispatch and chunk file writes.
    #[must_use]
    pub fn with_pool(mut self, pool: WorkerPool) -> Self {
        self.pool = pool;
        self
    }

    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    #[must_use]
    pub fn range(&self) -> ChunkRange {
        self.range
    }

    /// Path of this fetcher's chunk file.
    #[must_use]
    pub fn part_path(&self) -> &Path {
        &self.part_path
    }

    /// Returns true once [`ChunkFetcher::stop`] was called and not yet re-armed.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.token().is_cancelled()
    }

    /// The current stop token; cancelled when the fetcher is stopped.
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.stop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Requests the fetcher to stop. Idempotent and callable from anywhere.
    ///
    /// An in-flight request is dropped and data received afterwards is
    /// discarded. The chunk file is closed, never deleted.
    pub fn stop(&self) {
        self.token().cancel();
    }

    /// Clears a previous stop so the fetcher can run again.
    pub fn rearm(&self) {
        let mut token = self.stop.lock().unwrap_or_else(PoisonError::into_inner);
        if token.is_cancelled() {
            *token = CancellationToken::new();
        }
    }

    /// Waits until no run is in progress.
    pub async fn wait_idle(&self) {
        let _idle = self.run_lock.lock().await;
    }

    /// Size of the chunk file, 0 if it does not exist yet.
    pub async fn bytes_on_disk(&self) -> u64 {
        let on_disk = tokio::fs::metadata(&self.part_path)
            .await
            .map_or(0, |m| m.len());
        match self.range.len() {
            Some(len) => on_disk.min(len),
            None => on_disk,
        }
    }

    /// Transfers the remaining part of the range, reporting through `report`.
    ///
    /// Does nothing if the fetcher is already stopped when the run begins.
    /// Every run ends with exactly one of [`FetchEvent::Completed`],
    /// [`FetchEvent::Failed`] or [`FetchEvent::Stopped`].
    #[instrument(skip(self, report), fields(url = %self.url, chunk = self.index))]
    pub async fn run<R>(&self, mut report: R)
    where
        R: FnMut(FetchEvent) + Send,
    {
        let _running = self.run_lock.lock().await;
        let stop = self.token();
        if stop.is_cancelled() {
            debug!("fetcher stopped before start");
            return;
        }

        match self.transfer_with_retry(&stop, &mut report).await {
            Ok(Outcome::Completed) => {
                debug!("chunk complete");
                report(FetchEvent::Completed);
            }
            Ok(Outcome::Stopped) => {
                debug!("chunk stopped");
                report(FetchEvent::Stopped);
            }
            Err(e) => {
                warn!(error = %e, "chunk failed");
                report(FetchEvent::Failed(e.to_string()));
            }
        }
    }

    async fn transfer_with_retry<R>(
        &self,
        stop: &CancellationToken,
        report: &mut R,
    ) -> Result<Outcome, DownloadError>
    where
        R: FnMut(FetchEvent) + Send,
    {
        let mut retries_done = 0;
        loop {
            let error = match self.transfer_once(stop, report).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) => e,
            };
            if stop.is_cancelled() {
                return Ok(Outcome::Stopped);
            }

            match self
                .retry_policy
                .should_retry(classify_error(&error), retries_done)
            {
                RetryDecision::Retry { delay, attempt } => {
                    info!(
                        attempt,
                        delay_ms = delay.as_millis(),
                        error = %error,
                        "retrying chunk"
                    );
                    retries_done = attempt;
                    tokio::select! {
                        () = stop.cancelled() => return Ok(Outcome::Stopped),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                RetryDecision::DoNotRetry { reason } => {
                    debug!(reason = %reason, "not retrying chunk");
                    return Err(error);
                }
            }
        }
    }

    async fn transfer_once<R>(
        &self,
        stop: &CancellationToken,
        report: &mut R,
    ) -> Result<Outcome, DownloadError>
    where
        R: FnMut(FetchEvent) + Send,
    {
        let (mut file, existing) = self.open_part_file().await?;
        let effective_start = self.range.start + existing;
        if let Some(end) = self.range.end
            && effective_start > end
        {
            debug!(existing, "chunk already on disk");
            return Ok(Outcome::Completed);
        }

        let client = self.client.clone();
        let url = self.url.clone();
        let end = self.range.end;
        let timeout = self.transfer_timeout;
        let dispatch = async move {
            tokio::spawn(async move { client.get_range(&url, effective_start, end, timeout).await })
        };
        let Some(mut pending) = self.pool.run(stop, dispatch).await else {
            return Ok(Outcome::Stopped);
        };
        let response = tokio::select! {
            biased;
            () = stop.cancelled() => {
                pending.abort();
                return Ok(Outcome::Stopped);
            }
            joined = &mut pending => joined
                .map_err(|e| DownloadError::io(&self.part_path, std::io::Error::other(e)))??,
        };

        // A server that ignores Range replays the resource from byte 0.
        let mut skip = if response.status() == StatusCode::OK {
            effective_start
        } else {
            0
        };
        let mut remaining = self.range.end.map(|end| end + 1 - effective_start);
        debug!(
            status = response.status().as_u16(),
            effective_start, skip, "chunk response"
        );

        let mut stream = response.bytes_stream();
        loop {
            let next = tokio::select! {
                biased;
                () = stop.cancelled() => {
                    // Let an in-flight append land before the run ends.
                    let _ = file.flush().await;
                    return Ok(Outcome::Stopped);
                }
                next = tokio::time::timeout(self.transfer_timeout, stream.next()) => next,
            };
            let frame = match next {
                Err(_) => return Err(DownloadError::timeout(&self.url)),
                Ok(None) => break,
                Ok(Some(frame)) => frame.map_err(|e| DownloadError::network(&self.url, e))?,
            };

            let mut data: &[u8] = &frame;
            if skip > 0 {
                let dropped = usize::try_from(skip).unwrap_or(usize::MAX).min(data.len());
                data = &data[dropped..];
                skip -= dropped as u64;
            }
            if let Some(left) = remaining {
                let keep = usize::try_from(left).unwrap_or(usize::MAX).min(data.len());
                data = &data[..keep];
            }
            if data.is_empty() {
                if remaining == Some(0) {
                    break;
                }
                continue;
            }
            let appended = self.pool.run(stop, file.write_all(data)).await;
            let Some(appended) = appended else {
                let _ = file.flush().await;
                return Ok(Outcome::Stopped);
            };
            appended.map_err(|e| DownloadError::io(&self.part_path, e))?;
            let written = data.len() as u64;
            report(FetchEvent::Progress(written));

            if let Some(left) = remaining.as_mut() {
                *left -= written;
                if *left == 0 {
                    break;
                }
            }
        }

        file.flush()
            .await
            .map_err(|e| DownloadError::io(&self.part_path, e))?;
        Ok(Outcome::Completed)
    }

    /// Opens the chunk file for append, creating it if needed.
    ///
    /// A file longer than the range is truncated to the range length.
    async fn open_part_file(&self) -> Result<(File, u64), DownloadError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.part_path)
            .await
            .map_err(|e| DownloadError::io(&self.part_path, e))?;
        let mut existing = file
            .metadata()
            .await
            .map_err(|e| DownloadError::io(&self.part_path, e))?
            .len();

        if let Some(len) = self.range.len()
            && existing > len
        {
            warn!(existing, len, "chunk file longer than range, truncating");
            file.set_len(len)
                .await
                .map_err(|e| DownloadError::io(&self.part_path, e))?;
            existing = len;
        }
        Ok((file, existing))
    }
}
