//! Bounded worker pool shared by every task's chunk fetchers.

use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Bounded pool for the blocking-ish steps of chunk fetchers.
///
/// Network I/O is async, so fetchers never occupy a worker while they wait
/// on the network. A worker is taken only for short steps: dispatching a
/// request and appending a received frame to a chunk file. Any number of
/// transfers can therefore be in flight while at most `workers` of those
/// steps run at once.
///
/// # Concurrency Model
///
/// - Steps wait for a worker in submission order
/// - A step whose cancellation token fires before it gets a worker never runs
/// - Workers are released as soon as the step resolves (RAII)
#[derive(Debug, Clone)]
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    workers: usize,
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(default_workers())
    }
}

/// `max(1, available_parallelism - 1)`.
#[must_use]
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map_or(1, NonZeroUsize::get)
        .saturating_sub(1)
        .max(1)
}

impl WorkerPool {
    /// Creates a pool allowing `workers` concurrent steps (at least one).
    #[must_use]
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        debug!(workers, "creating worker pool");
        Self {
            semaphore: Arc::new(Semaphore::new(workers)),
            workers,
        }
    }

    /// Returns the configured number of workers.
    #[must_use]
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Returns the number of idle workers.
    #[must_use]
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Runs `step` on a worker once one is free.
    ///
    /// Returns `None` without polling `step` if `cancel` fires while waiting.
    /// Once started, `step` runs to completion; the worker is released when
    /// it resolves.
    pub async fn run<F>(&self, cancel: &CancellationToken, step: F) -> Option<F::Output>
    where
        F: Future,
    {
        let permit = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                trace!("step cancelled while queued");
                return None;
            }
            permit = self.semaphore.acquire() => permit,
        };
        let Ok(_permit) = permit else {
            return None;
        };
        Some(step.await)
    }
}
