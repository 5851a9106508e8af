//! Segmented HTTP download engine.
//!
//! This module splits a remote resource into byte ranges, fetches them
//! concurrently into chunk files and merges the chunks into the final file.
//!
//! # Features
//!
//! - HEAD probe for size and range support (falls back to one chunk)
//! - Per-chunk resume by appending to existing chunk files
//! - Bounded worker pool shared by all tasks
//! - Linear-backoff retry of transient transfer failures
//! - Pause, resume and cancel without waiting on the network
//! - Aggregate progress with a 1 s speed sampler
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use downloader_core::download::{DownloadTask, TaskContext};
//! use downloader_core::history::MemoryHistoryStore;
//!
//! # async fn example() {
//! let context = TaskContext::new(Arc::new(MemoryHistoryStore::new()));
//! let task = DownloadTask::new(1, "https://example.com/big.iso", "./big.iso", 5, context);
//! task.start();
//! # }
//! ```

mod chunk;
mod client;
mod constants;
mod error;
mod fetcher;
mod filename;
mod merge;
mod pool;
mod retry;
mod status;
mod task;

pub use chunk::{ChunkRange, part_file_path, plan_chunks};
pub use client::{HttpClient, ProbeResult};
pub use constants::{DEFAULT_CHUNK_COUNT, MAX_CHUNK_COUNT};
pub use error::DownloadError;
pub use fetcher::{ChunkFetcher, FetchEvent};
pub use filename::{filename_from_path, filename_from_url, sanitize_filename};
pub use merge::{delete_part_files, merge_chunks};
pub use pool::{WorkerPool, default_workers};
pub use retry::{DEFAULT_MAX_RETRIES, FailureType, RetryDecision, RetryPolicy, classify_error};
pub use status::{ProgressSnapshot, TaskEvent, TaskStatus};
pub use task::{DownloadTask, TaskContext, TaskOptions};

// Note: we do NOT define module-local Result aliases.
// Use `Result<T, DownloadError>` explicitly in function signatures.
