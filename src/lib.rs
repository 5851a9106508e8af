//! Downloader Core Library
//!
//! This library provides a multi-threaded segmented HTTP download engine:
//! a resource is probed, split into byte ranges fetched concurrently into
//! part files, and merged into the destination once every range is done.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`download`] - Chunk fetchers, the task state machine and the merge step
//! - [`registry`] - Task creation and lifecycle event routing
//! - [`history`] - Records of finished downloads (JSON, SQLite, in-memory)
//! - [`config`] - User settings
//! - [`request`] - Inbound download requests and destination resolution
//! - [`db`] - SQLite file backing the history table

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod db;
pub mod download;
pub mod history;
pub mod registry;
pub mod request;
pub(crate) mod user_agent;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export commonly used types
pub use config::{ConfigError, HistoryBackend, Settings};
pub use db::{Database, DbError};
pub use download::{
    ChunkFetcher, ChunkRange, DEFAULT_CHUNK_COUNT, DEFAULT_MAX_RETRIES, DownloadError,
    DownloadTask, HttpClient, MAX_CHUNK_COUNT, RetryPolicy, TaskContext, TaskEvent, TaskOptions,
    TaskStatus, WorkerPool, classify_error, merge_chunks, part_file_path, plan_chunks,
};
pub use history::{
    DownloadRecord, HistoryError, HistoryStore, JsonHistoryStore, MemoryHistoryStore,
    RecordStatus, SqliteHistoryStore,
};
pub use registry::{EngineError, RegistryEvent, TaskRegistry};
pub use request::DownloadRequest;
