//! Download history: one record per finished task.
//!
//! Tasks write a [`DownloadRecord`] through the [`HistoryStore`] trait each
//! time they reach a terminal state. Three backends are provided:
//! - [`JsonHistoryStore`] - a JSON array in a single file
//! - [`SqliteHistoryStore`] - a migration-managed `SQLite` table
//! - [`MemoryHistoryStore`] - process-local, for tests and ephemeral runs

mod json;
mod memory;
mod sqlite;

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use json::JsonHistoryStore;
pub use memory::MemoryHistoryStore;
pub use sqlite::SqliteHistoryStore;

/// Terminal status stored with a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordStatus {
    /// The file was merged and verified.
    Completed,
    /// The probe, a chunk or the merge failed.
    Failed,
    /// The task was cancelled.
    Cancelled,
}

impl RecordStatus {
    /// Returns the stored string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Cancelled => "Cancelled",
        }
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for RecordStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Completed" => Ok(Self::Completed),
            "Failed" => Ok(Self::Failed),
            "Cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("invalid record status: {s}")),
        }
    }
}

/// A finished download.
///
/// Serialized with camelCase keys; `fileSize` is written as a decimal string
/// and timestamps as ISO-8601.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRecord {
    pub url: String,
    pub file_path: PathBuf,
    pub file_name: String,
    #[serde(with = "size_string")]
    pub file_size: u64,
    #[serde(with = "iso_time", default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(with = "iso_time", default)]
    pub finish_time: Option<DateTime<Utc>>,
    pub status: RecordStatus,
}

/// Errors raised by history backends.
#[derive(Debug, Error)]
pub enum HistoryError {
    /// Reading or writing the history file failed.
    #[error("history IO error on {path}: {source}")]
    Io {
        /// The history file.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The history file is not a valid JSON array of records.
    #[error("invalid history JSON in {path}: {source}")]
    Json {
        /// The history file.
        path: PathBuf,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// A database query failed.
    #[error("history database error: {0}")]
    Database(String),
}

impl HistoryError {
    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates a JSON error.
    pub fn json(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        Self::Json {
            path: path.into(),
            source,
        }
    }

    /// Creates a database error from anything displayable.
    pub fn database(error: impl fmt::Display) -> Self {
        Self::Database(error.to_string())
    }
}

/// Persistent log of finished downloads.
///
/// Records are kept in insertion order; `delete_record` indexes into the
/// order returned by `get_history`.
#[async_trait]
pub trait HistoryStore: Send + Sync + fmt::Debug {
    /// Appends a record.
    ///
    /// # Errors
    ///
    /// Returns `HistoryError` if the record cannot be persisted. The store is
    /// left unchanged on failure.
    async fn add_record(&self, record: DownloadRecord) -> Result<(), HistoryError>;

    /// Returns all records, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `HistoryError` if the backend cannot be read.
    async fn get_history(&self) -> Result<Vec<DownloadRecord>, HistoryError>;

    /// Removes every record.
    ///
    /// # Errors
    ///
    /// Returns `HistoryError` if the backend cannot be written.
    async fn clear_history(&self) -> Result<(), HistoryError>;

    /// Removes the record at `index`; returns false when out of range.
    ///
    /// # Errors
    ///
    /// Returns `HistoryError` if the backend cannot be written.
    async fn delete_record(&self, index: usize) -> Result<bool, HistoryError>;
}

mod size_string {
    use serde::{Deserialize, Deserializer, Serializer, de};

    pub fn serialize<S: Serializer>(size: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&size.to_string())
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(u64),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Ok(n),
            Raw::Text(s) if s.trim().is_empty() => Ok(0),
            Raw::Text(s) => s.trim().parse().map_err(de::Error::custom),
        }
    }
}

mod iso_time {
    use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::ref_option)]
    pub fn serialize<S: Serializer>(
        time: &Option<DateTime<Utc>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match time {
            Some(t) => serializer.serialize_str(&t.to_rfc3339_opts(SecondsFormat::Secs, true)),
            None => serializer.serialize_str(""),
        }
    }

    /// Accepts RFC 3339 and zone-less `YYYY-MM-DDTHH:MM:SS` (read as UTC).
    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
        Ok(parse(&raw))
    }

    pub(crate) fn parse(raw: &str) -> Option<DateTime<Utc>> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        DateTime::parse_from_rfc3339(raw)
            .map(|t| t.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S")
                    .ok()
                    .map(|t| t.and_utc())
            })
    }
}

pub(crate) use iso_time::parse as parse_iso_time;
