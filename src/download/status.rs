//! Task status and the events a task publishes.

use std::fmt;

/// Lifecycle state of a [`DownloadTask`](super::DownloadTask).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    /// Created, never started.
    Pending,
    /// Probing or transferring.
    Downloading,
    /// Fetchers stopped; chunk files kept for resume.
    Paused,
    /// Stopped for good by the user.
    Cancelled,
    /// Merged and verified.
    Completed,
    /// Probe, chunk or merge error. Can be restarted.
    Failed,
}

impl TaskStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Downloading => "Downloading",
            Self::Paused => "Paused",
            Self::Cancelled => "Cancelled",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
        }
    }

    /// Returns true for Completed, Cancelled and Failed.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Byte counters at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressSnapshot {
    /// Bytes on disk across all chunks.
    pub downloaded: u64,
    /// Probed size, `None` until known.
    pub total: Option<u64>,
    /// Bytes per second over the last sample interval.
    pub speed: u64,
}

/// Event published to task subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskEvent {
    StatusChanged(TaskStatus),
    Progress(ProgressSnapshot),
    /// Always followed by [`TaskEvent::Finished`].
    Error(String),
    /// Emitted once per terminal transition.
    Finished,
}
