//! Byte-range partitioning of a resource into chunks.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Inclusive byte range assigned to one chunk.
///
/// `end` is `None` only for the single chunk of a resource whose size is
/// unknown; such a chunk runs until the server closes the body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRange {
    /// First byte of the chunk.
    pub start: u64,
    /// Last byte of the chunk (inclusive).
    pub end: Option<u64>,
}

impl ChunkRange {
    /// Creates a closed range `[start, end]`.
    #[must_use]
    pub fn new(start: u64, end: u64) -> Self {
        Self {
            start,
            end: Some(end),
        }
    }

    /// Creates an open-ended range starting at `start`.
    #[must_use]
    pub fn open(start: u64) -> Self {
        Self { start, end: None }
    }

    /// Number of bytes covered, `None` for an open-ended range.
    #[must_use]
    pub fn len(&self) -> Option<u64> {
        self.end.map(|end| end.saturating_sub(self.start) + 1)
    }

    /// Returns true for a closed range that covers no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.end.is_some_and(|end| end < self.start)
    }
}

/// Splits a resource of `total_size` bytes into `chunk_count` ranges.
///
/// With an unknown size, a single open-ended range is returned. Otherwise
/// `chunk_size = total / n`; chunk `i` starts at `i * chunk_size` and the
/// last chunk absorbs the remainder up to `total - 1`. The chunk count is
/// clamped to `1..=total` so no chunk is empty.
#[must_use]
pub fn plan_chunks(total_size: Option<u64>, chunk_count: usize) -> Vec<ChunkRange> {
    let Some(total) = total_size.filter(|t| *t > 0) else {
        return vec![ChunkRange::open(0)];
    };

    let n = u64::try_from(chunk_count.max(1)).unwrap_or(u64::MAX).min(total);
    let chunk_size = total / n;
    (0..n)
        .map(|i| {
            let start = i * chunk_size;
            let end = if i == n - 1 {
                total - 1
            } else {
                start + chunk_size - 1
            };
            ChunkRange::new(start, end)
        })
        .collect()
}

/// Path of chunk `index` of `final_path`: `<final_path>.part<index>`.
#[must_use]
pub fn part_file_path(final_path: &Path, index: usize) -> PathBuf {
    let mut name = OsString::from(final_path.as_os_str());
    name.push(format!(".part{index}"));
    PathBuf::from(name)
}
