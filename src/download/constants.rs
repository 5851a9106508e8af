//! Constants for the download module (timeouts, retry, chunking).

use std::time::Duration;

/// Default HTTP connect timeout (30 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Timeout for the HEAD probe issued before any chunk is fetched.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(20);

/// Inactivity timeout for a chunk transfer. Renewed by every received frame.
pub const TRANSFER_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval of the speed sampler.
pub const SPEED_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// Buffer size used when concatenating chunk files (1 MiB).
pub const MERGE_BUFFER_SIZE: usize = 1024 * 1024;

/// Default number of chunks per task.
pub const DEFAULT_CHUNK_COUNT: usize = 5;

/// Upper bound on chunks per task.
pub const MAX_CHUNK_COUNT: usize = 32;
