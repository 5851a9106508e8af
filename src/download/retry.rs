//! Retry logic with linear backoff for transient chunk transfer failures.
//!
//! This module provides the [`RetryPolicy`] and [`FailureType`] types for
//! classifying chunk errors and determining retry behavior.
//!
//! # Overview
//!
//! When a chunk transfer fails, the error is classified into a [`FailureType`]:
//! - [`FailureType::Transient`] - connection refused, remote closed, timeout,
//!   transient network failure. Retried in place by the fetcher.
//! - [`FailureType::Permanent`] - everything else. Surfaces to the task and
//!   fails the whole download.
//!
//! The [`RetryPolicy`] then decides whether to retry based on failure type
//! and the number of retries already spent, with a linear backoff.
//!
//! # Example
//!
//! ```
//! use downloader_core::download::{
//!     DownloadError, RetryPolicy, RetryDecision, classify_error
//! };
//!
//! let policy = RetryPolicy::default();
//! let error = DownloadError::timeout("https://example.com/file.iso");
//!
//! match policy.should_retry(classify_error(&error), 0) {
//!     RetryDecision::Retry { delay, attempt } => {
//!         println!("Retry {attempt} in {:?}", delay);
//!     }
//!     RetryDecision::DoNotRetry { reason } => {
//!         println!("Not retrying: {reason}");
//!     }
//! }
//! ```

use std::time::Duration;

use tracing::{debug, instrument};

use super::DownloadError;

/// Default maximum number of retries after the initial attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default backoff step; retry `n` waits `n * DEFAULT_BASE_DELAY`.
const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(2);

/// Classification of chunk failure types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// Temporary failure that may succeed on retry.
    ///
    /// Examples: connection refused, connection reset, transfer timeout.
    Transient,

    /// Failure that won't succeed regardless of retries.
    ///
    /// Examples: HTTP 404/416, TLS failures, local file system errors.
    Permanent,
}

/// Decision on whether to retry a failed chunk transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the specified delay.
    Retry {
        /// How long to wait before retrying.
        delay: Duration,
        /// Which retry this will be (1-indexed).
        attempt: u32,
    },

    /// Do not retry.
    DoNotRetry {
        /// Human-readable reason why retry is not attempted.
        reason: String,
    },
}

/// Configuration for retry behavior with linear backoff.
///
/// # Default Values
///
/// - `max_retries`: 3
/// - `base_delay`: 2 seconds
///
/// # Delay Calculation
///
/// ```text
/// delay = base_delay * attempt
/// ```
///
/// With defaults, delays are 2s, 4s, 6s.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retries (not counting the initial attempt).
    max_retries: u32,

    /// Backoff step.
    base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Creates a new retry policy.
    ///
    /// # Arguments
    ///
    /// * `max_retries` - Retries allowed after the initial attempt (0 disables retry)
    /// * `base_delay` - Backoff step multiplied by the retry number
    #[must_use]
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// Creates a policy that never retries.
    #[must_use]
    pub fn no_retry() -> Self {
        Self::new(0, Duration::ZERO)
    }

    /// Returns the maximum number of retries configured.
    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Returns the backoff step.
    #[must_use]
    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    /// Determines whether to retry a failed transfer.
    ///
    /// # Arguments
    ///
    /// * `failure_type` - Classification of the failure
    /// * `retries_done` - Retries already spent by this fetcher run
    #[instrument(skip(self), fields(max_retries = self.max_retries))]
    pub fn should_retry(&self, failure_type: FailureType, retries_done: u32) -> RetryDecision {
        if failure_type == FailureType::Permanent {
            return RetryDecision::DoNotRetry {
                reason: "permanent failure - retry would not help".to_string(),
            };
        }

        if retries_done >= self.max_retries {
            debug!(retries_done, max = self.max_retries, "retries exhausted");
            return RetryDecision::DoNotRetry {
                reason: format!("max retries ({}) exhausted", self.max_retries),
            };
        }

        let attempt = retries_done + 1;
        let delay = self.base_delay * attempt;
        debug!(attempt, delay_ms = delay.as_millis(), "will retry");

        RetryDecision::Retry { delay, attempt }
    }
}

/// Classifies a chunk error into a failure type for retry decisions.
///
/// | Error | Type | Rationale |
/// |-------|------|-----------|
/// | Timeout | Transient | Transfer stalled, the server may recover |
/// | Network (connect, reset, closed body) | Transient | Connection-level hiccup |
/// | Network (TLS, redirect loop, builder) | Permanent | Configuration problem |
/// | HttpStatus | Permanent | The server answered; asking again won't change it |
/// | Io / CreateDir / PartialWrite | Permanent | Local file system issue |
/// | InvalidUrl / MissingChunk / Integrity | Permanent | Won't succeed |
#[instrument(level = "debug")]
pub fn classify_error(error: &DownloadError) -> FailureType {
    match error {
        DownloadError::Timeout { .. } => FailureType::Transient,

        DownloadError::Network { source, .. } => {
            if is_tls_error(source) || source.is_builder() || source.is_redirect() {
                FailureType::Permanent
            } else {
                FailureType::Transient
            }
        }

        DownloadError::HttpStatus { .. }
        | DownloadError::Io { .. }
        | DownloadError::CreateDir { .. }
        | DownloadError::InvalidUrl { .. }
        | DownloadError::MissingChunk { .. }
        | DownloadError::PartialWrite { .. }
        | DownloadError::Integrity { .. } => FailureType::Permanent,
    }
}

/// Checks if a reqwest error is a TLS/certificate error.
fn is_tls_error(error: &reqwest::Error) -> bool {
    let error_string = format!("{error:?}").to_lowercase();
    error_string.contains("certificate")
        || error_string.contains("tls")
        || error_string.contains("ssl")
        || error_string.contains("handshake")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    // ==================== RetryPolicy Tests ====================

    #[test]
    fn test_retry_policy_default_values() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries(), 3);
        assert_eq!(policy.base_delay(), Duration::from_secs(2));
    }

    #[test]
    fn test_retry_policy_linear_backoff() {
        let policy = RetryPolicy::default();
        let delays: Vec<Duration> = (0..3)
            .map(|done| match policy.should_retry(FailureType::Transient, done) {
                RetryDecision::Retry { delay, .. } => delay,
                RetryDecision::DoNotRetry { reason } => panic!("unexpected: {reason}"),
            })
            .collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(6)
            ]
        );
    }

    #[test]
    fn test_retry_policy_exhausts_after_max_retries() {
        let policy = RetryPolicy::default();
        match policy.should_retry(FailureType::Transient, 3) {
            RetryDecision::DoNotRetry { reason } => assert!(reason.contains("exhausted")),
            other => panic!("expected DoNotRetry, got {other:?}"),
        }
    }

    #[test]
    fn test_retry_policy_attempt_numbering() {
        let policy = RetryPolicy::new(5, Duration::from_millis(10));
        assert_eq!(
            policy.should_retry(FailureType::Transient, 1),
            RetryDecision::Retry {
                delay: Duration::from_millis(20),
                attempt: 2
            }
        );
    }

    #[test]
    fn test_retry_policy_never_retries_permanent() {
        let policy = RetryPolicy::default();
        assert!(matches!(
            policy.should_retry(FailureType::Permanent, 0),
            RetryDecision::DoNotRetry { .. }
        ));
    }

    #[test]
    fn test_no_retry_policy() {
        let policy = RetryPolicy::no_retry();
        assert!(matches!(
            policy.should_retry(FailureType::Transient, 0),
            RetryDecision::DoNotRetry { .. }
        ));
    }

    // ==================== Classification Tests ====================

    #[test]
    fn test_classify_timeout_is_transient() {
        let error = DownloadError::timeout("https://example.com/a.bin");
        assert_eq!(classify_error(&error), FailureType::Transient);
    }

    #[test]
    fn test_classify_http_status_is_permanent() {
        for status in [404, 416, 500, 503] {
            let error = DownloadError::http_status("https://example.com/a.bin", status);
            assert_eq!(
                classify_error(&error),
                FailureType::Permanent,
                "status {status}"
            );
        }
    }

    #[test]
    fn test_classify_io_is_permanent() {
        let error = DownloadError::io(
            PathBuf::from("/tmp/a.bin.part0"),
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert_eq!(classify_error(&error), FailureType::Permanent);
    }

    #[tokio::test]
    async fn test_classify_connection_refused_is_transient() {
        // Bind then drop a listener so the port is very likely closed.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let url = format!("http://127.0.0.1:{port}/file.bin");
        let source = reqwest::Client::new().get(&url).send().await.unwrap_err();
        let error = DownloadError::network(&url, source);
        assert_eq!(classify_error(&error), FailureType::Transient);
    }
}
