//! HTTP client wrapper for probing resources and issuing ranged GETs.
//!
//! This module provides the `HttpClient` struct which handles the HEAD probe
//! run before a task is partitioned and the per-chunk ranged requests. Only
//! request issuance lives here; streaming the body is the fetcher's job.

use std::time::Duration;

use reqwest::header::{ACCEPT, ACCEPT_RANGES, CONTENT_LENGTH, RANGE};
use reqwest::{Client, ClientBuilder, Response, StatusCode};
use tracing::{debug, instrument};
use url::Url;

use super::constants::CONNECT_TIMEOUT_SECS;
use super::error::DownloadError;
use crate::user_agent;

/// Result of probing a remote resource with a HEAD request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeResult {
    /// `Content-Length` of the resource, `None` when absent or zero.
    pub content_length: Option<u64>,
    /// Whether the server advertised `Accept-Ranges: bytes`.
    pub accepts_ranges: bool,
}

/// HTTP client for probe and chunk requests.
///
/// This client is designed to be created once and shared by every task and
/// fetcher, taking advantage of connection pooling. Cloning is cheap.
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
/// use downloader_core::download::HttpClient;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = HttpClient::new();
/// let probe = client
///     .probe("https://example.com/big.iso", Duration::from_secs(20))
///     .await?;
/// println!("size={:?} ranges={}", probe.content_length, probe.accepts_ranges);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClient {
    /// Creates a new HTTP client with the default connect timeout.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client builder fails to build with the static
    /// configuration. This should never happen in practice.
    #[must_use]
    pub fn new() -> Self {
        Self::with_connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
    }

    /// Creates a new HTTP client with an explicit connect timeout.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client builder fails to build with the supplied
    /// configuration.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn with_connect_timeout(connect_timeout: Duration) -> Self {
        let client = base_client_builder(connect_timeout)
            .build()
            .expect("failed to build HTTP client with static configuration");
        Self { client }
    }

    /// Probes `url` with a HEAD request bounded by `timeout`.
    ///
    /// Redirects are followed. A missing or zero `Content-Length` yields
    /// `content_length: None`.
    ///
    /// # Errors
    ///
    /// Returns `DownloadError` if:
    /// - The URL is invalid
    /// - The request fails or does not complete within `timeout`
    /// - The server answers with a non-success status
    #[instrument(skip(self), fields(url = %url))]
    pub async fn probe(&self, url: &str, timeout: Duration) -> Result<ProbeResult, DownloadError> {
        validate_url(url)?;

        let response = self
            .client
            .head(url)
            .header(ACCEPT, "*/*")
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| DownloadError::network(url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::http_status(url, status.as_u16()));
        }

        let result = probe_result_from_response(&response);
        debug!(
            content_length = ?result.content_length,
            accepts_ranges = result.accepts_ranges,
            "probe complete"
        );
        Ok(result)
    }

    /// Issues a GET for bytes `start..=end` of `url`.
    ///
    /// With `end == None` the range is open-ended; a fresh open-ended request
    /// (`start == 0`) carries no `Range` header at all. Waiting for the
    /// response headers is bounded by `timeout`.
    ///
    /// Both `200 OK` and `206 Partial Content` are accepted; callers must
    /// check [`Response::status`] to learn whether the range was honored.
    ///
    /// # Errors
    ///
    /// Returns `DownloadError` on invalid URL, transport failure, timeout or a
    /// non-success status.
    #[instrument(skip(self), fields(url = %url))]
    pub async fn get_range(
        &self,
        url: &str,
        start: u64,
        end: Option<u64>,
        timeout: Duration,
    ) -> Result<Response, DownloadError> {
        validate_url(url)?;

        let mut request = self.client.get(url).header(ACCEPT, "*/*");
        if let Some(range) = range_header_value(start, end) {
            request = request.header(RANGE, range);
        }

        let response = match tokio::time::timeout(timeout, request.send()).await {
            Ok(result) => result.map_err(|e| DownloadError::network(url, e))?,
            Err(_) => return Err(DownloadError::timeout(url)),
        };

        let status = response.status();
        if status != StatusCode::OK && status != StatusCode::PARTIAL_CONTENT {
            return Err(DownloadError::http_status(url, status.as_u16()));
        }
        Ok(response)
    }
}

/// Formats the `Range` header value, or `None` when no header is needed.
#[must_use]
pub(crate) fn range_header_value(start: u64, end: Option<u64>) -> Option<String> {
    match end {
        Some(end) => Some(format!("bytes={start}-{end}")),
        None if start > 0 => Some(format!("bytes={start}-")),
        None => None,
    }
}

fn probe_result_from_response(response: &Response) -> ProbeResult {
    // HEAD bodies are empty, so `Response::content_length()` is unreliable here;
    // read the header itself.
    let content_length = response
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|len| *len > 0);
    let accepts_ranges = response
        .headers()
        .get(ACCEPT_RANGES)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("bytes"));
    ProbeResult {
        content_length,
        accepts_ranges,
    }
}

fn validate_url(url: &str) -> Result<(), DownloadError> {
    let parsed = Url::parse(url).map_err(|_| DownloadError::invalid_url(url))?;
    if matches!(parsed.scheme(), "http" | "https") {
        Ok(())
    } else {
        Err(DownloadError::invalid_url(url))
    }
}

fn base_client_builder(connect_timeout: Duration) -> ClientBuilder {
    Client::builder()
        .connect_timeout(connect_timeout)
        .user_agent(user_agent::default_download_user_agent())
}
