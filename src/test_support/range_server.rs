//! A wiremock responder that serves `Range` requests from a fixed body.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use wiremock::{Request, Respond, ResponseTemplate};

/// Serves `body`, honoring `Range: bytes=a-b` / `bytes=a-` with `206`.
///
/// Requests without a `Range` header get the full body with `200`.
#[derive(Clone)]
pub(crate) struct RangeResponder {
    body: Arc<Vec<u8>>,
    ranged_requests: Arc<AtomicUsize>,
}

impl RangeResponder {
    pub(crate) fn new(body: Vec<u8>) -> Self {
        Self {
            body: Arc::new(body),
            ranged_requests: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of requests that carried a `Range` header.
    pub(crate) fn ranged_requests(&self) -> usize {
        self.ranged_requests.load(Ordering::SeqCst)
    }
}

/// Parses `bytes=a-b` into inclusive bounds clamped to `len`.
pub(crate) fn parse_range(value: &str, len: usize) -> Option<(usize, usize)> {
    let spec = value.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let start: usize = start.trim().parse().ok()?;
    let end = if end.trim().is_empty() {
        len.checked_sub(1)?
    } else {
        end.trim().parse::<usize>().ok()?.min(len.checked_sub(1)?)
    };
    (start <= end).then_some((start, end))
}

impl Respond for RangeResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let Some(range) = request
            .headers
            .get("Range")
            .and_then(|v| v.to_str().ok())
        else {
            return ResponseTemplate::new(200).set_body_bytes(self.body.as_slice().to_vec());
        };
        self.ranged_requests.fetch_add(1, Ordering::SeqCst);

        match parse_range(range, self.body.len()) {
            Some((start, end)) => ResponseTemplate::new(206)
                .insert_header(
                    "Content-Range",
                    format!("bytes {start}-{end}/{}", self.body.len()).as_str(),
                )
                .set_body_bytes(self.body[start..=end].to_vec()),
            None => ResponseTemplate::new(416),
        }
    }
}
