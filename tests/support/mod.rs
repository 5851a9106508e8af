//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use downloader_core::{
    HistoryStore, HttpClient, RetryPolicy, TaskContext, TaskEvent, TaskOptions, WorkerPool,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

fn socket_tests_required() -> bool {
    std::env::var("DOWNLOADER_REQUIRE_SOCKET_TESTS")
        .ok()
        .is_some_and(|value| matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
}

/// Starts a mock server, or returns `None` when localhost sockets are not
/// available in the sandbox.
pub async fn start_mock_server_or_skip() -> Option<MockServer> {
    if TcpListener::bind("127.0.0.1:0").is_ok() {
        return Some(MockServer::start().await);
    }
    skip_without_sockets();
    None
}

fn skip_without_sockets() {
    let message = "[socket-bound-test] cannot bind localhost socket; wiremock-based test cannot run in this environment";
    assert!(
        !socket_tests_required(),
        "{message}. Set DOWNLOADER_REQUIRE_SOCKET_TESTS=0 to allow local skip behavior."
    );
    eprintln!(
        "{message}. Skipping test. Set DOWNLOADER_REQUIRE_SOCKET_TESTS=1 to fail-fast instead."
    );
}

/// Deterministic, non-repeating-looking test payload.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Serves a fixed body, honoring `Range: bytes=a-b` with `206`.
///
/// Every `Range` header seen is recorded. An optional delay is applied to
/// each response.
#[derive(Clone)]
pub struct RangeResponder {
    body: Arc<Vec<u8>>,
    delay: Option<Duration>,
    ranges: Arc<Mutex<Vec<String>>>,
    hits: Arc<AtomicUsize>,
}

impl RangeResponder {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body: Arc::new(body),
            delay: None,
            ranges: Arc::new(Mutex::new(Vec::new())),
            hits: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// `Range` header values received, in arrival order.
    pub fn ranges(&self) -> Vec<String> {
        self.ranges.lock().unwrap().clone()
    }

    /// Number of GET requests served.
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    fn full(&self) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_bytes(self.body.as_slice().to_vec())
    }

    fn delayed(&self, template: ResponseTemplate) -> ResponseTemplate {
        match self.delay {
            Some(delay) => template.set_delay(delay),
            None => template,
        }
    }
}

fn parse_range(value: &str, len: usize) -> Option<(usize, usize)> {
    let spec = value.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let start: usize = start.trim().parse().ok()?;
    let last = len.checked_sub(1)?;
    let end = if end.trim().is_empty() {
        last
    } else {
        end.trim().parse::<usize>().ok()?.min(last)
    };
    (start <= end).then_some((start, end))
}

impl Respond for RangeResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        self.hits.fetch_add(1, Ordering::SeqCst);
        let Some(range) = request.headers.get("Range").and_then(|v| v.to_str().ok()) else {
            return self.delayed(self.full());
        };
        self.ranges.lock().unwrap().push(range.to_string());

        let template = match parse_range(range, self.body.len()) {
            Some((start, end)) => ResponseTemplate::new(206)
                .insert_header(
                    "Content-Range",
                    format!("bytes {start}-{end}/{}", self.body.len()).as_str(),
                )
                .set_body_bytes(self.body[start..=end].to_vec()),
            None => ResponseTemplate::new(416),
        };
        self.delayed(template)
    }
}

/// Mounts `HEAD` and ranged `GET` handlers for `route`.
pub async fn mount_file(
    server: &MockServer,
    route: &str,
    body: &[u8],
    accept_ranges: bool,
    responder: RangeResponder,
) {
    let mut head = ResponseTemplate::new(200).set_body_bytes(vec![0u8; body.len()]);
    if accept_ranges {
        head = head.insert_header("Accept-Ranges", "bytes");
    }
    Mock::given(method("HEAD"))
        .and(path(route))
        .respond_with(head)
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(responder)
        .mount(server)
        .await;
}

/// Task options tuned for fast tests: short timeouts, no retries.
pub fn fast_options() -> TaskOptions {
    TaskOptions {
        probe_timeout: Duration::from_secs(2),
        transfer_timeout: Duration::from_secs(5),
        retry_policy: RetryPolicy::no_retry(),
        merge_buffer_size: 64 * 1024,
        speed_interval: Duration::from_millis(50),
    }
}

pub fn test_context(history: Arc<dyn HistoryStore>) -> TaskContext {
    TaskContext {
        client: HttpClient::new(),
        pool: WorkerPool::new(8),
        history,
        options: fast_options(),
    }
}

/// Collects task events up to and including `Finished`.
pub async fn collect_until_finished(events: &mut UnboundedReceiver<TaskEvent>) -> Vec<TaskEvent> {
    let mut seen = Vec::new();
    let result = tokio::time::timeout(Duration::from_secs(15), async {
        while let Some(event) = events.recv().await {
            let finished = event == TaskEvent::Finished;
            seen.push(event);
            if finished {
                break;
            }
        }
    })
    .await;
    assert!(result.is_ok(), "task did not finish in time; events so far: {seen:?}");
    seen
}

/// Waits until `pred` holds for an event, returning it.
pub async fn wait_for_event(
    events: &mut UnboundedReceiver<TaskEvent>,
    mut pred: impl FnMut(&TaskEvent) -> bool,
) -> TaskEvent {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let event = events.recv().await.expect("task event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("expected event did not arrive in time")
}

/// Counts events matching `pred`.
pub fn count(events: &[TaskEvent], pred: impl Fn(&TaskEvent) -> bool) -> usize {
    events.iter().filter(|e| pred(e)).count()
}

/// Bare HTTP/1.1 file server whose first answer for each range start sends
/// only `stall_after` bytes and then goes silent, keeping the connection open
/// until the client drops it.
///
/// A later request starting at an offset not seen before is served in full,
/// so a client that resumes from its bytes on disk completes.
pub struct StallingServer {
    addr: SocketAddr,
    ranges: Arc<Mutex<Vec<String>>>,
    accept: JoinHandle<()>,
}

impl StallingServer {
    pub async fn start_or_skip(body: Vec<u8>, stall_after: usize) -> Option<Self> {
        let Ok(listener) = tokio::net::TcpListener::bind("127.0.0.1:0").await else {
            skip_without_sockets();
            return None;
        };
        let addr = listener.local_addr().unwrap();
        let ranges = Arc::new(Mutex::new(Vec::new()));
        let body = Arc::new(body);
        let seen = Arc::new(Mutex::new(HashSet::new()));

        let recorded = Arc::clone(&ranges);
        let accept = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let stall = Stall {
                    body: Arc::clone(&body),
                    stall_after,
                    seen: Arc::clone(&seen),
                    ranges: Arc::clone(&recorded),
                };
                tokio::spawn(async move {
                    let _ = stall.serve(stream).await;
                });
            }
        });
        Some(Self {
            addr,
            ranges,
            accept,
        })
    }

    pub fn url(&self, route: &str) -> String {
        format!("http://{}{route}", self.addr)
    }

    /// `Range` header values received, in arrival order.
    pub fn ranges(&self) -> Vec<String> {
        self.ranges.lock().unwrap().clone()
    }
}

impl Drop for StallingServer {
    fn drop(&mut self) {
        self.accept.abort();
    }
}

struct Stall {
    body: Arc<Vec<u8>>,
    stall_after: usize,
    seen: Arc<Mutex<HashSet<usize>>>,
    ranges: Arc<Mutex<Vec<String>>>,
}

impl Stall {
    async fn serve(self, mut stream: TcpStream) -> std::io::Result<()> {
        let mut head = Vec::new();
        let mut buf = [0u8; 1024];
        while !head.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                return Ok(());
            }
            head.extend_from_slice(&buf[..n]);
        }
        let head = String::from_utf8_lossy(&head).into_owned();
        let len = self.body.len();

        if head.starts_with("HEAD ") {
            let reply = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {len}\r\nAccept-Ranges: bytes\r\nConnection: close\r\n\r\n"
            );
            return stream.write_all(reply.as_bytes()).await;
        }

        let range = head.lines().find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("range").then(|| value.trim().to_string())
        });
        let (start, end) = range
            .as_deref()
            .and_then(|r| parse_range(r, len))
            .unwrap_or((0, len - 1));
        if let Some(range) = range {
            self.ranges.lock().unwrap().push(range);
        }
        let first = self.seen.lock().unwrap().insert(start);
        let slice = &self.body[start..=end];

        let reply = format!(
            "HTTP/1.1 206 Partial Content\r\nContent-Length: {}\r\nContent-Range: bytes {start}-{end}/{len}\r\nConnection: close\r\n\r\n",
            slice.len()
        );
        stream.write_all(reply.as_bytes()).await?;

        if first && self.stall_after < slice.len() {
            stream.write_all(&slice[..self.stall_after]).await?;
            stream.flush().await?;
            let mut sink = [0u8; 64];
            while stream.read(&mut sink).await? > 0 {}
            return Ok(());
        }
        stream.write_all(slice).await?;
        stream.shutdown().await
    }
}

/// Drains events for `window`, returning whatever arrived.
pub async fn drain_for(
    events: &mut UnboundedReceiver<TaskEvent>,
    window: Duration,
) -> Vec<TaskEvent> {
    let mut seen = Vec::new();
    let deadline = tokio::time::Instant::now() + window;
    while let Ok(Some(event)) = tokio::time::timeout_at(deadline, events.recv()).await {
        seen.push(event);
    }
    seen
}
