//! Shared test fixtures for store, API and engine test modules.
//!
//! Keeping small reusable helpers here avoids rebuilding ad-hoc temp dirs,
//! SSE blocks, fake HTTP servers and scripted backends in every module.

use crate::api::{FrameSource, RunBackend};
use crate::error::ApiError;
use crate::runtime::schema::{RunRequest, StreamFrame};
use crate::types::ThreadHistory;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

static TEST_DIR_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Temporary directory fixture with best-effort cleanup.
#[derive(Debug)]
pub struct TestTempDir {
    path: PathBuf,
}

impl TestTempDir {
    /// Create a unique temporary directory with a readable prefix.
    pub fn new(prefix: &str) -> Self {
        let suffix = TEST_DIR_COUNTER.fetch_add(1, Ordering::Relaxed);
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let dir = std::env::temp_dir().join(format!("creeds-{prefix}-{millis}-{suffix}"));
        fs::create_dir_all(&dir).expect("failed to create temporary fixture directory");
        Self { path: dir }
    }

    /// Root directory path for this fixture.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Build a child path under the fixture root.
    pub fn child(&self, relative: &str) -> PathBuf {
        self.path.join(relative)
    }

    /// Write UTF-8 text to a child path, creating parent directories as needed.
    pub fn write_text(&self, relative: &str, content: &str) -> PathBuf {
        let path = self.child(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("failed to create parent directories for fixture");
        }
        fs::write(&path, content).expect("failed to write fixture file");
        path
    }
}

impl Drop for TestTempDir {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.path);
    }
}

/// Build one SSE event block with `event:` and `data:` lines.
pub fn sse_event_block(event: &str, data: &str) -> String {
    format!("event: {event}\ndata: {data}\n\n")
}

/// SSE stream terminator block some servers append.
pub fn sse_done_block() -> &'static str {
    "data: [DONE]\n\n"
}

/// Shorthand for a run frame.
pub fn frame(kind: &str, data: Value, thread_id: Option<&str>) -> StreamFrame {
    StreamFrame::new(kind, data, thread_id)
}

// ---------------------------------------------------------------------------
// Fake HTTP server
// ---------------------------------------------------------------------------

/// Full HTTP/1.1 response with `Connection: close`.
pub fn http_response(status: u16, content_type: &str, body: &str) -> String {
    let reason = match status {
        200 => "OK",
        404 => "Not Found",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "Status",
    };
    format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    )
}

/// Serve `responses` to successive connections, one each, and return the
/// raw requests received (headers and body) once all have been answered.
pub async fn serve_http(responses: Vec<String>) -> (SocketAddr, JoinHandle<Vec<String>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let server = tokio::spawn(async move {
        let mut requests = Vec::new();
        for response in responses {
            let (mut stream, _) = listener.accept().await.expect("accept");
            requests.push(read_http_request(&mut stream).await);
            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.shutdown().await;
        }
        requests
    });
    (addr, server)
}

async fn read_http_request(stream: &mut tokio::net::TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        if let Some(end) = find_header_end(&buf) {
            let headers = String::from_utf8_lossy(&buf[..end]).to_ascii_lowercase();
            let body_len = headers
                .lines()
                .find_map(|line| line.strip_prefix("content-length:"))
                .and_then(|value| value.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if buf.len() >= end + 4 + body_len {
                break;
            }
        }
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|window| window == b"\r\n\r\n")
}

// ---------------------------------------------------------------------------
// Scripted backend
// ---------------------------------------------------------------------------

type FrameResult = Result<StreamFrame, ApiError>;

/// In-memory [`RunBackend`] whose behavior is staged by the test.
///
/// Each `open_run` consumes the next queued run; frames for it are pushed
/// through the returned [`ScriptedRun`], and the stream ends when that is
/// dropped or closed.
#[derive(Default)]
pub struct ScriptedBackend {
    runs: Mutex<VecDeque<Result<mpsc::UnboundedReceiver<FrameResult>, ApiError>>>,
    requests: Mutex<Vec<RunRequest>>,
    histories: Mutex<VecDeque<Result<ThreadHistory, ApiError>>>,
    history_gate: Mutex<Option<oneshot::Receiver<()>>>,
    history_calls: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful stream open and return its frame feeder.
    pub fn push_run(&self) -> ScriptedRun {
        let (tx, rx) = mpsc::unbounded_channel();
        self.runs.lock().expect("runs lock").push_back(Ok(rx));
        ScriptedRun { tx: Some(tx) }
    }

    /// Queue a failed stream open.
    pub fn push_open_error(&self, err: ApiError) {
        self.runs.lock().expect("runs lock").push_back(Err(err));
    }

    /// Queue one latest-history result.
    pub fn push_history(&self, result: Result<ThreadHistory, ApiError>) {
        self.histories
            .lock()
            .expect("histories lock")
            .push_back(result);
    }

    /// Hold the next history fetch until the returned sender fires.
    pub fn gate_history(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.history_gate.lock().expect("gate lock") = Some(rx);
        tx
    }

    /// Requests received by `open_run`, in order.
    pub fn requests(&self) -> Vec<RunRequest> {
        self.requests.lock().expect("requests lock").clone()
    }

    pub fn history_calls(&self) -> usize {
        self.history_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RunBackend for ScriptedBackend {
    async fn open_run(&self, request: &RunRequest) -> Result<Box<dyn FrameSource>, ApiError> {
        self.requests
            .lock()
            .expect("requests lock")
            .push(request.clone());
        let next = self.runs.lock().expect("runs lock").pop_front();
        match next {
            Some(Ok(rx)) => Ok(Box::new(ChannelFrames(rx))),
            Some(Err(err)) => Err(err),
            None => Err(ApiError::status(503, "no scripted run")),
        }
    }

    async fn fetch_latest_history(&self, thread_id: &str) -> Result<ThreadHistory, ApiError> {
        self.history_calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.history_gate.lock().expect("gate lock").take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        let next = self.histories.lock().expect("histories lock").pop_front();
        next.unwrap_or_else(|| Err(ApiError::status(404, format!("no scripted history for {thread_id}"))))
    }
}

struct ChannelFrames(mpsc::UnboundedReceiver<FrameResult>);

#[async_trait]
impl FrameSource for ChannelFrames {
    async fn next_frame(&mut self) -> Option<FrameResult> {
        self.0.recv().await
    }
}

/// Test-side feeder for one scripted run.
pub struct ScriptedRun {
    tx: Option<mpsc::UnboundedSender<FrameResult>>,
}

impl ScriptedRun {
    pub fn send(&self, frame: StreamFrame) {
        self.push(Ok(frame));
    }

    /// Deliver a transport-level failure.
    pub fn fail(&self, err: ApiError) {
        self.push(Err(err));
    }

    /// End the stream.
    pub fn close(&mut self) {
        self.tx = None;
    }

    fn push(&self, item: FrameResult) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(item);
        }
    }
}

/// Poll `condition` until it holds, failing the test after two seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let reached = tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "condition not reached within timeout");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn temp_dir_fixture_writes_and_resolves_paths() {
        let fixture = TestTempDir::new("fixture");
        let file = fixture.write_text("nested/file.txt", "hello");
        assert_eq!(fs::read_to_string(file).unwrap(), "hello");
        assert!(fixture.path().is_dir());
    }

    #[test]
    fn sse_helpers_emit_expected_wire_format() {
        let block = sse_event_block("message", r#"{"type":"end"}"#);
        assert!(block.starts_with("event: message\n"));
        assert!(block.ends_with("\n\n"));
        assert_eq!(sse_done_block(), "data: [DONE]\n\n");
    }

    #[test]
    fn http_response_sets_content_length() {
        let response = http_response(200, "text/plain", "hey");
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.contains("Content-Length: 3\r\n"));
        assert!(response.ends_with("\r\n\r\nhey"));
    }

    #[tokio::test]
    async fn scripted_backend_replays_queued_runs() {
        let backend = ScriptedBackend::new();
        let mut run = backend.push_run();
        run.send(frame("end", json!({}), Some("T1")));
        run.close();

        let request = RunRequest::human("hi", None, Default::default(), true);
        let mut source = backend.open_run(&request).await.expect("open");
        let first = source.next_frame().await.expect("frame").expect("ok");
        assert_eq!(first.kind, "end");
        assert!(source.next_frame().await.is_none());
        assert_eq!(backend.requests(), vec![request.clone()]);

        let err = backend.open_run(&request).await.err().expect("no more runs");
        assert_eq!(err.status_code(), Some(503));
    }
}
