use std::{
    io,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header::CONTENT_TYPE, HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Router,
};
use futures::stream;
use serde_json::Value;
use tokio::{net::TcpListener, sync::oneshot, task::JoinHandle};

/// What the mock answers to every request.
#[derive(Clone, Debug)]
pub enum MockResponse {
    /// A complete response with a `Content-Length`.
    Fixed {
        status: u16,
        content_type: &'static str,
        body: String,
    },
    /// A chunked `200` response. With `endless`, numbered chunks keep coming
    /// after `chunks` until the client hangs up.
    Stream {
        chunks: Vec<String>,
        interval_ms: u64,
        endless: bool,
    },
    /// A chunked `200` response that sends `chunks` and then aborts the
    /// connection without finishing the body.
    Broken { chunks: Vec<String> },
}

impl MockResponse {
    pub fn json(status: u16, body: Value) -> Self {
        MockResponse::Fixed {
            status,
            content_type: "application/json",
            body: body.to_string(),
        }
    }

    pub fn ndjson(lines: &[&str]) -> Self {
        MockResponse::Stream {
            chunks: ndjson_lines(lines),
            interval_ms: 5,
            endless: false,
        }
    }

    pub fn endless(interval_ms: u64) -> Self {
        MockResponse::Stream {
            chunks: Vec::new(),
            interval_ms,
            endless: true,
        }
    }

    pub fn broken(lines: &[&str]) -> Self {
        MockResponse::Broken {
            chunks: ndjson_lines(lines),
        }
    }
}

fn ndjson_lines(lines: &[&str]) -> Vec<String> {
    lines.iter().map(|l| format!("{}\n", l)).collect()
}

#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub method: String,
    /// Path and query as sent on the request line.
    pub target: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap()
    }
}

#[derive(Default)]
struct Shared {
    requests: Mutex<Vec<RecordedRequest>>,
    closed_connections: AtomicUsize,
}

struct MockState {
    response: MockResponse,
    shared: Arc<Shared>,
}

/// Inference server stand-in on a random local port.
pub struct MockUpstream {
    port: u16,
    shared: Arc<Shared>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl MockUpstream {
    pub async fn start(response: MockResponse) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let shared = Arc::new(Shared::default());

        let app = Router::new().fallback(respond).with_state(Arc::new(MockState {
            response,
            shared: shared.clone(),
        }));

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });
            if let Err(e) = server.await {
                eprintln!("Mock upstream error: {}", e);
            }
        });

        Self {
            port,
            shared,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    /// Base URL in the form the gateway expects, ending in `/api`.
    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}/api", self.port)
    }

    pub fn authority(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.shared.requests.lock().unwrap().clone()
    }

    /// Waits until the client has dropped at least one response body that
    /// was still streaming.
    pub async fn wait_for_close(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.shared.closed_connections.load(Ordering::SeqCst) > 0 {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
        }
    }
}

impl Drop for MockUpstream {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Returns a local address with nothing listening on it.
pub async fn unused_base_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    format!("http://127.0.0.1:{}/api", port)
}

async fn respond(
    State(state): State<Arc<MockState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let target = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| uri.path().to_string());
    let headers = headers
        .iter()
        .map(|(name, value)| {
            let value = String::from_utf8_lossy(value.as_bytes()).to_string();
            (name.as_str().to_string(), value)
        })
        .collect();
    state.shared.requests.lock().unwrap().push(RecordedRequest {
        method: method.to_string(),
        target,
        headers,
        body: body.to_vec(),
    });

    match state.response.clone() {
        MockResponse::Fixed {
            status,
            content_type,
            body,
        } => (
            StatusCode::from_u16(status).unwrap(),
            [(CONTENT_TYPE, content_type)],
            body,
        )
            .into_response(),
        MockResponse::Stream {
            chunks,
            interval_ms,
            endless,
        } => ndjson_response(chunk_stream(
            state.shared.clone(),
            chunks,
            Duration::from_millis(interval_ms),
            endless,
            false,
        )),
        MockResponse::Broken { chunks } => ndjson_response(chunk_stream(
            state.shared.clone(),
            chunks,
            Duration::from_millis(5),
            false,
            true,
        )),
    }
}

fn ndjson_response(body: Body) -> Response {
    ([(CONTENT_TYPE, "application/x-ndjson")], body).into_response()
}

/// Counts a streaming body that was dropped before it finished, which is
/// how a client hang-up shows on the server side.
struct CloseGuard {
    shared: Arc<Shared>,
    finished: bool,
}

impl Drop for CloseGuard {
    fn drop(&mut self) {
        if !self.finished {
            self.shared.closed_connections.fetch_add(1, Ordering::SeqCst);
        }
    }
}

struct ChunkState {
    pending: std::vec::IntoIter<String>,
    interval: Duration,
    endless: bool,
    fail_at_end: bool,
    counter: usize,
    guard: CloseGuard,
}

fn chunk_stream(
    shared: Arc<Shared>,
    chunks: Vec<String>,
    interval: Duration,
    endless: bool,
    fail_at_end: bool,
) -> Body {
    let state = ChunkState {
        pending: chunks.into_iter(),
        interval,
        endless,
        fail_at_end,
        counter: 0,
        guard: CloseGuard {
            shared,
            finished: false,
        },
    };

    Body::from_stream(stream::unfold(state, |mut state| async move {
        if state.guard.finished {
            return None;
        }
        tokio::time::sleep(state.interval).await;

        let next = match state.pending.next() {
            Some(chunk) => chunk,
            None if state.endless => {
                state.counter += 1;
                format!("{{\"response\":\"tok{}\",\"done\":false}}\n", state.counter)
            }
            None if state.fail_at_end => {
                state.guard.finished = true;
                let error = io::Error::new(io::ErrorKind::ConnectionAborted, "upstream crashed");
                return Some((Err::<Bytes, _>(error), state));
            }
            None => {
                state.guard.finished = true;
                return None;
            }
        };
        Some((Ok::<_, io::Error>(Bytes::from(next)), state))
    }))
}
