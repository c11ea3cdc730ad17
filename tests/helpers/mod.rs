#![allow(dead_code)] // Test helpers appear unused when compiled independently

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use flate2::read::GzDecoder;
use pipestats::PipelineStatsPayload;
use std::collections::HashMap;
use std::future::Future;
use std::io::Read;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

const WAIT_ATTEMPTS: usize = 50;
const WAIT_DELAY: Duration = Duration::from_millis(100);

/// One request accepted by the mock backend.
#[derive(Debug, Clone)]
pub struct Received {
    pub headers: HashMap<String, String>,
    pub payload: PipelineStatsPayload,
}

#[derive(Clone)]
struct BackendState {
    received: Arc<Mutex<Vec<Received>>>,
    attempts: Arc<AtomicUsize>,
    fail_remaining: Arc<AtomicUsize>,
    fail_status: StatusCode,
}

pub struct MockBackend {
    state: BackendState,
    shutdown_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl MockBackend {
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.handle.await;
    }

    pub async fn received(&self) -> Vec<Received> {
        self.state.received.lock().await.clone()
    }

    /// Every request seen, including the ones answered with an error.
    pub fn attempts(&self) -> usize {
        self.state.attempts.load(Ordering::SeqCst)
    }

    /// Poll until at least `min_count` payloads were accepted
    pub async fn wait_for_payloads(&self, min_count: usize) -> Vec<Received> {
        poll_until(|| async {
            let received = self.received().await;
            (received.len() >= min_count).then_some(received)
        })
        .await
        .unwrap_or_else(|| panic!("timed out waiting for {} payloads", min_count))
    }
}

/// Find an available TCP port
pub async fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Best-effort check for whether binding to loopback is permitted in the current sandbox.
pub async fn can_bind_loopback() -> bool {
    match TcpListener::bind("127.0.0.1:0").await {
        Ok(listener) => {
            drop(listener);
            true
        }
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => false,
        Err(_) => true, // treat other errors as non-fatal for skipping
    }
}

/// Spawn a backend accepting pipeline stats, return (handle, base URL)
pub async fn spawn_mock_backend(port: u16) -> (MockBackend, String) {
    spawn_failing_backend(port, 0, StatusCode::SERVICE_UNAVAILABLE).await
}

/// Spawn a backend answering the first `failures` requests with `status`
pub async fn spawn_failing_backend(
    port: u16,
    failures: usize,
    status: StatusCode,
) -> (MockBackend, String) {
    let state = BackendState {
        received: Arc::new(Mutex::new(Vec::new())),
        attempts: Arc::new(AtomicUsize::new(0)),
        fail_remaining: Arc::new(AtomicUsize::new(failures)),
        fail_status: status,
    };

    let app = Router::new()
        .route("/api/v0.2/pipeline_stats", post(ingest))
        .route("/health", get(health))
        .with_state(state.clone());

    let listener = TcpListener::bind(("127.0.0.1", port))
        .await
        .expect("failed to bind mock backend listener");

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let handle = tokio::spawn(async move {
        let server = axum::serve(listener, app).with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        });
        if let Err(err) = server.await {
            eprintln!("mock backend server error: {}", err);
        }
    });

    (
        MockBackend {
            state,
            shutdown_tx,
            handle,
        },
        format!("http://127.0.0.1:{}", port),
    )
}

/// Wait for a server to respond to /health
pub async fn wait_for_health(client: &reqwest::Client, base_url: &str) {
    poll_until(|| async {
        client
            .get(format!("{}/health", base_url))
            .send()
            .await
            .ok()
            .map(|_| ())
    })
    .await
    .unwrap_or_else(|| panic!("timed out waiting for {} to be healthy", base_url));
}

pub async fn poll_until<T, F, Fut>(mut f: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    for _ in 0..WAIT_ATTEMPTS {
        if let Some(result) = f().await {
            return Some(result);
        }
        tokio::time::sleep(WAIT_DELAY).await;
    }
    None
}

async fn ingest(
    State(state): State<BackendState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, StatusCode> {
    state.attempts.fetch_add(1, Ordering::SeqCst);
    let failing = state
        .fail_remaining
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    if failing {
        return Err(state.fail_status);
    }

    let mut raw = Vec::new();
    GzDecoder::new(&body[..])
        .read_to_end(&mut raw)
        .map_err(|_| StatusCode::BAD_REQUEST)?;
    let payload: PipelineStatsPayload =
        rmp_serde::from_slice(&raw).map_err(|_| StatusCode::BAD_REQUEST)?;

    let headers = headers
        .iter()
        .filter_map(|(k, v)| Some((k.as_str().to_string(), v.to_str().ok()?.to_string())))
        .collect();
    state
        .received
        .lock()
        .await
        .push(Received { headers, payload });

    Ok(Json(serde_json::json!({ "status": "ok" })))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}
