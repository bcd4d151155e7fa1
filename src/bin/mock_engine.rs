//! Mock inference engine for testing vastmux.
//!
//! Emulates the engine HTTP surface the proxy consumes: `/v1/models` for
//! health and model discovery, `/v1/chat/completions` with SSE streaming,
//! and SGLang's `/abort_request`. Control endpoints let tests inject
//! failures. Prints `READY <port>` on stdout once listening.

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, Response, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;

#[derive(Parser, Debug)]
#[command(name = "mock-engine")]
#[command(about = "Mock inference engine for testing")]
struct Args {
    /// Port to listen on (0 = OS-assigned)
    #[arg(short, long, default_value = "0")]
    port: u16,

    /// Model name to serve
    #[arg(short, long, default_value = "test-model")]
    model: String,

    /// Bearer token required on every request (empty = no auth)
    #[arg(long, default_value = "")]
    token: String,

    /// Artificial latency per response or SSE frame (ms)
    #[arg(long, default_value = "0")]
    latency_ms: u64,

    /// Number of SSE chunks before [DONE]
    #[arg(long, default_value = "3")]
    stream_chunks: usize,
}

struct EngineState {
    model: String,
    token: String,
    latency: Duration,
    stream_chunks: usize,
    requests: AtomicU64,
    aborts: AtomicU64,
    fail_health: AtomicBool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("mock_engine=debug")
        .init();

    let args = Args::parse();
    let state = Arc::new(EngineState {
        model: args.model.clone(),
        token: args.token,
        latency: Duration::from_millis(args.latency_ms),
        stream_chunks: args.stream_chunks,
        requests: AtomicU64::new(0),
        aborts: AtomicU64::new(0),
        fail_health: AtomicBool::new(false),
    });

    let app = Router::new()
        .route("/v1/models", get(list_models))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/abort_request", post(abort_request))
        .route("/stats", get(stats))
        .route("/control/fail-health", post(control_fail_health))
        .with_state(state);

    let listener = TcpListener::bind(format!("127.0.0.1:{}", args.port)).await?;
    let actual_port = listener.local_addr()?.port();
    tracing::info!(model = %args.model, port = actual_port, "mock engine listening");

    // Readiness signal for test harnesses.
    println!("READY {actual_port}");

    axum::serve(listener, app).await?;
    Ok(())
}

fn authorized(state: &EngineState, headers: &HeaderMap) -> bool {
    if state.token.is_empty() {
        return true;
    }
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == format!("Bearer {}", state.token))
}

async fn list_models(
    State(state): State<Arc<EngineState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if !authorized(&state, &headers) {
        return (StatusCode::UNAUTHORIZED, Json(json!({"error": "unauthorized"})));
    }
    if state.fail_health.load(Ordering::SeqCst) {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": "unhealthy"})),
        );
    }
    (
        StatusCode::OK,
        Json(json!({
            "object": "list",
            "data": [{
                "id": state.model,
                "object": "model",
                "created": 0,
                "owned_by": "mock-engine"
            }]
        })),
    )
}

#[derive(Deserialize, Default)]
struct ChatRequest {
    #[serde(default)]
    stream: bool,
}

async fn chat_completions(
    State(state): State<Arc<EngineState>>,
    headers: HeaderMap,
    body: String,
) -> Response<Body> {
    if !authorized(&state, &headers) {
        return plain_json(StatusCode::UNAUTHORIZED, json!({"error": "unauthorized"}));
    }
    state.requests.fetch_add(1, Ordering::SeqCst);

    let request: ChatRequest = serde_json::from_str(&body).unwrap_or_default();
    if request.stream {
        return stream_response(&state);
    }

    tokio::time::sleep(state.latency).await;
    plain_json(
        StatusCode::OK,
        json!({
            "id": "chatcmpl-mock",
            "object": "chat.completion",
            "model": state.model,
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "mock response"},
                "finish_reason": "stop"
            }]
        }),
    )
}

/// SSE stream: `data: {...}` frames followed by `data: [DONE]`, one frame
/// per latency interval so relay flush behavior is observable.
fn stream_response(state: &EngineState) -> Response<Body> {
    let latency = state.latency;
    let model = state.model.clone();
    let mut frames: Vec<String> = (0..state.stream_chunks)
        .map(|i| {
            let chunk = json!({
                "id": "chatcmpl-mock",
                "object": "chat.completion.chunk",
                "model": model,
                "choices": [{
                    "index": 0,
                    "delta": {"content": format!("chunk {i}")},
                }]
            });
            format!("data: {chunk}\n\n")
        })
        .collect();
    frames.push("data: [DONE]\n\n".to_string());

    let stream = futures_util::stream::iter(frames).then(move |frame| async move {
        tokio::time::sleep(latency).await;
        Ok::<_, Infallible>(frame)
    });

    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "text/event-stream")
        .header("Cache-Control", "no-cache")
        .body(Body::from_stream(stream))
        .unwrap()
}

async fn abort_request(State(state): State<Arc<EngineState>>) -> impl IntoResponse {
    state.aborts.fetch_add(1, Ordering::SeqCst);
    Json(json!({"success": true}))
}

async fn stats(State(state): State<Arc<EngineState>>) -> impl IntoResponse {
    Json(json!({
        "requests": state.requests.load(Ordering::SeqCst),
        "aborts": state.aborts.load(Ordering::SeqCst),
    }))
}

#[derive(Deserialize)]
struct FailRequest {
    fail: bool,
}

async fn control_fail_health(
    State(state): State<Arc<EngineState>>,
    Json(req): Json<FailRequest>,
) -> impl IntoResponse {
    state.fail_health.store(req.fail, Ordering::SeqCst);
    Json(json!({"fail": req.fail}))
}

fn plain_json(status: StatusCode, value: serde_json::Value) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Body::from(value.to_string()))
        .unwrap()
}
