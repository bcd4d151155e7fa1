//! Reverse proxy dispatcher: relays OpenAI-style requests to backends.
//!
//! Each request is dispatched to one backend — pinned via the
//! `X-VASTPROXY-INSTANCE` header when possible, round-robin otherwise — with
//! the client's `Authorization` replaced by the backend's bearer token.
//! Bodies are relayed as streams in both directions, so SSE chunks reach the
//! client as the engine emits them. Release bookkeeping rides on the response
//! body: dropping it (completion or client disconnect) releases the backend
//! and, when the process-wide in-flight count hits zero, fans out an abort to
//! engines that support it.

use crate::balancer::Balancer;
use crate::sticky::StickyStats;
use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::header::{AUTHORIZATION, HOST};
use axum::http::{HeaderName, HeaderValue, Request, Response, StatusCode, Uri};
use bytes::Bytes;
use http_body::Frame;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use metrics::{counter, gauge, histogram};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tracing::error;

/// Header carrying the instance id: on requests a best-effort pin, on
/// responses the id that actually served.
pub static INSTANCE_HEADER: HeaderName = HeaderName::from_static("x-vastproxy-instance");

/// Shared state for the dispatcher.
#[derive(Clone)]
pub struct ProxyState {
    pub balancer: Arc<Balancer>,
    pub sticky: Arc<StickyStats>,
    client: Client<HttpConnector, Body>,
}

impl ProxyState {
    pub fn new(balancer: Arc<Balancer>, sticky: Arc<StickyStats>) -> Self {
        Self {
            balancer,
            sticky,
            client: Client::builder(TokioExecutor::new()).build_http(),
        }
    }
}

/// Build the client-facing router: every method and path relays verbatim.
pub fn router(state: ProxyState) -> Router {
    Router::new().fallback(relay_handler).with_state(state)
}

/// Relay one request to a chosen backend.
pub async fn relay_handler(
    State(state): State<ProxyState>,
    req: Request<Body>,
) -> Response<Body> {
    let started = Instant::now();

    // Sticky pin: best-effort, unknown or unhealthy targets fall back to
    // round-robin without a client-visible error.
    let pinned = req
        .headers()
        .get(&INSTANCE_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok());
    state.sticky.record(pinned.is_some());
    gauge!("vastmux_sticky_percent").set(state.sticky.percent());

    let backend = match pinned.and_then(|id| state.balancer.pick_by_id(id).ok()) {
        Some(backend) => backend,
        None => match state.balancer.pick() {
            Ok(backend) => backend,
            Err(_) => {
                counter!("vastmux_requests_total", "outcome" => "no_backends").increment(1);
                return error_response(StatusCode::SERVICE_UNAVAILABLE, "no backends available");
            }
        },
    };

    backend.acquire();
    state.balancer.acquire();
    let guard = ReleaseGuard {
        backend: Arc::clone(&backend),
        balancer: Arc::clone(&state.balancer),
    };

    let Some(base) = backend.base_url() else {
        // healthy implies base_url; hitting this means the supervisor is
        // mid-teardown. Treat as an upstream failure.
        backend.set_healthy(false);
        drop(guard);
        return error_response(StatusCode::BAD_GATEWAY, "backend not ready");
    };

    match forward(&state.client, req, &backend, &base).await {
        Ok(resp) => {
            counter!("vastmux_requests_total", "outcome" => "relayed").increment(1);
            histogram!("vastmux_request_duration_seconds").record(started.elapsed().as_secs_f64());

            let (mut parts, body) = resp.into_parts();
            parts
                .headers
                .insert(INSTANCE_HEADER.clone(), HeaderValue::from(backend.id()));
            // The guard rides the body so release happens when streaming
            // finishes or the client goes away.
            let guarded = GuardedBody {
                inner: Body::new(body),
                _guard: Some(guard),
            };
            Response::from_parts(parts, Body::new(guarded))
        }
        Err(e) => {
            error!(instance = backend.id(), error = %e, "upstream error");
            counter!("vastmux_requests_total", "outcome" => "upstream_error").increment(1);
            // Skip this backend until its next successful health check.
            backend.set_healthy(false);
            drop(guard);
            error_response(StatusCode::BAD_GATEWAY, "backend error")
        }
    }
}

async fn forward(
    client: &Client<HttpConnector, Body>,
    mut req: Request<Body>,
    backend: &crate::backend::Backend,
    base_url: &str,
) -> Result<Response<hyper::body::Incoming>, hyper_util::client::legacy::Error> {
    // Path and query travel verbatim; the base URL is the engine root.
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.to_string())
        .unwrap_or_else(|| "/".to_string());
    let uri: Uri = format!("{base_url}{path_and_query}")
        .parse()
        .expect("valid upstream URI");
    *req.uri_mut() = uri;

    let headers = req.headers_mut();
    headers.remove(HOST);
    headers.remove(AUTHORIZATION);
    // The pin header is proxy-internal; it must not reach the engine.
    headers.remove(&INSTANCE_HEADER);
    if !backend.token().is_empty() {
        let bearer = format!("Bearer {}", backend.token());
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&bearer).expect("valid bearer header"),
        );
    }

    client.request(req).await
}

fn error_response(status: StatusCode, message: &str) -> Response<Body> {
    let body = serde_json::json!({
        "error": {
            "message": message,
            "type": "server_error"
        }
    });

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

/// Releases the backend and balancer counters on drop. When the balancer
/// count reaches zero — the last in-flight client departed — one abort
/// fan-out is started to free engine-side resources.
struct ReleaseGuard {
    backend: Arc<crate::backend::Backend>,
    balancer: Arc<Balancer>,
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        self.backend.release();
        if self.balancer.release() == 0 {
            let balancer = Arc::clone(&self.balancer);
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move { balancer.abort_all().await });
            }
        }
    }
}

/// Response body wrapper holding a [`ReleaseGuard`] until the body is fully
/// consumed or dropped. For SSE this keeps the in-flight counters accurate
/// for the whole generation, and a client disconnect drops the relay body,
/// cancelling the upstream request with it.
struct GuardedBody {
    inner: Body,
    _guard: Option<ReleaseGuard>,
}

impl http_body::Body for GuardedBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        Pin::new(&mut self.get_mut().inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> http_body::SizeHint {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    #[tokio::test]
    async fn error_response_uses_openai_error_schema() {
        let resp = error_response(StatusCode::SERVICE_UNAVAILABLE, "no backends available");
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            resp.headers().get("Content-Type").unwrap(),
            "application/json"
        );
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"]["message"], "no backends available");
        assert_eq!(json["error"]["type"], "server_error");
    }

    #[test]
    fn instance_header_is_proxy_internal_name() {
        assert_eq!(INSTANCE_HEADER.as_str(), "x-vastproxy-instance");
    }
}
