//! HTTP proxy logic
//!
//! Turns an inbound request into an [`OutboundRequest`] template, hands it to
//! the dispatcher, and streams the first successful upstream response back.
//! Gateway failures are answered with a JSON error body.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;

use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode, header};
use axum::response::{IntoResponse, Response};
use dispatcher::{Dispatched, Dispatcher, OutboundRequest};
use tracing::{error, info, instrument};

use crate::metrics::{self, ServiceMetrics};

/// Largest request body accepted for forwarding.
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Headers to strip before forwarding (hop-by-hop per RFC 2616 Section 13.5.1)
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Shared state passed to the proxy handler via axum State extractor
#[derive(Clone)]
pub struct ProxyState {
    pub dispatcher: Arc<Dispatcher>,
    pub metrics: ServiceMetrics,
}

/// JSON error body: {"error":{"type":"proxy_error","message":"...","request_id":"req_..."}}
pub fn error_response(status: StatusCode, message: &str, request_id: &str) -> Response {
    let body = serde_json::json!({
        "error": {
            "type": "proxy_error",
            "message": message,
            "request_id": request_id,
        }
    });
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

pub fn new_request_id() -> String {
    format!("req_{}", uuid::Uuid::new_v4().as_simple())
}

/// Decrements the in-flight gauge when the handler returns.
struct InFlight<'a>(&'a ServiceMetrics);

impl<'a> InFlight<'a> {
    fn enter(metrics: &'a ServiceMetrics) -> Self {
        metrics.in_flight.fetch_add(1, Ordering::Relaxed);
        Self(metrics)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Proxy an inbound request upstream with key failover.
#[instrument(skip_all, fields(request_id = %request_id, method = %request.method(), path = %request.uri().path()))]
pub async fn proxy_request(
    state: &ProxyState,
    request: Request<Body>,
    request_id: String,
) -> Response {
    let started = Instant::now();
    let _in_flight = InFlight::enter(&state.metrics);
    state.metrics.requests_total.fetch_add(1, Ordering::Relaxed);

    let method = request.method().clone();
    let path_and_query = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());
    let headers = forwardable_headers(request.headers());

    let body = match axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(e) => {
            state.metrics.errors_total.fetch_add(1, Ordering::Relaxed);
            error!(error = %e, "failed to read request body");
            let response = error_response(
                StatusCode::BAD_REQUEST,
                &format!("invalid request body: {e}"),
                &request_id,
            );
            metrics::record_request(400, method.as_str(), started.elapsed().as_secs_f64());
            return response;
        }
    };

    let outbound = OutboundRequest {
        method: method.clone(),
        path_and_query,
        headers,
        body,
    };

    let response = match state.dispatcher.dispatch(&outbound).await {
        Ok(dispatched) => {
            info!(attempts = dispatched.attempts, "request forwarded");
            stream_response(dispatched, &request_id)
        }
        Err(e) => {
            state.metrics.errors_total.fetch_add(1, Ordering::Relaxed);
            error!(error = %e, "dispatch failed");
            error_response(e.status_code(), &e.to_string(), &request_id)
        }
    };

    metrics::record_request(
        response.status().as_u16(),
        method.as_str(),
        started.elapsed().as_secs_f64(),
    );
    metrics::set_key_gauges(&state.dispatcher.pool().summary().await);
    response
}

/// Build a client response from a successful upstream response, streaming the body.
pub fn stream_response(dispatched: Dispatched, request_id: &str) -> Response {
    let upstream = dispatched.response;
    let mut response = Response::builder().status(upstream.status());
    for (name, value) in upstream.headers() {
        if !is_hop_by_hop(name.as_str()) {
            response = response.header(name, value);
        }
    }
    response
        .body(Body::from_stream(upstream.bytes_stream()))
        .unwrap_or_else(|e| {
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("response build error: {e}"),
                request_id,
            )
        })
}

/// Inbound headers minus hop-by-hop, `host`, and the client's own credential.
pub fn forwardable_headers(inbound: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in inbound {
        if is_hop_by_hop(name.as_str()) || name == header::HOST || name == header::AUTHORIZATION {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers
}

/// Check if a header is hop-by-hop (should be stripped before forwarding)
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}
