//! HTTP proxy logic
//!
//! Receives inbound requests, strips hop-by-hop headers, and forwards them to
//! the upstream URL through the `AuthHandler`, which attaches the cached bearer
//! and answers a 401 challenge with one refreshed retry. Returns the upstream
//! response verbatim (including error status codes from upstream).

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use auth_handler::{AuthHandler, HandlerError};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use tracing::{error, instrument};

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

/// Inbound bodies larger than this are rejected
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Shared state passed to the proxy handler via axum State extractor
#[derive(Clone)]
pub struct ProxyState {
    pub client: reqwest::Client,
    pub handler: AuthHandler,
    pub upstream_url: String,
    pub timeout: Duration,
    pub requests_total: Arc<AtomicU64>,
    pub errors_total: Arc<AtomicU64>,
}

/// JSON error body: {"error":{"type":"proxy_error","message":"...","request_id":"req_..."}}
fn error_response(status: StatusCode, message: &str, request_id: &str) -> Response {
    let body = serde_json::json!({
        "error": {
            "type": "proxy_error",
            "message": message,
            "request_id": request_id,
        }
    });
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

/// Proxy an inbound request to upstream with bearer attachment.
#[instrument(skip_all, fields(request_id = %request_id, method = %request.method(), path = %request.uri().path()))]
pub async fn proxy_request(
    state: &ProxyState,
    request: axum::http::Request<axum::body::Body>,
    request_id: String,
) -> Response {
    let started = Instant::now();
    state.requests_total.fetch_add(1, Ordering::Relaxed);
    let method = request.method().clone();

    let response = forward(state, request, &request_id).await;

    crate::metrics::record_request(
        response.status().as_u16(),
        method.as_str(),
        started.elapsed().as_secs_f64(),
    );
    response
}

async fn forward(
    state: &ProxyState,
    request: axum::http::Request<axum::body::Body>,
    request_id: &str,
) -> Response {
    let method = request.method().clone();
    let upstream_url = match request.uri().path_and_query() {
        Some(pq) => format!("{}{}", state.upstream_url.trim_end_matches('/'), pq),
        None => state.upstream_url.clone(),
    };
    let headers = forwardable_headers(request.headers());

    let body_bytes = match axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(e) => {
            state.errors_total.fetch_add(1, Ordering::Relaxed);
            error!(error = %e, "failed to read request body");
            return error_response(
                StatusCode::BAD_REQUEST,
                &format!("invalid request body: {e}"),
                request_id,
            );
        }
    };

    let upstream_request = match state
        .client
        .request(method, &upstream_url)
        .headers(headers)
        .timeout(state.timeout)
        .body(body_bytes)
        .build()
    {
        Ok(r) => r,
        Err(e) => {
            state.errors_total.fetch_add(1, Ordering::Relaxed);
            error!(error = %e, url = %upstream_url, "failed to build upstream request");
            return error_response(
                StatusCode::BAD_REQUEST,
                &format!("invalid upstream request: {e}"),
                request_id,
            );
        }
    };

    let upstream_response = match state.handler.send(upstream_request).await {
        Ok(r) => r,
        Err(e) => return handler_error_response(state, e, request_id),
    };

    let status = upstream_response.status();
    let resp_headers = upstream_response.headers().clone();
    match upstream_response.bytes().await {
        Ok(resp_body) => {
            let mut response = Response::builder().status(status);
            for (name, value) in &resp_headers {
                if !is_hop_by_hop(name.as_str()) {
                    response = response.header(name, value);
                }
            }
            response
                .body(axum::body::Body::from(resp_body))
                .unwrap_or_else(|e| {
                    error_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        &format!("response build error: {e}"),
                        request_id,
                    )
                })
        }
        Err(e) => {
            state.errors_total.fetch_add(1, Ordering::Relaxed);
            crate::metrics::record_upstream_error("body");
            error!(error = %e, "failed to read upstream response body");
            error_response(
                StatusCode::BAD_GATEWAY,
                &format!("upstream response read error: {e}"),
                request_id,
            )
        }
    }
}

fn handler_error_response(state: &ProxyState, err: HandlerError, request_id: &str) -> Response {
    state.errors_total.fetch_add(1, Ordering::Relaxed);
    match err {
        HandlerError::Transport(e) if e.is_timeout() => {
            crate::metrics::record_upstream_error("timeout");
            error!(error = %e, "upstream timeout");
            error_response(
                StatusCode::GATEWAY_TIMEOUT,
                &format!("upstream timeout after {}s", state.timeout.as_secs()),
                request_id,
            )
        }
        HandlerError::Transport(e) => {
            crate::metrics::record_upstream_error("connection");
            error!(error = %e, "upstream request failed");
            error_response(
                StatusCode::BAD_GATEWAY,
                &format!("upstream error: {e}"),
                request_id,
            )
        }
        HandlerError::Cache(e) => {
            crate::metrics::record_upstream_error("token_cache");
            error!(error = %e, "could not obtain bearer");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("token cache error: {e}"),
                request_id,
            )
        }
    }
}

/// Inbound headers minus hop-by-hop headers and `host`; reqwest sets the
/// upstream's own host from the URL.
fn forwardable_headers(inbound: &HeaderMap) -> reqwest::header::HeaderMap {
    let mut headers = reqwest::header::HeaderMap::new();
    for (name, value) in inbound {
        if name != axum::http::header::HOST && !is_hop_by_hop(name.as_str()) {
            headers.append(name.clone(), value.clone());
        }
    }
    headers
}

/// Check if a header is hop-by-hop (should be stripped before forwarding)
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}
