//! Request logging and metrics recording

use axum::extract::{ConnectInfo, Request};
use axum::middleware::Next;
use axum::response::Response;
use std::net::SocketAddr;
use std::time::Instant;
use tracing::info;

use super::{RequestId, TraceId};
use crate::metrics;

/// Log method, path, status, latency and ids, and feed the Prometheus
/// request counter and latency histogram.
pub async fn logging(request: Request, next: Next) -> Response {
    let start = Instant::now();

    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let client_ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string())
        .unwrap_or_default();
    let trace_id = request
        .extensions()
        .get::<TraceId>()
        .map(|id| id.0.clone())
        .unwrap_or_default();
    let request_id = request
        .extensions()
        .get::<RequestId>()
        .map(|id| id.0.clone())
        .unwrap_or_default();

    let response = next.run(request).await;

    let latency = start.elapsed();
    let status = response.status().as_u16();
    info!(
        "{} {} | status={} | latency={:?} | ip={} | trace_id={} | request_id={}",
        method, path, status, latency, client_ip, trace_id, request_id
    );
    metrics::record_request(method.as_str(), &path, status, latency);

    response
}
