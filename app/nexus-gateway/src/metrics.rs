//! Prometheus metrics for the gateway

use axum::body::Body;
use axum::http::{header, Response, StatusCode};
use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge_vec, Encoder,
    HistogramVec, IntCounterVec, IntGaugeVec, TextEncoder,
};
use std::time::Duration;

lazy_static! {
    pub static ref REQUEST_TOTAL: IntCounterVec = register_int_counter_vec!(
        "gateway_requests_total",
        "Total number of requests processed by the gateway",
        &["method", "service", "status"]
    )
    .expect("register gateway_requests_total");

    pub static ref REQUEST_DURATION: HistogramVec = register_histogram_vec!(
        "gateway_request_duration_seconds",
        "Request latency distribution",
        &["method", "service"],
        vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .expect("register gateway_request_duration_seconds");

    pub static ref CIRCUIT_BREAKER_STATE: IntGaugeVec = register_int_gauge_vec!(
        "gateway_circuit_breaker_state",
        "Circuit breaker state per service (0=closed, 1=open, 2=half-open)",
        &["service"]
    )
    .expect("register gateway_circuit_breaker_state");
}

/// Record one request against the counter and latency histogram
pub fn record_request(method: &str, path: &str, status: u16, latency: Duration) {
    let service = extract_service(path);
    let status = status.to_string();

    REQUEST_TOTAL
        .with_label_values(&[method, service, &status])
        .inc();
    REQUEST_DURATION
        .with_label_values(&[method, service])
        .observe(latency.as_secs_f64());
}

/// Pull the service name out of `/api/{service}/...` paths
fn extract_service(path: &str) -> &str {
    let mut parts = path.trim_start_matches('/').splitn(3, '/');
    if parts.next() == Some("api") {
        if let Some(service) = parts.next() {
            if !service.is_empty() {
                return service;
            }
        }
    }
    "unknown"
}

/// Prometheus exposition endpoint
pub async fn metrics_handler() -> Response<Body> {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();

    let mut buffer = Vec::new();
    if encoder.encode(&families, &mut buffer).is_err() {
        return Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .body(Body::from("metrics encoding failed"))
            .expect("static response");
    }

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, encoder.format_type())
        .body(Body::from(buffer))
        .expect("metrics response")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_extraction() {
        assert_eq!(extract_service("/api/user-service/v1/users"), "user-service");
        assert_eq!(extract_service("/api/user-service"), "user-service");
        assert_eq!(extract_service("/health"), "unknown");
        assert_eq!(extract_service("/"), "unknown");
    }
}
