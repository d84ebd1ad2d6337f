//! HTTP reverse proxy for backend instances

use axum::body::Body;
use axum::extract::Request;
use axum::http::{HeaderMap, HeaderName, Response};
use std::collections::HashSet;
use tracing::error;

use crate::config::TimeoutSection;
use crate::error::{codes, gateway_error, GatewayError};

/// Hop-by-hop headers are meaningful for a single connection only and
/// must not be forwarded in either direction.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Request-only headers the outbound client manages itself
const CLIENT_MANAGED: [&str; 2] = ["host", "content-length"];

/// Reverse proxy over a shared outbound client
pub struct HttpProxy {
    client: reqwest::Client,
}

impl HttpProxy {
    pub fn new(timeouts: &TimeoutSection) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeouts.connect())
            .timeout(timeouts.response())
            .build()
            .map_err(|e| GatewayError::Proxy(format!("build http client: {}", e)))?;
        Ok(Self { client })
    }

    /// Forward a request to `http://{address}/{method}` mirroring method,
    /// body, query and non-hop-by-hop headers, streaming the response
    /// body back.
    pub async fn forward(
        &self,
        address: &str,
        method_path: &str,
        request: Request,
        trace_id: &str,
    ) -> Response<Body> {
        let mut target = format!("http://{}/{}", address, method_path);
        if let Some(query) = request.uri().query() {
            target.push('?');
            target.push_str(query);
        }

        let method = request.method().clone();
        let headers = filter_request_headers(request.headers());
        let body = reqwest::Body::wrap_stream(request.into_body().into_data_stream());

        let result = self
            .client
            .request(method, &target)
            .headers(headers)
            .body(body)
            .send()
            .await;

        let upstream = match result {
            Ok(upstream) => upstream,
            Err(e) if e.is_timeout() => {
                error!("proxy to {} timed out: {}", target, e);
                return gateway_error(codes::BACKEND_TIMEOUT, "backend timeout", trace_id);
            }
            Err(e) => {
                error!("proxy to {} failed: {}", target, e);
                return gateway_error(codes::BACKEND_ERROR, "backend error", trace_id);
            }
        };

        let status = upstream.status();
        let response_headers = filter_response_headers(upstream.headers());

        let mut builder = Response::builder().status(status);
        if let Some(headers) = builder.headers_mut() {
            headers.extend(response_headers);
        }
        builder
            .body(Body::from_stream(upstream.bytes_stream()))
            .unwrap_or_else(|e| {
                error!("assemble proxied response: {}", e);
                gateway_error(codes::BACKEND_ERROR, "backend error", trace_id)
            })
    }
}

/// Headers named by the Connection header are hop-by-hop as well
fn connection_named(headers: &HeaderMap) -> HashSet<String> {
    let mut named = HashSet::new();
    for value in headers.get_all("connection") {
        if let Ok(value) = value.to_str() {
            for name in value.split(',') {
                named.insert(name.trim().to_ascii_lowercase());
            }
        }
    }
    named
}

fn is_hop_by_hop(name: &HeaderName, connection_named: &HashSet<String>) -> bool {
    let name = name.as_str();
    HOP_BY_HOP.contains(&name) || connection_named.contains(name)
}

fn filter_request_headers(headers: &HeaderMap) -> HeaderMap {
    let named = connection_named(headers);
    let mut filtered = HeaderMap::new();
    for (name, value) in headers {
        if is_hop_by_hop(name, &named) || CLIENT_MANAGED.contains(&name.as_str()) {
            continue;
        }
        filtered.append(name.clone(), value.clone());
    }
    filtered
}

fn filter_response_headers(headers: &HeaderMap) -> HeaderMap {
    let named = connection_named(headers);
    let mut filtered = HeaderMap::new();
    for (name, value) in headers {
        if is_hop_by_hop(name, &named) {
            continue;
        }
        filtered.append(name.clone(), value.clone());
    }
    filtered
}
