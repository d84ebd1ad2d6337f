//! Error types and wire error responses for the gateway

use axum::body::Body;
use axum::http::{header, Response, StatusCode};
use thiserror::Error;

/// Error type for gateway operations
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Service discovery error: {0}")]
    ServiceDiscovery(String),

    #[error("Proxy error: {0}")]
    Proxy(String),

    #[error("Transcoding error: {0}")]
    Transcoding(String),

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        GatewayError::Internal(err.to_string())
    }
}

impl From<nexus_registry::RegistryError> for GatewayError {
    fn from(err: nexus_registry::RegistryError) -> Self {
        GatewayError::ServiceDiscovery(err.to_string())
    }
}

/// Gateway wire error codes
pub mod codes {
    pub const OK: u16 = 0;
    pub const JWT_INVALID: u16 = 1001;
    pub const IP_BLOCKED: u16 = 1002;
    pub const RATE_LIMITED: u16 = 1003;
    pub const CIRCUIT_OPEN: u16 = 1004;
    pub const SERVICE_NOT_FOUND: u16 = 1005;
    pub const BACKEND_TIMEOUT: u16 = 1006;
    pub const BACKEND_ERROR: u16 = 1007;
}

/// HTTP status carried by each wire error code
pub fn code_to_status(code: u16) -> StatusCode {
    match code {
        codes::JWT_INVALID => StatusCode::UNAUTHORIZED,
        codes::IP_BLOCKED => StatusCode::FORBIDDEN,
        codes::RATE_LIMITED => StatusCode::TOO_MANY_REQUESTS,
        codes::CIRCUIT_OPEN => StatusCode::SERVICE_UNAVAILABLE,
        codes::SERVICE_NOT_FOUND => StatusCode::BAD_GATEWAY,
        codes::BACKEND_TIMEOUT => StatusCode::GATEWAY_TIMEOUT,
        codes::BACKEND_ERROR => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Standard gateway error response: `{code, message, trace_id}`
pub fn gateway_error(code: u16, message: &str, trace_id: &str) -> Response<Body> {
    let body = serde_json::json!({
        "code": code,
        "message": message,
        "trace_id": trace_id,
    });

    Response::builder()
        .status(code_to_status(code))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap_or_else(|_| {
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Body::from("internal error"))
                .expect("static response")
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_map_to_documented_statuses() {
        assert_eq!(code_to_status(codes::JWT_INVALID), StatusCode::UNAUTHORIZED);
        assert_eq!(code_to_status(codes::IP_BLOCKED), StatusCode::FORBIDDEN);
        assert_eq!(
            code_to_status(codes::RATE_LIMITED),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            code_to_status(codes::CIRCUIT_OPEN),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            code_to_status(codes::SERVICE_NOT_FOUND),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            code_to_status(codes::BACKEND_TIMEOUT),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(code_to_status(codes::BACKEND_ERROR), StatusCode::BAD_GATEWAY);
    }
}
