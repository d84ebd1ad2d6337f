//! Gateway middleware chain
//!
//! Applied in a fixed order: trace, request id, logging, CORS, IP filter,
//! rate limit, JWT. The circuit breaker is not a layer; the route handler
//! gates on it around the proxy call.

pub mod circuit;
pub mod cors;
pub mod ip_filter;
pub mod jwt;
pub mod logging;
pub mod rate_limit;
pub mod request_id;
pub mod trace;

pub use circuit::{CircuitBreakerManager, CircuitState};
pub use jwt::{JwtState, KeyManager};

/// Trace id carried through request extensions
#[derive(Debug, Clone)]
pub struct TraceId(pub String);

/// Request id carried through request extensions
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// Verified JWT claims carried through request extensions
#[derive(Debug, Clone)]
pub struct UserClaims(pub serde_json::Map<String, serde_json::Value>);
