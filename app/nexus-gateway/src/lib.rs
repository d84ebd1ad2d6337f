//! API gateway for the Nexus control plane.
//!
//! Routes `/api/{service}/{*method}` requests to registered backends with
//! per-service resolution, load balancing, circuit breaking and an
//! HTTP-to-gRPC transcoder. Runtime policy lives in a
//! [`dynamic::DynamicConfigHolder`] fed by the configuration center.

pub mod config;
pub mod dynamic;
pub mod error;
pub mod gateway;
pub mod metrics;
pub mod middleware;
pub mod proxy;

pub use config::GatewayConfig;
pub use dynamic::{DynamicConfig, DynamicConfigHolder};
pub use error::GatewayError;
pub use gateway::Gateway;

/// Gateway name
pub const GATEWAY_NAME: &str = "nexus-gateway";

/// Gateway version
pub const GATEWAY_VERSION: &str = env!("CARGO_PKG_VERSION");
