//! Gateway core: router assembly and the dynamic proxy route

use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::Response;
use axum::middleware::{from_fn, from_fn_with_state};
use axum::routing::{any, get};
use axum::{Json, Router};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use nexus_registry::{Protocol, Registry};

use crate::config::GatewayConfig;
use crate::dynamic::DynamicConfigHolder;
use crate::error::{codes, gateway_error, GatewayError};
use crate::metrics;
use crate::middleware::ip_filter::IpFilterState;
use crate::middleware::rate_limit::RateLimiterState;
use crate::middleware::{
    circuit::CircuitBreakerManager, cors, ip_filter, jwt, logging, rate_limit, request_id, trace,
    JwtState, KeyManager, TraceId,
};
use crate::proxy::{picker_factory, GrpcTranscoder, HttpProxy, ResolverPool};

/// The gateway: resolver pool, circuit breakers, proxies and the policy
/// holder, wired into an axum router.
pub struct Gateway {
    config: GatewayConfig,
    holder: Arc<DynamicConfigHolder>,
    registry: Arc<Registry>,
    pool: Arc<ResolverPool>,
    breaker: Arc<CircuitBreakerManager>,
    keys: Arc<KeyManager>,
    http_proxy: HttpProxy,
    transcoder: GrpcTranscoder,
}

impl Gateway {
    /// Wire the gateway against a registry and a policy holder.
    ///
    /// Registers holder callbacks so JWT keys and the balancer strategy
    /// follow dynamic configuration changes.
    pub fn new(
        config: GatewayConfig,
        holder: Arc<DynamicConfigHolder>,
        registry: Arc<Registry>,
    ) -> Result<Arc<Self>, GatewayError> {
        let dynamic = holder.load();

        let pool = Arc::new(ResolverPool::new(
            registry.clone(),
            picker_factory(&dynamic.balancer.strategy),
        ));
        let keys = Arc::new(KeyManager::new());
        keys.update_keys(&dynamic.jwt.keys);

        {
            let keys = keys.clone();
            let pool = pool.clone();
            holder.on_change(move |cfg| {
                keys.update_keys(&cfg.jwt.keys);
                if !cfg.balancer.strategy.is_empty() {
                    pool.update_strategy(&cfg.balancer.strategy);
                }
            });
        }

        let gateway = Arc::new(Self {
            breaker: Arc::new(CircuitBreakerManager::new(holder.clone())),
            http_proxy: HttpProxy::new(&config.timeout)?,
            transcoder: GrpcTranscoder::new(config.grpc.clone()),
            pool,
            keys,
            registry,
            holder,
            config,
        });
        Ok(gateway)
    }

    /// Build the router with the full middleware chain.
    ///
    /// Chain order: trace, request id, logging, CORS, IP filter, rate
    /// limit, JWT; then the route handlers.
    pub fn router(self: &Arc<Self>) -> Router {
        let jwt_state = Arc::new(JwtState {
            holder: self.holder.clone(),
            keys: self.keys.clone(),
        });
        let ip_state = Arc::new(IpFilterState::new(self.holder.clone()));
        let rate_state = Arc::new(RateLimiterState::new(self.holder.clone()));

        let mut router = Router::new()
            .route("/health", get(health))
            .route("/api/{service}/{*method}", any(proxy_handler))
            .with_state(self.clone());

        if self.config.metrics.enabled {
            router = router.route(&self.config.metrics.path, get(metrics::metrics_handler));
        }

        router
            .layer(from_fn_with_state(jwt_state, jwt::jwt))
            .layer(from_fn_with_state(rate_state, rate_limit::rate_limit))
            .layer(from_fn_with_state(ip_state, ip_filter::ip_filter))
            .layer(from_fn_with_state(self.holder.clone(), cors::cors))
            .layer(from_fn(logging::logging))
            .layer(from_fn(request_id::request_id))
            .layer(from_fn(trace::trace))
    }

    /// Listen address from static configuration
    pub fn addr(&self) -> &str {
        &self.config.server.addr
    }

    /// Policy holder, for wiring the config client
    pub fn holder(&self) -> &Arc<DynamicConfigHolder> {
        &self.holder
    }

    /// Close proxies, resolvers and the registry (lease revocation is
    /// bounded at five seconds).
    pub async fn shutdown(&self) {
        self.transcoder.close().await;
        self.pool.close();
        if tokio::time::timeout(Duration::from_secs(5), self.registry.close())
            .await
            .is_err()
        {
            error!("registry close timed out");
        }
        info!("gateway shutdown complete");
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "time": chrono::Utc::now().timestamp(),
    }))
}

/// `ALL /api/{service}/{*method}`: circuit gate, resolve, dispatch by
/// instance protocol, then feed the breaker.
async fn proxy_handler(
    State(gateway): State<Arc<Gateway>>,
    Path((service, method)): Path<(String, String)>,
    request: Request,
) -> Response<Body> {
    let trace_id = request
        .extensions()
        .get::<TraceId>()
        .map(|id| id.0.clone())
        .unwrap_or_default();
    let method = method.trim_start_matches('/').to_string();

    if service.is_empty() {
        return gateway_error(codes::SERVICE_NOT_FOUND, "empty service name", &trace_id);
    }

    let breaker_enabled = gateway.breaker.enabled();
    if breaker_enabled && !gateway.breaker.allow(&service) {
        return gateway_error(
            codes::CIRCUIT_OPEN,
            &format!("circuit breaker open for {}", service),
            &trace_id,
        );
    }

    let resolver = match gateway.pool.get_or_create(&service).await {
        Ok(resolver) => resolver,
        Err(e) => {
            error!("resolver create failed: {}: {}", service, e);
            return gateway_error(
                codes::SERVICE_NOT_FOUND,
                &format!("service not found: {}", service),
                &trace_id,
            );
        }
    };
    let instance = match resolver.resolve().await {
        Ok(instance) => instance,
        Err(e) => {
            error!("resolve failed: {}: {}", service, e);
            return gateway_error(
                codes::SERVICE_NOT_FOUND,
                &format!("no available instance for {}", service),
                &trace_id,
            );
        }
    };

    let response = match instance.protocol {
        Protocol::Grpc => {
            gateway
                .transcoder
                .handle(&instance.address, &method, request, &trace_id)
                .await
        }
        Protocol::Http => {
            gateway
                .http_proxy
                .forward(&instance.address, &method, request, &trace_id)
                .await
        }
    };

    if breaker_enabled {
        if response.status().is_server_error() {
            gateway.breaker.record_failure(&service);
        } else {
            gateway.breaker.record_success(&service);
        }
    }

    response
}
