//! Main binary for the Nexus gateway

use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use nexus_config::types::ConfigVersion;
use nexus_config::{ConfigClient, ConfigFormat};
use nexus_registry::kv::EtcdStore;
use nexus_registry::Registry;

use nexus_gateway::dynamic::DynamicConfigHolder;
use nexus_gateway::{DynamicConfig, Gateway, GatewayConfig, GATEWAY_NAME, GATEWAY_VERSION};

#[derive(Parser)]
#[command(name = "nexus-gateway")]
#[command(about = "Nexus API gateway")]
#[command(version = GATEWAY_VERSION)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config/nexus-gateway.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    info!("Starting {} v{}", GATEWAY_NAME, GATEWAY_VERSION);

    let config = match GatewayConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            warn!("{}; using default configuration", e);
            GatewayConfig::default()
        }
    };

    // Registry over etcd; unreachable KV is fatal at bootstrap
    let store = EtcdStore::connect(config.registry.to_registry_config()).await?;
    let registry = Arc::new(Registry::new(
        Arc::new(store),
        config.registry.to_registry_config(),
    )?);
    info!("connected to registry at {:?}", config.registry.endpoints);

    // Dynamic policy: config center when reachable, defaults otherwise
    let holder = Arc::new(DynamicConfigHolder::new());
    let client = Arc::new(ConfigClient::new(config.config_center.to_client_config())?);
    client.start().await;

    match client.get_config().await {
        Ok(version) => apply_dynamic_payload(&holder, &version),
        Err(e) => warn!("initial dynamic config unavailable ({}), using defaults", e),
    }
    {
        let holder = holder.clone();
        client
            .add_change_listener(Arc::new(move |version| {
                apply_dynamic_payload(&holder, version);
            }))
            .await;
    }

    let gateway = Gateway::new(config, holder, registry)?;

    let addr: SocketAddr = gateway.addr().parse()?;
    info!("gateway listening on {}", addr);
    let listener = TcpListener::bind(addr).await?;

    let app = gateway
        .router()
        .into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down");
    client.stop();
    gateway.shutdown().await;
    Ok(())
}

/// Parse a config-center payload (YAML or JSON) and install it
fn apply_dynamic_payload(holder: &Arc<DynamicConfigHolder>, version: &ConfigVersion) {
    let format = match version.format.as_str() {
        "json" => ConfigFormat::Json,
        _ => ConfigFormat::Yaml,
    };
    match nexus_config::format::parse_config::<DynamicConfig>(&version.value, format) {
        Ok(dynamic) => {
            holder.store(dynamic);
            info!(
                "dynamic config applied: {}/{} md5={}",
                version.namespace, version.key, version.md5
            );
        }
        Err(e) => {
            error!("invalid dynamic config payload: {}", e);
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Ctrl+C received, shutting down");
        }
        _ = terminate => {
            info!("SIGTERM received, shutting down");
        }
    }
}
