//! Configuration center server binary

use anyhow::Result;
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use nexus_config::notifier::ConfigNotifier;
use nexus_config::server::AppState;
use nexus_config::storage::MemoryStorage;
use nexus_config::{admin, server, CONFIG_CENTER_NAME, CONFIG_CENTER_VERSION};

#[derive(Parser)]
#[command(name = "nexus-config-server")]
#[command(about = "Nexus configuration center")]
#[command(version = CONFIG_CENTER_VERSION)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config/nexus-config.toml")]
    config: PathBuf,

    /// Listen address override
    #[arg(long)]
    addr: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ServerConfig {
    #[serde(default)]
    server: ListenConfig,
}

#[derive(Debug, Deserialize)]
struct ListenConfig {
    addr: String,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:8888".to_string(),
        }
    }
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
    info!("Starting {} v{}", CONFIG_CENTER_NAME, CONFIG_CENTER_VERSION);

    let mut config = load_config(&cli.config).await;
    if let Some(addr) = cli.addr {
        config.server.addr = addr;
    }

    let storage = Arc::new(MemoryStorage::new());
    let notifier = Arc::new(ConfigNotifier::new());
    let state = Arc::new(AppState::new(storage, notifier));

    let app = server::router(state.clone()).merge(admin::router(state));

    let addr: std::net::SocketAddr = config.server.addr.parse()?;
    info!("config center listening on {}", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("config center shutdown complete");
    Ok(())
}

async fn load_config(path: &PathBuf) -> ServerConfig {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => config,
            Err(e) => {
                warn!("failed to parse {}: {}, using defaults", path.display(), e);
                ServerConfig::default()
            }
        },
        Err(_) => {
            warn!("no configuration at {}, using defaults", path.display());
            ServerConfig::default()
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
