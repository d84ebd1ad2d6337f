//! Long-poll configuration delivery endpoints

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::gray::effective_version;
use crate::notifier::ConfigNotifier;
use crate::storage::Storage;
use crate::types::ConfigVersion;

/// How long the server holds an unchanged poll before answering
pub const DEFAULT_POLL_HOLD: Duration = Duration::from_secs(30);

/// Shared state behind the delivery endpoints
pub struct AppState {
    pub storage: Arc<dyn Storage>,
    pub notifier: Arc<ConfigNotifier>,
    pub poll_hold: Duration,
}

impl AppState {
    pub fn new(storage: Arc<dyn Storage>, notifier: Arc<ConfigNotifier>) -> Self {
        Self {
            storage,
            notifier,
            poll_hold: DEFAULT_POLL_HOLD,
        }
    }

    /// Override the hold duration (tests shorten it)
    pub fn with_poll_hold(mut self, hold: Duration) -> Self {
        self.poll_hold = hold;
        self
    }
}

/// Long-poll request body
#[derive(Debug, Deserialize)]
pub struct PollConfigRequest {
    pub namespace: String,
    pub key: String,
    pub client_id: String,
    /// Fingerprint of the configuration the client currently holds
    #[serde(default)]
    pub md5: String,
}

/// Long-poll response body
#[derive(Debug, Serialize)]
pub struct PollConfigResponse {
    pub changed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<ConfigVersion>,
}

/// Immediate fetch request body
#[derive(Debug, Deserialize)]
pub struct GetConfigRequest {
    pub namespace: String,
    pub key: String,
    pub client_id: String,
}

/// Build the delivery router
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/config/poll", post(poll_config))
        .route("/api/v1/config/get", post(get_config))
        .route("/health", get(health))
        .with_state(state)
}

/// Compute the effective version a client should see right now
async fn current_version(
    state: &AppState,
    namespace: &str,
    key: &str,
    client_id: &str,
) -> Option<ConfigVersion> {
    let item = state.storage.get_published_config(namespace, key).await.ok()?;
    let gray = state.storage.get_gray_rule(namespace, key).await.ok();
    Some(effective_version(&item, gray.as_ref(), client_id))
}

async fn poll_config(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PollConfigRequest>,
) -> Json<PollConfigResponse> {
    let Some(version) = current_version(&state, &req.namespace, &req.key, &req.client_id).await
    else {
        return Json(PollConfigResponse {
            changed: false,
            version: None,
        });
    };

    // Fingerprint mismatch: answer immediately
    if version.md5 != req.md5 {
        info!(
            "config changed, client_md5={}, server_md5={}",
            req.md5, version.md5
        );
        return Json(PollConfigResponse {
            changed: true,
            version: Some(version),
        });
    }

    debug!(
        "config unchanged, waiting for change: {}/{}",
        req.namespace, req.key
    );
    let woken = state
        .notifier
        .wait_for_change(&req.namespace, &req.key, state.poll_hold)
        .await;

    match woken {
        Some(notified) => {
            // Recompute: the gray rule may have changed alongside the
            // publish that woke us up.
            let version =
                current_version(&state, &req.namespace, &req.key, &req.client_id)
                    .await
                    .unwrap_or(notified);
            Json(PollConfigResponse {
                changed: true,
                version: Some(version),
            })
        }
        None => Json(PollConfigResponse {
            changed: false,
            version: None,
        }),
    }
}

async fn get_config(
    State(state): State<Arc<AppState>>,
    Json(req): Json<GetConfigRequest>,
) -> Result<Json<ConfigVersion>, (axum::http::StatusCode, Json<serde_json::Value>)> {
    match current_version(&state, &req.namespace, &req.key, &req.client_id).await {
        Some(version) => Ok(Json(version)),
        None => Err((
            axum::http::StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "config not found" })),
        )),
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "time": chrono::Utc::now().timestamp(),
    }))
}
