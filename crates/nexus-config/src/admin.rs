//! Admin REST surface: thin wrappers over storage
//!
//! Publishing a config loads the freshly published item and pushes it
//! through the notifier so hanging pollers wake up. Gray-rule changes on
//! their own are picked up by clients on their next poll cycle.

use axum::extract::{Path, State};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::server::AppState;
use crate::types::{ConfigFormat, ConfigNamespace, ConfigVersion, GrayRule};

/// Uniform admin response envelope
#[derive(Debug, Serialize)]
pub struct AdminResponse<T: Serialize> {
    pub code: u16,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T: Serialize> AdminResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            code: 0,
            message: "ok".to_string(),
            data: Some(data),
        })
    }

    fn error(code: u16, message: impl Into<String>) -> Json<Self> {
        Json(Self {
            code,
            message: message.into(),
            data: None,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateNamespaceRequest {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Deserialize)]
pub struct SaveDraftRequest {
    pub namespace: String,
    pub key: String,
    pub value: String,
    #[serde(default)]
    pub format: ConfigFormat,
}

#[derive(Debug, Deserialize)]
pub struct PublishConfigRequest {
    pub namespace: String,
    pub key: String,
}

#[derive(Debug, Deserialize)]
pub struct SaveGrayRuleRequest {
    pub namespace: String,
    pub key: String,
    pub percentage: u32,
    pub enabled: bool,
}

/// Build the admin router
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/admin/namespaces", post(create_namespace))
        .route("/api/v1/admin/namespaces", get(list_namespaces))
        .route("/api/v1/admin/namespaces/{id}", get(get_namespace))
        .route("/api/v1/admin/namespaces/{id}", delete(delete_namespace))
        .route("/api/v1/admin/configs/draft", post(save_draft))
        .route(
            "/api/v1/admin/configs/{namespace}/{key}/draft",
            get(get_draft),
        )
        .route("/api/v1/admin/configs/publish", post(publish_config))
        .route(
            "/api/v1/admin/configs/{namespace}/{key}",
            delete(delete_config),
        )
        .route("/api/v1/admin/configs/{namespace}", get(list_configs))
        .route("/api/v1/admin/gray", post(save_gray_rule))
        .route("/api/v1/admin/gray/{namespace}/{key}", get(get_gray_rule))
        .route(
            "/api/v1/admin/gray/{namespace}/{key}",
            delete(delete_gray_rule),
        )
        .route("/api/v1/admin/gray/{namespace}", get(list_gray_rules))
        .with_state(state)
}

async fn create_namespace(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateNamespaceRequest>,
) -> Json<AdminResponse<ConfigNamespace>> {
    let now = Utc::now();
    let ns = ConfigNamespace {
        id: req.id,
        name: req.name,
        description: req.description,
        created_at: now,
        updated_at: now,
    };
    match state.storage.create_namespace(ns.clone()).await {
        Ok(()) => AdminResponse::ok(ns),
        Err(e) => AdminResponse::error(500, e.to_string()),
    }
}

async fn list_namespaces(
    State(state): State<Arc<AppState>>,
) -> Json<AdminResponse<Vec<ConfigNamespace>>> {
    match state.storage.list_namespaces().await {
        Ok(list) => AdminResponse::ok(list),
        Err(e) => AdminResponse::error(500, e.to_string()),
    }
}

async fn get_namespace(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Json<AdminResponse<ConfigNamespace>> {
    match state.storage.get_namespace(&id).await {
        Ok(ns) => AdminResponse::ok(ns),
        Err(_) => AdminResponse::error(404, "namespace not found"),
    }
}

async fn delete_namespace(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Json<AdminResponse<()>> {
    match state.storage.delete_namespace(&id).await {
        Ok(()) => AdminResponse::ok(()),
        Err(e) => AdminResponse::error(500, e.to_string()),
    }
}

async fn save_draft(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SaveDraftRequest>,
) -> Json<AdminResponse<()>> {
    match state
        .storage
        .save_draft(&req.namespace, &req.key, &req.value, req.format)
        .await
    {
        Ok(()) => AdminResponse::ok(()),
        Err(e) => AdminResponse::error(500, e.to_string()),
    }
}

async fn get_draft(
    State(state): State<Arc<AppState>>,
    Path((namespace, key)): Path<(String, String)>,
) -> Json<AdminResponse<crate::types::ConfigItem>> {
    match state.storage.get_draft(&namespace, &key).await {
        Ok(item) => AdminResponse::ok(item),
        Err(_) => AdminResponse::error(404, "draft not found"),
    }
}

async fn publish_config(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PublishConfigRequest>,
) -> Json<AdminResponse<()>> {
    if let Err(e) = state.storage.publish_config(&req.namespace, &req.key).await {
        return AdminResponse::error(500, e.to_string());
    }
    info!("config published: {}/{}", req.namespace, req.key);

    // Wake hanging pollers with the published content. Pollers recompute
    // their effective version themselves, so this carries the published
    // slot only.
    if let Ok(item) = state
        .storage
        .get_published_config(&req.namespace, &req.key)
        .await
    {
        let version = ConfigVersion {
            namespace: item.namespace.clone(),
            key: item.key.clone(),
            md5: item.published_md5.clone(),
            value: item.published_value.clone(),
            format: item.format.to_string(),
        };
        state.notifier.notify(&version);
        info!("config change notified: {}/{}", req.namespace, req.key);
    }

    AdminResponse::ok(())
}

async fn delete_config(
    State(state): State<Arc<AppState>>,
    Path((namespace, key)): Path<(String, String)>,
) -> Json<AdminResponse<()>> {
    match state.storage.delete_config(&namespace, &key).await {
        Ok(()) => AdminResponse::ok(()),
        Err(e) => AdminResponse::error(500, e.to_string()),
    }
}

async fn list_configs(
    State(state): State<Arc<AppState>>,
    Path(namespace): Path<String>,
) -> Json<AdminResponse<Vec<crate::types::ConfigItem>>> {
    match state.storage.list_configs(&namespace).await {
        Ok(list) => AdminResponse::ok(list),
        Err(e) => AdminResponse::error(500, e.to_string()),
    }
}

async fn save_gray_rule(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SaveGrayRuleRequest>,
) -> Json<AdminResponse<()>> {
    let now = Utc::now();
    let rule = GrayRule {
        namespace: req.namespace,
        key: req.key,
        percentage: req.percentage,
        enabled: req.enabled,
        created_at: now,
        updated_at: now,
    };
    match state.storage.save_gray_rule(rule).await {
        Ok(()) => AdminResponse::ok(()),
        Err(e) => AdminResponse::error(400, e.to_string()),
    }
}

async fn get_gray_rule(
    State(state): State<Arc<AppState>>,
    Path((namespace, key)): Path<(String, String)>,
) -> Json<AdminResponse<GrayRule>> {
    match state.storage.get_gray_rule(&namespace, &key).await {
        Ok(rule) => AdminResponse::ok(rule),
        Err(_) => AdminResponse::error(404, "gray rule not found"),
    }
}

async fn delete_gray_rule(
    State(state): State<Arc<AppState>>,
    Path((namespace, key)): Path<(String, String)>,
) -> Json<AdminResponse<()>> {
    match state.storage.delete_gray_rule(&namespace, &key).await {
        Ok(()) => AdminResponse::ok(()),
        Err(e) => AdminResponse::error(500, e.to_string()),
    }
}

async fn list_gray_rules(
    State(state): State<Arc<AppState>>,
    Path(namespace): Path<String>,
) -> Json<AdminResponse<Vec<GrayRule>>> {
    match state.storage.list_gray_rules(&namespace).await {
        Ok(list) => AdminResponse::ok(list),
        Err(e) => AdminResponse::error(500, e.to_string()),
    }
}
