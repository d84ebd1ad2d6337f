//! Long-poll protocol behavior over the in-memory storage

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::Router;
use http::{Request, StatusCode};
use tower::ServiceExt;

use nexus_config::notifier::ConfigNotifier;
use nexus_config::server::AppState;
use nexus_config::storage::{MemoryStorage, Storage};
use nexus_config::types::{fingerprint, ConfigFormat, ConfigVersion};
use nexus_config::{admin, server};

const HOLD: Duration = Duration::from_millis(300);

fn test_app() -> (Router, Arc<AppState>) {
    let storage = Arc::new(MemoryStorage::new());
    let notifier = Arc::new(ConfigNotifier::new());
    let state = Arc::new(AppState::new(storage, notifier).with_poll_hold(HOLD));
    let app = server::router(state.clone()).merge(admin::router(state.clone()));
    (app, state)
}

async fn post_json(app: &Router, uri: &str, body: serde_json::Value) -> (StatusCode, serde_json::Value) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
    (status, value)
}

async fn publish(app: &Router, namespace: &str, key: &str, value: &str) {
    let (status, body) = post_json(
        app,
        "/api/v1/admin/configs/draft",
        serde_json::json!({
            "namespace": namespace,
            "key": key,
            "value": value,
            "format": "yaml",
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["code"], 0);

    let (status, body) = post_json(
        app,
        "/api/v1/admin/configs/publish",
        serde_json::json!({ "namespace": namespace, "key": key }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["code"], 0);
}

#[tokio::test]
async fn get_returns_published_version() {
    let (app, _state) = test_app();
    publish(&app, "myapp", "app.yaml", "k: 1").await;

    let (status, body) = post_json(
        &app,
        "/api/v1/config/get",
        serde_json::json!({ "namespace": "myapp", "key": "app.yaml", "client_id": "c1" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["value"], "k: 1");
    assert_eq!(body["md5"], fingerprint("k: 1"));
    assert_eq!(body["format"], "yaml");
}

#[tokio::test]
async fn get_unknown_config_is_not_found() {
    let (app, _state) = test_app();
    let (status, _) = post_json(
        &app,
        "/api/v1/config/get",
        serde_json::json!({ "namespace": "myapp", "key": "missing", "client_id": "c1" }),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn stale_fingerprint_short_circuits() {
    let (app, _state) = test_app();
    publish(&app, "myapp", "app.yaml", "k: 1").await;

    let started = Instant::now();
    let (status, body) = post_json(
        &app,
        "/api/v1/config/poll",
        serde_json::json!({
            "namespace": "myapp",
            "key": "app.yaml",
            "client_id": "c1",
            "md5": "stale",
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["changed"], true);
    assert_eq!(body["version"]["md5"], fingerprint("k: 1"));
    assert!(started.elapsed() < HOLD / 2, "poll did not short-circuit");
}

#[tokio::test]
async fn missing_config_answers_unchanged() {
    let (app, _state) = test_app();
    let (_, body) = post_json(
        &app,
        "/api/v1/config/poll",
        serde_json::json!({
            "namespace": "myapp",
            "key": "missing",
            "client_id": "c1",
            "md5": "",
        }),
    )
    .await;
    assert_eq!(body["changed"], false);
}

#[tokio::test]
async fn matching_fingerprint_waits_until_publish() {
    let (app, _state) = test_app();
    publish(&app, "myapp", "app.yaml", "k: 1").await;

    let poller = {
        let app = app.clone();
        tokio::spawn(async move {
            post_json(
                &app,
                "/api/v1/config/poll",
                serde_json::json!({
                    "namespace": "myapp",
                    "key": "app.yaml",
                    "client_id": "c1",
                    "md5": fingerprint("k: 1"),
                }),
            )
            .await
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    publish(&app, "myapp", "app.yaml", "k: 2").await;

    let (status, body) = poller.await.unwrap();
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["changed"], true);
    assert_eq!(body["version"]["value"], "k: 2");
    assert_eq!(body["version"]["md5"], fingerprint("k: 2"));
}

#[tokio::test]
async fn matching_fingerprint_times_out_unchanged() {
    let (app, _state) = test_app();
    publish(&app, "myapp", "app.yaml", "k: 1").await;

    let started = Instant::now();
    let (_, body) = post_json(
        &app,
        "/api/v1/config/poll",
        serde_json::json!({
            "namespace": "myapp",
            "key": "app.yaml",
            "client_id": "c1",
            "md5": fingerprint("k: 1"),
        }),
    )
    .await;
    assert_eq!(body["changed"], false);
    assert!(started.elapsed() >= HOLD, "poll answered before the hold");
}

#[tokio::test]
async fn gray_rule_routes_draft_to_pinned_clients() {
    let (app, state) = test_app();
    publish(&app, "myapp", "app.yaml", "k: 1").await;

    // new draft, not published, rolled out to everyone
    state
        .storage
        .save_draft("myapp", "app.yaml", "k: 2", ConfigFormat::Yaml)
        .await
        .unwrap();
    let (status, body) = post_json(
        &app,
        "/api/v1/admin/gray",
        serde_json::json!({
            "namespace": "myapp",
            "key": "app.yaml",
            "percentage": 100,
            "enabled": true,
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["code"], 0);

    let (_, body) = post_json(
        &app,
        "/api/v1/config/poll",
        serde_json::json!({
            "namespace": "myapp",
            "key": "app.yaml",
            "client_id": "c1",
            "md5": fingerprint("k: 1"),
        }),
    )
    .await;
    assert_eq!(body["changed"], true);
    assert_eq!(body["version"]["value"], "k: 2");

    // disabling the rule reverts clients to the published value
    let (_, body) = post_json(
        &app,
        "/api/v1/admin/gray",
        serde_json::json!({
            "namespace": "myapp",
            "key": "app.yaml",
            "percentage": 100,
            "enabled": false,
        }),
    )
    .await;
    assert_eq!(body["code"], 0);

    let (_, body) = post_json(
        &app,
        "/api/v1/config/get",
        serde_json::json!({ "namespace": "myapp", "key": "app.yaml", "client_id": "c1" }),
    )
    .await;
    assert_eq!(body["value"], "k: 1");
}

#[tokio::test]
async fn poll_wakeup_recomputes_gray_assignment() {
    let (app, state) = test_app();
    publish(&app, "myapp", "app.yaml", "k: 1").await;

    // a poller hangs with the current fingerprint
    let poller = {
        let app = app.clone();
        tokio::spawn(async move {
            post_json(
                &app,
                "/api/v1/config/poll",
                serde_json::json!({
                    "namespace": "myapp",
                    "key": "app.yaml",
                    "client_id": "c1",
                    "md5": fingerprint("k: 1"),
                }),
            )
            .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    // while it hangs: a draft lands, the gray rule opens to everyone, and
    // a republish of the same published value wakes the poller
    state
        .storage
        .save_draft("myapp", "app.yaml", "k: 3", ConfigFormat::Yaml)
        .await
        .unwrap();
    post_json(
        &app,
        "/api/v1/admin/gray",
        serde_json::json!({
            "namespace": "myapp",
            "key": "app.yaml",
            "percentage": 100,
            "enabled": true,
        }),
    )
    .await;
    state.notifier.notify(&ConfigVersion {
        namespace: "myapp".to_string(),
        key: "app.yaml".to_string(),
        md5: fingerprint("k: 1"),
        value: "k: 1".to_string(),
        format: "yaml".to_string(),
    });

    // the response reflects the recomputed effective version, not the
    // payload that woke the poller
    let (_, body) = poller.await.unwrap();
    assert_eq!(body["changed"], true);
    assert_eq!(body["version"]["value"], "k: 3");
}
