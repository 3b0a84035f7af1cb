use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use pagetally_core::config::Config;
use pagetally_duckdb::DuckDbBackend;
use pagetally_server::app::build_app;
use pagetally_server::auth::tokens::issue_token;
use pagetally_server::error::ERROR_CODE_HEADER;
use pagetally_server::state::AppState;

fn test_config() -> Config {
    Config {
        port: 0,
        data_dir: "/tmp/pagetally-test".to_string(),
        buffer_flush_interval_ms: 60_000,
        buffer_max_size: 10_000,
        salt_rotation_secs: 86_400,
        export_concurrency: 1,
        shutdown_timeout_secs: 5,
        duckdb_memory_limit: "256MB".to_string(),
    }
}

async fn setup() -> (Arc<AppState>, axum::Router) {
    let db = DuckDbBackend::open_in_memory().expect("in-memory DuckDB");
    db.seed_website("site_test", "example.com")
        .await
        .expect("seed website");
    let state = Arc::new(AppState::new(db, test_config()));
    let app = build_app(Arc::clone(&state));
    (state, app)
}

fn count_request(authorization: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/count")
        .header("content-type", "application/json");
    if let Some(value) = authorization {
        builder = builder.header("authorization", value);
    }
    builder
        .body(Body::from(
            json!({"no_sessions": true, "hits": [{"path": "/x"}]}).to_string(),
        ))
        .expect("request")
}

async fn json_body(response: axum::http::Response<Body>) -> Value {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("read body")
        .to_bytes();
    serde_json::from_slice(&bytes).expect("json")
}

async fn assert_forbidden(response: axum::http::Response<Body>, message: &str) {
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(
        response
            .headers()
            .get(ERROR_CODE_HEADER)
            .and_then(|v| v.to_str().ok()),
        Some("forbidden")
    );
    assert_eq!(json_body(response).await, json!({"error": message}));
}

#[tokio::test]
async fn missing_authorization_header_is_forbidden() {
    let (state, app) = setup().await;
    let response = app.oneshot(count_request(None)).await.expect("response");
    assert_forbidden(response, "no Authorization header").await;
    assert!(state.memstore.is_empty().await);
}

#[tokio::test]
async fn non_bearer_authorization_is_forbidden() {
    let (_state, app) = setup().await;
    let response = app
        .oneshot(count_request(Some("Basic dXNlcjpwYXNz")))
        .await
        .expect("response");
    assert_forbidden(response, "wrong format for Authorization header").await;
}

#[tokio::test]
async fn unknown_token_is_forbidden() {
    let (_state, app) = setup().await;
    let response = app
        .oneshot(count_request(Some("Bearer ptk_00000000000000000000000000000000")))
        .await
        .expect("response");
    assert_forbidden(response, "unknown token").await;
}

#[tokio::test]
async fn token_without_count_permission_cannot_count() {
    let (state, app) = setup().await;
    let (token, _) = issue_token(&state.db, "site_test", "exports only", false, true)
        .await
        .expect("token");

    let response = app
        .oneshot(count_request(Some(&format!("Bearer {token}"))))
        .await
        .expect("response");
    assert_forbidden(response, "requires [count] permissions").await;
    assert!(state.memstore.is_empty().await);
}

#[tokio::test]
async fn token_without_export_permission_cannot_export() {
    let (state, app) = setup().await;
    let (token, _) = issue_token(&state.db, "site_test", "count only", true, false)
        .await
        .expect("token");

    let request = Request::builder()
        .method("POST")
        .uri("/export")
        .header("content-type", "application/json")
        .header("authorization", format!("Bearer {token}"))
        .body(Body::from("{}"))
        .expect("request");
    let response = app.oneshot(request).await.expect("response");
    assert_forbidden(response, "requires [export] permissions").await;
}

#[tokio::test]
async fn valid_token_counts_for_its_own_site() {
    let (state, app) = setup().await;
    let (token, _) = issue_token(&state.db, "site_test", "counter", true, false)
        .await
        .expect("token");

    let response = app
        .oneshot(count_request(Some(&format!("Bearer {token}"))))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    state.flush_buffer().await;
    assert_eq!(state.db.count_hits("site_test").await.expect("count"), 1);
}

#[tokio::test]
async fn bearer_header_with_wrong_field_count_is_forbidden() {
    let (state, app) = setup().await;
    let (token, _) = issue_token(&state.db, "site_test", "counter", true, false)
        .await
        .expect("token");

    for value in ["Bearer".to_string(), "Bearer a b".to_string(), format!("Bearer {token} x")] {
        let response = app
            .clone()
            .oneshot(count_request(Some(&value)))
            .await
            .expect("response");
        assert_forbidden(response, "wrong format for Authorization header").await;
    }
    assert!(state.memstore.is_empty().await);
}

#[tokio::test]
async fn permission_is_checked_before_the_body_is_read() {
    let (state, app) = setup().await;
    let (exporter, _) = issue_token(&state.db, "site_test", "exports only", false, true)
        .await
        .expect("token");
    let (counter, _) = issue_token(&state.db, "site_test", "count only", true, false)
        .await
        .expect("token");

    for (uri, token, message) in [
        ("/count", &exporter, "requires [count] permissions"),
        ("/export", &counter, "requires [export] permissions"),
    ] {
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .header("authorization", format!("Bearer {token}"))
            .body(Body::from(r#"{"hits": [ "#))
            .expect("request");
        let response = app.clone().oneshot(request).await.expect("response");
        assert_forbidden(response, message).await;
    }
}
