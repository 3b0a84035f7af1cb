use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use chrono::{DateTime, TimeZone, Utc};
use flate2::read::GzDecoder;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use pagetally_core::clock::ManualClock;
use pagetally_core::config::Config;
use pagetally_core::store::CreateExport;
use pagetally_duckdb::DuckDbBackend;
use pagetally_server::app::build_app;
use pagetally_server::auth::tokens::issue_token;
use pagetally_server::state::AppState;

fn server_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2020, 6, 18, 14, 42, 0)
        .single()
        .expect("valid date")
}

fn test_config(data_dir: &std::path::Path) -> Config {
    Config {
        port: 0,
        data_dir: data_dir.to_string_lossy().into_owned(),
        buffer_flush_interval_ms: 60_000,
        buffer_max_size: 10_000,
        salt_rotation_secs: 86_400,
        export_concurrency: 1,
        shutdown_timeout_secs: 5,
        duckdb_memory_limit: "256MB".to_string(),
    }
}

struct TestApp {
    state: Arc<AppState>,
    app: axum::Router,
    token: String,
    _dir: tempfile::TempDir,
}

async fn setup() -> TestApp {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = DuckDbBackend::open_in_memory().expect("in-memory DuckDB");
    db.seed_website("site_test", "example.com")
        .await
        .expect("seed website");
    let (token, _) = issue_token(&db, "site_test", "test", true, true)
        .await
        .expect("token");
    let clock = Arc::new(ManualClock::new(server_now()));
    let state = Arc::new(AppState::with_clock(db, test_config(dir.path()), clock));
    let app = build_app(Arc::clone(&state));
    TestApp {
        state,
        app,
        token,
        _dir: dir,
    }
}

fn json_request(token: &str, method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .header("authorization", format!("Bearer {token}"))
        .body(Body::from(body.to_string()))
        .expect("request")
}

fn get_request(token: &str, uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .header("authorization", format!("Bearer {token}"))
        .body(Body::empty())
        .expect("request")
}

async fn body_bytes(response: axum::http::Response<Body>) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .expect("read body")
        .to_bytes()
        .to_vec()
}

async fn json_body(response: axum::http::Response<Body>) -> Value {
    serde_json::from_slice(&body_bytes(response).await).expect("json")
}

/// Count `paths` and flush them to DuckDB.
async fn count_and_flush(t: &TestApp, paths: &[&str]) {
    let hits: Vec<Value> = paths.iter().map(|p| json!({"path": p})).collect();
    let response = t
        .app
        .clone()
        .oneshot(json_request(
            &t.token,
            "POST",
            "/count",
            json!({"no_sessions": true, "hits": hits}),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(t.state.flush_buffer().await.persisted, paths.len());
}

/// Start an export, wait for the job, and return the finished export.
async fn export_and_wait(t: &TestApp, start_from_hit_id: i64) -> Value {
    let response = t
        .app
        .clone()
        .oneshot(json_request(
            &t.token,
            "POST",
            "/export",
            json!({"start_from_hit_id": start_from_hit_id}),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let created = json_body(response).await;
    assert_eq!(created["state"], "pending");
    assert_eq!(created["start_from_hit_id"], start_from_hit_id);

    assert_eq!(t.state.jobs.join_all(Duration::from_secs(10)).await, 0);

    let id = created["id"].as_i64().expect("export id");
    let response = t
        .app
        .clone()
        .oneshot(get_request(&t.token, &format!("/export/{id}")))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    json_body(response).await
}

fn gunzip(bytes: &[u8]) -> String {
    let mut csv = String::new();
    GzDecoder::new(bytes)
        .read_to_string(&mut csv)
        .expect("valid gzip");
    csv
}

#[tokio::test]
async fn export_runs_in_background_and_downloads() {
    let t = setup().await;
    count_and_flush(&t, &["/a", "/b", "/c"]).await;

    let export = export_and_wait(&t, 0).await;
    assert_eq!(export["state"], "done");
    assert_eq!(export["num_rows"], 3);
    assert!(export["hash"]
        .as_str()
        .expect("hash")
        .starts_with("sha256-"));
    assert!(export["error"].is_null());
    let id = export["id"].as_i64().expect("id");

    let response = t
        .app
        .clone()
        .oneshot(get_request(&t.token, &format!("/export/{id}/download")))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).map(|v| v.as_bytes()),
        Some(&b"application/gzip"[..])
    );
    let disposition = response
        .headers()
        .get(header::CONTENT_DISPOSITION)
        .and_then(|v| v.to_str().ok())
        .expect("content-disposition")
        .to_string();
    assert!(disposition.starts_with("attachment;"));
    assert!(disposition.contains(&format!(
        "pagetally-export-site_test-20200618T144200-{id}.csv.gz"
    )));

    let bytes = body_bytes(response).await;
    assert_eq!(export["size"].as_u64(), Some(bytes.len() as u64));
    let csv = gunzip(&bytes);
    let lines: Vec<&str> = csv.lines().collect();
    assert_eq!(lines.len(), 4);
    assert!(lines[0].starts_with("1Path,Title,Event"));
    assert!(lines[1].starts_with("/a,"));
    assert!(lines[3].starts_with("/c,"));
}

#[tokio::test]
async fn export_resumes_from_last_hit() {
    let t = setup().await;
    count_and_flush(&t, &["/a", "/b"]).await;
    let first = export_and_wait(&t, 0).await;
    let cursor = first["last_hit_id"].as_i64().expect("cursor");

    count_and_flush(&t, &["/c"]).await;
    let second = export_and_wait(&t, cursor).await;
    assert_eq!(second["state"], "done");
    assert_eq!(second["num_rows"], 1);
    assert!(second["last_hit_id"].as_i64().expect("cursor") > cursor);

    // Nothing new: the cursor stays where it was.
    let third = export_and_wait(&t, second["last_hit_id"].as_i64().expect("cursor")).await;
    assert_eq!(third["num_rows"], 0);
    assert_eq!(third["last_hit_id"], second["last_hit_id"]);
}

#[tokio::test]
async fn unfinished_export_is_joined_or_conflicts() {
    let t = setup().await;
    let pending = match t
        .state
        .db
        .create_export("site_test", 0, &t.state.config.export_dir(), server_now())
        .await
        .expect("create")
    {
        CreateExport::Created(export) => export,
        other => panic!("expected a new export, got {other:?}"),
    };

    let response = t
        .app
        .clone()
        .oneshot(json_request(&t.token, "POST", "/export", json!({})))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(json_body(response).await["id"], pending.id);

    let response = t
        .app
        .clone()
        .oneshot(json_request(
            &t.token,
            "POST",
            "/export",
            json!({"start_from_hit_id": 5}),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(
        json_body(response).await,
        json!({"error": "an export is already running"})
    );

    let response = t
        .app
        .clone()
        .oneshot(get_request(
            &t.token,
            &format!("/export/{}/download", pending.id),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(
        json_body(response).await,
        json!({"error": "export is not finished"})
    );
    assert_eq!(t.state.jobs.in_flight(), 0);
}

#[tokio::test]
async fn missing_export_file_redirects_with_flash() {
    let t = setup().await;
    count_and_flush(&t, &["/a"]).await;
    let export = export_and_wait(&t, 0).await;
    std::fs::remove_file(export["path"].as_str().expect("path")).expect("remove export file");

    let id = export["id"].as_i64().expect("id");
    let response = t
        .app
        .clone()
        .oneshot(get_request(&t.token, &format!("/export/{id}/download")))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(
        response.headers().get(header::LOCATION).map(|v| v.as_bytes()),
        Some(&b"/settings#tab-export"[..])
    );
    let cookie = response
        .headers()
        .get(header::SET_COOKIE)
        .and_then(|v| v.to_str().ok())
        .expect("flash cookie");
    assert!(cookie.starts_with("flash=It+looks+like+there+is+no+export+yet."));
}

#[tokio::test]
async fn exports_of_other_sites_are_not_found() {
    let t = setup().await;
    count_and_flush(&t, &["/a"]).await;
    let export = export_and_wait(&t, 0).await;
    let id = export["id"].as_i64().expect("id");

    t.state
        .db
        .seed_website("site_other", "other.example")
        .await
        .expect("seed");
    let (other, _) = issue_token(&t.state.db, "site_other", "other", false, true)
        .await
        .expect("token");

    for uri in [format!("/export/{id}"), format!("/export/{id}/download")] {
        let response = t
            .app
            .clone()
            .oneshot(get_request(&other, &uri))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(response).await, json!({"error": "export not found"}));
    }
}

#[tokio::test]
async fn negative_cursor_is_rejected() {
    let t = setup().await;
    let response = t
        .app
        .clone()
        .oneshot(json_request(
            &t.token,
            "POST",
            "/export",
            json!({"start_from_hit_id": -1}),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert!(body["error"]
        .as_str()
        .expect("message")
        .contains("start_from_hit_id"));
}

#[tokio::test]
async fn concurrent_creates_share_one_export() {
    let t = setup().await;
    count_and_flush(&t, &["/a", "/b"]).await;

    let requests = (0..4).map(|_| {
        t.app.clone().oneshot(json_request(
            &t.token,
            "POST",
            "/export",
            json!({"start_from_hit_id": 0}),
        ))
    });
    let responses = futures::future::join_all(requests).await;

    let mut ids = Vec::new();
    for response in responses {
        let response = response.expect("response");
        match response.status() {
            StatusCode::ACCEPTED => {
                ids.push(json_body(response).await["id"].as_i64().expect("id"));
            }
            StatusCode::CONFLICT => {}
            other => panic!("unexpected status {other}"),
        }
    }
    assert!(!ids.is_empty());
    assert!(ids.iter().all(|id| *id == ids[0]), "ids: {ids:?}");

    assert_eq!(t.state.jobs.join_all(Duration::from_secs(10)).await, 0);
    assert!(t
        .state
        .db
        .get_export("site_test", ids[0] + 1)
        .await
        .expect("lookup")
        .is_none());
    let files = std::fs::read_dir(t.state.config.export_dir())
        .expect("export dir")
        .count();
    assert_eq!(files, 1);

    let export = t
        .state
        .db
        .get_export("site_test", ids[0])
        .await
        .expect("lookup")
        .expect("export");
    assert_eq!(export.num_rows, Some(2));
}
