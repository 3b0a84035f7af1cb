use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};

use pagetally_core::clock::ManualClock;
use pagetally_core::config::Config;
use pagetally_core::export::ExportWriter;
use pagetally_core::hit::{Hit, RefScheme};
use pagetally_duckdb::DuckDbBackend;
use pagetally_server::app::build_app;
use pagetally_server::auth::tokens::issue_token;
use pagetally_server::import::open_input;
use pagetally_server::replay::{read_plan, replay};
use pagetally_server::state::AppState;

fn at(secs: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2020, 6, 18, 14, 0, secs)
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

fn exported(path: &str, session: i64, secs: u32) -> Hit {
    Hit {
        website_id: "site_old".to_string(),
        path: path.to_string(),
        title: String::new(),
        event: false,
        referrer: "example.com/from".to_string(),
        ref_scheme: Some(RefScheme::Http),
        size: "1920,1080,1".to_string(),
        query: String::new(),
        bot: 0,
        browser: "Mozilla/5.0".to_string(),
        location: "NL".to_string(),
        created_at: at(secs),
        session: Some(session),
        first_visit: false,
    }
}

fn write_export(dir: &std::path::Path, hits: &[Hit]) -> String {
    let path = dir.join("replay.csv.gz");
    let mut writer = ExportWriter::create(&path).expect("create export");
    for hit in hits {
        writer.write_hit(hit).expect("write");
    }
    writer.finish().expect("finish");
    path.to_string_lossy().into_owned()
}

struct Harness {
    state: Arc<AppState>,
    app: axum::Router,
    token: String,
    clock: Arc<ManualClock>,
}

async fn harness(dir: &std::path::Path, start: DateTime<Utc>) -> Harness {
    let db = DuckDbBackend::open_in_memory().expect("in-memory DuckDB");
    db.seed_website("site_test", "example.com")
        .await
        .expect("seed website");
    let (token, _) = issue_token(&db, "site_test", "replay", true, false)
        .await
        .expect("token");
    let clock = Arc::new(ManualClock::new(start));
    let state = Arc::new(AppState::with_clock(db, test_config(dir), clock.clone()));
    let app = build_app(Arc::clone(&state));
    Harness {
        state,
        app,
        token,
        clock,
    }
}

#[tokio::test(start_paused = true)]
async fn replay_regroups_sessions_at_original_times() {
    let dir = tempfile::tempdir().expect("tempdir");
    let file = write_export(
        dir.path(),
        &[
            exported("/a", 5, 0),
            exported("/b", 5, 2),
            exported("/c", 9, 2),
            exported("/d", 12, 3),
        ],
    );
    let plan = read_plan(open_input(&file).expect("open"), None).expect("plan");
    assert_eq!(plan.len(), 4);
    assert_eq!(plan.sessions(), 3);

    let h = harness(dir.path(), at(0)).await;
    let wall = ManualClock::new(at(3600));
    let summary = replay(h.app.clone(), &h.token, &h.clock, &wall, plan, 100.0)
        .await
        .expect("replay");
    assert_eq!(summary.sent, 4);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.ticks, 4);

    assert_eq!(h.state.flush_buffer().await.persisted, 4);
    let stored = h
        .state
        .db
        .hits_after("site_test", 0, 10)
        .await
        .expect("hits");
    let find = |path: &str| {
        stored
            .iter()
            .find(|s| s.hit.path == path)
            .map(|s| s.hit.clone())
            .expect("replayed hit")
    };
    let (a, b, c, d) = (find("/a"), find("/b"), find("/c"), find("/d"));
    assert_eq!(a.created_at, at(0));
    assert_eq!(b.created_at, at(2));
    assert_eq!(d.created_at, at(3));
    assert_eq!(a.session, b.session);
    assert_ne!(a.session, c.session);
    assert!(a.first_visit);
    assert!(!b.first_visit);
    assert!(c.first_visit);
    assert_eq!(a.referrer, "example.com/from");
    assert_eq!(a.ref_scheme, Some(RefScheme::Http));
    assert_eq!(a.location, "NL");
}

#[tokio::test(start_paused = true)]
async fn replay_stops_at_wall_clock() {
    let dir = tempfile::tempdir().expect("tempdir");
    let file = write_export(dir.path(), &[exported("/a", 1, 0), exported("/b", 1, 5)]);
    let plan = read_plan(open_input(&file).expect("open"), None).expect("plan");

    let h = harness(dir.path(), at(0)).await;
    let wall = ManualClock::new(at(1));
    let summary = replay(h.app.clone(), &h.token, &h.clock, &wall, plan, 1.0)
        .await
        .expect("replay");
    assert_eq!(summary.sent, 1);
    assert_eq!(summary.ticks, 2);
}

#[tokio::test(start_paused = true)]
async fn rejected_rows_do_not_abort_the_replay() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut bad = exported("/bad", 1, 0);
    bad.location = "NLD".to_string();
    let file = write_export(dir.path(), &[bad, exported("/good", 2, 1)]);
    let plan = read_plan(open_input(&file).expect("open"), None).expect("plan");

    let h = harness(dir.path(), at(0)).await;
    let wall = ManualClock::new(at(3600));
    let summary = replay(h.app.clone(), &h.token, &h.clock, &wall, plan, 10.0)
        .await
        .expect("replay");
    assert_eq!(summary.sent, 2);
    assert_eq!(summary.failed, 1);
    assert_eq!(h.state.memstore.len().await, 1);
}

#[tokio::test]
async fn zero_speed_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let file = write_export(dir.path(), &[exported("/a", 1, 0)]);
    let plan = read_plan(open_input(&file).expect("open"), None).expect("plan");

    let h = harness(dir.path(), at(0)).await;
    let wall = ManualClock::new(at(3600));
    let err = replay(h.app.clone(), &h.token, &h.clock, &wall, plan, 0.0)
        .await
        .expect_err("speed must be positive");
    assert!(err.to_string().contains("speed"));
}
