//! Replay a CSV export against the ingestion API at (scaled) real speed.
//!
//! Rows are rebuilt into `POST /count` requests and grouped by the second
//! they were recorded in. A virtual clock then walks forward one second per
//! tick; every request of the current second is sent concurrently through
//! the in-process router, and the harness sleeps `1s / speed` before the
//! next tick. Original IPs were never stored, so each distinct session gets a
//! stable synthetic IP instead and the session resolver regroups them.

use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::net::Ipv4Addr;
use std::time::Duration;

use anyhow::Context;
use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use chrono::{DateTime, Utc};
use tower::ServiceExt;
use tracing::{info, warn};

use pagetally_core::clock::{Clock, ManualClock};
use pagetally_core::export::{ExportReader, ExportRow};
use pagetally_core::hit::{parse_size, CountHit, CountRequest, RefScheme};

use crate::error::ERROR_CODE_HEADER;

/// User agent sent for rows that were exported without one.
pub const REPLAY_USER_AGENT: &str = "pagetally-replay";

/// Reconstructed requests, bucketed by their original second.
#[derive(Debug, Default)]
pub struct ReplayPlan {
    buckets: BTreeMap<i64, Vec<CountRequest>>,
    sessions: usize,
    start: Option<DateTime<Utc>>,
}

impl ReplayPlan {
    /// Build the plan. Rows before `start` are dropped; without `start` the
    /// replay begins at the earliest row.
    pub fn from_rows(
        rows: impl IntoIterator<Item = ExportRow>,
        start: Option<DateTime<Utc>>,
    ) -> Self {
        let mut plan = Self {
            start,
            ..Self::default()
        };
        let mut ips: HashMap<String, Ipv4Addr> = HashMap::new();

        for row in rows {
            if start.is_some_and(|s| row.created_at < s) {
                continue;
            }
            let ip = if row.session.is_empty() {
                None
            } else {
                let next = Ipv4Addr::from(ips.len() as u32);
                Some(*ips.entry(row.session.clone()).or_insert(next))
            };
            plan.buckets
                .entry(row.created_at.timestamp())
                .or_default()
                .push(request_for_row(&row, ip));
        }
        plan.sessions = ips.len();
        plan
    }

    /// Number of requests in the plan.
    pub fn len(&self) -> usize {
        self.buckets.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Distinct sessions, and so distinct synthetic IPs.
    pub fn sessions(&self) -> usize {
        self.sessions
    }

    /// First second the virtual clock shows.
    pub fn first_second(&self) -> Option<DateTime<Utc>> {
        self.start.or_else(|| {
            self.buckets
                .keys()
                .next()
                .and_then(|&secs| DateTime::from_timestamp(secs, 0))
        })
    }

    fn take(&mut self, second: i64) -> Option<Vec<CountRequest>> {
        self.buckets.remove(&second)
    }
}

/// Read an export and build a [`ReplayPlan`] from it.
pub fn read_plan<R: Read>(input: R, start: Option<DateTime<Utc>>) -> anyhow::Result<ReplayPlan> {
    let mut reader = ExportReader::new(input).context("reading export header")?;
    let rows = reader
        .rows()
        .collect::<Result<Vec<_>, _>>()
        .context("reading export rows")?;
    Ok(ReplayPlan::from_rows(rows, start))
}

/// Rebuild the submission a stored row came from.
///
/// `created_at` is left empty: the handler stamps the hit with the virtual
/// clock, which shows the row's original second when it is sent. The
/// referrer is given back its scheme so the stored form is re-derived.
fn request_for_row(row: &ExportRow, ip: Option<Ipv4Addr>) -> CountRequest {
    let (referrer, query) = match row.ref_scheme {
        Some(RefScheme::Http) => (format!("https://{}", row.referrer), String::new()),
        Some(RefScheme::Campaign) => {
            let query = url::form_urlencoded::Serializer::new(String::new())
                .append_pair("utm_source", &row.referrer)
                .finish();
            (String::new(), query)
        }
        _ => (row.referrer.clone(), String::new()),
    };
    let browser = if row.browser.is_empty() {
        REPLAY_USER_AGENT.to_string()
    } else {
        row.browser.clone()
    };

    CountRequest {
        no_sessions: ip.is_none(),
        hits: vec![CountHit {
            path: row.path.clone(),
            title: row.title.clone(),
            event: row.event,
            referrer,
            size: parse_size(&row.size),
            query,
            bot: row.bot,
            browser,
            location: row.location.clone(),
            ip: ip.map(|ip| ip.to_string()).unwrap_or_default(),
            created_at: None,
            session: String::new(),
        }],
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplaySummary {
    /// Requests sent.
    pub sent: usize,
    /// Requests that did not answer 202.
    pub failed: usize,
    /// Seconds the virtual clock advanced through.
    pub ticks: u64,
}

/// Drive `plan` through `app`, authenticating with `token`.
///
/// `virtual_clock` must be the clock the app's state reads. The run ends
/// once the virtual clock passes `wall` or every request has been sent.
/// Failed requests are logged and counted; they never abort the run.
pub async fn replay(
    app: Router,
    token: &str,
    virtual_clock: &ManualClock,
    wall: &dyn Clock,
    mut plan: ReplayPlan,
    speed: f64,
) -> anyhow::Result<ReplaySummary> {
    if !(speed.is_finite() && speed > 0.0) {
        anyhow::bail!("replay speed must be greater than zero");
    }
    let sleep = Duration::from_secs_f64(1.0 / speed);
    let mut summary = ReplaySummary::default();
    let Some(mut now) = plan.first_second() else {
        return Ok(summary);
    };
    info!(
        requests = plan.len(),
        sessions = plan.sessions(),
        start = %now,
        speed,
        "Starting replay"
    );

    let authorization = format!("Bearer {token}");
    loop {
        virtual_clock.set(now);
        if let Some(requests) = plan.take(now.timestamp()) {
            info!(requests = requests.len(), at = %now.format("%Y-%m-%d %H:%M:%S"), "Replaying");
            let sends = requests
                .iter()
                .map(|req| send(app.clone(), &authorization, req));
            for ok in futures::future::join_all(sends).await {
                summary.sent += 1;
                if !ok {
                    summary.failed += 1;
                }
            }
        }

        now += chrono::Duration::seconds(1);
        summary.ticks += 1;
        if now > wall.now() || plan.is_empty() {
            break;
        }
        tokio::time::sleep(sleep).await;
    }

    info!(sent = summary.sent, failed = summary.failed, "Replay finished");
    Ok(summary)
}

async fn send(app: Router, authorization: &str, body: &CountRequest) -> bool {
    let body = match serde_json::to_vec(body) {
        Ok(body) => body,
        Err(e) => {
            warn!(error = %e, "Could not encode replay request");
            return false;
        }
    };
    let request = match Request::builder()
        .method("POST")
        .uri("/count")
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::AUTHORIZATION, authorization)
        .body(Body::from(body))
    {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "Could not build replay request");
            return false;
        }
    };

    match app.oneshot(request).await {
        Ok(response) if response.status() == StatusCode::ACCEPTED => true,
        Ok(response) => {
            let code = response
                .headers()
                .get(ERROR_CODE_HEADER)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default();
            warn!(status = response.status().as_u16(), error_code = code, "Replay request failed");
            false
        }
        Err(e) => {
            warn!(error = %e, "Replay request failed");
            false
        }
    }
}
