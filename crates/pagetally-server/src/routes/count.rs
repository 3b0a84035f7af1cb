use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Extension, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde_json::json;

use pagetally_core::hit::{CountRequest, Hit, MAX_HITS_PER_REQUEST};
use pagetally_core::session::SessionSource;

use crate::auth::middleware::ApiCaller;
use crate::error::AppError;
use crate::extract::JsonBody;
use crate::state::AppState;

/// `POST /count`: buffer a batch of pageviews for the caller's site.
///
/// Every record is handled on its own: valid records are buffered even
/// when others in the same batch are rejected, and the response lists the
/// rejected indices. Nothing here waits on DuckDB.
#[tracing::instrument(skip_all)]
pub async fn count(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<ApiCaller>,
    JsonBody(req): JsonBody<CountRequest>,
) -> Result<impl IntoResponse, AppError> {
    if req.hits.is_empty() {
        return Err(AppError::BadRequest("no hits".to_string()));
    }
    if req.hits.len() > MAX_HITS_PER_REQUEST {
        return Err(AppError::BadRequest(format!(
            "maximum amount of pageviews in one batch is {MAX_HITS_PER_REQUEST}"
        )));
    }

    let now = state.clock.now();
    let mut errors = BTreeMap::new();
    let mut wake_flusher = false;
    for (i, record) in req.hits.iter().enumerate() {
        let hit = Hit::from_count(&caller.website_id, record, now);
        let source = match SessionSource::from_signals(
            &record.session,
            &record.browser,
            &record.ip,
            req.no_sessions,
        ) {
            Ok(source) => source,
            Err(e) => {
                // Report field errors too, not just the missing session.
                let message = match hit.validate(now) {
                    Ok(()) => e.to_string(),
                    Err(invalid) => format!("{invalid}; {e}"),
                };
                errors.insert(i, message);
                continue;
            }
        };

        match state.memstore.append(hit, source).await {
            Ok(appended) => {
                if appended.buffered >= state.config.buffer_max_size {
                    wake_flusher = true;
                }
            }
            Err(e) => {
                errors.insert(i, e.to_string());
            }
        }
    }

    if wake_flusher {
        state.flusher.wake();
    }
    if !errors.is_empty() {
        tracing::debug!(rejected = errors.len(), "Some hits were rejected");
        return Err(AppError::InvalidHits(errors));
    }
    Ok((StatusCode::ACCEPTED, Json(json!({ "status": "ok" }))))
}
