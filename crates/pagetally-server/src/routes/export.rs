use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Extension, Path, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use tokio_util::io::ReaderStream;

use pagetally_core::export::{Export, ExportState};
use pagetally_core::store::CreateExport;

use crate::auth::middleware::ApiCaller;
use crate::error::AppError;
use crate::extract::JsonBody;
use crate::state::AppState;

/// Where the browser is sent when an export file has gone missing.
const EXPORT_SETTINGS_URL: &str = "/settings#tab-export";
const MISSING_FILE_FLASH: &str = "It looks like there is no export yet.";

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CreateExportRequest {
    /// Only hits with a larger id are exported; pass the `last_hit_id` of a
    /// previous export to resume from it.
    pub start_from_hit_id: i64,
}

/// `POST /export`: start an export of the caller's site.
///
/// Answers 202 with the export right away; the file is written in the
/// background. If an export with the same cursor is already unfinished it is
/// returned instead of starting another; a different cursor is a conflict.
#[tracing::instrument(skip_all)]
pub async fn create_export(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<ApiCaller>,
    JsonBody(req): JsonBody<CreateExportRequest>,
) -> Result<Response, AppError> {
    if req.start_from_hit_id < 0 {
        return Err(AppError::BadRequest(
            "start_from_hit_id: must be zero or positive".to_string(),
        ));
    }

    let created = state
        .db
        .create_export(
            &caller.website_id,
            req.start_from_hit_id,
            &state.config.export_dir(),
            state.clock.now(),
        )
        .await?;

    let export = match created {
        CreateExport::Created(export) => {
            tracing::info!(
                export_id = export.id,
                website_id = %export.site_id,
                start_from_hit_id = export.start_from_hit_id,
                "Export created"
            );
            state.spawn_export(export.clone());
            export
        }
        CreateExport::Joined(export) => {
            tracing::debug!(export_id = export.id, "Joined unfinished export");
            export
        }
        CreateExport::Conflict(existing) => {
            tracing::debug!(export_id = existing.id, "Export already running with another cursor");
            return Err(AppError::Conflict("an export is already running".to_string()));
        }
    };

    Ok((StatusCode::ACCEPTED, Json(export)).into_response())
}

async fn load_export(state: &AppState, caller: &ApiCaller, id: i64) -> Result<Export, AppError> {
    state
        .db
        .get_export(&caller.website_id, id)
        .await?
        .ok_or_else(|| AppError::NotFound("export not found".to_string()))
}

/// `GET /export/{id}`: poll an export of the caller's site.
#[tracing::instrument(skip(state, caller))]
pub async fn get_export(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<ApiCaller>,
    Path(id): Path<i64>,
) -> Result<Json<Export>, AppError> {
    Ok(Json(load_export(&state, &caller, id).await?))
}

/// `GET /export/{id}/download`: stream the compressed export file.
///
/// An export whose file has been removed redirects back to the export
/// settings with a flash message rather than answering 404; the export
/// itself still exists.
#[tracing::instrument(skip(state, caller))]
pub async fn download_export(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<ApiCaller>,
    Path(id): Path<i64>,
) -> Result<Response, AppError> {
    let export = load_export(&state, &caller, id).await?;
    if export.state != ExportState::Done {
        return Err(AppError::Conflict("export is not finished".to_string()));
    }

    let file = match tokio::fs::File::open(&export.path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(export_id = export.id, path = %export.path, "Export file is missing");
            return Ok(missing_file_redirect());
        }
        Err(e) => return Err(AppError::Internal(e.into())),
    };

    let disposition = format!("attachment; filename=\"{}\"", export.file_name());
    let disposition = HeaderValue::from_str(&disposition)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("invalid file name: {e}")))?;

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, HeaderValue::from_static("application/gzip")),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        Body::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}

fn missing_file_redirect() -> Response {
    let flash: String = url::form_urlencoded::byte_serialize(MISSING_FILE_FLASH.as_bytes()).collect();
    let cookie = format!("flash={flash}; Path=/; HttpOnly; SameSite=Lax");
    let mut response = (
        StatusCode::SEE_OTHER,
        [(header::LOCATION, HeaderValue::from_static(EXPORT_SETTINGS_URL))],
    )
        .into_response();
    if let Ok(value) = HeaderValue::from_str(&cookie) {
        response.headers_mut().insert(header::SET_COOKIE, value);
    }
    response
}
