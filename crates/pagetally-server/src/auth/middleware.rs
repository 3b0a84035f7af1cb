use std::fmt;
use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::error::AppError;
use crate::state::AppState;

use super::tokens::hash_token;

/// A capability an API token can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Count,
    Export,
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Permission::Count => "count",
            Permission::Export => "export",
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Permissions {
    pub count: bool,
    pub export: bool,
}

impl Permissions {
    pub fn has(&self, permission: Permission) -> bool {
        match permission {
            Permission::Count => self.count,
            Permission::Export => self.export,
        }
    }
}

/// Caller identity injected into request extensions after successful auth.
///
/// Every request acts on `website_id`; there is no way to address another site.
#[derive(Debug, Clone)]
pub struct ApiCaller {
    pub token_id: String,
    pub website_id: String,
    pub permissions: Permissions,
}

impl ApiCaller {
    /// Fail with 403 unless the caller holds every permission in `needed`.
    pub fn require(&self, needed: &[Permission]) -> Result<(), AppError> {
        if needed.iter().all(|p| self.permissions.has(*p)) {
            return Ok(());
        }
        let names: Vec<String> = needed.iter().map(ToString::to_string).collect();
        Err(AppError::Forbidden(format!(
            "requires [{}] permissions",
            names.join(", ")
        )))
    }
}

/// The token of a `Bearer <token>` header value: exactly two
/// whitespace-separated fields, the first being `Bearer`.
fn bearer_token(value: &str) -> Option<&str> {
    let mut fields = value.split_whitespace();
    match (fields.next(), fields.next(), fields.next()) {
        (Some("Bearer"), Some(token), None) => Some(token),
        _ => None,
    }
}

/// Resolve the `Authorization: Bearer <token>` header into an [`ApiCaller`].
pub async fn require_token(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let token = match request.headers().get(header::AUTHORIZATION) {
        None => return AppError::Forbidden("no Authorization header".to_string()).into_response(),
        Some(value) => match value.to_str().ok().and_then(bearer_token) {
            Some(token) => token.to_string(),
            None => {
                return AppError::Forbidden("wrong format for Authorization header".to_string())
                    .into_response()
            }
        },
    };

    let record = match state.db.lookup_api_token(&hash_token(&token)).await {
        Ok(Some(record)) => record,
        Ok(None) => return AppError::Forbidden("unknown token".to_string()).into_response(),
        Err(e) => return AppError::Internal(e).into_response(),
    };

    let token_id = record.id.clone();
    request.extensions_mut().insert(ApiCaller {
        token_id: record.id,
        website_id: record.website_id,
        permissions: Permissions {
            count: record.perm_count,
            export: record.perm_export,
        },
    });
    let response = next.run(request).await;

    // Fire-and-forget: update last_used_at.
    let db = Arc::clone(&state.db);
    tokio::spawn(async move {
        if let Err(e) = db.touch_api_token(&token_id).await {
            tracing::warn!(error = %e, "Failed to update token last_used_at");
        }
    });
    response
}

/// Route layer for `/count`: runs before the body is read.
pub async fn require_count(request: Request, next: Next) -> Response {
    require_permission(Permission::Count, request, next).await
}

/// Route layer for the `/export` routes: runs before the body is read.
pub async fn require_export(request: Request, next: Next) -> Response {
    require_permission(Permission::Export, request, next).await
}

async fn require_permission(permission: Permission, request: Request, next: Next) -> Response {
    let allowed = match request.extensions().get::<ApiCaller>() {
        Some(caller) => caller.require(&[permission]),
        None => Err(AppError::Internal(anyhow::anyhow!(
            "permission check before token auth"
        ))),
    };
    match allowed {
        Ok(()) => next.run(request).await,
        Err(e) => e.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caller(count: bool, export: bool) -> ApiCaller {
        ApiCaller {
            token_id: "tok_test".to_string(),
            website_id: "site_test".to_string(),
            permissions: Permissions { count, export },
        }
    }

    #[test]
    fn missing_permissions_are_named() {
        let err = caller(true, false)
            .require(&[Permission::Export])
            .expect_err("must be rejected");
        assert_eq!(err.to_string(), "forbidden: requires [export] permissions");
        assert!(caller(true, false).require(&[Permission::Count]).is_ok());
        assert!(caller(true, true)
            .require(&[Permission::Count, Permission::Export])
            .is_ok());
    }

    #[test]
    fn bearer_header_needs_exactly_two_fields() {
        assert_eq!(bearer_token("Bearer abc"), Some("abc"));
        assert_eq!(bearer_token("  Bearer\tabc "), Some("abc"));
        assert_eq!(bearer_token("Bearer a b"), None);
        assert_eq!(bearer_token("Bearer"), None);
        assert_eq!(bearer_token("Bearer "), None);
        assert_eq!(bearer_token("bearer abc"), None);
        assert_eq!(bearer_token("Token abc"), None);
    }
}
