use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::{
    auth::middleware::{require_count, require_export, require_token},
    routes,
    state::AppState,
};

/// Construct the Axum [`Router`] with all routes and middleware attached.
///
/// Everything except `/health` sits behind token auth; the token decides
/// which site a request acts on. Permissions are checked per route, before
/// any request body is decoded.
pub fn build_app(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route(
            "/count",
            post(routes::count::count).route_layer(middleware::from_fn(require_count)),
        )
        .route(
            "/export",
            post(routes::export::create_export)
                .route_layer(middleware::from_fn(require_export)),
        )
        .route(
            "/export/{id}",
            get(routes::export::get_export).route_layer(middleware::from_fn(require_export)),
        )
        .route(
            "/export/{id}/download",
            get(routes::export::download_export)
                .route_layer(middleware::from_fn(require_export)),
        )
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            require_token,
        ));

    Router::new()
        .route("/health", get(routes::health::health))
        .merge(api)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
