use axum::error_handling::HandleErrorLayer;
use axum::extract::DefaultBodyLimit;
use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::api::*;
use crate::config::Config;
use crate::error::{handle_middleware_error, normalize_errors};

pub fn create_router(service: SharedService, config: &Config) -> Router {
    let state = AppState {
        service,
        json_body_bytes: config.limits.json_body_bytes,
    };

    let collection = post(create_solar)
        .get(list_solar)
        .fallback(route_not_found)
        .layer(DefaultBodyLimit::max(config.limits.upload_body_bytes));
    let document = get(get_solar)
        .put(update_solar)
        .delete(delete_solar)
        .fallback(route_not_found)
        .layer(DefaultBodyLimit::max(config.limits.upload_body_bytes));

    // Trailing-slash forms resolve to the same handlers.
    Router::new()
        .route("/health", get(health_check).fallback(route_not_found))
        .route("/api/solar", collection.clone())
        .route("/api/solar/", collection)
        .route("/api/solar/:id", document.clone())
        .route("/api/solar/:id/", document)
        .route("/media/*key", get(get_media).fallback(route_not_found))
        .fallback(route_not_found)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(CompressionLayer::new())
                .layer(middleware::from_fn_with_state(config.mode, normalize_errors))
                .layer(HandleErrorLayer::new(handle_middleware_error))
                .timeout(Duration::from_secs(config.limits.request_timeout_secs)),
        )
        .with_state(state)
}
