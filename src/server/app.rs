use axum::{
    http::{Method, Uri},
    Router,
};
use tower_http::{
    cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer},
    limit::RequestBodyLimitLayer,
    trace::TraceLayer,
};

use crate::api::api_routes;
use crate::error::AppError;
use crate::postgres::Connector;

use super::AppState;

/// Maximum accepted request body size
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

pub fn create_app<C: Connector>(state: AppState<C>) -> Router {
    // Reflect the caller's origin so credentialed requests work from any origin
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true);

    Router::new()
        .merge(api_routes())
        .fallback(not_found)
        // Add middleware
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        // Add state
        .with_state(state)
}

async fn not_found(method: Method, uri: Uri) -> AppError {
    AppError::NotFound(format!("Route {} {} not found", method, uri.path()))
}
