//! HTTP API.

mod closures;
mod pending_closures;
mod pins;

use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;

async fn health() -> StatusCode {
    StatusCode::OK
}

pub(crate) fn get_router() -> Router {
    Router::new()
        .route("/health", get(health))
        .merge(pending_closures::get_router())
        .merge(closures::get_router())
        .merge(pins::get_router())
}
