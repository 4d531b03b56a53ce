//! `/api/closures`: closure inspection and the explicit garbage-collection
//! trigger.

use std::time::Duration;

use axum::extract::{Extension, Path, Query};
use axum::routing::{delete, get};
use axum::Json;
use axum::Router;
use serde::{Deserialize, Serialize};

use crate::error::ServerResult;
use crate::gc::{self, GcParams, GcStats};
use crate::State;

#[derive(Debug, Clone, Serialize)]
struct ClosureObject {
    key: String,
}

#[derive(Debug, Clone, Serialize)]
struct ClosureResponse {
    key: String,
    updated_at: chrono::DateTime<chrono::Utc>,
    objects: Vec<ClosureObject>,
}

/// `GET /api/closures/{key}`.
#[tracing::instrument(skip_all, fields(key))]
async fn get_closure(
    Extension(state): Extension<State>,
    Path(key): Path<String>,
) -> ServerResult<Json<ClosureResponse>> {
    let ledger = state.ledger().await?;
    let closure = ledger.get_closure(&key).await?;
    let objects = ledger.get_closure_objects(&key).await?;

    Ok(Json(ClosureResponse {
        key: closure.key,
        updated_at: closure.updated_at,
        objects: objects.into_iter().map(|o| ClosureObject { key: o.key }).collect(),
    }))
}

#[derive(Debug, Deserialize)]
struct DeleteClosuresQuery {
    #[serde(rename = "older-than", default, with = "humantime_serde::option")]
    older_than: Option<Duration>,
    #[serde(
        rename = "failed-uploads-older-than",
        default,
        with = "humantime_serde::option"
    )]
    failed_uploads_older_than: Option<Duration>,
    #[serde(default)]
    force: bool,
}

/// `DELETE /api/closures`: runs one garbage-collection pass synchronously
/// and returns its stats, overriding the configured defaults with any
/// query parameters given.
#[tracing::instrument(skip_all)]
async fn delete_closures(
    Extension(state): Extension<State>,
    Query(query): Query<DeleteClosuresQuery>,
) -> ServerResult<Json<GcStats>> {
    let defaults = state
        .config
        .garbage_collection
        .params(state.config.storage.s3_concurrency);
    let params = GcParams {
        older_than: query.older_than.unwrap_or(defaults.older_than),
        failed_uploads_older_than: query
            .failed_uploads_older_than
            .unwrap_or(defaults.failed_uploads_older_than),
        force: query.force,
        s3_concurrency: defaults.s3_concurrency,
    };

    let stats = gc::run_once(
        state.ledger().await?,
        state.storage().await?.as_ref(),
        &params,
    )
    .await?;

    Ok(Json(stats))
}

pub(crate) fn get_router() -> Router {
    Router::new()
        .route("/api/closures/*key", get(get_closure))
        .route("/api/closures", delete(delete_closures))
}
