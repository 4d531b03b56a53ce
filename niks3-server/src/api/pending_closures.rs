//! `/api/pending_closures` and `/api/multipart`: the upload protocol's
//! HTTP surface, delegating straight into `crate::protocol`.

use std::time::Duration;

use axum::extract::{Extension, Json, Path, Query};
use axum::http::StatusCode;
use axum::routing::post;
use axum::Router;
use serde::{Deserialize, Serialize};

use crate::error::ServerResult;
use crate::gc;
use crate::protocol::{self, BeginRequest, BeginResponse, CommitRequest};
use crate::State;

/// `POST /api/pending_closures`.
#[tracing::instrument(skip_all)]
async fn begin(
    Extension(state): Extension<State>,
    Json(request): Json<BeginRequest>,
) -> ServerResult<Json<BeginResponse>> {
    let response = protocol::begin_pending_closure(
        state.ledger().await?,
        state.storage().await?.as_ref(),
        request,
    )
    .await?;

    Ok(Json(response))
}

/// `POST /api/pending_closures/{id}/complete`.
#[tracing::instrument(skip_all, fields(id))]
async fn complete(
    Extension(state): Extension<State>,
    Path(id): Path<i64>,
    Json(request): Json<CommitRequest>,
) -> ServerResult<StatusCode> {
    protocol::complete_pending_closure(
        state.ledger().await?,
        state.storage().await?.as_ref(),
        &state.signing_keys,
        id,
        request,
    )
    .await?;

    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct ReapQuery {
    #[serde(rename = "older-than", with = "humantime_serde")]
    older_than: Duration,
}

/// `DELETE /api/pending_closures?older-than=<dur>`: reaps multipart
/// uploads and pending closures abandoned for longer than `older-than`,
/// without touching live closures or sweeping objects.
#[tracing::instrument(skip_all)]
async fn reap(
    Extension(state): Extension<State>,
    Query(query): Query<ReapQuery>,
) -> ServerResult<StatusCode> {
    gc::run_reap_only(
        state.ledger().await?,
        state.storage().await?.as_ref(),
        query.older_than,
        state.config.storage.s3_concurrency,
    )
    .await?;

    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct RequestPartsRequest {
    object_key: String,
    upload_id: String,
    start_part_number: i32,
    num_parts: i32,
}

#[derive(Debug, Serialize)]
struct RequestPartsResponse {
    part_urls: Vec<String>,
    start_part_number: i32,
}

/// `POST /api/multipart/request_parts`: issues additional presigned part
/// URLs for a multipart upload that turned out to need more parts than
/// originally estimated.
#[tracing::instrument(skip_all)]
async fn request_parts(
    Extension(state): Extension<State>,
    Json(request): Json<RequestPartsRequest>,
) -> ServerResult<Json<RequestPartsResponse>> {
    let part_urls = protocol::request_additional_parts(
        state.storage().await?.as_ref(),
        &request.object_key,
        &request.upload_id,
        request.start_part_number,
        request.num_parts,
    )
    .await?;

    Ok(Json(RequestPartsResponse {
        part_urls,
        start_part_number: request.start_part_number,
    }))
}

#[derive(Debug, Deserialize)]
struct CompleteMultipartRequest {
    object_key: String,
    upload_id: String,
    parts: Vec<crate::storage::CompletedPart>,
}

/// `POST /api/multipart/complete`: forwarded straight to the storage
/// backend once the client has uploaded every part.
#[tracing::instrument(skip_all)]
async fn complete_multipart(
    Extension(state): Extension<State>,
    Json(request): Json<CompleteMultipartRequest>,
) -> ServerResult<StatusCode> {
    state
        .storage()
        .await?
        .complete_multipart(&request.object_key, &request.upload_id, request.parts)
        .await?;

    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct AbortMultipartRequest {
    object_key: String,
    upload_id: String,
}

/// `POST /api/multipart/abort`: lets a client give up on an upload early
/// instead of waiting for the garbage collector to reap it.
#[tracing::instrument(skip_all)]
async fn abort_multipart(
    Extension(state): Extension<State>,
    Json(request): Json<AbortMultipartRequest>,
) -> ServerResult<StatusCode> {
    state
        .storage()
        .await?
        .abort_multipart(&request.object_key, &request.upload_id)
        .await?;

    Ok(StatusCode::NO_CONTENT)
}

pub(crate) fn get_router() -> Router {
    Router::new()
        .route("/api/pending_closures", post(begin).delete(reap))
        .route("/api/pending_closures/:id/complete", post(complete))
        .route("/api/multipart/request_parts", post(request_parts))
        .route("/api/multipart/complete", post(complete_multipart))
        .route("/api/multipart/abort", post(abort_multipart))
}
