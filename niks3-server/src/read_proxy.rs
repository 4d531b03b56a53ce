//! The read proxy: an optional, unauthenticated passthrough to storage
//! for clients (Nix itself) that only ever need to read a cache.
//!
//! Every path it serves is an S3 object looked up directly by key; the
//! read proxy never consults the ledger. Orphan keys such as
//! `nix-cache-info` and the landing page are expected here and are not
//! an error.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Extension, Path};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures::TryStreamExt;
use lazy_static::lazy_static;
use regex::Regex;
use tokio::io::AsyncReadExt;
use tokio_util::io::StreamReader;
use tracing::instrument;

use crate::error::{ServerError, ServerResult};
use crate::storage::ObjectStore;
use niks3::mime;

/// Nix's own base32 alphabet (no `e`, `t`, `u`, `o`).
const BASE32: &str = "0-9a-df-np-sv-z";

lazy_static! {
    static ref NARINFO_RE: Regex =
        Regex::new(&format!("^[{BASE32}]{{32}}\\.narinfo$")).unwrap();
    static ref LISTING_RE: Regex = Regex::new(&format!("^[{BASE32}]{{32}}\\.ls$")).unwrap();
    static ref NAR_RE: Regex =
        Regex::new(&format!("^nar/[{BASE32}]{{52}}\\.nar(\\.(zst|xz|bz2))?$")).unwrap();
    static ref LOG_RE: Regex = Regex::new(r"^log/[A-Za-z0-9+_.-]+\.drv$").unwrap();
    static ref REALISATION_RE: Regex =
        Regex::new(r"^realisations/[A-Za-z0-9]+:[0-9a-fA-F]+![A-Za-z0-9+_.-]+\.doi$").unwrap();
}

/// Which path pattern a request matched, since narinfos need
/// on-the-fly decompression and nothing else does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ObjectKind {
    Narinfo,
    Other,
}

fn classify(path: &str) -> Option<ObjectKind> {
    if path.starts_with('/') || path.contains("..") {
        return None;
    }

    if path == "index.html" {
        Some(ObjectKind::Other)
    } else if NARINFO_RE.is_match(path) {
        Some(ObjectKind::Narinfo)
    } else if LISTING_RE.is_match(path)
        || NAR_RE.is_match(path)
        || LOG_RE.is_match(path)
        || REALISATION_RE.is_match(path)
    {
        Some(ObjectKind::Other)
    } else {
        None
    }
}

fn content_type_for(path: &str, kind: ObjectKind) -> &'static str {
    match kind {
        ObjectKind::Narinfo => mime::NARINFO,
        ObjectKind::Other if path.starts_with("nar/") => mime::NAR,
        ObjectKind::Other => "application/octet-stream",
    }
}

/// Serves `nix-cache-info`: GET/HEAD `/nix-cache-info`.
#[instrument(skip_all)]
async fn get_nix_cache_info(
    method: Method,
    headers: HeaderMap,
    Extension(storage): Extension<Arc<dyn ObjectStore>>,
) -> ServerResult<Response> {
    serve_object(storage.as_ref(), "nix-cache-info", ObjectKind::Other, &method, &headers).await
}

/// Serves a top-level path: `.narinfo`, `.ls`, `log/*.drv`,
/// `realisations/*.doi`.
#[instrument(skip_all, fields(path))]
async fn get_toplevel(
    method: Method,
    headers: HeaderMap,
    Path(path): Path<String>,
    Extension(storage): Extension<Arc<dyn ObjectStore>>,
) -> ServerResult<Response> {
    let kind = classify(&path).ok_or(ServerError::NotFound)?;
    serve_object(storage.as_ref(), &path, kind, &method, &headers).await
}

/// Serves `/nar/<path>`.
#[instrument(skip_all, fields(path))]
async fn get_nar(
    method: Method,
    headers: HeaderMap,
    Path(path): Path<String>,
    Extension(storage): Extension<Arc<dyn ObjectStore>>,
) -> ServerResult<Response> {
    let key = format!("nar/{path}");
    let kind = classify(&key).ok_or(ServerError::NotFound)?;
    serve_object(storage.as_ref(), &key, kind, &method, &headers).await
}

async fn serve_object(
    storage: &dyn ObjectStore,
    key: &str,
    kind: ObjectKind,
    method: &Method,
    headers: &HeaderMap,
) -> ServerResult<Response> {
    let meta = storage.stat_object(key).await?.ok_or(ServerError::NotFound)?;

    if let Some(etag) = &meta.etag {
        if let Some(if_none_match) = headers.get(header::IF_NONE_MATCH) {
            if if_none_match.as_bytes() == etag.as_bytes() {
                return Ok(not_modified(etag));
            }
        }
    }
    if let Some(if_modified_since) = headers.get(header::IF_MODIFIED_SINCE) {
        if let Ok(since) = if_modified_since.to_str() {
            if let Ok(since) = chrono::DateTime::parse_from_rfc2822(since) {
                if meta.last_modified <= since.with_timezone(&chrono::Utc) {
                    let etag = meta.etag.clone().unwrap_or_default();
                    return Ok(not_modified(&etag));
                }
            }
        }
    }

    let content_type = content_type_for(key, kind);

    if *method == Method::HEAD {
        let mut response = Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, content_type);
        if kind != ObjectKind::Narinfo {
            response = response.header(header::CONTENT_LENGTH, meta.size);
        }
        if let Some(etag) = &meta.etag {
            response = response.header(header::ETAG, etag.as_str());
        }
        return Ok(response.body(Body::empty()).map_err(ServerError::request_error)?);
    }

    let stream = storage.get_object(key).await?;

    if kind == ObjectKind::Narinfo {
        let reader = StreamReader::new(
            stream.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)),
        );
        let mut decoder = async_compression::tokio::bufread::ZstdDecoder::new(reader);
        let mut raw = Vec::new();
        decoder
            .read_to_end(&mut raw)
            .await
            .map_err(ServerError::request_error)?;

        let mut response = Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, content_type);
        if let Some(etag) = &meta.etag {
            response = response.header(header::ETAG, etag.as_str());
        }
        return Ok(response
            .body(Body::from(raw))
            .map_err(ServerError::request_error)?);
    }

    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_LENGTH, meta.size);
    if let Some(etag) = &meta.etag {
        response = response.header(header::ETAG, etag.as_str());
    }
    Ok(response
        .body(Body::from_stream(stream))
        .map_err(ServerError::request_error)?)
}

fn not_modified(etag: &str) -> Response {
    let mut response = Response::builder().status(StatusCode::NOT_MODIFIED);
    if let Ok(value) = HeaderValue::from_str(etag) {
        response = response.header(header::ETAG, value);
    }
    response.body(Body::empty()).unwrap()
}

pub fn get_router() -> Router {
    Router::new()
        .route("/nix-cache-info", get(get_nix_cache_info))
        .route("/nar/*path", get(get_nar))
        .route("/*path", get(get_toplevel))
}
