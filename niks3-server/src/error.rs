//! Error handling.

use std::error::Error as StdError;

use anyhow::Error as AnyError;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use displaydoc::Display;
use serde::Serialize;

use niks3::Niks3Error;

pub type ServerResult<T> = Result<T, ServerError>;

/// An error.
#[derive(Debug, Display)]
pub enum ServerError {
    /// The URL you requested was not found.
    NotFound,

    /// Unauthorized.
    Unauthorized,

    /// The server encountered an internal error or misconfiguration.
    InternalServerError,

    /// The rate limiter is saturated; try again shortly.
    RateLimiterSaturated,

    /// No such closure "{key}".
    NoSuchClosure { key: String },

    /// No such pending closure: id={id}.
    NoSuchPendingClosure { id: i64 },

    /// No such pin "{name}".
    NoSuchPin { name: String },

    /// Object "{key}" is not part of pending closure {pending_closure_id}.
    ObjectNotInPendingClosure { key: String, pending_closure_id: i64 },

    /// Malformed request: {0}
    MalformedRequest(String),

    /// S3 is throttling requests; retry shortly.
    S3Throttled,

    /// Database error: {0}
    DatabaseError(AnyError),

    /// Storage error: {0}
    StorageError(AnyError),

    /// General request error: {0}
    RequestError(AnyError),

    /// Error from the common components: {0}
    CoreError(Niks3Error),
}

#[derive(Serialize)]
pub struct ErrorResponse {
    code: u16,
    error: String,
    message: String,
}

impl ServerError {
    pub fn database_error(error: impl StdError + Send + Sync + 'static) -> Self {
        Self::DatabaseError(AnyError::new(error))
    }

    pub fn storage_error(error: impl StdError + Send + Sync + 'static) -> Self {
        Self::StorageError(AnyError::new(error))
    }

    pub fn request_error(error: impl StdError + Send + Sync + 'static) -> Self {
        Self::RequestError(AnyError::new(error))
    }

    fn name(&self) -> &'static str {
        match self {
            Self::NotFound => "NotFound",
            Self::Unauthorized => "Unauthorized",
            Self::InternalServerError => "InternalServerError",
            Self::RateLimiterSaturated => "RateLimiterSaturated",
            Self::NoSuchClosure { .. } => "NoSuchClosure",
            Self::NoSuchPendingClosure { .. } => "NoSuchPendingClosure",
            Self::NoSuchPin { .. } => "NoSuchPin",
            Self::ObjectNotInPendingClosure { .. } => "ObjectNotInPendingClosure",
            Self::MalformedRequest(_) => "MalformedRequest",
            Self::S3Throttled => "S3Throttled",
            Self::DatabaseError(_) => "DatabaseError",
            Self::StorageError(_) => "StorageError",
            Self::RequestError(_) => "RequestError",
            Self::CoreError(e) => e.name(),
        }
    }

    /// Returns a version of this error suitable for clients, stripping any
    /// internal detail that should only ever reach the server log.
    fn into_clients(self) -> Self {
        match self {
            Self::DatabaseError(_) => Self::InternalServerError,
            Self::StorageError(_) => Self::InternalServerError,
            _ => self,
        }
    }

    fn http_status_code(&self) -> StatusCode {
        match self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::InternalServerError => StatusCode::INTERNAL_SERVER_ERROR,
            Self::RateLimiterSaturated => StatusCode::SERVICE_UNAVAILABLE,
            Self::NoSuchClosure { .. } => StatusCode::NOT_FOUND,
            Self::NoSuchPendingClosure { .. } => StatusCode::NOT_FOUND,
            Self::NoSuchPin { .. } => StatusCode::NOT_FOUND,
            Self::ObjectNotInPendingClosure { .. } => StatusCode::FORBIDDEN,
            Self::MalformedRequest(_) => StatusCode::BAD_REQUEST,
            Self::S3Throttled => StatusCode::TOO_MANY_REQUESTS,
            Self::RequestError(_) => StatusCode::BAD_REQUEST,
            Self::CoreError(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl StdError for ServerError {}

impl From<Niks3Error> for ServerError {
    fn from(error: Niks3Error) -> Self {
        Self::CoreError(error)
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        if matches!(
            self,
            Self::DatabaseError(_) | Self::StorageError(_) | Self::InternalServerError
        ) {
            tracing::error!("{:?}", self);
        } else {
            tracing::debug!("{:?}", self);
        }

        let throttled = matches!(self, Self::S3Throttled);
        let sanitized = self.into_clients();

        let status_code = sanitized.http_status_code();
        let error_response = ErrorResponse {
            code: status_code.as_u16(),
            message: sanitized.to_string(),
            error: sanitized.name().to_string(),
        };

        let mut response = (status_code, Json(error_response)).into_response();
        if throttled {
            response
                .headers_mut()
                .insert("Retry-After", HeaderValue::from_static("2"));
        }

        response
    }
}
