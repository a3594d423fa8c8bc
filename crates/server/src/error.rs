//! Engine error → HTTP response mapping.

use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use plinth_types::PlinthError;
use serde_json::json;

/// Wrapper turning a [`PlinthError`] into the wire response:
/// Forbidden → 403, Validation → 400, NotFound → 404, Uniqueness → 409,
/// VersionConflict → 409, Overload → 503 (with `Retry-After`),
/// otherwise → 500.
#[derive(Debug)]
pub struct ApiError(pub PlinthError);

impl From<PlinthError> for ApiError {
    fn from(err: PlinthError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self.0 {
            PlinthError::Forbidden { .. } => (StatusCode::FORBIDDEN, "forbidden"),
            PlinthError::Validation { .. } => (StatusCode::BAD_REQUEST, "validation_failed"),
            PlinthError::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
            PlinthError::Uniqueness { .. } => (StatusCode::CONFLICT, "uniqueness_violation"),
            PlinthError::VersionConflict { .. } => (StatusCode::CONFLICT, "version_conflict"),
            PlinthError::Overload { .. } => (StatusCode::SERVICE_UNAVAILABLE, "overloaded"),
            PlinthError::Substrate { .. } | PlinthError::Serialization { .. } => {
                tracing::error!(error = %self.0, "internal engine fault");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal")
            },
        };

        let body = Json(json!({ "code": code, "message": self.0.to_string() }));
        let mut response = (status, body).into_response();
        if let PlinthError::Overload { retry_after_ms, .. } = &self.0 {
            let secs = retry_after_ms.div_ceil(1000).max(1);
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

/// Handler failure: an engine error or a rate-limit rejection. Engine
/// errors convert implicitly so handlers can use `?` on engine calls.
#[derive(Debug)]
pub enum ApiFailure {
    /// Engine/storage error, mapped by [`ApiError`].
    Engine(ApiError),
    /// Write surface rate limit tripped; maps to 429 + `Retry-After`.
    RateLimited {
        /// Estimated milliseconds until a token is available.
        retry_after_ms: u64,
    },
}

impl From<PlinthError> for ApiFailure {
    fn from(err: PlinthError) -> Self {
        Self::Engine(ApiError(err))
    }
}

impl From<ApiError> for ApiFailure {
    fn from(err: ApiError) -> Self {
        Self::Engine(err)
    }
}

impl IntoResponse for ApiFailure {
    fn into_response(self) -> Response {
        match self {
            ApiFailure::Engine(err) => err.into_response(),
            ApiFailure::RateLimited { retry_after_ms } => {
                let secs = retry_after_ms.div_ceil(1000).max(1);
                let body = Json(json!({
                    "code": "rate_limited",
                    "message": "write rate limit exceeded; retry later",
                }));
                let mut response = (StatusCode::TOO_MANY_REQUESTS, body).into_response();
                if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                    response.headers_mut().insert(header::RETRY_AFTER, value);
                }
                response
            },
        }
    }
}
