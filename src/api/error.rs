//! HTTP mapping for scheduler errors.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::error::SchedulerError;

#[derive(Debug)]
pub enum ApiError {
    Scheduler(SchedulerError),
    BadRequest(String),
    Unauthenticated(String),
    NotFound(String),
}

impl From<SchedulerError> for ApiError {
    fn from(e: SchedulerError) -> Self {
        ApiError::Scheduler(e)
    }
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            ApiError::Unauthenticated(_) => (StatusCode::UNAUTHORIZED, "unauthenticated"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            ApiError::Scheduler(e) => match e {
                SchedulerError::DuplicateKey { .. } => (StatusCode::CONFLICT, "duplicate_key"),
                e if e.is_validation() => (StatusCode::BAD_REQUEST, "validation"),
                SchedulerError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
                SchedulerError::StaleUpdate { .. } => (StatusCode::CONFLICT, "stale_update"),
                SchedulerError::Unauthorized(_) => (StatusCode::FORBIDDEN, "forbidden"),
                SchedulerError::Cancelled | SchedulerError::RegistryStopped => {
                    (StatusCode::SERVICE_UNAVAILABLE, "unavailable")
                }
                _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
            },
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::Scheduler(e) => e.to_string(),
            ApiError::BadRequest(m) | ApiError::Unauthenticated(m) | ApiError::NotFound(m) => m.clone(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if status.is_server_error() {
            tracing::error!(error = %self.message(), "request failed");
        }
        let body = json!({ "error": { "code": code, "message": self.message() } });
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
