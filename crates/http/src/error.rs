//! Translates every dependency crate's error into the status codes spec
//! §6/§7 call for, dispatching on the shared `ErrorKind` where one is
//! available instead of matching concrete error variants per crate.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use types::ErrorKind;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("{0}")]
    BadRequest(String),
    #[error("missing or invalid bearer token")]
    Unauthorized,
    #[error(transparent)]
    Store(#[from] store::StoreError),
    #[error(transparent)]
    Provider(#[from] provider::ProviderError),
    #[error(transparent)]
    Watch(#[from] watch::WatchError),
    #[error(transparent)]
    Queue(#[from] queue::QueueError),
    #[error(transparent)]
    Resolver(#[from] resolver::ResolverError),
    #[error(transparent)]
    Label(#[from] labels::LabelError),
    #[error(transparent)]
    Correction(#[from] corrections::CorrectionError),
    #[error(transparent)]
    Scheduler(#[from] scheduler::SchedulerError),
}

/// Spec §7 "the HTTP surface translates categories into status codes".
fn status_for_kind(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Transient => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::AuthExpired => StatusCode::UNAUTHORIZED,
        ErrorKind::ExtractionParse => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::ResolverConflict => StatusCode::CONFLICT,
        ErrorKind::PersistenceConflict => StatusCode::CONFLICT,
        ErrorKind::FatalConfig => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::NotFound(what) => (StatusCode::NOT_FOUND, what.to_string()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, self.to_string()),
            ApiError::Store(e) => (status_for_kind(e.kind()), e.to_string()),
            ApiError::Provider(e) => (status_for_kind(e.kind()), e.to_string()),
            ApiError::Watch(e) => (status_for_kind(e.kind()), e.to_string()),
            ApiError::Queue(e) => (status_for_kind(e.kind()), e.to_string()),
            ApiError::Resolver(e) => (status_for_kind(e.kind()), e.to_string()),
            ApiError::Label(e) => (status_for_kind(e.kind()), e.to_string()),
            ApiError::Correction(e) => (status_for_kind(e.kind()), e.to_string()),
            ApiError::Scheduler(e) => (status_for_kind(e.kind()), e.to_string()),
        };
        if status.is_server_error() {
            tracing::error!(context = "http", event = "handler-error", status = status.as_u16(), error = %message, "Request failed.");
        } else {
            tracing::warn!(context = "http", event = "handler-error", status = status.as_u16(), error = %message, "Request rejected.");
        }
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}
