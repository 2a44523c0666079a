//! HTTP surface of the transfer server
//!
//! `/tus` speaks the tus 1.0 resumable upload protocol; `/api` carries the
//! file catalogue, downloads and server information.

pub mod admin;
pub mod files;
pub mod info;
pub mod profile;
pub mod tus;

use axum::{
    http::{header, HeaderMap, HeaderValue},
    response::{IntoResponse, Response},
    Json, Router,
};
use serde::Serialize;

use crate::state::AppState;
use crate::upload::UploadError;

/// Seconds a client should wait before retrying a quota rejection
pub const QUOTA_RETRY_AFTER_SECS: u64 = 30;

// ============================================================================
// Error Response
// ============================================================================

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: &'static str,
}

impl IntoResponse for UploadError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let mut headers = HeaderMap::new();

        match &self {
            UploadError::Conflict { expected, .. } => {
                headers.insert("upload-offset", HeaderValue::from(*expected));
            }
            UploadError::RangeUnavailable { available, .. } => {
                headers.insert("upload-offset", HeaderValue::from(*available));
            }
            UploadError::RangeNotSatisfiable { size } => {
                if let Ok(v) = HeaderValue::from_str(&format!("bytes */{}", size)) {
                    headers.insert(header::CONTENT_RANGE, v);
                }
            }
            UploadError::QuotaExceeded { used, max, .. } => {
                headers.insert(header::RETRY_AFTER, HeaderValue::from(QUOTA_RETRY_AFTER_SECS));
                headers.insert("x-storage-used", HeaderValue::from(*used));
                headers.insert("x-storage-max", HeaderValue::from(*max));
                headers.insert(
                    "x-storage-available",
                    HeaderValue::from(max.saturating_sub(*used)),
                );
            }
            UploadError::Locked(_) => {
                headers.insert(header::RETRY_AFTER, HeaderValue::from(1u64));
            }
            UploadError::Backend(e) => {
                tracing::error!(error = %e, "State backend failure");
            }
            UploadError::Storage(e) => {
                tracing::error!(error = %e, "Blob storage failure");
            }
            _ => {}
        }

        let body = Json(ErrorResponse {
            error: self.to_string(),
            code: self.code(),
        });

        (status, headers, body).into_response()
    }
}

/// Result type for handlers
pub type Result<T> = std::result::Result<T, UploadError>;

// ============================================================================
// Router
// ============================================================================

/// Create the full application router
pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/tus", tus::router())
        .nest("/api", api_router())
        .with_state(state)
}

fn api_router() -> Router<AppState> {
    Router::new()
        .merge(info::router())
        .merge(files::router())
        .merge(admin::router())
}
