//! File catalogue and download routes
//!
//! Downloads go through the range reader, so bytes of an upload still in
//! progress can be fetched up to its committed offset.

use std::collections::BTreeMap;

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Result;
use crate::backend::{for_each_page, ListFilter};
use crate::range::RangeSpec;
use crate::retention::{RetentionPolicy, SweepReport};
use crate::state::AppState;
use crate::upload::{SessionState, UploadError, UploadSession};

const DEFAULT_PAGE_SIZE: usize = 20;
const MAX_PAGE_SIZE: usize = 100;

/// Create the files router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/files", get(list_files))
        .route("/files/cleanup", post(cleanup))
        .route("/files/:id", get(file_info).delete(delete_file))
        .route("/files/:id/download", get(download_file))
}

// ============================================================================
// Types
// ============================================================================

/// Public view of a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileInfo {
    pub id: String,
    pub filename: Option<String>,
    pub mime_type: String,
    /// Best-known length: declared total, else bytes received so far
    pub size: u64,
    pub uploaded_size: u64,
    pub state: SessionState,
    pub progress: f64,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retention: String,
    pub retention_ttl: Option<u64>,
    pub retention_expires_at: Option<DateTime<Utc>>,
    pub download_count: u64,
    pub last_downloaded_at: Option<DateTime<Utc>>,
    pub owner: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

impl From<&UploadSession> for FileInfo {
    fn from(session: &UploadSession) -> Self {
        Self {
            id: session.id.clone(),
            filename: session.filename().map(str::to_string),
            mime_type: content_type(session),
            size: session.known_length(),
            uploaded_size: session.uploaded_offset,
            state: session.state,
            progress: session.progress(),
            created_at: session.created_at,
            completed_at: session.completed_at,
            retention: session.retention.name().to_string(),
            retention_ttl: match session.retention {
                RetentionPolicy::Ttl { ttl_secs } => Some(ttl_secs),
                _ => None,
            },
            retention_expires_at: session.retention_expires_at,
            download_count: session.file.download_count,
            last_downloaded_at: session.file.last_full_delivery_at,
            owner: session.owner.clone(),
            metadata: session.metadata.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default = "default_page")]
    pub page: usize,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default)]
    pub include_partial: bool,
}

fn default_page() -> usize {
    1
}

fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

#[derive(Debug, Serialize)]
pub struct FileList {
    pub files: Vec<FileInfo>,
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /api/files - newest first
async fn list_files(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<FileList>> {
    let states: &[SessionState] = if query.include_partial {
        &[
            SessionState::Created,
            SessionState::Uploading,
            SessionState::Completed,
        ]
    } else {
        &[SessionState::Completed]
    };

    let mut sessions = Vec::new();
    for_each_page(
        state.engine().backend().as_ref(),
        ListFilter::with_states(states),
        |page| {
            if !page.corrupt.is_empty() {
                tracing::warn!(corrupt = ?page.corrupt, "Skipping corrupt records in listing");
            }
            sessions.extend(page.sessions);
        },
    )
    .await?;

    sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));

    let page = query.page.max(1);
    let page_size = query.page_size.clamp(1, MAX_PAGE_SIZE);
    let total = sessions.len();

    let files = sessions
        .iter()
        .skip((page - 1) * page_size)
        .take(page_size)
        .map(FileInfo::from)
        .collect();

    Ok(Json(FileList {
        files,
        total,
        page,
        page_size,
    }))
}

/// GET /api/files/:id
async fn file_info(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<FileInfo>> {
    let session = state.engine().get_session(&id).await?;
    Ok(Json(FileInfo::from(&session)))
}

/// GET /api/files/:id/download - whole file or a single byte range
async fn download_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response> {
    let range = headers
        .get(header::RANGE)
        .map(|v| {
            v.to_str()
                .map_err(|_| UploadError::BadRequest("invalid Range header".into()))
                .and_then(RangeSpec::parse)
        })
        .transpose()?;

    let delivery = state.reader().open(&id, range).await?;
    let session = &delivery.session;

    let status = if delivery.partial {
        StatusCode::PARTIAL_CONTENT
    } else {
        StatusCode::OK
    };

    let mut out = HeaderMap::new();
    insert(&mut out, header::CONTENT_TYPE, &content_type(session));
    out.insert(header::CONTENT_LENGTH, HeaderValue::from(delivery.range.len()));
    out.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    insert(&mut out, header::CONTENT_DISPOSITION, &content_disposition(session));
    if delivery.partial {
        insert(
            &mut out,
            header::CONTENT_RANGE,
            &delivery.range.content_range(delivery.total_length()),
        );
    }
    if session.state != SessionState::Completed {
        out.insert("upload-offset", HeaderValue::from(session.uploaded_offset));
    }

    out.insert("x-retention-policy", HeaderValue::from_static(session.retention.name()));
    if let Some(expires) = session.retention_expires_at {
        insert(&mut out, "x-retention-expires", &expires.to_rfc3339());
    }
    out.insert("x-download-count", HeaderValue::from(session.file.download_count));
    if delivery.full_download && session.retention == RetentionPolicy::DownloadOnce {
        out.insert(
            "x-retention-warning",
            HeaderValue::from_static("File will be deleted after this download"),
        );
    }

    tracing::info!(
        session_id = %id,
        start = delivery.range.start,
        end = delivery.range.end,
        full = delivery.full_download,
        "Serving download"
    );

    let chunk_size = state.settings().chunk_size();
    let mut response = Response::new(Body::from_stream(delivery.into_stream(chunk_size)));
    *response.status_mut() = status;
    response.headers_mut().extend(out);

    Ok(response)
}

/// DELETE /api/files/:id
async fn delete_file(State(state): State<AppState>, Path(id): Path<String>) -> Result<StatusCode> {
    state.engine().delete_file(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/files/cleanup - run one retention sweep now
async fn cleanup(State(state): State<AppState>) -> Json<SweepReport> {
    Json(state.sweeper().run_once().await)
}

// ============================================================================
// Helpers
// ============================================================================

fn content_type(session: &UploadSession) -> String {
    match session.filetype() {
        Some(ft) => ft.to_string(),
        None => session
            .filename()
            .map(|name| mime_guess::from_path(name).first_or_octet_stream().to_string())
            .unwrap_or_else(|| "application/octet-stream".to_string()),
    }
}

fn content_disposition(session: &UploadSession) -> String {
    let name = session.filename().unwrap_or(&session.id);
    format!(
        "attachment; filename*=UTF-8''{}",
        urlencoding::encode(name)
    )
}

fn insert<K>(headers: &mut HeaderMap, name: K, value: &str)
where
    K: axum::http::header::IntoHeaderName,
{
    if let Ok(v) = HeaderValue::from_str(value) {
        headers.insert(name, v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CredentialProfile;
    use crate::retention::{RetentionKind, RetentionRequest};
    use crate::routes::testing::{body_bytes, body_json, header, send, state};
    use crate::upload::CreateUpload;
    use axum::http::Request;

    async fn seed(state: &AppState, length: u64, data: &[u8], retention: RetentionRequest) -> String {
        let mut metadata = BTreeMap::new();
        metadata.insert("filename".to_string(), "report.pdf".to_string());

        let session = state
            .engine()
            .create(
                CreateUpload {
                    declared_length: Some(length),
                    metadata,
                    retention,
                    ..CreateUpload::default()
                },
                &CredentialProfile::anonymous(),
            )
            .await
            .unwrap();
        if !data.is_empty() {
            state.engine().append(&session.id, 0, data, None).await.unwrap();
        }
        session.id
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn get_range(uri: &str, range: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header("range", range)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_full_download() {
        let state = state();
        let id = seed(&state, 5, b"hello", RetentionRequest::default()).await;

        let response = send(&state, get(&format!("/api/files/{}/download", id))).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header(&response, "content-type"), Some("application/pdf"));
        assert_eq!(header(&response, "content-length"), Some("5"));
        assert_eq!(header(&response, "x-retention-policy"), Some("permanent"));
        assert_eq!(header(&response, "x-download-count"), Some("0"));
        assert_eq!(
            header(&response, "content-disposition"),
            Some("attachment; filename*=UTF-8''report.pdf")
        );
        assert_eq!(body_bytes(response).await, b"hello");
    }

    #[tokio::test]
    async fn test_partial_reads_of_incomplete_upload() {
        let state = state();
        let data = vec![7u8; 500];
        let id = seed(&state, 1000, &data, RetentionRequest::default()).await;
        let uri = format!("/api/files/{}/download", id);

        let response = send(&state, get_range(&uri, "bytes=600-699")).await;
        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(header(&response, "upload-offset"), Some("500"));
        assert_eq!(body_json(response).await["code"], "RANGE_UNAVAILABLE");

        let response = send(&state, get_range(&uri, "bytes=0-499")).await;
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(header(&response, "content-range"), Some("bytes 0-499/1000"));
        assert_eq!(header(&response, "upload-offset"), Some("500"));
        assert_eq!(body_bytes(response).await.len(), 500);

        // Open-ended ranges stop at the committed offset
        let response = send(&state, get_range(&uri, "bytes=400-")).await;
        assert_eq!(header(&response, "content-range"), Some("bytes 400-499/1000"));
    }

    #[tokio::test]
    async fn test_range_past_completed_file() {
        let state = state();
        let id = seed(&state, 4, b"abcd", RetentionRequest::default()).await;

        let response = send(
            &state,
            get_range(&format!("/api/files/{}/download", id), "bytes=10-"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(header(&response, "content-range"), Some("bytes */4"));
    }

    #[tokio::test]
    async fn test_download_once_file_is_gone_after_full_download() {
        let state = state();
        let id = seed(
            &state,
            3,
            b"abc",
            RetentionRequest::new(Some(RetentionKind::DownloadOnce), None),
        )
        .await;
        let uri = format!("/api/files/{}/download", id);

        // Partial reads do not count
        let response = send(&state, get_range(&uri, "bytes=0-1")).await;
        assert_eq!(body_bytes(response).await, b"ab");

        let response = send(&state, get(&uri)).await;
        assert_eq!(
            header(&response, "x-retention-warning"),
            Some("File will be deleted after this download")
        );
        assert_eq!(body_bytes(response).await, b"abc");

        let mut status = StatusCode::OK;
        for _ in 0..100 {
            status = send(&state, get(&format!("/api/files/{}", id))).await.status();
            if status != StatusCode::OK {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(status, StatusCode::GONE);
    }

    #[tokio::test]
    async fn test_listing() {
        let state = state();
        let done = seed(&state, 2, b"ok", RetentionRequest::default()).await;
        let partial = seed(&state, 10, b"half", RetentionRequest::default()).await;

        let response = send(&state, get("/api/files")).await;
        let json = body_json(response).await;
        assert_eq!(json["total"], 1);
        assert_eq!(json["files"][0]["id"], done.as_str());
        assert_eq!(json["files"][0]["filename"], "report.pdf");

        let response = send(&state, get("/api/files?include_partial=true&page_size=1")).await;
        let json = body_json(response).await;
        assert_eq!(json["total"], 2);
        assert_eq!(json["files"].as_array().unwrap().len(), 1);

        let response = send(&state, get(&format!("/api/files/{}", partial))).await;
        let json = body_json(response).await;
        assert_eq!(json["uploaded_size"], 4);
        assert_eq!(json["state"], "uploading");
    }

    #[tokio::test]
    async fn test_delete_then_gone() {
        let state = state();
        let id = seed(&state, 2, b"ok", RetentionRequest::default()).await;

        let response = send(
            &state,
            Request::builder()
                .method("DELETE")
                .uri(format!("/api/files/{}", id))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = send(&state, get(&format!("/api/files/{}/download", id))).await;
        assert_eq!(response.status(), StatusCode::GONE);
        assert_eq!(state.quota().used().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cleanup_runs_a_sweep() {
        let state = state();
        seed(&state, 2, b"ok", RetentionRequest::default()).await;

        let response = send(
            &state,
            Request::builder()
                .method("POST")
                .uri("/api/files/cleanup")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["scanned"], 1);
        assert_eq!(json["expired_files"], 0);
    }
}
