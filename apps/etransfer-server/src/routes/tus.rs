//! tus 1.0 resumable upload routes
//!
//! Implements the core protocol plus the creation, creation-with-upload,
//! creation-defer-length, termination, checksum and expiration extensions.
//! Every request except `OPTIONS` must carry `Tus-Resumable: 1.0.0`.

use std::collections::BTreeMap;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Request, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{post, MethodRouter},
    Router,
};
use chrono::{DateTime, Utc};

use super::profile::Profile;
use super::Result;
use crate::config::Config;
use crate::retention::{RetentionKind, RetentionRequest};
use crate::state::AppState;
use crate::upload::{
    encode_metadata, parse_metadata, ChecksumAlgorithm, ChunkChecksum, CreateUpload, UploadError,
    TUS_EXTENSIONS, TUS_VERSION,
};

/// Content type of chunk bodies
pub const OFFSET_OCTET_STREAM: &str = "application/offset+octet-stream";

/// Set on a creation response when the inline chunk was not applied; the
/// value is the error code
pub const UPLOAD_ERROR_HEADER: &str = "x-upload-error";

/// Largest request body accepted on the upload routes: 256MB
const MAX_REQUEST_BODY: usize = 256 * 1024 * 1024;

// ============================================================================
// Router
// ============================================================================

/// Create the tus router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(create_upload).options(discover))
        .route(
            "/:id",
            MethodRouter::new()
                .head(get_offset)
                .patch(append_chunk)
                .delete(terminate)
                .options(discover),
        )
        .route("/:id/finalize", post(finalize))
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY))
        .layer(middleware::from_fn(tus_resumable))
}

/// Enforce the protocol version on requests and stamp it on responses
async fn tus_resumable(request: Request, next: Next) -> Response {
    if request.method() != Method::OPTIONS {
        let version = request
            .headers()
            .get("tus-resumable")
            .and_then(|v| v.to_str().ok());

        if version != Some(TUS_VERSION) {
            let mut response =
                UploadError::VersionMismatch(version.unwrap_or("missing").to_string())
                    .into_response();
            response
                .headers_mut()
                .insert("tus-version", HeaderValue::from_static(TUS_VERSION));
            return response;
        }
    }

    let mut response = next.run(request).await;
    response
        .headers_mut()
        .insert("tus-resumable", HeaderValue::from_static(TUS_VERSION));
    response
}

// ============================================================================
// Handlers
// ============================================================================

/// OPTIONS /tus - capability discovery
async fn discover(State(state): State<AppState>, Profile(profile): Profile) -> Response {
    let mut response = StatusCode::NO_CONTENT.into_response();
    let headers = response.headers_mut();

    headers.insert("tus-version", HeaderValue::from_static(TUS_VERSION));
    if let Ok(v) = HeaderValue::from_str(&TUS_EXTENSIONS.join(",")) {
        headers.insert("tus-extension", v);
    }
    if let Ok(v) = HeaderValue::from_str(&ChecksumAlgorithm::advertised()) {
        headers.insert("tus-checksum-algorithm", v);
    }
    if let Some(max) = state.engine().max_upload_size(&profile) {
        headers.insert("tus-max-size", HeaderValue::from(max));
    }

    response
}

/// POST /tus - create an upload, optionally with its first chunk
async fn create_upload(
    State(state): State<AppState>,
    Profile(profile): Profile,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let declared_length = header_u64(&headers, "upload-length")?;
    match (declared_length, header_str(&headers, "upload-defer-length")) {
        (Some(_), Some(_)) => {
            return Err(UploadError::BadRequest(
                "Upload-Length and Upload-Defer-Length are mutually exclusive".into(),
            ))
        }
        (None, None) => {
            return Err(UploadError::BadRequest(
                "Upload-Length or Upload-Defer-Length required".into(),
            ))
        }
        (None, Some(v)) if v != "1" => {
            return Err(UploadError::BadRequest("Upload-Defer-Length must be 1".into()))
        }
        _ => {}
    }

    let metadata = match header_str(&headers, "upload-metadata") {
        Some(raw) => parse_metadata(raw).map_err(UploadError::BadRequest)?,
        None => BTreeMap::new(),
    };
    let retention = retention_request(&headers, &metadata)?;
    let checksum_algorithm = metadata
        .get("checksum_algorithm")
        .map(|v| v.parse::<ChecksumAlgorithm>())
        .transpose()
        .map_err(UploadError::BadRequest)?;

    let inline_checksum = if body.is_empty() {
        None
    } else {
        require_chunk_content_type(&headers)?;
        Some(chunk_checksum(&headers)?)
    };

    let session = state
        .engine()
        .create(
            CreateUpload {
                declared_length,
                metadata,
                checksum_algorithm,
                retention,
            },
            &profile,
        )
        .await?;

    let mut offset = session.uploaded_offset;
    let mut expires_at = session.expires_at;
    let mut inline_error = None;

    if let Some(checksum) = inline_checksum {
        match state
            .engine()
            .append(&session.id, 0, &body, checksum.as_ref())
            .await
        {
            Ok(outcome) => {
                offset = outcome.offset;
                expires_at = outcome.expires_at;
            }
            Err(e) => {
                tracing::warn!(
                    session_id = %session.id,
                    bytes = body.len(),
                    error = %e,
                    "Inline chunk not applied, client resumes from offset 0"
                );
                inline_error = Some(e.code());
            }
        }
    }

    let mut response = StatusCode::CREATED.into_response();
    let out = response.headers_mut();
    if let Ok(v) = HeaderValue::from_str(&upload_location(state.config(), &session.id)) {
        out.insert(header::LOCATION, v);
    }
    out.insert("upload-offset", HeaderValue::from(offset));
    if let Some(code) = inline_error {
        out.insert(UPLOAD_ERROR_HEADER, HeaderValue::from_static(code));
    }
    insert_expires(out, expires_at);

    Ok(response)
}

/// HEAD /tus/:id - current offset
async fn get_offset(State(state): State<AppState>, Path(id): Path<String>) -> Result<Response> {
    let info = state.engine().get_offset(&id).await?;

    let mut response = StatusCode::OK.into_response();
    let out = response.headers_mut();
    out.insert("upload-offset", HeaderValue::from(info.offset));
    match info.total_size {
        Some(total) => out.insert("upload-length", HeaderValue::from(total)),
        None => out.insert("upload-defer-length", HeaderValue::from_static("1")),
    };
    if !info.metadata.is_empty() {
        if let Ok(v) = HeaderValue::from_str(&encode_metadata(&info.metadata)) {
            out.insert("upload-metadata", v);
        }
    }
    insert_expires(out, info.expires_at);
    out.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));

    Ok(response)
}

/// PATCH /tus/:id - append a chunk at `Upload-Offset`
async fn append_chunk(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    require_chunk_content_type(&headers)?;
    let offset = header_u64(&headers, "upload-offset")?
        .ok_or_else(|| UploadError::BadRequest("Upload-Offset header required".into()))?;
    let checksum = chunk_checksum(&headers)?;

    let outcome = state
        .engine()
        .append(&id, offset, &body, checksum.as_ref())
        .await?;

    let mut response = StatusCode::NO_CONTENT.into_response();
    let out = response.headers_mut();
    out.insert("upload-offset", HeaderValue::from(outcome.offset));
    insert_expires(out, outcome.expires_at);

    Ok(response)
}

/// POST /tus/:id/finalize - fix the length of a deferred-length upload
async fn finalize(State(state): State<AppState>, Path(id): Path<String>) -> Result<Response> {
    let session = state.engine().finalize(&id).await?;

    let mut response = StatusCode::NO_CONTENT.into_response();
    let out = response.headers_mut();
    out.insert("upload-offset", HeaderValue::from(session.uploaded_offset));
    out.insert("upload-length", HeaderValue::from(session.known_length()));

    Ok(response)
}

/// DELETE /tus/:id - terminate an incomplete upload
async fn terminate(State(state): State<AppState>, Path(id): Path<String>) -> Result<StatusCode> {
    state.engine().terminate(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// Header helpers
// ============================================================================

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn header_u64(headers: &HeaderMap, name: &str) -> Result<Option<u64>> {
    header_str(headers, name)
        .map(|v| {
            v.parse::<u64>()
                .map_err(|_| UploadError::BadRequest(format!("invalid {}: {}", name, v)))
        })
        .transpose()
}

fn require_chunk_content_type(headers: &HeaderMap) -> Result<()> {
    match header_str(headers, "content-type") {
        Some(ct) if ct.eq_ignore_ascii_case(OFFSET_OCTET_STREAM) => Ok(()),
        other => Err(UploadError::UnsupportedMediaType(
            other.unwrap_or("none").to_string(),
        )),
    }
}

fn chunk_checksum(headers: &HeaderMap) -> Result<Option<ChunkChecksum>> {
    header_str(headers, "upload-checksum")
        .map(ChunkChecksum::parse)
        .transpose()
        .map_err(UploadError::BadRequest)
}

/// Retention asked for through `X-Retention-*` headers, falling back to the
/// `retention` and `retention_ttl` metadata keys
fn retention_request(
    headers: &HeaderMap,
    metadata: &BTreeMap<String, String>,
) -> Result<RetentionRequest> {
    let kind = header_str(headers, "x-retention-policy")
        .or_else(|| metadata.get("retention").map(String::as_str))
        .map(str::parse::<RetentionKind>)
        .transpose()
        .map_err(UploadError::BadRequest)?;

    let ttl_secs = header_str(headers, "x-retention-ttl")
        .or_else(|| metadata.get("retention_ttl").map(String::as_str))
        .map(|v| {
            v.trim()
                .parse::<u64>()
                .map_err(|_| UploadError::BadRequest(format!("invalid retention TTL: {}", v)))
        })
        .transpose()?;

    Ok(RetentionRequest::new(kind, ttl_secs))
}

fn upload_location(config: &Config, id: &str) -> String {
    match &config.server.public_url {
        Some(base) => format!("{}/tus/{}", base.trim_end_matches('/'), id),
        None => format!("/tus/{}", id),
    }
}

/// RFC 7231 date, as tus expects in `Upload-Expires`
pub(crate) fn http_date(at: DateTime<Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

fn insert_expires(headers: &mut HeaderMap, expires_at: Option<DateTime<Utc>>) {
    if let Some(v) = expires_at.and_then(|at| HeaderValue::from_str(&http_date(at)).ok()) {
        headers.insert("upload-expires", v);
    }
}
