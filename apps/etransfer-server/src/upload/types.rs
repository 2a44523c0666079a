//! Upload types for the resumable upload protocol

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::backend::BackendError;
use crate::retention::{RetentionPolicy, RetentionRequest};
use crate::storage::StorageError;

use super::checksum::ChecksumAlgorithm;

// ============================================================================
// Constants
// ============================================================================

/// tus protocol version implemented by the server
pub const TUS_VERSION: &str = "1.0.0";

/// tus extensions advertised on discovery
pub const TUS_EXTENSIONS: &[&str] = &[
    "creation",
    "creation-with-upload",
    "creation-defer-length",
    "termination",
    "checksum",
    "expiration",
];

/// Default chunk size: 4MB
pub const DEFAULT_CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Incomplete uploads idle for this long are reclaimed: 24 hours
pub const DEFAULT_UPLOAD_EXPIRATION_SECS: u64 = 24 * 60 * 60;

/// Tombstones of destroyed sessions are kept this long: 7 days
pub const DEFAULT_TOMBSTONE_TTL_SECS: u64 = 7 * 24 * 60 * 60;

// ============================================================================
// Session Types
// ============================================================================

/// Lifecycle state of an upload session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Record exists, no bytes received yet
    Created,
    /// At least one chunk committed
    Uploading,
    /// All bytes committed
    Completed,
    /// Terminated by the client before completion
    Terminated,
    /// Deleted after completion (explicitly or by retention)
    Deleted,
    /// Reclaimed by the sweep (idle upload or elapsed TTL)
    Expired,
}

impl SessionState {
    /// Still accepting chunks
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Created | Self::Uploading)
    }

    /// Record is a tombstone; the bytes are gone
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminated | Self::Deleted | Self::Expired)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Uploading => "uploading",
            Self::Completed => "completed",
            Self::Terminated => "terminated",
            Self::Deleted => "deleted",
            Self::Expired => "expired",
        }
    }
}

/// Download statistics of the bytes backing a session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredFile {
    /// Number of complete end-to-end deliveries
    pub download_count: u64,

    /// Last time the whole file was delivered in one response
    pub last_full_delivery_at: Option<DateTime<Utc>>,
}

/// Durable record of one resumable upload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadSession {
    /// Opaque session ID
    pub id: String,

    /// Declared total size; `None` until finalize for deferred-length uploads
    pub total_size: Option<u64>,

    /// Bytes durably committed so far
    pub uploaded_offset: u64,

    /// Quota reserved at creation for a declared length
    #[serde(default)]
    pub reserved_bytes: u64,

    /// Per-file maximum of the creating profile, enforced on deferred-length
    /// appends
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_limit: Option<u64>,

    pub state: SessionState,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,

    /// Idle deadline of an incomplete upload, pushed forward on every chunk
    pub expires_at: Option<DateTime<Utc>>,

    /// Checksum algorithm the client announced, if any
    pub checksum_algorithm: Option<ChecksumAlgorithm>,

    /// Client metadata (`filename`, `filetype`, ...)
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,

    /// Policy resolved at creation
    pub retention: RetentionPolicy,

    /// Deletion time of a TTL file, fixed at completion
    pub retention_expires_at: Option<DateTime<Utc>>,

    /// Credential profile that created the upload
    pub owner: Option<String>,

    #[serde(default)]
    pub file: StoredFile,
}

impl UploadSession {
    /// Create a fresh session record
    pub fn new(
        total_size: Option<u64>,
        metadata: BTreeMap<String, String>,
        checksum_algorithm: Option<ChecksumAlgorithm>,
        retention: RetentionPolicy,
        owner: Option<String>,
        upload_expiration: chrono::Duration,
    ) -> Self {
        let now = Utc::now();

        Self {
            id: Uuid::new_v4().simple().to_string(),
            total_size,
            uploaded_offset: 0,
            reserved_bytes: 0,
            size_limit: None,
            state: SessionState::Created,
            created_at: now,
            updated_at: now,
            completed_at: None,
            expires_at: Some(now + upload_expiration),
            checksum_algorithm,
            metadata,
            retention,
            retention_expires_at: None,
            owner,
            file: StoredFile::default(),
        }
    }

    /// Best-known length of the file
    pub fn known_length(&self) -> u64 {
        self.total_size.unwrap_or(self.uploaded_offset)
    }

    pub fn filename(&self) -> Option<&str> {
        self.metadata.get("filename").map(String::as_str)
    }

    pub fn filetype(&self) -> Option<&str> {
        self.metadata.get("filetype").map(String::as_str)
    }

    /// Bytes this session counts against the quota
    pub fn charged_bytes(&self) -> u64 {
        if self.state.is_terminal() {
            0
        } else {
            self.uploaded_offset.max(self.reserved_bytes)
        }
    }

    /// Mark the session complete at `now`
    pub fn complete(&mut self, now: DateTime<Utc>) {
        self.state = SessionState::Completed;
        self.completed_at = Some(now);
        self.expires_at = None;
        self.retention_expires_at = self.retention.expires_at(now);
    }

    /// Turn the record into a tombstone carrying `state`
    pub fn into_tombstone(mut self, state: SessionState, now: DateTime<Utc>) -> Self {
        debug_assert!(state.is_terminal());
        self.state = state;
        self.updated_at = now;
        self.reserved_bytes = 0;
        self.expires_at = None;
        self
    }

    /// Calculate progress percentage
    pub fn progress(&self) -> f64 {
        match self.total_size {
            Some(0) => 100.0,
            Some(total) => (self.uploaded_offset as f64 / total as f64) * 100.0,
            None => 0.0,
        }
    }
}

// ============================================================================
// Request / Response Types
// ============================================================================

/// Parameters of a new upload, after header parsing
#[derive(Debug, Clone, Default)]
pub struct CreateUpload {
    /// Declared length, `None` for deferred-length uploads
    pub declared_length: Option<u64>,

    pub metadata: BTreeMap<String, String>,

    pub checksum_algorithm: Option<ChecksumAlgorithm>,

    /// Retention the client asked for
    pub retention: RetentionRequest,
}

/// Offset query result
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OffsetInfo {
    pub offset: u64,
    pub total_size: Option<u64>,
    pub state: SessionState,
    pub expires_at: Option<DateTime<Utc>>,
    pub metadata: BTreeMap<String, String>,
}

impl From<&UploadSession> for OffsetInfo {
    fn from(session: &UploadSession) -> Self {
        Self {
            offset: session.uploaded_offset,
            total_size: session.total_size,
            state: session.state,
            expires_at: session.expires_at,
            metadata: session.metadata.clone(),
        }
    }
}

/// Outcome of an accepted append
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendOutcome {
    /// Offset after the append
    pub offset: u64,

    pub state: SessionState,

    /// Idle deadline after the append; `None` once completed
    pub expires_at: Option<DateTime<Utc>>,

    /// The chunk was a replay of bytes already committed
    pub replayed: bool,
}

// ============================================================================
// Error Types
// ============================================================================

/// Upload error types
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("Upload not found: {0}")]
    NotFound(String),

    #[error("Upload is gone ({state}): {id}", state = state.as_str())]
    Gone { id: String, state: SessionState },

    #[error("Upload offset mismatch: expected {expected}, got {actual}")]
    Conflict { expected: u64, actual: u64 },

    #[error("Checksum mismatch ({algorithm})")]
    ChecksumMismatch { algorithm: ChecksumAlgorithm },

    #[error("Storage quota exceeded: {used} of {max} bytes used, {requested} requested")]
    QuotaExceeded { used: u64, max: u64, requested: u64 },

    #[error("Range unavailable: requested up to {requested}, {available} bytes uploaded")]
    RangeUnavailable { requested: u64, available: u64 },

    #[error("Range not satisfiable for a file of {size} bytes")]
    RangeNotSatisfiable { size: u64 },

    #[error("Operation not allowed while upload is {state}", state = state.as_str())]
    InvalidState { state: SessionState },

    #[error("Upload is locked by another request: {0}")]
    Locked(String),

    #[error("Upload exceeds maximum size: {size} bytes (max: {max})")]
    TooLarge { size: u64, max: u64 },

    #[error("Chunk runs past the declared length: {end} > {total}")]
    ExceedsLength { end: u64, total: u64 },

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Unsupported content type: {0}")]
    UnsupportedMediaType(String),

    #[error("Unsupported protocol version: {0}")]
    VersionMismatch(String),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl UploadError {
    /// Get HTTP status code for this error
    pub fn status_code(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Gone { .. } => StatusCode::GONE,
            Self::Conflict { .. } => StatusCode::CONFLICT,
            Self::ChecksumMismatch { .. } => {
                StatusCode::from_u16(460).unwrap_or(StatusCode::BAD_REQUEST)
            }
            Self::QuotaExceeded { .. } => StatusCode::INSUFFICIENT_STORAGE,
            Self::RangeUnavailable { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            Self::RangeNotSatisfiable { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            Self::InvalidState { .. } => StatusCode::CONFLICT,
            Self::Locked(_) => StatusCode::LOCKED,
            Self::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::ExceedsLength { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Self::VersionMismatch(_) => StatusCode::PRECONDITION_FAILED,
            Self::Backend(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Storage(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::Gone { .. } => "GONE",
            Self::Conflict { .. } => "OFFSET_MISMATCH",
            Self::ChecksumMismatch { .. } => "CHECKSUM_MISMATCH",
            Self::QuotaExceeded { .. } => "QUOTA_EXCEEDED",
            Self::RangeUnavailable { .. } => "RANGE_UNAVAILABLE",
            Self::RangeNotSatisfiable { .. } => "RANGE_NOT_SATISFIABLE",
            Self::InvalidState { .. } => "INVALID_STATE",
            Self::Locked(_) => "LOCKED",
            Self::TooLarge { .. } => "TOO_LARGE",
            Self::ExceedsLength { .. } => "EXCEEDS_LENGTH",
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::UnsupportedMediaType(_) => "UNSUPPORTED_MEDIA_TYPE",
            Self::VersionMismatch(_) => "VERSION_MISMATCH",
            Self::Backend(_) => "BACKEND_ERROR",
            Self::Storage(_) => "STORAGE_ERROR",
        }
    }

    /// The client may retry the same request later without changing it
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::QuotaExceeded { .. } | Self::Locked(_) | Self::Backend(_) | Self::Storage(_)
        )
    }
}
