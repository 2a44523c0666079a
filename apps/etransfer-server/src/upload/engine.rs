//! Upload Engine
//!
//! The resumable-upload state machine. Every mutation of a session runs
//! under the backend's per-id lock and is committed with a compare-and-swap
//! on the offset the mutation started from:
//! - bytes are durable in the blob store before the record moves
//! - quota is reserved before bytes are written, counted as used once the
//!   record moves, and handed back if the write or the commit fails
//! - destroyed sessions leave a tombstone so later requests get `Gone`

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::checksum::ChunkChecksum;
use super::types::{
    AppendOutcome, CreateUpload, OffsetInfo, SessionState, UploadError, UploadSession,
};
use crate::backend::StateBackend;
use crate::config::{CredentialProfile, Settings};
use crate::quota::QuotaController;
use crate::retention::{self, ReadGuards};
use crate::storage::BlobStore;

/// Attempts made to take a lock for short bookkeeping writes
const BOOKKEEPING_LOCK_ATTEMPTS: u32 = 20;
const BOOKKEEPING_LOCK_BACKOFF: Duration = Duration::from_millis(25);

/// Static engine limits
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Per-file maximum; `None` means unlimited
    pub max_upload_size: Option<u64>,
    /// Idle window after which an incomplete upload expires
    pub upload_expiration: chrono::Duration,
    /// Lease of the per-session lock
    pub lock_ttl: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            max_upload_size: None,
            upload_expiration: chrono::Duration::seconds(
                super::types::DEFAULT_UPLOAD_EXPIRATION_SECS as i64,
            ),
            lock_ttl: Duration::from_secs(60),
        }
    }
}

/// Outcome of a conditional deletion
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reclaim {
    /// Session destroyed, tombstone written
    Destroyed,
    /// Session busy (locked or being read); try again later
    Busy,
    /// Session no longer eligible or already gone
    Skipped,
}

// ============================================================================
// Upload Engine
// ============================================================================

#[derive(Clone)]
pub struct UploadEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    backend: Arc<dyn StateBackend>,
    blobs: BlobStore,
    quota: QuotaController,
    guards: ReadGuards,
    settings: Settings,
    options: EngineOptions,
}

impl UploadEngine {
    pub fn new(
        backend: Arc<dyn StateBackend>,
        blobs: BlobStore,
        quota: QuotaController,
        settings: Settings,
        options: EngineOptions,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                backend,
                blobs,
                quota,
                guards: ReadGuards::new(),
                settings,
                options,
            }),
        }
    }

    pub fn backend(&self) -> &Arc<dyn StateBackend> {
        &self.inner.backend
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.inner.blobs
    }

    pub fn quota(&self) -> &QuotaController {
        &self.inner.quota
    }

    pub fn guards(&self) -> &ReadGuards {
        &self.inner.guards
    }

    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub fn options(&self) -> &EngineOptions {
        &self.inner.options
    }

    /// Per-file maximum for `profile`
    pub fn max_upload_size(&self, profile: &CredentialProfile) -> Option<u64> {
        match (self.inner.options.max_upload_size, profile.max_upload_size) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    // ========================================================================
    // Session Lifecycle
    // ========================================================================

    /// Create a new upload session
    pub async fn create(
        &self,
        request: CreateUpload,
        profile: &CredentialProfile,
    ) -> Result<UploadSession, UploadError> {
        if let (Some(size), Some(max)) = (request.declared_length, self.max_upload_size(profile)) {
            if size > max {
                return Err(UploadError::TooLarge { size, max });
            }
        }

        let policy = retention::resolve(
            &request.retention,
            &profile.retention_request(),
            &self.inner.settings.default_retention(),
        );

        let mut session = UploadSession::new(
            request.declared_length,
            request.metadata,
            request.checksum_algorithm,
            policy,
            Some(profile.name.clone()),
            self.inner.options.upload_expiration,
        );

        session.size_limit = self.max_upload_size(profile);

        let reservation = self
            .inner
            .quota
            .admit(request.declared_length.unwrap_or(0))
            .await?;
        session.reserved_bytes = reservation.bytes();

        if session.total_size == Some(0) {
            session.complete(session.created_at);
        }

        if let Err(e) = self.inner.backend.put(&session).await {
            self.inner.quota.cancel(reservation).await;
            return Err(e.into());
        }
        self.inner.quota.commit(reservation).await;

        tracing::info!(
            session_id = %session.id,
            total_size = ?session.total_size,
            retention = %session.retention,
            owner = %profile.name,
            filename = session.filename().unwrap_or(""),
            "Created upload session"
        );

        Ok(session)
    }

    /// Current offset of a session; read-only
    pub async fn get_offset(&self, id: &str) -> Result<OffsetInfo, UploadError> {
        self.load_live(id).await.map(|s| OffsetInfo::from(&s))
    }

    /// Fetch a live session (not a tombstone)
    pub async fn get_session(&self, id: &str) -> Result<UploadSession, UploadError> {
        self.load_live(id).await
    }

    /// Append a chunk at `offset`
    pub async fn append(
        &self,
        id: &str,
        offset: u64,
        data: &[u8],
        checksum: Option<&ChunkChecksum>,
    ) -> Result<AppendOutcome, UploadError> {
        let lock = self.lock(id).await?;
        let result = self.append_locked(id, offset, data, checksum).await;
        lock.release().await;
        result
    }

    async fn append_locked(
        &self,
        id: &str,
        offset: u64,
        data: &[u8],
        checksum: Option<&ChunkChecksum>,
    ) -> Result<AppendOutcome, UploadError> {
        let session = self.load_live(id).await?;
        let current = session.uploaded_offset;
        let len = data.len() as u64;

        if offset != current {
            if self.is_replay(&session, offset, data).await? {
                tracing::debug!(session_id = %id, offset = offset, bytes = len, "Replayed chunk ignored");
                return Ok(AppendOutcome {
                    offset: current,
                    state: session.state,
                    expires_at: session.expires_at,
                    replayed: true,
                });
            }
            return Err(UploadError::Conflict {
                expected: current,
                actual: offset,
            });
        }

        if !session.state.is_open() {
            return Err(UploadError::InvalidState {
                state: session.state,
            });
        }

        let end = offset + len;
        match session.total_size {
            Some(total) if end > total => {
                return Err(UploadError::ExceedsLength { end, total });
            }
            None => {
                // Records written before the limit was stored fall back to
                // the server-wide maximum
                if let Some(max) = session.size_limit.or(self.inner.options.max_upload_size) {
                    if end > max {
                        return Err(UploadError::TooLarge { size: end, max });
                    }
                }
            }
            _ => {}
        }

        if let Some(checksum) = checksum {
            if !checksum.verify(data) {
                return Err(UploadError::ChecksumMismatch {
                    algorithm: checksum.algorithm,
                });
            }
        }

        if len == 0 {
            return Ok(AppendOutcome {
                offset: current,
                state: session.state,
                expires_at: session.expires_at,
                replayed: false,
            });
        }

        // Only growth past what is already charged needs admission
        let growth = end.saturating_sub(current.max(session.reserved_bytes));
        let reservation = self.inner.quota.admit(growth).await?;

        if let Err(e) = self.inner.blobs.write_at(id, offset, data).await {
            self.inner.quota.cancel(reservation).await;
            tracing::error!(session_id = %id, offset = offset, error = %e, "Chunk write failed");
            return Err(e.into());
        }

        let now = Utc::now();
        let mut next = session;
        next.uploaded_offset = end;
        next.updated_at = now;
        next.state = SessionState::Uploading;
        next.expires_at = Some(now + self.inner.options.upload_expiration);
        if next.total_size == Some(end) {
            next.complete(now);
        }

        match self.inner.backend.compare_and_swap(id, current, &next).await {
            Ok(true) => self.inner.quota.commit(reservation).await,
            Ok(false) => {
                self.inner.quota.cancel(reservation).await;
                let actual = self
                    .inner
                    .backend
                    .get(id)
                    .await?
                    .map_or(current, |s| s.uploaded_offset);
                return Err(UploadError::Conflict {
                    expected: actual,
                    actual: offset,
                });
            }
            Err(e) => {
                self.inner.quota.cancel(reservation).await;
                return Err(e.into());
            }
        }

        tracing::debug!(
            session_id = %id,
            offset = end,
            bytes = len,
            "Chunk committed"
        );
        if next.state == SessionState::Completed {
            tracing::info!(
                session_id = %id,
                size = end,
                retention = %next.retention,
                "Upload completed"
            );
        }

        Ok(AppendOutcome {
            offset: end,
            state: next.state,
            expires_at: next.expires_at,
            replayed: false,
        })
    }

    /// A chunk lying wholly below the committed offset whose bytes match
    /// what is stored
    async fn is_replay(
        &self,
        session: &UploadSession,
        offset: u64,
        data: &[u8],
    ) -> Result<bool, UploadError> {
        let len = data.len() as u64;
        if data.is_empty() || offset >= session.uploaded_offset || offset + len > session.uploaded_offset {
            return Ok(false);
        }

        let stored = self.inner.blobs.read_at(&session.id, offset, data.len()).await?;
        Ok(stored == data)
    }

    /// Fix the length of a deferred-length upload at its current offset
    pub async fn finalize(&self, id: &str) -> Result<UploadSession, UploadError> {
        let lock = self.lock(id).await?;
        let result = self.finalize_locked(id).await;
        lock.release().await;
        result
    }

    async fn finalize_locked(&self, id: &str) -> Result<UploadSession, UploadError> {
        let session = self.load_live(id).await?;
        if !session.state.is_open() || session.total_size.is_some() {
            return Err(UploadError::InvalidState {
                state: session.state,
            });
        }

        let now = Utc::now();
        let mut next = session.clone();
        next.total_size = Some(session.uploaded_offset);
        next.updated_at = now;
        next.complete(now);

        if !self
            .inner
            .backend
            .compare_and_swap(id, session.uploaded_offset, &next)
            .await?
        {
            return Err(UploadError::Conflict {
                expected: session.uploaded_offset,
                actual: session.uploaded_offset,
            });
        }

        tracing::info!(session_id = %id, size = session.uploaded_offset, "Upload finalized");
        Ok(next)
    }

    /// Abort an incomplete upload
    pub async fn terminate(&self, id: &str) -> Result<(), UploadError> {
        let lock = self.lock(id).await?;
        let result = async {
            let session = self.load_live(id).await?;
            if !session.state.is_open() {
                return Err(UploadError::InvalidState {
                    state: session.state,
                });
            }
            self.destroy(session, SessionState::Terminated).await
        }
        .await;
        lock.release().await;
        result
    }

    /// Delete a session in any live state
    pub async fn delete_file(&self, id: &str) -> Result<(), UploadError> {
        let Some(delete_guard) = self.inner.guards.try_begin_delete(id) else {
            return Err(UploadError::Locked(id.to_string()));
        };

        let lock = self.lock(id).await?;
        let result = async {
            let session = self.load_live(id).await?;
            self.destroy(session, SessionState::Deleted).await
        }
        .await;
        lock.release().await;
        drop(delete_guard);
        result
    }

    /// Destroy `id` as `state` if it is free and `eligible` still holds
    /// after the lock is taken. Used by the retention engine.
    pub async fn reclaim<F>(
        &self,
        id: &str,
        state: SessionState,
        eligible: F,
    ) -> Result<Reclaim, UploadError>
    where
        F: Fn(&UploadSession) -> bool + Send,
    {
        let Some(delete_guard) = self.inner.guards.try_begin_delete(id) else {
            return Ok(Reclaim::Busy);
        };

        let Some(lock) = self.try_lock(id).await? else {
            return Ok(Reclaim::Busy);
        };

        let result = async {
            match self.inner.backend.get(id).await? {
                Some(session) if !session.state.is_terminal() && eligible(&session) => {
                    self.destroy(session, state).await?;
                    Ok(Reclaim::Destroyed)
                }
                _ => Ok::<_, UploadError>(Reclaim::Skipped),
            }
        }
        .await;

        lock.release().await;
        drop(delete_guard);
        result
    }

    /// Remove a tombstone record for good
    pub async fn purge_tombstone(&self, id: &str) -> Result<bool, UploadError> {
        let Some(lock) = self.try_lock(id).await? else {
            return Ok(false);
        };

        let result = async {
            match self.inner.backend.get(id).await? {
                Some(session) if session.state.is_terminal() => {
                    Ok(self.inner.backend.delete(id).await?)
                }
                _ => Ok::<_, UploadError>(false),
            }
        }
        .await;

        lock.release().await;
        result
    }

    /// Record one complete end-to-end delivery
    pub async fn record_full_download(
        &self,
        id: &str,
        at: DateTime<Utc>,
    ) -> Result<UploadSession, UploadError> {
        let lock = self.lock_patiently(id).await?;
        let result = async {
            let session = self.load_live(id).await?;
            let mut next = session.clone();
            next.file.download_count += 1;
            next.file.last_full_delivery_at = Some(at);
            next.updated_at = at;

            if !self
                .inner
                .backend
                .compare_and_swap(id, session.uploaded_offset, &next)
                .await?
            {
                return Err(UploadError::Gone {
                    id: id.to_string(),
                    state: SessionState::Deleted,
                });
            }
            Ok(next)
        }
        .await;
        lock.release().await;

        if let Ok(session) = &result {
            tracing::info!(
                session_id = %id,
                download_count = session.file.download_count,
                "Full download recorded"
            );
        }
        result
    }

    // ========================================================================
    // Internals
    // ========================================================================

    async fn load_live(&self, id: &str) -> Result<UploadSession, UploadError> {
        match self.inner.backend.get(id).await? {
            None => Err(UploadError::NotFound(id.to_string())),
            Some(session) if session.state.is_terminal() => Err(UploadError::Gone {
                id: id.to_string(),
                state: session.state,
            }),
            Some(session) => Ok(session),
        }
    }

    /// Tombstone the record, drop its bytes and return its quota.
    /// Caller holds the session lock.
    async fn destroy(&self, session: UploadSession, state: SessionState) -> Result<(), UploadError> {
        let id = session.id.clone();
        let offset = session.uploaded_offset;
        let charged = session.charged_bytes();
        let tombstone = session.into_tombstone(state, Utc::now());

        if !self.inner.backend.compare_and_swap(&id, offset, &tombstone).await? {
            return Err(UploadError::Conflict {
                expected: offset,
                actual: offset,
            });
        }

        if let Err(e) = self.inner.blobs.delete(&id).await {
            tracing::warn!(session_id = %id, error = %e, "Failed to delete blob of destroyed session");
        }
        self.inner.quota.release_logged(charged).await;

        tracing::info!(
            session_id = %id,
            state = state.as_str(),
            released = charged,
            "Session destroyed"
        );
        Ok(())
    }

    async fn try_lock(&self, id: &str) -> Result<Option<SessionLock>, UploadError> {
        let holder = Uuid::new_v4().simple().to_string();
        let acquired = self
            .inner
            .backend
            .try_lock(id, &holder, self.inner.options.lock_ttl)
            .await?;

        Ok(acquired.then(|| SessionLock {
            backend: self.inner.backend.clone(),
            id: id.to_string(),
            holder,
            released: false,
        }))
    }

    async fn lock(&self, id: &str) -> Result<SessionLock, UploadError> {
        self.try_lock(id)
            .await?
            .ok_or_else(|| UploadError::Locked(id.to_string()))
    }

    /// Bookkeeping writes wait briefly instead of failing on contention
    async fn lock_patiently(&self, id: &str) -> Result<SessionLock, UploadError> {
        for _ in 1..BOOKKEEPING_LOCK_ATTEMPTS {
            if let Some(lock) = self.try_lock(id).await? {
                return Ok(lock);
            }
            tokio::time::sleep(BOOKKEEPING_LOCK_BACKOFF).await;
        }
        self.lock(id).await
    }
}

/// Held per-session lock; released explicitly, or on drop if the request
/// was cancelled
struct SessionLock {
    backend: Arc<dyn StateBackend>,
    id: String,
    holder: String,
    released: bool,
}

impl SessionLock {
    async fn release(mut self) {
        self.released = true;
        if let Err(e) = self.backend.unlock(&self.id, &self.holder).await {
            tracing::warn!(session_id = %self.id, error = %e, "Failed to release session lock");
        }
    }
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let backend = self.backend.clone();
        let id = std::mem::take(&mut self.id);
        let holder = std::mem::take(&mut self.holder);
        handle.spawn(async move {
            let _ = backend.unlock(&id, &holder).await;
        });
    }
}

impl std::fmt::Debug for SessionLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLock")
            .field("id", &self.id)
            .field("holder", &self.holder)
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::config::RuntimeSettings;
    use crate::retention::{RetentionKind, RetentionPolicy, RetentionRequest};
    use crate::storage::{BlobStorage, StorageError};
    use crate::upload::checksum::ChecksumAlgorithm;

    pub(crate) fn engine_with(ceiling: Option<u64>, options: EngineOptions) -> UploadEngine {
        engine_with_blobs(ceiling, options, BlobStore::in_memory())
    }

    fn engine_with_blobs(ceiling: Option<u64>, options: EngineOptions, blobs: BlobStore) -> UploadEngine {
        let backend: Arc<dyn StateBackend> = Arc::new(MemoryBackend::new());
        let settings = Settings::new(RuntimeSettings {
            max_storage_size: ceiling,
            ..RuntimeSettings::default()
        });
        let quota = QuotaController::new(backend.clone(), settings.clone());
        UploadEngine::new(backend, blobs, quota, settings, options)
    }

    pub(crate) fn engine() -> UploadEngine {
        engine_with(None, EngineOptions::default())
    }

    pub(crate) fn create(length: Option<u64>) -> CreateUpload {
        CreateUpload {
            declared_length: length,
            ..CreateUpload::default()
        }
    }

    fn anon() -> CredentialProfile {
        CredentialProfile::anonymous()
    }

    #[tokio::test]
    async fn test_sequential_appends_concatenate() {
        let engine = engine();
        let session = engine.create(create(Some(11)), &anon()).await.unwrap();

        let first = engine.append(&session.id, 0, b"hello ", None).await.unwrap();
        assert_eq!(first.offset, 6);
        assert_eq!(first.state, SessionState::Uploading);

        let second = engine.append(&session.id, 6, b"world", None).await.unwrap();
        assert_eq!(second.offset, 11);
        assert_eq!(second.state, SessionState::Completed);

        let stored = engine.blobs().read_at(&session.id, 0, 11).await.unwrap();
        assert_eq!(stored, b"hello world");

        let done = engine.get_session(&session.id).await.unwrap();
        assert!(done.completed_at.is_some());
        assert_eq!(done.uploaded_offset, done.total_size.unwrap());
    }

    #[tokio::test]
    async fn test_replay_is_noop() {
        let engine = engine();
        let session = engine.create(create(Some(10)), &anon()).await.unwrap();
        engine.append(&session.id, 0, b"abcd", None).await.unwrap();
        engine.append(&session.id, 4, b"ef", None).await.unwrap();
        let used = engine.quota().used().await.unwrap();

        let replay = engine.append(&session.id, 0, b"abcd", None).await.unwrap();
        assert!(replay.replayed);
        assert_eq!(replay.offset, 6);

        assert_eq!(engine.get_offset(&session.id).await.unwrap().offset, 6);
        assert_eq!(engine.blobs().read_at(&session.id, 0, 6).await.unwrap(), b"abcdef");
        assert_eq!(engine.quota().used().await.unwrap(), used);
    }

    #[tokio::test]
    async fn test_offset_mismatch_conflicts_without_mutation() {
        let engine = engine();
        let session = engine.create(create(Some(10)), &anon()).await.unwrap();
        engine.append(&session.id, 0, b"abcd", None).await.unwrap();

        // Ahead of the offset
        let err = engine.append(&session.id, 6, b"xy", None).await.unwrap_err();
        assert!(matches!(err, UploadError::Conflict { expected: 4, actual: 6 }));

        // Behind the offset with different bytes
        let err = engine.append(&session.id, 0, b"zzzz", None).await.unwrap_err();
        assert!(matches!(err, UploadError::Conflict { expected: 4, actual: 0 }));

        // Overlapping the offset is not a replay
        let err = engine.append(&session.id, 2, b"cdef", None).await.unwrap_err();
        assert!(matches!(err, UploadError::Conflict { .. }));

        assert_eq!(engine.get_offset(&session.id).await.unwrap().offset, 4);
        assert_eq!(engine.blobs().read_at(&session.id, 0, 4).await.unwrap(), b"abcd");
    }

    #[tokio::test]
    async fn test_checksum_mismatch_leaves_offset() {
        let engine = engine();
        let session = engine.create(create(Some(4)), &anon()).await.unwrap();

        let wrong = ChunkChecksum::compute(ChecksumAlgorithm::Sha256, b"nope");
        let err = engine
            .append(&session.id, 0, b"data", Some(&wrong))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::ChecksumMismatch { .. }));
        assert_eq!(engine.get_offset(&session.id).await.unwrap().offset, 0);

        let right = ChunkChecksum::compute(ChecksumAlgorithm::Sha256, b"data");
        let ok = engine.append(&session.id, 0, b"data", Some(&right)).await.unwrap();
        assert_eq!(ok.state, SessionState::Completed);
    }

    #[tokio::test]
    async fn test_quota_rejects_entire_chunk() {
        let engine = engine_with(Some(100), EngineOptions::default());
        engine.backend().set_usage(90).await.unwrap();

        // Deferred length: admission happens per chunk
        let session = engine.create(create(None), &anon()).await.unwrap();
        let err = engine
            .append(&session.id, 0, &[7u8; 20], None)
            .await
            .unwrap_err();

        assert!(matches!(err, UploadError::QuotaExceeded { used: 90, max: 100, .. }));
        assert_eq!(engine.quota().used().await.unwrap(), 90);
        assert_eq!(engine.get_offset(&session.id).await.unwrap().offset, 0);
        assert_eq!(engine.blobs().size(&session.id).await.unwrap(), None);

        // Resumable from the unchanged offset once space frees up
        engine.backend().set_usage(0).await.unwrap();
        let ok = engine.append(&session.id, 0, &[7u8; 20], None).await.unwrap();
        assert_eq!(ok.offset, 20);
    }

    #[tokio::test]
    async fn test_declared_length_reserves_quota() {
        let engine = engine_with(Some(100), EngineOptions::default());

        let session = engine.create(create(Some(60)), &anon()).await.unwrap();
        assert_eq!(session.reserved_bytes, 60);
        assert_eq!(engine.quota().used().await.unwrap(), 60);

        let err = engine.create(create(Some(50)), &anon()).await.unwrap_err();
        assert!(matches!(err, UploadError::QuotaExceeded { .. }));

        // Appends inside the reservation are not charged again
        engine.append(&session.id, 0, &[1u8; 60], None).await.unwrap();
        assert_eq!(engine.quota().used().await.unwrap(), 60);
    }

    #[tokio::test]
    async fn test_too_large_and_exceeds_length() {
        let engine = engine_with(
            None,
            EngineOptions {
                max_upload_size: Some(10),
                ..EngineOptions::default()
            },
        );

        let err = engine.create(create(Some(11)), &anon()).await.unwrap_err();
        assert!(matches!(err, UploadError::TooLarge { size: 11, max: 10 }));

        let session = engine.create(create(Some(4)), &anon()).await.unwrap();
        let err = engine.append(&session.id, 0, b"12345", None).await.unwrap_err();
        assert!(matches!(err, UploadError::ExceedsLength { end: 5, total: 4 }));

        let deferred = engine.create(create(None), &anon()).await.unwrap();
        let err = engine
            .append(&deferred.id, 0, &[0u8; 11], None)
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::TooLarge { .. }));
    }

    #[tokio::test]
    async fn test_zero_length_completes_immediately() {
        let engine = engine();
        let session = engine.create(create(Some(0)), &anon()).await.unwrap();
        assert_eq!(session.state, SessionState::Completed);
    }

    #[tokio::test]
    async fn test_deferred_length_needs_finalize() {
        let engine = engine();
        let session = engine.create(create(None), &anon()).await.unwrap();
        engine.append(&session.id, 0, b"abc", None).await.unwrap();
        assert_eq!(
            engine.get_offset(&session.id).await.unwrap().state,
            SessionState::Uploading
        );

        let done = engine.finalize(&session.id).await.unwrap();
        assert_eq!(done.state, SessionState::Completed);
        assert_eq!(done.total_size, Some(3));

        let err = engine.finalize(&session.id).await.unwrap_err();
        assert!(matches!(err, UploadError::InvalidState { .. }));

        let declared = engine.create(create(Some(3)), &anon()).await.unwrap();
        assert!(matches!(
            engine.finalize(&declared.id).await,
            Err(UploadError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_terminate() {
        let engine = engine_with(Some(1_000), EngineOptions::default());
        let session = engine.create(create(Some(100)), &anon()).await.unwrap();
        engine.append(&session.id, 0, b"partial", None).await.unwrap();

        engine.terminate(&session.id).await.unwrap();

        assert!(matches!(
            engine.get_offset(&session.id).await,
            Err(UploadError::Gone { state: SessionState::Terminated, .. })
        ));
        assert_eq!(engine.blobs().size(&session.id).await.unwrap(), None);
        assert_eq!(engine.quota().used().await.unwrap(), 0);

        let completed = engine.create(create(Some(1)), &anon()).await.unwrap();
        engine.append(&completed.id, 0, b"x", None).await.unwrap();
        assert!(matches!(
            engine.terminate(&completed.id).await,
            Err(UploadError::InvalidState { state: SessionState::Completed })
        ));

        assert!(matches!(
            engine.terminate("doesnotexist").await,
            Err(UploadError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_append_is_locked() {
        let engine = engine();
        let session = engine.create(create(Some(10)), &anon()).await.unwrap();

        let held = engine.lock(&session.id).await.unwrap();
        let err = engine.append(&session.id, 0, b"a", None).await.unwrap_err();
        assert!(matches!(err, UploadError::Locked(_)));
        assert!(matches!(
            engine.terminate(&session.id).await,
            Err(UploadError::Locked(_))
        ));

        held.release().await;
        engine.append(&session.id, 0, b"a", None).await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_lock_is_released() {
        let engine = engine();
        let session = engine.create(create(Some(10)), &anon()).await.unwrap();

        drop(engine.lock(&session.id).await.unwrap());
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        engine.append(&session.id, 0, b"a", None).await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_file_respects_readers() {
        let engine = engine();
        let session = engine.create(create(Some(1)), &anon()).await.unwrap();
        engine.append(&session.id, 0, b"x", None).await.unwrap();

        let reader = engine.guards().acquire_read(&session.id).unwrap();
        assert!(matches!(
            engine.delete_file(&session.id).await,
            Err(UploadError::Locked(_))
        ));
        assert_eq!(
            engine.reclaim(&session.id, SessionState::Expired, |_| true).await.unwrap(),
            Reclaim::Busy
        );

        drop(reader);
        engine.delete_file(&session.id).await.unwrap();
        assert!(matches!(
            engine.get_session(&session.id).await,
            Err(UploadError::Gone { state: SessionState::Deleted, .. })
        ));

        assert!(engine.purge_tombstone(&session.id).await.unwrap());
        assert!(matches!(
            engine.get_session(&session.id).await,
            Err(UploadError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_retention_resolved_at_creation() {
        let engine = engine();
        let profile = CredentialProfile {
            retention: Some(RetentionKind::Ttl),
            retention_ttl: Some(30),
            ..CredentialProfile::anonymous()
        };

        let from_profile = engine.create(create(Some(1)), &profile).await.unwrap();
        assert_eq!(from_profile.retention, RetentionPolicy::Ttl { ttl_secs: 30 });

        let explicit = CreateUpload {
            declared_length: Some(1),
            retention: RetentionRequest::new(Some(RetentionKind::DownloadOnce), None),
            ..CreateUpload::default()
        };
        let session = engine.create(explicit, &profile).await.unwrap();
        assert_eq!(session.retention, RetentionPolicy::DownloadOnce);
        assert_eq!(session.owner.as_deref(), Some("anonymous"));
    }

    /// Blob storage whose writes always fail
    struct BrokenDisk;

    #[async_trait::async_trait]
    impl BlobStorage for BrokenDisk {
        async fn write_at(&self, _: &str, _: u64, _: &[u8]) -> Result<(), StorageError> {
            Err(StorageError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk full")))
        }
        async fn read_at(&self, id: &str, _: u64, _: usize) -> Result<Vec<u8>, StorageError> {
            Err(StorageError::NotFound(id.to_string()))
        }
        async fn size(&self, _: &str) -> Result<Option<u64>, StorageError> {
            Ok(None)
        }
        async fn delete(&self, _: &str) -> Result<bool, StorageError> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn test_failed_write_is_retryable_and_releases_quota() {
        let engine = engine_with_blobs(
            Some(100),
            EngineOptions::default(),
            BlobStore::with_backend(BrokenDisk),
        );
        let session = engine.create(create(None), &anon()).await.unwrap();

        let err = engine.append(&session.id, 0, &[0u8; 10], None).await.unwrap_err();
        assert!(matches!(err, UploadError::Storage(_)));
        assert!(err.is_retryable());
        assert_eq!(engine.quota().used().await.unwrap(), 0);
        assert_eq!(engine.get_offset(&session.id).await.unwrap().offset, 0);
    }

    #[tokio::test]
    async fn test_deferred_length_uses_profile_limit() {
        let engine = engine();
        let profile = CredentialProfile {
            max_upload_size: Some(10),
            ..CredentialProfile::anonymous()
        };

        let session = engine.create(create(None), &profile).await.unwrap();
        assert_eq!(session.size_limit, Some(10));

        engine.append(&session.id, 0, &[1u8; 6], None).await.unwrap();
        let err = engine.append(&session.id, 6, &[1u8; 5], None).await.unwrap_err();
        assert!(matches!(err, UploadError::TooLarge { size: 11, max: 10 }));
        assert_eq!(engine.get_offset(&session.id).await.unwrap().offset, 6);

        // Other profiles are not bound by it
        let open = engine.create(create(None), &anon()).await.unwrap();
        engine.append(&open.id, 0, &[1u8; 11], None).await.unwrap();
    }

    /// Blob storage whose writes park until the test lets them through
    struct GatedDisk {
        entered: Arc<tokio::sync::Notify>,
        proceed: Arc<tokio::sync::Notify>,
        inner: BlobStore,
    }

    #[async_trait::async_trait]
    impl BlobStorage for GatedDisk {
        async fn write_at(&self, id: &str, offset: u64, data: &[u8]) -> Result<(), StorageError> {
            self.entered.notify_one();
            self.proceed.notified().await;
            self.inner.write_at(id, offset, data).await
        }
        async fn read_at(&self, id: &str, offset: u64, len: usize) -> Result<Vec<u8>, StorageError> {
            self.inner.read_at(id, offset, len).await
        }
        async fn size(&self, id: &str) -> Result<Option<u64>, StorageError> {
            self.inner.size(id).await
        }
        async fn delete(&self, id: &str) -> Result<bool, StorageError> {
            self.inner.delete(id).await
        }
    }

    #[tokio::test]
    async fn test_reconcile_during_in_flight_append() {
        let entered = Arc::new(tokio::sync::Notify::new());
        let proceed = Arc::new(tokio::sync::Notify::new());
        let engine = engine_with_blobs(
            Some(100),
            EngineOptions::default(),
            BlobStore::with_backend(GatedDisk {
                entered: entered.clone(),
                proceed: proceed.clone(),
                inner: BlobStore::in_memory(),
            }),
        );

        let session = engine.create(create(None), &anon()).await.unwrap();
        let writer = {
            let engine = engine.clone();
            let id = session.id.clone();
            tokio::spawn(async move { engine.append(&id, 0, &[5u8; 80], None).await })
        };

        // Admitted, write parked, record still at offset 0
        entered.notified().await;
        engine.backend().set_usage(15).await.unwrap();
        let result = engine.quota().reconcile().await.unwrap();
        assert!(result.applied);
        assert_eq!(result.previous, 15);
        assert_eq!(result.actual, 0);
        assert_eq!(result.pending, 80);
        assert_eq!(engine.quota().used().await.unwrap(), 80);
        assert!(matches!(
            engine.create(create(Some(30)), &anon()).await,
            Err(UploadError::QuotaExceeded { used: 80, .. })
        ));

        proceed.notify_one();
        assert_eq!(writer.await.unwrap().unwrap().offset, 80);

        engine.quota().reconcile().await.unwrap();
        assert_eq!(engine.quota().used().await.unwrap(), 80);
        assert!(matches!(
            engine.create(create(Some(90)), &anon()).await,
            Err(UploadError::QuotaExceeded { .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_two_processes_race_on_one_session() {
        use crate::backend::SqliteBackend;

        let dir = tempfile::TempDir::new().unwrap();
        let url = format!("sqlite://{}", dir.path().join("state.db").display());
        let blobs = BlobStore::with_local_storage(dir.path());
        let settings = Settings::new(RuntimeSettings::default());

        let mut engines = Vec::new();
        for _ in 0..2 {
            let backend: Arc<dyn StateBackend> = Arc::new(SqliteBackend::connect(&url).await.unwrap());
            let quota = QuotaController::new(backend.clone(), settings.clone());
            engines.push(UploadEngine::new(
                backend,
                blobs.clone(),
                quota,
                settings.clone(),
                EngineOptions::default(),
            ));
        }

        let session = engines[0].create(create(Some(20)), &anon()).await.unwrap();
        let mut expected = Vec::new();

        for round in 0..5u8 {
            let offset = u64::from(round) * 4;
            let attempts: Vec<_> = engines
                .iter()
                .enumerate()
                .map(|(n, engine)| {
                    let engine = engine.clone();
                    let id = session.id.clone();
                    let chunk = vec![round * 2 + n as u8; 4];
                    tokio::spawn(async move {
                        let outcome = engine.append(&id, offset, &chunk, None).await;
                        (chunk, outcome)
                    })
                })
                .collect();

            let mut winners = 0;
            for attempt in attempts {
                let (chunk, outcome) = attempt.await.unwrap();
                match outcome {
                    Ok(done) => {
                        assert!(!done.replayed);
                        assert_eq!(done.offset, offset + 4);
                        expected.extend_from_slice(&chunk);
                        winners += 1;
                    }
                    Err(UploadError::Conflict { .. }) | Err(UploadError::Locked(_)) => {}
                    Err(other) => panic!("unexpected error: {other}"),
                }
            }
            assert_eq!(winners, 1, "round {round}");
        }

        let done = engines[1].get_session(&session.id).await.unwrap();
        assert_eq!(done.state, SessionState::Completed);
        assert_eq!(blobs.read_at(&session.id, 0, 20).await.unwrap(), expected);
        assert_eq!(engines[1].quota().used().await.unwrap(), 20);
    }
}
