//! Durable single-process backend: one JSON document per session
//!
//! Writes go to `<id>.json.tmp`, are fsynced, then renamed over
//! `<id>.json`, so a crash leaves either the old or the new record.
//! Read-compare-write sequences are serialized per id; writes to different
//! sessions never wait on each other.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::sync::OwnedMutexGuard;

use super::{
    page_bounds, Admission, BackendError, LedgerSnapshot, ListFilter, LocalLedger, LockTable,
    SessionPage, StateBackend,
};
use crate::upload::UploadSession;

const RECORD_EXT: &str = "json";

pub struct FileBackend {
    dir: PathBuf,
    gates: WriteGates,
    locks: LockTable,
    ledger: LocalLedger,
}

/// One async mutex per record id, dropped from the map once nobody holds
/// or waits on it
#[derive(Default)]
struct WriteGates {
    gates: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl WriteGates {
    async fn acquire(&self, id: &str) -> WriteGate<'_> {
        let gate = self.gates.lock().entry(id.to_string()).or_default().clone();
        let guard = gate.lock_owned().await;

        WriteGate {
            gates: self,
            id: id.to_string(),
            guard: Some(guard),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.gates.lock().len()
    }
}

struct WriteGate<'a> {
    gates: &'a WriteGates,
    id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for WriteGate<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());

        let mut gates = self.gates.gates.lock();
        // Waiters hold a clone of the gate; only the map's copy is left
        // when the id has gone quiet
        if gates.get(&self.id).is_some_and(|gate| Arc::strong_count(gate) == 1) {
            gates.remove(&self.id);
        }
    }
}

impl FileBackend {
    /// Open (creating if needed) a record directory
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, BackendError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;

        // Leftovers from writes interrupted before the rename
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "tmp") {
                tracing::debug!(path = %path.display(), "Removing stale temp record");
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to remove stale temp record");
                }
            }
        }

        Ok(Self {
            dir,
            gates: WriteGates::default(),
            locks: LockTable::new(),
            ledger: LocalLedger::default(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", id, RECORD_EXT))
    }

    async fn read_record(&self, id: &str) -> Result<Option<UploadSession>, BackendError> {
        if !is_record_id(id) {
            return Ok(None);
        }

        let bytes = match tokio::fs::read(self.record_path(id)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| BackendError::Corrupt {
                id: id.to_string(),
                reason: e.to_string(),
            })
    }

    async fn write_record(&self, session: &UploadSession) -> Result<(), BackendError> {
        let json = serde_json::to_vec_pretty(session)?;
        let path = self.record_path(&session.id);
        let tmp = path.with_extension(format!("{}.tmp", RECORD_EXT));

        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&json).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn record_ids(&self) -> Result<Vec<String>, BackendError> {
        let mut ids = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == RECORD_EXT) {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    ids.push(stem.to_string());
                }
            }
        }

        ids.sort();
        Ok(ids)
    }
}

/// Ids become file names; anything but a plain token cannot name a record
fn is_record_id(id: &str) -> bool {
    !id.is_empty() && id.len() <= 64 && id.bytes().all(|b| b.is_ascii_alphanumeric())
}

#[async_trait::async_trait]
impl StateBackend for FileBackend {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn get(&self, id: &str) -> Result<Option<UploadSession>, BackendError> {
        self.read_record(id).await
    }

    async fn put(&self, session: &UploadSession) -> Result<(), BackendError> {
        let _gate = self.gates.acquire(&session.id).await;
        self.write_record(session).await
    }

    async fn delete(&self, id: &str) -> Result<bool, BackendError> {
        if !is_record_id(id) {
            return Ok(false);
        }

        let _gate = self.gates.acquire(id).await;
        match tokio::fs::remove_file(self.record_path(id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, filter: &ListFilter) -> Result<SessionPage, BackendError> {
        let ids = self.record_ids().await?;
        let (window, next_cursor) = page_bounds(ids.iter(), filter);

        let mut page = SessionPage {
            next_cursor,
            ..SessionPage::default()
        };

        for id in window {
            match self.read_record(id).await {
                Ok(Some(session)) if filter.matches(&session) => page.sessions.push(session),
                Ok(_) => {}
                Err(BackendError::Corrupt { id, reason }) => {
                    tracing::warn!(session_id = %id, reason = %reason, "Skipping corrupt record");
                    page.corrupt.push(id);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(page)
    }

    async fn compare_and_swap(
        &self,
        id: &str,
        expected_offset: u64,
        record: &UploadSession,
    ) -> Result<bool, BackendError> {
        let _gate = self.gates.acquire(id).await;

        match self.read_record(id).await? {
            Some(current) if current.uploaded_offset == expected_offset => {
                self.write_record(record).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn try_lock(&self, id: &str, holder: &str, ttl: Duration) -> Result<bool, BackendError> {
        Ok(self.locks.try_lock(id, holder, ttl))
    }

    async fn unlock(&self, id: &str, holder: &str) -> Result<(), BackendError> {
        self.locks.unlock(id, holder);
        Ok(())
    }

    async fn try_reserve(
        &self,
        token: &str,
        bytes: u64,
        ceiling: Option<u64>,
        ttl: Duration,
    ) -> Result<Admission, BackendError> {
        Ok(self.ledger.try_reserve(token, bytes, ceiling, ttl))
    }

    async fn commit_reservation(&self, token: &str, bytes: u64) -> Result<u64, BackendError> {
        Ok(self.ledger.commit(token, bytes))
    }

    async fn cancel_reservation(&self, token: &str) -> Result<(), BackendError> {
        self.ledger.cancel(token);
        Ok(())
    }

    async fn prune_reservations(&self) -> Result<u64, BackendError> {
        Ok(self.ledger.prune())
    }

    async fn release(&self, bytes: u64) -> Result<u64, BackendError> {
        Ok(self.ledger.release(bytes))
    }

    async fn ledger(&self) -> Result<LedgerSnapshot, BackendError> {
        Ok(self.ledger.snapshot())
    }

    async fn set_usage(&self, bytes: u64) -> Result<(), BackendError> {
        self.ledger.set_usage(bytes);
        Ok(())
    }

    async fn replace_usage(&self, revision: u64, bytes: u64) -> Result<bool, BackendError> {
        Ok(self.ledger.replace_usage(revision, bytes))
    }
}
