//! Ephemeral single-process backend

use std::collections::BTreeMap;
use std::time::Duration;

use parking_lot::RwLock;

use super::{
    page_bounds, Admission, BackendError, LedgerSnapshot, ListFilter, LocalLedger, LockTable,
    SessionPage, StateBackend,
};
use crate::upload::UploadSession;

/// Records held in a sorted map
#[derive(Default)]
pub struct MemoryBackend {
    sessions: RwLock<BTreeMap<String, UploadSession>>,
    locks: LockTable,
    ledger: LocalLedger,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl StateBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, id: &str) -> Result<Option<UploadSession>, BackendError> {
        Ok(self.sessions.read().get(id).cloned())
    }

    async fn put(&self, session: &UploadSession) -> Result<(), BackendError> {
        self.sessions
            .write()
            .insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool, BackendError> {
        Ok(self.sessions.write().remove(id).is_some())
    }

    async fn list(&self, filter: &ListFilter) -> Result<SessionPage, BackendError> {
        let sessions = self.sessions.read();
        let (ids, next_cursor) = page_bounds(sessions.keys(), filter);

        Ok(SessionPage {
            sessions: ids
                .into_iter()
                .filter_map(|id| sessions.get(id))
                .filter(|s| filter.matches(s))
                .cloned()
                .collect(),
            corrupt: Vec::new(),
            next_cursor,
        })
    }

    async fn compare_and_swap(
        &self,
        id: &str,
        expected_offset: u64,
        record: &UploadSession,
    ) -> Result<bool, BackendError> {
        let mut sessions = self.sessions.write();
        match sessions.get_mut(id) {
            Some(current) if current.uploaded_offset == expected_offset => {
                *current = record.clone();
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
