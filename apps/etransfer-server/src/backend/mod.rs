//! Durable session state
//!
//! A `StateBackend` stores upload-session records and supplies the atomic
//! primitives the upload engine builds on:
//! - compare-and-swap of a record on its committed offset
//! - a per-id advisory lock with holder token and lease TTL
//! - the aggregate quota ledger: committed bytes plus in-flight
//!   reservations, with an atomic check-and-reserve against the ceiling
//!
//! Variants are chosen by configuration. `memory` and `file` serialize
//! through process memory and must not be shared between processes;
//! `sqlite` keeps every primitive in the database so several server
//! processes can share one file.

mod file;
mod local;
mod memory;
mod sqlite;

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::upload::{SessionState, UploadSession};

pub use file::FileBackend;
pub use local::{LocalLedger, LockTable};
pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;

/// Default page size for scans
pub const DEFAULT_PAGE_SIZE: usize = 256;

// ============================================================================
// Errors
// ============================================================================

/// Backend error types
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt record {id}: {reason}")]
    Corrupt { id: String, reason: String },

    #[error("Invalid backend configuration: {0}")]
    Config(String),
}

// ============================================================================
// Scan Types
// ============================================================================

/// Filter for paginated scans
#[derive(Debug, Clone)]
pub struct ListFilter {
    /// Return records with ids strictly greater than this cursor
    pub after: Option<String>,

    /// Maximum number of records scanned for this page
    pub limit: usize,

    /// Only return records in one of these states
    pub states: Option<Vec<SessionState>>,
}

impl Default for ListFilter {
    fn default() -> Self {
        Self {
            after: None,
            limit: DEFAULT_PAGE_SIZE,
            states: None,
        }
    }
}

impl ListFilter {
    pub fn with_states(states: &[SessionState]) -> Self {
        Self {
            states: Some(states.to_vec()),
            ..Self::default()
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit.max(1);
        self
    }

    pub fn after(mut self, cursor: Option<String>) -> Self {
        self.after = cursor;
        self
    }

    pub(crate) fn matches(&self, session: &UploadSession) -> bool {
        self.states
            .as_ref()
            .map_or(true, |states| states.contains(&session.state))
    }
}

/// One page of a scan
#[derive(Debug, Clone, Default)]
pub struct SessionPage {
    pub sessions: Vec<UploadSession>,

    /// Ids of records that could not be decoded
    pub corrupt: Vec<String>,

    /// Cursor for the next page; `None` when the scan is complete
    pub next_cursor: Option<String>,
}

/// Outcome of a quota admission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Bytes were reserved; `used` is the new total including reservations
    Admitted { used: u64 },
    /// Nothing was reserved; `used` is the unchanged total
    Rejected { used: u64 },
}

/// Point-in-time view of the quota ledger
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerSnapshot {
    /// Bytes backed by committed session records
    pub used: u64,
    /// Bytes reserved by live, not yet committed admissions
    pub pending: u64,
    /// Bumped on every change to `used`
    pub revision: u64,
}

impl LedgerSnapshot {
    /// Everything counted against the ceiling
    pub fn total(&self) -> u64 {
        self.used.saturating_add(self.pending)
    }
}

// ============================================================================
// Backend Trait
// ============================================================================

/// Capability set of a session-state backend
#[async_trait::async_trait]
pub trait StateBackend: Send + Sync {
    /// Backend name for logs and `/api/info`
    fn name(&self) -> &'static str;

    /// Whether the backend can be shared by several server processes
    fn is_shared(&self) -> bool {
        false
    }

    /// Fetch a record
    async fn get(&self, id: &str) -> Result<Option<UploadSession>, BackendError>;

    /// Atomically insert or replace a record
    async fn put(&self, session: &UploadSession) -> Result<(), BackendError>;

    /// Remove a record; returns whether it existed
    async fn delete(&self, id: &str) -> Result<bool, BackendError>;

    /// Scan records in id order
    async fn list(&self, filter: &ListFilter) -> Result<SessionPage, BackendError>;

    /// Replace the record iff its stored offset equals `expected_offset`
    async fn compare_and_swap(
        &self,
        id: &str,
        expected_offset: u64,
        record: &UploadSession,
    ) -> Result<bool, BackendError>;

    /// Take the advisory lock for `id`; re-entrant for the same holder
    async fn try_lock(&self, id: &str, holder: &str, ttl: Duration) -> Result<bool, BackendError>;

    /// Release the lock if `holder` still owns it
    async fn unlock(&self, id: &str, holder: &str) -> Result<(), BackendError>;

    /// Reserve `bytes` under `token` unless committed plus live reserved
    /// bytes would then exceed `ceiling`. The reservation lapses after `ttl`.
    async fn try_reserve(
        &self,
        token: &str,
        bytes: u64,
        ceiling: Option<u64>,
        ttl: Duration,
    ) -> Result<Admission, BackendError>;

    /// Turn the reservation `token` into `bytes` of committed usage; the
    /// bytes are committed even if the reservation already lapsed.
    /// Returns the new total.
    async fn commit_reservation(&self, token: &str, bytes: u64) -> Result<u64, BackendError>;

    /// Drop the reservation `token` without committing it
    async fn cancel_reservation(&self, token: &str) -> Result<(), BackendError>;

    /// Forget lapsed reservations; returns how many were dropped
    async fn prune_reservations(&self) -> Result<u64, BackendError>;

    /// Subtract `bytes` from committed usage (saturating); returns the new total
    async fn release(&self, bytes: u64) -> Result<u64, BackendError>;

    /// Committed usage, live reservations and revision
    async fn ledger(&self) -> Result<LedgerSnapshot, BackendError>;

    /// Committed plus reserved bytes
    async fn usage(&self) -> Result<u64, BackendError> {
        Ok(self.ledger().await?.total())
    }

    /// Overwrite committed usage unconditionally
    async fn set_usage(&self, bytes: u64) -> Result<(), BackendError>;

    /// Overwrite committed usage iff the ledger is still at `revision`
    async fn replace_usage(&self, revision: u64, bytes: u64) -> Result<bool, BackendError>;
}

// ============================================================================
// Construction
// ============================================================================

/// Configured backend variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Memory,
    File,
    Sqlite,
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "file" => Ok(Self::File),
            "sqlite" => Ok(Self::Sqlite),
            other => Err(format!("unknown state backend: {}", other)),
        }
    }
}

/// Open the configured backend
pub async fn open_backend(
    kind: BackendKind,
    storage_path: &std::path::Path,
    database_url: &str,
) -> Result<Arc<dyn StateBackend>, BackendError> {
    let backend: Arc<dyn StateBackend> = match kind {
        BackendKind::Memory => Arc::new(MemoryBackend::new()),
        BackendKind::File => Arc::new(FileBackend::open(storage_path.join("sessions")).await?),
        BackendKind::Sqlite => Arc::new(SqliteBackend::connect(database_url).await?),
    };

    tracing::info!(backend = backend.name(), shared = backend.is_shared(), "State backend ready");
    Ok(backend)
}

/// Walk every page of a scan, feeding each page to `visit`
pub async fn for_each_page<F>(
    backend: &dyn StateBackend,
    mut filter: ListFilter,
    mut visit: F,
) -> Result<(), BackendError>
where
    F: FnMut(SessionPage),
{
    loop {
        let page = backend.list(&filter).await?;
        let next = page.next_cursor.clone();
        visit(page);

        match next {
            Some(cursor) => filter.after = Some(cursor),
            None => return Ok(()),
        }
    }
}

/// Paginate a sorted id listing, shared by the in-process variants
pub(crate) fn page_bounds<'a, I>(ids: I, filter: &ListFilter) -> (Vec<&'a String>, Option<String>)
where
    I: Iterator<Item = &'a String>,
{
    let mut window: Vec<&String> = ids
        .filter(|id| filter.after.as_ref().map_or(true, |after| *id > after))
        .take(filter.limit + 1)
        .collect();

    let next_cursor = if window.len() > filter.limit {
        window.truncate(filter.limit);
        window.last().map(|id| (*id).clone())
    } else {
        None
    };

    (window, next_cursor)
}

// ============================================================================
// Shared backend behaviour tests
// ============================================================================
