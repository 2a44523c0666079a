//! Storage quota admission control
//!
//! The ledger itself lives in the state backend so that the check-and-add
//! is one atomic step even when several processes share the backend. The
//! ceiling comes from the hot-reloadable settings and is read on every
//! admission.
//!
//! Admitted bytes start as a reservation and become committed usage only
//! once the session record that accounts for them is durable. Reconciliation
//! rewrites committed usage from the records and leaves reservations alone,
//! so bytes still being written are never lost from the ledger.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::backend::{for_each_page, Admission, BackendError, ListFilter, StateBackend};
use crate::config::Settings;
use crate::upload::{SessionState, UploadError};

/// Lifetime of an uncommitted reservation; a request that dies mid-write
/// stops holding space after this long
pub const DEFAULT_RESERVATION_TTL: Duration = Duration::from_secs(15 * 60);

/// Attempts to apply one reconciliation while the ledger keeps moving
const RECONCILE_ATTEMPTS: u32 = 3;

/// Aggregate storage status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageStatus {
    pub used: u64,
    pub max: Option<u64>,
    pub available: Option<u64>,
    pub usage_percent: f64,
    pub is_full: bool,
    pub files_count: u64,
    pub uploads_count: u64,
}

/// Result of a reconciliation pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Reconciliation {
    /// Committed usage before the pass
    pub previous: u64,
    /// Usage derived from the session records
    pub actual: u64,
    /// Reserved bytes left in place
    pub pending: u64,
    pub files_count: u64,
    pub uploads_count: u64,
    pub corrupt: u64,
    /// Lapsed reservations dropped
    pub expired_reservations: u64,
    /// Whether `actual` was written; false when the ledger kept moving
    pub applied: bool,
}

/// Bytes admitted against the ceiling but not yet committed
///
/// Hand it back through [`QuotaController::commit`] once the record that
/// accounts for the bytes is durable, or [`QuotaController::cancel`] when
/// the operation fails.
#[derive(Debug)]
#[must_use]
pub struct Reservation {
    token: Option<String>,
    bytes: u64,
}

impl Reservation {
    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

#[derive(Clone)]
pub struct QuotaController {
    inner: Arc<QuotaInner>,
}

struct QuotaInner {
    backend: Arc<dyn StateBackend>,
    settings: Settings,
    reservation_ttl: Duration,
}

impl QuotaController {
    pub fn new(backend: Arc<dyn StateBackend>, settings: Settings) -> Self {
        Self::with_reservation_ttl(backend, settings, DEFAULT_RESERVATION_TTL)
    }

    pub fn with_reservation_ttl(
        backend: Arc<dyn StateBackend>,
        settings: Settings,
        reservation_ttl: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(QuotaInner {
                backend,
                settings,
                reservation_ttl,
            }),
        }
    }

    pub fn ceiling(&self) -> Option<u64> {
        self.inner.settings.max_storage_size()
    }

    /// Reserve `bytes` or fail with `QuotaExceeded`; nothing is held on failure
    pub async fn admit(&self, bytes: u64) -> Result<Reservation, UploadError> {
        if bytes == 0 {
            return Ok(Reservation { token: None, bytes });
        }

        let token = Uuid::new_v4().simple().to_string();
        let ceiling = self.ceiling();
        let admission = self
            .inner
            .backend
            .try_reserve(&token, bytes, ceiling, self.inner.reservation_ttl)
            .await?;

        match admission {
            Admission::Admitted { used } => {
                tracing::trace!(bytes = bytes, used = used, "Quota admitted");
                Ok(Reservation {
                    token: Some(token),
                    bytes,
                })
            }
            Admission::Rejected { used } => {
                tracing::info!(
                    bytes = bytes,
                    used = used,
                    max = ?ceiling,
                    "Quota exceeded"
                );
                Err(UploadError::QuotaExceeded {
                    used,
                    max: ceiling.unwrap_or(u64::MAX),
                    requested: bytes,
                })
            }
        }
    }

    /// Count a reservation as committed usage. Failures are logged; the
    /// next reconciliation restores the bytes from the records.
    pub async fn commit(&self, reservation: Reservation) {
        let Some(token) = reservation.token else { return };

        if let Err(e) = self
            .inner
            .backend
            .commit_reservation(&token, reservation.bytes)
            .await
        {
            tracing::warn!(bytes = reservation.bytes, error = %e, "Quota commit failed");
        }
    }

    /// Give a reservation back. A failure only delays the release until
    /// the reservation lapses.
    pub async fn cancel(&self, reservation: Reservation) {
        let Some(token) = reservation.token else { return };

        if let Err(e) = self.inner.backend.cancel_reservation(&token).await {
            tracing::warn!(bytes = reservation.bytes, error = %e, "Quota cancel failed");
        }
    }

    /// Return previously committed bytes
    pub async fn release(&self, bytes: u64) -> Result<u64, BackendError> {
        if bytes == 0 {
            return self.inner.backend.usage().await;
        }
        self.inner.backend.release(bytes).await
    }

    /// Release without failing the caller; drift is healed by reconciliation
    pub async fn release_logged(&self, bytes: u64) {
        if let Err(e) = self.release(bytes).await {
            tracing::warn!(bytes = bytes, error = %e, "Quota release failed");
        }
    }

    /// Committed plus reserved bytes
    pub async fn used(&self) -> Result<u64, BackendError> {
        self.inner.backend.usage().await
    }

    /// Re-derive committed usage from the session records
    ///
    /// The new value is written only if no commit or release moved the
    /// ledger during the scan; otherwise the scan is repeated.
    pub async fn reconcile(&self) -> Result<Reconciliation, BackendError> {
        let expired = self.inner.backend.prune_reservations().await?;
        let mut result = Reconciliation::default();

        for attempt in 1..=RECONCILE_ATTEMPTS {
            let snapshot = self.inner.backend.ledger().await?;
            result = self.scan().await?;
            result.previous = snapshot.used;
            result.pending = snapshot.pending;
            result.expired_reservations = expired;

            if result.previous == result.actual {
                result.applied = true;
                tracing::debug!(used = result.actual, pending = result.pending, "Quota ledger consistent");
                return Ok(result);
            }

            if self
                .inner
                .backend
                .replace_usage(snapshot.revision, result.actual)
                .await?
            {
                result.applied = true;
                tracing::info!(
                    previous = result.previous,
                    actual = result.actual,
                    pending = result.pending,
                    "Quota ledger reconciled"
                );
                return Ok(result);
            }

            tracing::debug!(attempt = attempt, "Quota ledger moved during reconciliation");
        }

        tracing::warn!(
            attempts = RECONCILE_ATTEMPTS,
            "Quota ledger kept moving, reconciliation skipped"
        );
        Ok(result)
    }

    async fn scan(&self) -> Result<Reconciliation, BackendError> {
        let mut result = Reconciliation::default();

        for_each_page(self.inner.backend.as_ref(), ListFilter::default(), |page| {
            result.corrupt += page.corrupt.len() as u64;
            for session in &page.sessions {
                result.actual += session.charged_bytes();
                match session.state {
                    SessionState::Completed => result.files_count += 1,
                    SessionState::Created | SessionState::Uploading => result.uploads_count += 1,
                    _ => {}
                }
            }
        })
        .await?;

        Ok(result)
    }

    /// Current status including per-state counts
    pub async fn status(&self) -> Result<StorageStatus, BackendError> {
        let counts = self.count_sessions().await?;
        let used = self.used().await?;
        let max = self.ceiling();

        let usage_percent = match max {
            Some(0) | None => 0.0,
            Some(max) => (used as f64 / max as f64 * 100.0).min(100.0),
        };

        Ok(StorageStatus {
            used,
            max,
            available: max.map(|m| m.saturating_sub(used)),
            usage_percent,
            is_full: max.is_some_and(|m| used >= m),
            files_count: counts.0,
            uploads_count: counts.1,
        })
    }

    async fn count_sessions(&self) -> Result<(u64, u64), BackendError> {
        let mut files = 0;
        let mut uploads = 0;

        for_each_page(
            self.inner.backend.as_ref(),
            ListFilter::with_states(&[
                SessionState::Created,
                SessionState::Uploading,
                SessionState::Completed,
            ]),
            |page| {
                for session in &page.sessions {
                    if session.state == SessionState::Completed {
                        files += 1;
                    } else {
                        uploads += 1;
                    }
                }
            },
        )
        .await?;

        Ok((files, uploads))
    }

    /// Reconcile now and then every `interval`
    pub fn start_reconcile_task(self, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);

            loop {
                ticker.tick().await;
                if let Err(e) = self.reconcile().await {
                    tracing::warn!(error = %e, "Quota reconciliation failed");
                }
            }
        })
    }
}
