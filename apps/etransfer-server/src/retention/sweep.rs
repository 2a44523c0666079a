//! Retention sweep
//!
//! Scans every session page by page and destroys the ones whose time has
//! come. Each deletion re-checks eligibility under the session lock, so an
//! interrupted or overlapping sweep never corrupts anything; a session that
//! is busy is simply left for the next run.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::backend::{ListFilter, DEFAULT_PAGE_SIZE};
use crate::upload::{Reclaim, SessionState, UploadEngine, UploadError, UploadSession};

use super::RetentionPolicy;

/// What the sweep should do with one session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Keep,
    /// Incomplete upload idle past its deadline
    ExpireUpload,
    /// TTL elapsed since completion
    ExpireFile,
    /// DownloadOnce file already delivered in full
    DeleteDownloaded,
    /// Tombstone older than the tombstone TTL
    PurgeTombstone,
}

impl Disposition {
    /// Classify `session` at `now`
    pub fn of(session: &UploadSession, now: DateTime<Utc>, tombstone_ttl: chrono::Duration) -> Self {
        match session.state {
            SessionState::Created | SessionState::Uploading => match session.expires_at {
                Some(deadline) if deadline <= now => Self::ExpireUpload,
                _ => Self::Keep,
            },
            SessionState::Completed => match session.retention {
                RetentionPolicy::Permanent => Self::Keep,
                RetentionPolicy::DownloadOnce if session.file.download_count > 0 => {
                    Self::DeleteDownloaded
                }
                RetentionPolicy::DownloadOnce => Self::Keep,
                RetentionPolicy::Ttl { .. } => match session.retention_expires_at {
                    Some(deadline) if deadline <= now => Self::ExpireFile,
                    _ => Self::Keep,
                },
            },
            SessionState::Terminated | SessionState::Deleted | SessionState::Expired => {
                if session.updated_at + tombstone_ttl <= now {
                    Self::PurgeTombstone
                } else {
                    Self::Keep
                }
            }
        }
    }

    fn tombstone_state(&self) -> SessionState {
        match self {
            Self::DeleteDownloaded => SessionState::Deleted,
            _ => SessionState::Expired,
        }
    }
}

/// Summary of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub scanned: u64,
    pub expired_uploads: u64,
    pub expired_files: u64,
    pub purged_tombstones: u64,
    /// Eligible but busy; retried next run
    pub skipped: u64,
    pub errors: u64,
    pub corrupt: u64,
}

impl SweepReport {
    pub fn removed(&self) -> u64 {
        self.expired_uploads + self.expired_files + self.purged_tombstones
    }
}

#[derive(Clone)]
pub struct RetentionSweeper {
    engine: UploadEngine,
    tombstone_ttl: chrono::Duration,
    page_size: usize,
}

impl RetentionSweeper {
    pub fn new(engine: UploadEngine, tombstone_ttl: chrono::Duration) -> Self {
        Self {
            engine,
            tombstone_ttl,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub async fn run_once(&self) -> SweepReport {
        self.run_once_at(Utc::now()).await
    }

    /// Sweep as if the time were `now`
    pub async fn run_once_at(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();
        let mut filter = ListFilter::default().with_limit(self.page_size);

        loop {
            let page = match self.engine.backend().list(&filter).await {
                Ok(page) => page,
                Err(e) => {
                    tracing::warn!(error = %e, cursor = ?filter.after, "Sweep scan failed");
                    report.errors += 1;
                    break;
                }
            };

            report.corrupt += page.corrupt.len() as u64;

            for session in &page.sessions {
                report.scanned += 1;
                self.apply(session, now, &mut report).await;
            }

            match page.next_cursor {
                Some(cursor) => filter.after = Some(cursor),
                None => break,
            }
        }

        if report.removed() > 0 || report.errors > 0 || report.corrupt > 0 {
            tracing::info!(
                scanned = report.scanned,
                expired_uploads = report.expired_uploads,
                expired_files = report.expired_files,
                purged_tombstones = report.purged_tombstones,
                skipped = report.skipped,
                errors = report.errors,
                corrupt = report.corrupt,
                "Retention sweep finished"
            );
        } else {
            tracing::debug!(scanned = report.scanned, skipped = report.skipped, "Retention sweep finished");
        }

        report
    }

    async fn apply(&self, session: &UploadSession, now: DateTime<Utc>, report: &mut SweepReport) {
        let disposition = Disposition::of(session, now, self.tombstone_ttl);
        let id = session.id.as_str();

        let outcome: Result<bool, UploadError> = match disposition {
            Disposition::Keep => return,
            Disposition::PurgeTombstone => self.engine.purge_tombstone(id).await,
            Disposition::ExpireUpload | Disposition::ExpireFile | Disposition::DeleteDownloaded => {
                let ttl = self.tombstone_ttl;
                self.engine
                    .reclaim(id, disposition.tombstone_state(), move |current| {
                        Disposition::of(current, now, ttl) == disposition
                    })
                    .await
                    .map(|reclaim| match reclaim {
                        Reclaim::Destroyed => true,
                        Reclaim::Busy => {
                            report.skipped += 1;
                            false
                        }
                        Reclaim::Skipped => false,
                    })
            }
        };

        match outcome {
            Ok(true) => match disposition {
                Disposition::ExpireUpload => report.expired_uploads += 1,
                Disposition::PurgeTombstone => report.purged_tombstones += 1,
                _ => report.expired_files += 1,
            },
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(session_id = %id, error = %e, "Sweep failed on session");
                report.errors += 1;
            }
        }
    }

    /// Run the sweep every `interval`
    pub fn start(self, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                self.run_once().await;
            }
        })
    }
}
