//! Shared backend on SQLite
//!
//! Every primitive is a single conditional statement, so independent server
//! processes pointed at the same database file serialize through SQLite
//! itself rather than through process memory.

use std::str::FromStr;
use std::time::Duration;

use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use sqlx::Row;

use super::{Admission, BackendError, LedgerSnapshot, ListFilter, SessionPage, StateBackend};
use crate::upload::UploadSession;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS upload_sessions (
    id TEXT PRIMARY KEY,
    uploaded_offset INTEGER NOT NULL,
    state TEXT NOT NULL,
    record TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_upload_sessions_state ON upload_sessions(state);

-- Advisory per-session locks; expires_at in unix milliseconds
CREATE TABLE IF NOT EXISTS session_locks (
    id TEXT PRIMARY KEY,
    holder TEXT NOT NULL,
    expires_at INTEGER NOT NULL
);

-- Single-row quota ledger of committed bytes
CREATE TABLE IF NOT EXISTS quota_ledger (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    used_bytes INTEGER NOT NULL,
    revision INTEGER NOT NULL DEFAULT 0
);

INSERT OR IGNORE INTO quota_ledger (id, used_bytes, revision) VALUES (1, 0, 0);

-- Admitted bytes not yet committed; expires_at in unix milliseconds
CREATE TABLE IF NOT EXISTS quota_reservations (
    token TEXT PRIMARY KEY,
    bytes INTEGER NOT NULL,
    expires_at INTEGER NOT NULL
);
"#;

pub struct SqliteBackend {
    pool: SqlitePool,
}

impl SqliteBackend {
    /// Connect and initialize the schema
    pub async fn connect(database_url: &str) -> Result<Self, BackendError> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Self::with_pool(pool).await
    }

    pub async fn with_pool(pool: SqlitePool) -> Result<Self, BackendError> {
        sqlx::query(SCHEMA_SQL).execute(&pool).await?;
        Ok(Self { pool })
    }

    fn decode(id: &str, record: &str) -> Result<UploadSession, BackendError> {
        serde_json::from_str(record).map_err(|e| BackendError::Corrupt {
            id: id.to_string(),
            reason: e.to_string(),
        })
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn to_u64(value: i64) -> u64 {
    value.max(0) as u64
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX / 2)
}

#[async_trait::async_trait]
impl StateBackend for SqliteBackend {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn is_shared(&self) -> bool {
        true
    }

    async fn get(&self, id: &str) -> Result<Option<UploadSession>, BackendError> {
        let row = sqlx::query("SELECT record FROM upload_sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| Self::decode(id, row.get::<&str, _>("record")))
            .transpose()
    }

    async fn put(&self, session: &UploadSession) -> Result<(), BackendError> {
        let record = serde_json::to_string(session)?;

        sqlx::query(
            r#"
            INSERT INTO upload_sessions (id, uploaded_offset, state, record, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                uploaded_offset = excluded.uploaded_offset,
                state = excluded.state,
                record = excluded.record,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&session.id)
        .bind(to_i64(session.uploaded_offset))
        .bind(session.state.as_str())
        .bind(&record)
        .bind(session.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool, BackendError> {
        let result = sqlx::query("DELETE FROM upload_sessions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list(&self, filter: &ListFilter) -> Result<SessionPage, BackendError> {
        let rows = sqlx::query(
            r#"
            SELECT id, record FROM upload_sessions
            WHERE id > ?
            ORDER BY id ASC
            LIMIT ?
            "#,
        )
        .bind(filter.after.as_deref().unwrap_or(""))
        .bind(to_i64(filter.limit as u64 + 1))
        .fetch_all(&self.pool)
        .await?;

        let has_more = rows.len() > filter.limit;
        let mut page = SessionPage::default();
        let mut last_id = None;

        for row in rows.iter().take(filter.limit) {
            let id: String = row.get("id");
            let record: &str = row.get("record");

            match Self::decode(&id, record) {
                Ok(session) if filter.matches(&session) => page.sessions.push(session),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(session_id = %id, error = %e, "Skipping corrupt record");
                    page.corrupt.push(id.clone());
                }
            }
            last_id = Some(id);
        }

        if has_more {
            page.next_cursor = last_id;
        }
        Ok(page)
    }

    async fn compare_and_swap(
        &self,
        id: &str,
        expected_offset: u64,
        record: &UploadSession,
    ) -> Result<bool, BackendError> {
        let json = serde_json::to_string(record)?;

        let result = sqlx::query(
            r#"
            UPDATE upload_sessions
            SET uploaded_offset = ?, state = ?, record = ?, updated_at = ?
            WHERE id = ? AND uploaded_offset = ?
            "#,
        )
        .bind(to_i64(record.uploaded_offset))
        .bind(record.state.as_str())
        .bind(&json)
        .bind(record.updated_at.to_rfc3339())
        .bind(id)
        .bind(to_i64(expected_offset))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn try_lock(&self, id: &str, holder: &str, ttl: Duration) -> Result<bool, BackendError> {
        let now = Utc::now().timestamp_millis();
        let expires = now.saturating_add(millis(ttl));

        // Upsert only wins over an expired lease or our own
        let result = sqlx::query(
            r#"
            INSERT INTO session_locks (id, holder, expires_at)
            VALUES (?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                holder = excluded.holder,
                expires_at = excluded.expires_at
            WHERE session_locks.expires_at <= ? OR session_locks.holder = excluded.holder
            "#,
        )
        .bind(id)
        .bind(holder)
        .bind(expires)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn unlock(&self, id: &str, holder: &str) -> Result<(), BackendError> {
        sqlx::query("DELETE FROM session_locks WHERE id = ? AND holder = ?")
            .bind(id)
            .bind(holder)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn try_reserve(
        &self,
        token: &str,
        bytes: u64,
        ceiling: Option<u64>,
        ttl: Duration,
    ) -> Result<Admission, BackendError> {
        let now = Utc::now().timestamp_millis();
        let bytes = to_i64(bytes);

        // One statement: SQLite takes the write lock before evaluating the
        // ceiling check, so concurrent admissions cannot both pass it
        let result = sqlx::query(
            r#"
            INSERT INTO quota_reservations (token, bytes, expires_at)
            SELECT ?, ?, ?
            WHERE ? IS NULL OR (
                (SELECT used_bytes FROM quota_ledger WHERE id = 1)
                + COALESCE((SELECT SUM(bytes) FROM quota_reservations WHERE expires_at > ?), 0)
                + ? <= ?
            )
            "#,
        )
        .bind(token)
        .bind(bytes)
        .bind(now.saturating_add(millis(ttl)))
        .bind(ceiling.map(to_i64))
        .bind(now)
        .bind(bytes)
        .bind(ceiling.map(to_i64))
        .execute(&self.pool)
        .await?;

        let used = self.usage().await?;
        if result.rows_affected() == 1 {
            Ok(Admission::Admitted { used })
        } else {
            Ok(Admission::Rejected { used })
        }
    }

    async fn commit_reservation(&self, token: &str, bytes: u64) -> Result<u64, BackendError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM quota_reservations WHERE token = ?")
            .bind(token)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "UPDATE quota_ledger SET used_bytes = used_bytes + ?, revision = revision + 1 WHERE id = 1",
        )
        .bind(to_i64(bytes))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        self.usage().await
    }

    async fn cancel_reservation(&self, token: &str) -> Result<(), BackendError> {
        sqlx::query("DELETE FROM quota_reservations WHERE token = ?")
            .bind(token)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn prune_reservations(&self) -> Result<u64, BackendError> {
        let result = sqlx::query("DELETE FROM quota_reservations WHERE expires_at <= ?")
            .bind(Utc::now().timestamp_millis())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn release(&self, bytes: u64) -> Result<u64, BackendError> {
        sqlx::query(
            "UPDATE quota_ledger SET used_bytes = MAX(used_bytes - ?, 0), revision = revision + 1 WHERE id = 1",
        )
        .bind(to_i64(bytes))
        .execute(&self.pool)
        .await?;

        self.usage().await
    }

    async fn ledger(&self) -> Result<LedgerSnapshot, BackendError> {
        let row = sqlx::query(
            r#"
            SELECT used_bytes, revision,
                (SELECT COALESCE(SUM(bytes), 0) FROM quota_reservations WHERE expires_at > ?) AS pending
            FROM quota_ledger WHERE id = 1
            "#,
        )
        .bind(Utc::now().timestamp_millis())
        .fetch_one(&self.pool)
        .await?;

        Ok(LedgerSnapshot {
            used: to_u64(row.get("used_bytes")),
            pending: to_u64(row.get("pending")),
            revision: to_u64(row.get("revision")),
        })
    }

    async fn set_usage(&self, bytes: u64) -> Result<(), BackendError> {
        sqlx::query("UPDATE quota_ledger SET used_bytes = ?, revision = revision + 1 WHERE id = 1")
            .bind(to_i64(bytes))
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn replace_usage(&self, revision: u64, bytes: u64) -> Result<bool, BackendError> {
        let result = sqlx::query(
            "UPDATE quota_ledger SET used_bytes = ?, revision = revision + 1 WHERE id = 1 AND revision = ?",
        )
        .bind(to_i64(bytes))
        .bind(to_i64(revision))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::super::conformance;
    use super::*;
    use tempfile::TempDir;

    async fn backend(dir: &TempDir) -> SqliteBackend {
        let url = format!("sqlite://{}", dir.path().join("state.db").display());
        SqliteBackend::connect(&url).await.unwrap()
    }

    #[tokio::test]
    async fn test_conformance() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir).await;

        conformance::crud(&backend).await;
        conformance::cas(&backend).await;
        conformance::locking(&backend).await;
        conformance::lease_expiry(&backend).await;
        conformance::ledger(&backend).await;
        conformance::reservations(&backend).await;
    }

    #[tokio::test]
    async fn test_pagination() {
        let dir = TempDir::new().unwrap();
        conformance::pagination(&backend(&dir).await).await;
    }

    #[tokio::test]
    async fn test_two_processes_share_locks_and_quota() {
        let dir = TempDir::new().unwrap();
        let a = backend(&dir).await;
        let b = backend(&dir).await;

        assert!(a.try_lock("shared", "proc-a", Duration::from_secs(30)).await.unwrap());
        assert!(!b.try_lock("shared", "proc-b", Duration::from_secs(30)).await.unwrap());

        let ttl = Duration::from_secs(60);
        a.set_usage(0).await.unwrap();
        assert!(matches!(
            a.try_reserve("from-a", 60, Some(100), ttl).await.unwrap(),
            Admission::Admitted { used: 60 }
        ));
        assert_eq!(
            b.try_reserve("from-b", 60, Some(100), ttl).await.unwrap(),
            Admission::Rejected { used: 60 }
        );

        // Reservations made through one handle hold off the other's
        // reconciliation
        let snapshot = b.ledger().await.unwrap();
        assert_eq!(snapshot.pending, 60);
        a.commit_reservation("from-a", 60).await.unwrap();
        assert!(!b.replace_usage(snapshot.revision, 0).await.unwrap());
        assert_eq!(b.usage().await.unwrap(), 60);
    }

    #[tokio::test]
    async fn test_corrupt_row_is_reported() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir).await;

        sqlx::query(
            "INSERT INTO upload_sessions (id, uploaded_offset, state, record, updated_at) VALUES ('bad', 0, 'created', 'nope', '')",
        )
        .execute(&backend.pool)
        .await
        .unwrap();

        let page = backend.list(&ListFilter::default()).await.unwrap();
        assert_eq!(page.corrupt, vec!["bad".to_string()]);
        assert!(page.sessions.is_empty());
    }
}
