//! Per-site scrape sessions.

use crate::error::DatabaseError;
use crate::types::{SessionCounters, SessionId};
use crate::{Error, Result};

use super::{Database, ScrapeSession, ScrapeSessionRow};

const SESSION_COLUMNS: &str = "id, site_name, started_at, ended_at, links_found, \
     links_filtered_in, downloads_succeeded, downloads_failed, bytes_downloaded, \
     success, error_message";

impl Database {
    /// Open a session for one site within the current run
    pub async fn open_session(&self, site_name: &str) -> Result<SessionId> {
        let now = chrono::Utc::now().timestamp();
        let result = sqlx::query("INSERT INTO scrape_sessions (site_name, started_at) VALUES (?, ?)")
            .bind(site_name)
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to open session: {}",
                    e
                )))
            })?;

        Ok(SessionId(result.last_insert_rowid()))
    }

    /// Add counter deltas to an open session
    pub async fn update_session_counters(
        &self,
        id: SessionId,
        deltas: &SessionCounters,
    ) -> Result<()> {
        if deltas.is_zero() {
            return Ok(());
        }

        let result = sqlx::query(
            r#"
            UPDATE scrape_sessions SET
                links_found = links_found + ?,
                links_filtered_in = links_filtered_in + ?,
                downloads_succeeded = downloads_succeeded + ?,
                downloads_failed = downloads_failed + ?,
                bytes_downloaded = bytes_downloaded + ?
            WHERE id = ?
            "#,
        )
        .bind(deltas.links_found as i64)
        .bind(deltas.links_filtered_in as i64)
        .bind(deltas.downloads_succeeded as i64)
        .bind(deltas.downloads_failed as i64)
        .bind(deltas.bytes_downloaded as i64)
        .bind(id.get())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to update session counters: {}",
                e
            )))
        })?;

        if result.rows_affected() == 0 {
            return Err(Error::Database(DatabaseError::NotFound(format!(
                "session {}",
                id
            ))));
        }
        Ok(())
    }

    /// Close a session
    ///
    /// Safe to call more than once; the first `ended_at` is kept.
    pub async fn close_session(
        &self,
        id: SessionId,
        success: bool,
        error_message: Option<&str>,
    ) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let result = sqlx::query(
            r#"
            UPDATE scrape_sessions SET
                ended_at = COALESCE(ended_at, ?),
                success = ?,
                error_message = ?
            WHERE id = ?
            "#,
        )
        .bind(now)
        .bind(i64::from(success))
        .bind(error_message)
        .bind(id.get())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to close session: {}",
                e
            )))
        })?;

        if result.rows_affected() == 0 {
            return Err(Error::Database(DatabaseError::NotFound(format!(
                "session {}",
                id
            ))));
        }
        Ok(())
    }

    /// Get a session by ID
    pub async fn get_session(&self, id: SessionId) -> Result<Option<ScrapeSession>> {
        let row = sqlx::query_as::<_, ScrapeSessionRow>(&format!(
            "SELECT {SESSION_COLUMNS} FROM scrape_sessions WHERE id = ?"
        ))
        .bind(id.get())
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Sqlx)?;

        Ok(row.map(ScrapeSession::from))
    }

    /// Most recent sessions, optionally for one site
    pub async fn recent_sessions(
        &self,
        site_name: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ScrapeSession>> {
        let sql = match site_name {
            Some(_) => format!(
                "SELECT {SESSION_COLUMNS} FROM scrape_sessions WHERE site_name = ? \
                 ORDER BY started_at DESC, id DESC LIMIT ?"
            ),
            None => format!(
                "SELECT {SESSION_COLUMNS} FROM scrape_sessions \
                 ORDER BY started_at DESC, id DESC LIMIT ?"
            ),
        };

        let mut query = sqlx::query_as::<_, ScrapeSessionRow>(&sql);
        if let Some(site) = site_name {
            query = query.bind(site);
        }
        let rows = query
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Sqlx)?;

        Ok(rows.into_iter().map(ScrapeSession::from).collect())
    }

    /// Sessions that were never closed (left behind by a crash)
    pub async fn open_sessions(&self) -> Result<Vec<ScrapeSession>> {
        let rows = sqlx::query_as::<_, ScrapeSessionRow>(&format!(
            "SELECT {SESSION_COLUMNS} FROM scrape_sessions WHERE ended_at IS NULL ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Sqlx)?;

        Ok(rows.into_iter().map(ScrapeSession::from).collect())
    }
}
