//! Append-only error log, aggregate stats and retention cleanup.

use crate::error::DatabaseError;
use crate::types::ErrorStage;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::{Database, ErrorLog, ErrorLogRow, NewErrorLog};

/// Error counts since a point in time
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorStats {
    /// Total entries
    pub total: u64,
    /// Entries per stage
    pub by_stage: HashMap<ErrorStage, u64>,
    /// Entries per site
    pub by_site: HashMap<String, u64>,
}

/// Rows removed by [`Database::cleanup_old_records`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupStats {
    /// Error log rows removed
    pub error_logs: u64,
    /// Visited-url rows removed
    pub visited_urls: u64,
}

impl Database {
    /// Append an error log entry
    pub async fn append_error(&self, entry: &NewErrorLog) -> Result<i64> {
        let now = chrono::Utc::now().timestamp();
        let result = sqlx::query(
            r#"
            INSERT INTO error_logs (site_name, url, stage, error_kind, message, occurred_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.site_name)
        .bind(&entry.url)
        .bind(entry.stage.as_str())
        .bind(&entry.error_kind)
        .bind(&entry.message)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to append error log: {}",
                e
            )))
        })?;

        Ok(result.last_insert_rowid())
    }

    /// Most recent error log entries for a site
    pub async fn recent_errors(&self, site_name: &str, limit: usize) -> Result<Vec<ErrorLog>> {
        let rows = sqlx::query_as::<_, ErrorLogRow>(
            r#"
            SELECT id, site_name, url, stage, error_kind, message, occurred_at
            FROM error_logs
            WHERE site_name = ?
            ORDER BY occurred_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(site_name)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Sqlx)?;

        Ok(rows.into_iter().map(ErrorLog::from).collect())
    }

    /// Aggregate error counts for entries at or after `since` (Unix seconds)
    pub async fn error_stats(&self, since: i64) -> Result<ErrorStats> {
        let rows: Vec<(String, String, i64)> = sqlx::query_as(
            r#"
            SELECT site_name, stage, COUNT(*)
            FROM error_logs
            WHERE occurred_at >= ?
            GROUP BY site_name, stage
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to compute error stats: {}",
                e
            )))
        })?;

        let mut stats = ErrorStats::default();
        for (site, stage, count) in rows {
            let count = count.max(0) as u64;
            stats.total += count;
            *stats.by_site.entry(site).or_default() += count;
            if let Some(stage) = ErrorStage::parse(&stage) {
                *stats.by_stage.entry(stage).or_default() += count;
            }
        }
        Ok(stats)
    }

    /// Delete error logs and visited-url decisions older than `before` (Unix seconds)
    ///
    /// Download records are never removed: they carry the idempotency guarantee.
    pub async fn cleanup_old_records(&self, before: i64) -> Result<CleanupStats> {
        let mut tx = self.pool.begin().await.map_err(|e| {
            Error::LedgerUnavailable(format!("Failed to begin transaction: {}", e))
        })?;

        let error_logs = sqlx::query("DELETE FROM error_logs WHERE occurred_at < ?")
            .bind(before)
            .execute(&mut *tx)
            .await
            .map_err(Error::Sqlx)?
            .rows_affected();

        let visited_urls = sqlx::query("DELETE FROM visited_urls WHERE last_seen_at < ?")
            .bind(before)
            .execute(&mut *tx)
            .await
            .map_err(Error::Sqlx)?
            .rows_affected();

        tx.commit().await.map_err(Error::Sqlx)?;

        tracing::info!(error_logs, visited_urls, "Cleaned up old ledger records");

        Ok(CleanupStats {
            error_logs,
            visited_urls,
        })
    }
}
