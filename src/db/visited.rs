//! Visited-url decisions.

use crate::error::DatabaseError;
use crate::types::VisitedOutcome;
use crate::{Error, Result};

use super::{Database, VisitedUrl, VisitedUrlRow};

impl Database {
    /// Record the latest decision for `url` on `site`
    ///
    /// One row per (site, url); a repeat call replaces the outcome and
    /// refreshes `last_seen_at`. SKIPPED_DUPLICATE never replaces
    /// DOWNLOADED, so the row keeps pointing at the stored copy.
    pub async fn upsert_visited(
        &self,
        url: &str,
        site_name: &str,
        outcome: VisitedOutcome,
    ) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        Self::upsert_visited_with(&self.pool, url, site_name, outcome, now).await
    }

    /// Upsert on any executor, so it can join an open transaction
    pub(crate) async fn upsert_visited_with<'e, E>(
        executor: E,
        url: &str,
        site_name: &str,
        outcome: VisitedOutcome,
        now: i64,
    ) -> Result<()>
    where
        E: sqlx::SqliteExecutor<'e>,
    {
        sqlx::query(
            r#"
            INSERT INTO visited_urls (site_name, url, outcome, last_seen_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(site_name, url) DO UPDATE SET
                outcome = excluded.outcome,
                last_seen_at = excluded.last_seen_at
            WHERE NOT (excluded.outcome = 'SKIPPED_DUPLICATE'
                       AND visited_urls.outcome = 'DOWNLOADED')
            "#,
        )
        .bind(site_name)
        .bind(url)
        .bind(outcome.as_str())
        .bind(now)
        .execute(executor)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to upsert visited url: {}",
                e
            )))
        })?;

        Ok(())
    }

    /// Latest decision for `url` across all sites
    pub async fn is_visited(&self, url: &str) -> Result<Option<VisitedOutcome>> {
        Ok(self.visited_entry(url).await?.map(|v| v.outcome))
    }

    /// Latest visited row for `url` across all sites
    pub async fn visited_entry(&self, url: &str) -> Result<Option<VisitedUrl>> {
        let row = sqlx::query_as::<_, VisitedUrlRow>(
            r#"
            SELECT site_name, url, outcome, last_seen_at
            FROM visited_urls
            WHERE url = ?
            ORDER BY last_seen_at DESC
            LIMIT 1
            "#,
        )
        .bind(url)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to look up visited url: {}",
                e
            )))
        })?;

        Ok(row.and_then(VisitedUrlRow::into_visited))
    }

    /// Visited row for `url` on one site
    pub async fn visited_for_site(&self, site_name: &str, url: &str) -> Result<Option<VisitedUrl>> {
        let row = sqlx::query_as::<_, VisitedUrlRow>(
            r#"
            SELECT site_name, url, outcome, last_seen_at
            FROM visited_urls
            WHERE site_name = ? AND url = ?
            "#,
        )
        .bind(site_name)
        .bind(url)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Sqlx)?;

        Ok(row.and_then(VisitedUrlRow::into_visited))
    }

    /// Number of visited rows for a site
    pub async fn count_visited(&self, site_name: &str) -> Result<i64> {
        let count =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM visited_urls WHERE site_name = ?")
                .bind(site_name)
                .fetch_one(&self.pool)
                .await
                .map_err(Error::Sqlx)?;
        Ok(count)
    }
}
