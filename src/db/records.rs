//! Download records and the at-most-one-success guard.

use crate::error::DatabaseError;
use crate::{Error, Result};

use super::{Database, DownloadRecord, DownloadRecordRow, NewDownloadRecord};

const RECORD_COLUMNS: &str = "id, site_name, url, local_path, file_size_bytes, checksum, \
     status, error_kind, error_message, attempt_count, created_at";

impl Database {
    /// True iff a SUCCESS record exists for `url`
    pub async fn has_succeeded(&self, url: &str) -> Result<bool> {
        let exists: i64 = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM download_records WHERE url = ? AND status = 'SUCCESS')",
        )
        .bind(url)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to check download history: {}",
                e
            )))
        })?;

        Ok(exists != 0)
    }

    /// Persist the final outcome of a fetch
    ///
    /// The insert and the matching visited-url decision are written in one
    /// transaction. A second SUCCESS for the same url is rejected by the
    /// partial unique index with [`DatabaseError::ConstraintViolation`]; the
    /// check and the insert are a single statement, so concurrent writers
    /// cannot both succeed.
    pub async fn record_attempt(&self, record: &NewDownloadRecord) -> Result<i64> {
        let mut tx = self.pool.begin().await.map_err(|e| {
            Error::LedgerUnavailable(format!("Failed to begin transaction: {}", e))
        })?;

        let now = chrono::Utc::now().timestamp();
        let inserted = sqlx::query(
            r#"
            INSERT INTO download_records (
                site_name, url, local_path, file_size_bytes, checksum,
                status, error_kind, error_message, attempt_count, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.site_name)
        .bind(&record.url)
        .bind(
            record
                .local_path
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
        )
        .bind(record.file_size_bytes.map(|s| s as i64))
        .bind(&record.checksum)
        .bind(record.status.as_str())
        .bind(record.error_kind.map(|k| k.as_str()))
        .bind(&record.error_message)
        .bind(i64::from(record.attempt_count))
        .bind(now)
        .execute(&mut *tx)
        .await;

        let id = match inserted {
            Ok(result) => result.last_insert_rowid(),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                // Dropping the transaction rolls it back
                return Err(Error::Database(DatabaseError::ConstraintViolation(format!(
                    "url already has a SUCCESS record: {}",
                    record.url
                ))));
            }
            Err(e) => {
                return Err(Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to insert download record: {}",
                    e
                ))));
            }
        };

        if let Some(outcome) = record.visited_outcome() {
            Self::upsert_visited_with(&mut *tx, &record.url, &record.site_name, outcome, now)
                .await?;
        }

        tx.commit().await.map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to commit download record: {}",
                e
            )))
        })?;

        Ok(id)
    }

    /// The SUCCESS record for `url`, if any
    pub async fn success_record(&self, url: &str) -> Result<Option<DownloadRecord>> {
        let row = sqlx::query_as::<_, DownloadRecordRow>(&format!(
            "SELECT {RECORD_COLUMNS} FROM download_records WHERE url = ? AND status = 'SUCCESS'"
        ))
        .bind(url)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to get success record: {}",
                e
            )))
        })?;

        Ok(row.map(DownloadRecord::from))
    }

    /// Every record for `url`, oldest first
    pub async fn records_for_url(&self, url: &str) -> Result<Vec<DownloadRecord>> {
        let rows = sqlx::query_as::<_, DownloadRecordRow>(&format!(
            "SELECT {RECORD_COLUMNS} FROM download_records WHERE url = ? ORDER BY id ASC"
        ))
        .bind(url)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to list records for url: {}",
                e
            )))
        })?;

        Ok(rows.into_iter().map(DownloadRecord::from).collect())
    }

    /// Most recent records, optionally for one site
    pub async fn get_download_history(
        &self,
        site_name: Option<&str>,
        limit: usize,
    ) -> Result<Vec<DownloadRecord>> {
        let sql = match site_name {
            Some(_) => format!(
                "SELECT {RECORD_COLUMNS} FROM download_records WHERE site_name = ? \
                 ORDER BY created_at DESC, id DESC LIMIT ?"
            ),
            None => format!(
                "SELECT {RECORD_COLUMNS} FROM download_records \
                 ORDER BY created_at DESC, id DESC LIMIT ?"
            ),
        };

        let mut query = sqlx::query_as::<_, DownloadRecordRow>(&sql);
        if let Some(site) = site_name {
            query = query.bind(site);
        }
        let query = query.bind(limit as i64);

        let rows = query.fetch_all(&self.pool).await.map_err(Error::Sqlx)?;

        Ok(rows.into_iter().map(DownloadRecord::from).collect())
    }

    /// Number of SUCCESS records for a site
    pub async fn count_successes(&self, site_name: &str) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM download_records WHERE site_name = ? AND status = 'SUCCESS'",
        )
        .bind(site_name)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Sqlx)?;

        Ok(count)
    }
}
