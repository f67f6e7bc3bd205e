//! Database layer for harvest-dl (the ledger)
//!
//! Handles SQLite persistence for download records, visited urls, scrape
//! sessions and error logs. The ledger is the single source of truth for
//! idempotency: at most one `SUCCESS` download record may exist per url,
//! enforced by a partial unique index so concurrent writers race on the
//! insert itself rather than on a global lock.
//!
//! ## Submodules
//!
//! Methods on [`Database`] are organized by domain:
//! - [`migrations`] - Database lifecycle, schema migrations
//! - [`records`] - Download records and the idempotency guard
//! - [`visited`] - Visited-url decisions
//! - [`sessions`] - Per-site scrape sessions
//! - [`errors`] - Append-only error log, stats and retention cleanup

use crate::types::{DownloadStatus, ErrorStage, FailureKind, SessionId, VisitedOutcome};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, sqlite::SqlitePool};
use std::path::PathBuf;

mod errors;
mod migrations;
mod records;
mod sessions;
mod visited;

pub use errors::{CleanupStats, ErrorStats};

/// New download record to be inserted into the ledger
#[derive(Debug, Clone)]
pub struct NewDownloadRecord {
    /// Site the url belongs to
    pub site_name: String,
    /// Fetched url
    pub url: String,
    /// Where the file was stored (None if failed)
    pub local_path: Option<PathBuf>,
    /// Stored size in bytes (None if failed)
    pub file_size_bytes: Option<u64>,
    /// Hex SHA-256 of the stored file (None if failed)
    pub checksum: Option<String>,
    /// SUCCESS or FAILED
    pub status: DownloadStatus,
    /// Failure classification (None on success)
    pub error_kind: Option<FailureKind>,
    /// Last error message (None on success)
    pub error_message: Option<String>,
    /// Attempts made, including the final one
    pub attempt_count: u32,
}

impl NewDownloadRecord {
    /// A successful fetch
    pub fn success(
        site_name: impl Into<String>,
        url: impl Into<String>,
        local_path: PathBuf,
        file_size_bytes: u64,
        checksum: String,
        attempt_count: u32,
    ) -> Self {
        Self {
            site_name: site_name.into(),
            url: url.into(),
            local_path: Some(local_path),
            file_size_bytes: Some(file_size_bytes),
            checksum: Some(checksum),
            status: DownloadStatus::Success,
            error_kind: None,
            error_message: None,
            attempt_count,
        }
    }

    /// A fetch that ended in failure
    pub fn failure(
        site_name: impl Into<String>,
        url: impl Into<String>,
        kind: FailureKind,
        error_message: impl Into<String>,
        attempt_count: u32,
    ) -> Self {
        Self {
            site_name: site_name.into(),
            url: url.into(),
            local_path: None,
            file_size_bytes: None,
            checksum: None,
            status: DownloadStatus::Failed,
            error_kind: Some(kind),
            error_message: Some(error_message.into()),
            attempt_count,
        }
    }

    /// Visited outcome written in the same transaction as this record, if any
    ///
    /// Transient exhaustion leaves the url undecided so the next run retries it.
    pub fn visited_outcome(&self) -> Option<VisitedOutcome> {
        match (self.status, self.error_kind) {
            (DownloadStatus::Success, _) => Some(VisitedOutcome::Downloaded),
            (DownloadStatus::Failed, Some(FailureKind::Permanent)) => {
                Some(VisitedOutcome::FailedPermanent)
            }
            (DownloadStatus::Failed, _) => None,
        }
    }
}

/// Download record row from database (raw from SQLite)
#[derive(Debug, Clone, FromRow)]
pub struct DownloadRecordRow {
    /// Unique database ID
    pub id: i64,
    /// Site name
    pub site_name: String,
    /// Fetched url
    pub url: String,
    /// Local path on success
    pub local_path: Option<String>,
    /// Stored size on success
    pub file_size_bytes: Option<i64>,
    /// Hex SHA-256 on success
    pub checksum: Option<String>,
    /// "SUCCESS" or "FAILED"
    pub status: String,
    /// "PERMANENT" or "TRANSIENT_EXHAUSTED"
    pub error_kind: Option<String>,
    /// Last error message
    pub error_message: Option<String>,
    /// Attempts made
    pub attempt_count: i64,
    /// Unix timestamp of creation
    pub created_at: i64,
}

/// Download record, immutable once written
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadRecord {
    /// Unique database ID
    pub id: i64,
    /// Site name
    pub site_name: String,
    /// Fetched url
    pub url: String,
    /// Local path on success
    pub local_path: Option<PathBuf>,
    /// Stored size on success
    pub file_size_bytes: Option<u64>,
    /// Hex SHA-256 on success
    pub checksum: Option<String>,
    /// SUCCESS or FAILED
    pub status: DownloadStatus,
    /// Failure classification
    pub error_kind: Option<FailureKind>,
    /// Last error message
    pub error_message: Option<String>,
    /// Attempts made
    pub attempt_count: u32,
    /// When the record was written
    pub created_at: DateTime<Utc>,
}

impl From<DownloadRecordRow> for DownloadRecord {
    fn from(row: DownloadRecordRow) -> Self {
        DownloadRecord {
            id: row.id,
            site_name: row.site_name,
            url: row.url,
            local_path: row.local_path.map(PathBuf::from),
            file_size_bytes: row.file_size_bytes.map(|s| s.max(0) as u64),
            checksum: row.checksum,
            status: DownloadStatus::parse(&row.status),
            error_kind: row.error_kind.as_deref().and_then(FailureKind::parse),
            error_message: row.error_message,
            attempt_count: row.attempt_count.max(0) as u32,
            created_at: timestamp_to_datetime(row.created_at),
        }
    }
}

/// Visited url row from database (raw from SQLite)
#[derive(Debug, Clone, FromRow)]
pub struct VisitedUrlRow {
    /// Site name
    pub site_name: String,
    /// Url
    pub url: String,
    /// Outcome text
    pub outcome: String,
    /// Unix timestamp of the last decision
    pub last_seen_at: i64,
}

/// Latest decision recorded for a url
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisitedUrl {
    /// Site name
    pub site_name: String,
    /// Url
    pub url: String,
    /// Outcome
    pub outcome: VisitedOutcome,
    /// When the decision was last written
    pub last_seen_at: DateTime<Utc>,
}

impl VisitedUrlRow {
    fn into_visited(self) -> Option<VisitedUrl> {
        let outcome = VisitedOutcome::parse(&self.outcome)?;
        Some(VisitedUrl {
            site_name: self.site_name,
            url: self.url,
            outcome,
            last_seen_at: timestamp_to_datetime(self.last_seen_at),
        })
    }
}

/// Scrape session row from database
#[derive(Debug, Clone, FromRow)]
pub struct ScrapeSessionRow {
    /// Unique database ID
    pub id: i64,
    /// Site name
    pub site_name: String,
    /// Unix timestamp when the session opened
    pub started_at: i64,
    /// Unix timestamp when the session closed
    pub ended_at: Option<i64>,
    /// Candidates returned by the collector
    pub links_found: i64,
    /// Candidates surviving the filter pipeline
    pub links_filtered_in: i64,
    /// Successful downloads
    pub downloads_succeeded: i64,
    /// Failed downloads
    pub downloads_failed: i64,
    /// Bytes downloaded
    pub bytes_downloaded: i64,
    /// 1 if the site completed without a fatal error, NULL while open
    pub success: Option<i64>,
    /// Error that failed the session
    pub error_message: Option<String>,
}

/// One site within one run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeSession {
    /// Session ID
    pub id: SessionId,
    /// Site name
    pub site_name: String,
    /// When the session opened
    pub started_at: DateTime<Utc>,
    /// When the session closed (None while open)
    pub ended_at: Option<DateTime<Utc>>,
    /// Candidates returned by the collector
    pub links_found: u64,
    /// Candidates surviving the filter pipeline
    pub links_filtered_in: u64,
    /// Successful downloads
    pub downloads_succeeded: u64,
    /// Failed downloads
    pub downloads_failed: u64,
    /// Bytes downloaded
    pub bytes_downloaded: u64,
    /// Whether the session completed without a fatal error (None while open)
    pub success: Option<bool>,
    /// Error that failed the session
    pub error_message: Option<String>,
}

impl From<ScrapeSessionRow> for ScrapeSession {
    fn from(row: ScrapeSessionRow) -> Self {
        ScrapeSession {
            id: SessionId(row.id),
            site_name: row.site_name,
            started_at: timestamp_to_datetime(row.started_at),
            ended_at: row.ended_at.map(timestamp_to_datetime),
            links_found: row.links_found.max(0) as u64,
            links_filtered_in: row.links_filtered_in.max(0) as u64,
            downloads_succeeded: row.downloads_succeeded.max(0) as u64,
            downloads_failed: row.downloads_failed.max(0) as u64,
            bytes_downloaded: row.bytes_downloaded.max(0) as u64,
            success: row.success.map(|s| s != 0),
            error_message: row.error_message,
        }
    }
}

/// New error log entry
#[derive(Debug, Clone)]
pub struct NewErrorLog {
    /// Site name
    pub site_name: String,
    /// Url involved, if any
    pub url: Option<String>,
    /// Stage that failed
    pub stage: ErrorStage,
    /// Machine-readable kind (e.g. "http_404", "scoring_timeout")
    pub error_kind: String,
    /// Human-readable message
    pub message: String,
}

impl NewErrorLog {
    /// Create an entry
    pub fn new(
        site_name: impl Into<String>,
        stage: ErrorStage,
        error_kind: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            site_name: site_name.into(),
            url: None,
            stage,
            error_kind: error_kind.into(),
            message: message.into(),
        }
    }

    /// Attach the url the error concerns
    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }
}

/// Error log row from database
#[derive(Debug, Clone, FromRow)]
pub struct ErrorLogRow {
    /// Unique database ID
    pub id: i64,
    /// Site name
    pub site_name: String,
    /// Url involved
    pub url: Option<String>,
    /// Stage text
    pub stage: String,
    /// Machine-readable kind
    pub error_kind: String,
    /// Message
    pub message: String,
    /// Unix timestamp
    pub occurred_at: i64,
}

/// Error log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorLog {
    /// Unique database ID
    pub id: i64,
    /// Site name
    pub site_name: String,
    /// Url involved
    pub url: Option<String>,
    /// Stage (None if the stored text is unrecognized)
    pub stage: Option<ErrorStage>,
    /// Machine-readable kind
    pub error_kind: String,
    /// Message
    pub message: String,
    /// When it happened
    pub occurred_at: DateTime<Utc>,
}

impl From<ErrorLogRow> for ErrorLog {
    fn from(row: ErrorLogRow) -> Self {
        ErrorLog {
            id: row.id,
            site_name: row.site_name,
            url: row.url,
            stage: ErrorStage::parse(&row.stage),
            error_kind: row.error_kind,
            message: row.message,
            occurred_at: timestamp_to_datetime(row.occurred_at),
        }
    }
}

fn timestamp_to_datetime(ts: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(ts, 0).single().unwrap_or_else(Utc::now)
}

/// Database handle for harvest-dl
pub struct Database {
    pool: SqlitePool,
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
