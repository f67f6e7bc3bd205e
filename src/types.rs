//! Core types shared across the pipeline stages

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Unique identifier for a scrape session row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub i64);

impl SessionId {
    /// Get the inner i64 value
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl From<i64> for SessionId {
    fn from(id: i64) -> Self {
        SessionId(id)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A discovered, not-yet-vetted link to a potentially downloadable file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateLink {
    /// Absolute URL of the file
    pub url: String,
    /// Site the link was discovered on
    pub site_name: String,
    /// Link text or document title
    pub title: Option<String>,
    /// Publication date, if the page exposes one
    pub published_at: Option<DateTime<Utc>>,
    /// File extension (e.g. ".pdf")
    pub file_type: String,
    /// Size advertised by the page, in bytes
    pub discovered_size_hint: Option<u64>,
}

impl CandidateLink {
    /// Create a candidate with only a url, site and file type
    pub fn new(
        url: impl Into<String>,
        site_name: impl Into<String>,
        file_type: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            site_name: site_name.into(),
            title: None,
            published_at: None,
            file_type: file_type.into(),
            discovered_size_hint: None,
        }
    }

    /// Builder-style title setter
    #[must_use]
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Builder-style publication date setter
    #[must_use]
    pub fn with_published_at(mut self, published_at: DateTime<Utc>) -> Self {
        self.published_at = Some(published_at);
        self
    }

    /// Builder-style size hint setter
    #[must_use]
    pub fn with_size_hint(mut self, bytes: u64) -> Self {
        self.discovered_size_hint = Some(bytes);
        self
    }

    /// Text used for keyword matching: the title, or the url when the title is empty
    pub fn match_text(&self) -> &str {
        match self.title.as_deref() {
            Some(t) if !t.trim().is_empty() => t,
            _ => &self.url,
        }
    }
}

/// Final decision recorded for a url in the visited table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VisitedOutcome {
    /// File was fetched and recorded
    Downloaded,
    /// Dropped by the rule or relevance filter
    SkippedFiltered,
    /// Another worker or run already holds the success record
    SkippedDuplicate,
    /// Fetch failed with a non-retryable error
    FailedPermanent,
}

impl VisitedOutcome {
    /// Database text representation
    pub fn as_str(&self) -> &'static str {
        match self {
            VisitedOutcome::Downloaded => "DOWNLOADED",
            VisitedOutcome::SkippedFiltered => "SKIPPED_FILTERED",
            VisitedOutcome::SkippedDuplicate => "SKIPPED_DUPLICATE",
            VisitedOutcome::FailedPermanent => "FAILED_PERMANENT",
        }
    }

    /// Parse the database text representation
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "DOWNLOADED" => Some(VisitedOutcome::Downloaded),
            "SKIPPED_FILTERED" => Some(VisitedOutcome::SkippedFiltered),
            "SKIPPED_DUPLICATE" => Some(VisitedOutcome::SkippedDuplicate),
            "FAILED_PERMANENT" => Some(VisitedOutcome::FailedPermanent),
            _ => None,
        }
    }
}

/// Outcome status of a download record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DownloadStatus {
    /// File fetched and stored
    Success,
    /// Fetch failed
    Failed,
}

impl DownloadStatus {
    /// Database text representation
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadStatus::Success => "SUCCESS",
            DownloadStatus::Failed => "FAILED",
        }
    }

    /// Parse the database text representation, unknown values map to Failed
    pub fn parse(s: &str) -> Self {
        match s {
            "SUCCESS" => DownloadStatus::Success,
            _ => DownloadStatus::Failed,
        }
    }
}

/// Why a failed download record failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    /// Non-retryable error; the url is not attempted again
    Permanent,
    /// Transient errors on every attempt until retries ran out
    TransientExhausted,
}

impl FailureKind {
    /// Database text representation
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Permanent => "PERMANENT",
            FailureKind::TransientExhausted => "TRANSIENT_EXHAUSTED",
        }
    }

    /// Parse the database text representation
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PERMANENT" => Some(FailureKind::Permanent),
            "TRANSIENT_EXHAUSTED" => Some(FailureKind::TransientExhausted),
            _ => None,
        }
    }
}

/// Pipeline stage an error log entry belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorStage {
    /// Candidate collection
    Collect,
    /// Filtering and scoring
    Filter,
    /// Network fetch
    Fetch,
    /// Ledger or local storage writes
    Persist,
}

impl ErrorStage {
    /// Database text representation
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorStage::Collect => "COLLECT",
            ErrorStage::Filter => "FILTER",
            ErrorStage::Fetch => "FETCH",
            ErrorStage::Persist => "PERSIST",
        }
    }

    /// Parse the database text representation
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "COLLECT" => Some(ErrorStage::Collect),
            "FILTER" => Some(ErrorStage::Filter),
            "FETCH" => Some(ErrorStage::Fetch),
            "PERSIST" => Some(ErrorStage::Persist),
            _ => None,
        }
    }
}

/// Per-site state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Waiting for the collector
    Collecting,
    /// Running the filter pipeline
    Filtering,
    /// Fetch executor running
    Fetching,
    /// Closing the ledger session
    Closing,
    /// Finished normally
    Done,
    /// Finished after an unrecoverable error
    Failed,
}

/// Counter deltas applied to a scrape session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCounters {
    /// Candidates returned by the collector
    pub links_found: u64,
    /// Candidates that survived the filter pipeline
    pub links_filtered_in: u64,
    /// Successful downloads
    pub downloads_succeeded: u64,
    /// Failed downloads
    pub downloads_failed: u64,
    /// Bytes written by successful downloads
    pub bytes_downloaded: u64,
}

impl SessionCounters {
    /// Returns true if every counter is zero
    pub fn is_zero(&self) -> bool {
        *self == SessionCounters::default()
    }
}

/// Per-stage drop counts produced by the filter pipeline
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropCounts {
    /// Not an absolute http(s) url
    pub invalid: u64,
    /// Repeated url within the batch
    pub duplicate: u64,
    /// Already succeeded, or sticky in the visited table
    pub history: u64,
    /// Failed the file type or keyword rules
    pub rules: u64,
    /// Scored below the relevance threshold
    pub relevance: u64,
}

impl DropCounts {
    /// Sum of all drops
    pub fn total(&self) -> u64 {
        self.invalid + self.duplicate + self.history + self.rules + self.relevance
    }
}

/// Result of one site's pass through the pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteSummary {
    /// Site name
    pub site_name: String,
    /// Ledger session id, if a session could be opened
    pub session_id: Option<SessionId>,
    /// Terminal state: Done or Failed
    pub state: SessionState,
    /// Whether the FETCHING stage ran to completion
    pub fetch_completed: bool,
    /// Session counters
    pub counters: SessionCounters,
    /// Filter drop counts
    pub drops: DropCounts,
    /// Candidates dropped as duplicates of a concurrent success
    pub skipped_duplicate: u64,
    /// Error that moved the site to Failed
    pub error: Option<String>,
}

/// Aggregate result of a run over all configured sites
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunSummary {
    /// Enabled sites that were processed
    pub sites_processed: u64,
    /// Candidates returned by collectors
    pub links_found: u64,
    /// Candidates that survived filtering
    pub links_filtered_in: u64,
    /// Successful downloads
    pub downloads_succeeded: u64,
    /// Failed downloads
    pub downloads_failed: u64,
    /// Bytes downloaded
    pub bytes_downloaded: u64,
    /// Wall-clock duration of the run
    pub duration: Duration,
    /// Per-site details in processing order
    pub sites: Vec<SiteSummary>,
    /// Set when the run was aborted because the ledger became unreachable
    pub fatal_error: Option<String>,
    /// Set when the run stopped early because of cancellation
    pub cancelled: bool,
}

impl RunSummary {
    /// Fold a site's result into the run totals
    pub fn add_site(&mut self, site: SiteSummary) {
        self.sites_processed += 1;
        self.links_found += site.counters.links_found;
        self.links_filtered_in += site.counters.links_filtered_in;
        self.downloads_succeeded += site.counters.downloads_succeeded;
        self.downloads_failed += site.counters.downloads_failed;
        self.bytes_downloaded += site.counters.bytes_downloaded;
        self.sites.push(site);
    }

    /// Exit status: every processed site completed FETCHING and no ledger-wide failure occurred
    pub fn all_sites_fetched(&self) -> bool {
        self.fatal_error.is_none() && !self.cancelled && self.sites.iter().all(|s| s.fetch_completed)
    }
}
