//! Error types for harvest-dl
//!
//! This module provides the error taxonomy for the library:
//! - A crate-wide [`Error`] with conversions from the underlying stacks (sqlx, reqwest, io)
//! - [`DatabaseError`] for ledger failures, including idempotency conflicts
//! - [`FetchError`] for a single fetch attempt, classified transient or permanent
//! - [`CollectionError`] and [`ScoringError`] for the external collaborators

use std::time::Duration;
use thiserror::Error;

/// Result type alias for harvest-dl operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for harvest-dl
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "sites[0].name")
        key: Option<String>,
    },

    /// Database operation failed
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    /// SQLx database error
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// The ledger cannot be reached at all (connection, pool or disk failure)
    #[error("ledger unavailable: {0}")]
    LedgerUnavailable(String),

    /// Candidate collection failed for a site
    #[error("collection error: {0}")]
    Collection(#[from] CollectionError),

    /// Relevance scoring failed
    #[error("scoring error: {0}")]
    Scoring(#[from] ScoringError),

    /// A fetch attempt failed
    #[error("fetch error: {0}")]
    Fetch(#[from] FetchError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Network error
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Shorthand for a configuration error tied to a specific key
    pub fn config(message: impl Into<String>, key: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
            key: Some(key.into()),
        }
    }

    /// Returns true if this error means the ledger itself is unreachable
    ///
    /// Query failures on an otherwise healthy connection are not included;
    /// those are scoped to the statement that caused them.
    pub fn is_ledger_unavailable(&self) -> bool {
        match self {
            Error::LedgerUnavailable(_) => true,
            Error::Database(DatabaseError::ConnectionFailed(_)) => true,
            Error::Sqlx(e) => matches!(
                e,
                sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::Io(_)
                    | sqlx::Error::WorkerCrashed
            ),
            _ => false,
        }
    }

    /// Returns true if this is an idempotency conflict raised by the ledger
    pub fn is_constraint_violation(&self) -> bool {
        matches!(self, Error::Database(DatabaseError::ConstraintViolation(_)))
    }
}

/// Database-related errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Failed to connect to database
    #[error("failed to connect to database: {0}")]
    ConnectionFailed(String),

    /// Failed to run migrations
    #[error("failed to run migrations: {0}")]
    MigrationFailed(String),

    /// Query failed
    #[error("query failed: {0}")]
    QueryFailed(String),

    /// Record not found
    #[error("record not found: {0}")]
    NotFound(String),

    /// Constraint violation (e.g., a second SUCCESS record for one url)
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),
}

/// Failure of the external collector for a whole site
#[derive(Debug, Clone, Error)]
#[error("collection failed for site '{site}': {reason}")]
pub struct CollectionError {
    /// Site whose collection failed
    pub site: String,
    /// Why collection failed (site unreachable, parse failure, ...)
    pub reason: String,
}

impl CollectionError {
    /// Create a collection error for a site
    pub fn new(site: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            site: site.into(),
            reason: reason.into(),
        }
    }
}

/// Relevance scorer failures; both are advisory and never drop a candidate
#[derive(Debug, Clone, Error)]
pub enum ScoringError {
    /// The scorer did not answer in time
    #[error("scoring timed out after {0:?}")]
    Timeout(Duration),

    /// The scorer could not produce a score (transport failure, malformed reply)
    #[error("scorer unavailable: {0}")]
    Unavailable(String),
}

impl ScoringError {
    /// Stable machine-readable kind used in error logs
    pub fn kind(&self) -> &'static str {
        match self {
            ScoringError::Timeout(_) => "scoring_timeout",
            ScoringError::Unavailable(_) => "scoring_unavailable",
        }
    }
}

/// Failure of a single fetch attempt
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// Request or body read exceeded the per-request timeout
    #[error("request timed out: {0}")]
    Timeout(String),

    /// Connection refused, reset or dropped mid-stream
    #[error("connection error: {0}")]
    Connection(String),

    /// Server answered with a 5xx status
    #[error("server error: HTTP {status}")]
    ServerError {
        /// HTTP status code
        status: u16,
    },

    /// Server answered 429, optionally with a Retry-After hint
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited {
        /// Parsed Retry-After header, if present
        retry_after: Option<Duration>,
    },

    /// Server answered with a 4xx status other than 429
    #[error("client error: HTTP {status}")]
    ClientError {
        /// HTTP status code
        status: u16,
    },

    /// File exceeds the configured size cap
    #[error("file too large: {size} bytes exceeds limit of {limit} bytes")]
    TooLarge {
        /// Configured cap in bytes
        limit: u64,
        /// Declared or observed size in bytes
        size: u64,
    },

    /// Response content is malformed or not of an allowed type
    #[error("disallowed content: {0}")]
    DisallowedContent(String),

    /// The candidate URL cannot be requested
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    /// Local storage failure while writing the artifact
    #[error("storage error: {0}")]
    Storage(String),

    /// The run was cancelled before the request was sent
    #[error("cancelled before the request was sent")]
    Cancelled,
}

impl FetchError {
    /// Stable machine-readable kind used in error logs
    pub fn kind(&self) -> String {
        match self {
            FetchError::Timeout(_) => "timeout".to_string(),
            FetchError::Connection(_) => "connection".to_string(),
            FetchError::ServerError { status } | FetchError::ClientError { status } => {
                format!("http_{status}")
            }
            FetchError::RateLimited { .. } => "http_429".to_string(),
            FetchError::TooLarge { .. } => "too_large".to_string(),
            FetchError::DisallowedContent(_) => "disallowed_content".to_string(),
            FetchError::InvalidUrl(_) => "invalid_url".to_string(),
            FetchError::Storage(_) => "storage".to_string(),
            FetchError::Cancelled => "cancelled".to_string(),
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            FetchError::Timeout(e.to_string())
        } else if let Some(status) = e.status() {
            if status.is_server_error() {
                FetchError::ServerError {
                    status: status.as_u16(),
                }
            } else if status.as_u16() == 429 {
                FetchError::RateLimited { retry_after: None }
            } else {
                FetchError::ClientError {
                    status: status.as_u16(),
                }
            }
        } else if e.is_builder() {
            FetchError::InvalidUrl(e.to_string())
        } else {
            FetchError::Connection(e.to_string())
        }
    }
}
