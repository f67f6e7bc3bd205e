//! # harvest-dl
//!
//! Idempotent file harvester for configured websites.
//!
//! Each run walks the enabled sites in order. For every site a [`Collector`]
//! produces candidate links, the filter pipeline drops duplicates, already
//! handled urls, rule mismatches and irrelevant links, and the fetch executor
//! downloads the survivors with bounded concurrency, per-site rate limits and
//! retries. Every outcome lands in a SQLite ledger, so the next run skips
//! what is already done.
//!
//! ## Design Philosophy
//!
//! - **Idempotent** - a url is recorded as SUCCESS at most once, even across
//!   concurrent workers
//! - **Contained failures** - one bad link or one broken site never stops the rest
//! - **Library-first** - the embedding binary owns logging setup and exit codes
//!
//! ## Quick Start
//!
//! ```no_run
//! use harvest_dl::{CandidateLink, Config, Coordinator, StaticCollector, run_with_shutdown};
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_file(Path::new("harvest.json")).await?;
//!
//!     let collector = StaticCollector::new().with_batch(
//!         "city-council",
//!         vec![CandidateLink::new(
//!             "https://council.example/minutes/2025-03.pdf",
//!             "city-council",
//!             ".pdf",
//!         )],
//!     );
//!
//!     let coordinator = Coordinator::new(config, Arc::new(collector)).await?;
//!     let summary = run_with_shutdown(&coordinator).await;
//!
//!     println!("{} files downloaded", summary.downloads_succeeded);
//!     std::process::exit(if summary.all_sites_fetched() { 0 } else { 1 });
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Candidate link collectors
pub mod collector;
/// Configuration types
pub mod config;
/// Per-site session state machine
pub mod coordinator;
/// Database persistence layer
pub mod db;
/// Error types
pub mod error;
/// Bounded concurrent fetching
pub mod fetch;
/// Candidate filter pipeline
pub mod filter;
/// Per-site request rate limiting
pub mod rate_limiter;
/// Retry logic with exponential backoff
pub mod retry;
/// Relevance scoring
pub mod scorer;
/// Core types
pub mod types;
/// Utility functions
pub mod utils;

// Re-export commonly used types
pub use collector::{Collector, StaticCollector};
pub use config::{Config, FetchConfig, HistoryConfig, RetryConfig, ScorerConfig, SiteConfig};
pub use coordinator::Coordinator;
pub use db::Database;
pub use error::{CollectionError, DatabaseError, Error, FetchError, Result, ScoringError};
pub use fetch::{FetchExecutor, FetchSummary, StorageStats};
pub use filter::{FilterOutcome, FilterPipeline};
pub use scorer::{KeywordScorer, LlmScorer, NoOpScorer, RelevanceScorer};
pub use types::{
    CandidateLink, DownloadStatus, DropCounts, ErrorStage, FailureKind, RunSummary,
    SessionCounters, SessionId, SessionState, SiteSummary, VisitedOutcome,
};

use tokio_util::sync::CancellationToken;

/// Run the coordinator, cancelling it on SIGINT or SIGTERM.
///
/// A signal lets fetches already in flight finish their current attempt,
/// closes the active session and returns the partial summary.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
pub async fn run_with_shutdown(coordinator: &Coordinator) -> RunSummary {
    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    let watcher = tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("Shutdown requested, letting in-flight fetches finish");
        signal_cancel.cancel();
    });

    let summary = coordinator.run(&cancel).await;
    watcher.abort();
    summary
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Registration can fail in restricted environments
    match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
                _ = sigint.recv() => tracing::info!("Received SIGINT"),
            }
        }
        (Err(e), Ok(mut sigint)) => {
            tracing::warn!(error = %e, "No SIGTERM handler, waiting for SIGINT only");
            sigint.recv().await;
            tracing::info!("Received SIGINT");
        }
        (Ok(mut sigterm), Err(e)) => {
            tracing::warn!(error = %e, "No SIGINT handler, waiting for SIGTERM only");
            sigterm.recv().await;
            tracing::info!("Received SIGTERM");
        }
        (Err(e), Err(_)) => {
            tracing::error!(error = %e, "Could not register signal handlers, using ctrl_c fallback");
            tokio::signal::ctrl_c().await.ok();
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Received Ctrl+C"),
        Err(e) => tracing::error!(error = %e, "Failed to listen for Ctrl+C"),
    }
}
