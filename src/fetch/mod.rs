//! Fetch executor
//!
//! Downloads a prioritized candidate list with bounded concurrency. Each
//! candidate moves through:
//!
//! 1. a concurrency slot (global semaphore, plus the site's own cap if set)
//! 2. a rate-limit token, taken again before every retry; cancellation
//!    while waiting for it ends the item without a request
//! 3. the retry state machine around one HTTP attempt
//! 4. finalization in the ledger
//!
//! Item failures become ledger records and never abort siblings. A second
//! SUCCESS for the same url is rejected by the ledger; the redundant file is
//! deleted and the candidate counts as a skipped duplicate. Ledger failures
//! stop new items from starting and are reported in [`FetchSummary`].

mod http;
mod naming;
mod storage;

pub use http::{FetchedFile, HttpFetcher, parse_retry_after};
pub use naming::{NameAllocator, PART_SUFFIX, base_file_name, part_path};
pub use storage::{ExtensionStats, StorageStats, storage_stats, sweep_stale_parts};

use crate::config::{FetchConfig, RetryConfig, SiteConfig};
use crate::db::{Database, NewDownloadRecord, NewErrorLog};
use crate::error::FetchError;
use crate::rate_limiter::RequestLimiter;
use crate::retry::{RetryOutcome, run_with_retry};
use crate::types::{CandidateLink, ErrorStage, FailureKind, VisitedOutcome};
use crate::{Error, Result};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

/// Counts produced by one executor run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchSummary {
    /// Candidates fetched and recorded as SUCCESS
    pub succeeded: u64,
    /// Candidates recorded as FAILED
    pub failed: u64,
    /// Candidates another worker had already recorded as SUCCESS
    pub skipped_duplicate: u64,
    /// Candidates not finished because of cancellation
    pub cancelled: u64,
    /// Bytes stored by successful fetches
    pub bytes_downloaded: u64,
    /// First ledger failure seen; set means the batch was cut short
    pub ledger_error: Option<String>,
}

/// How one candidate ended
#[derive(Debug)]
enum ItemOutcome {
    Succeeded { bytes: u64 },
    Failed,
    Duplicate,
    Cancelled,
    LedgerFailed(Error),
}

/// State shared by every worker of one site batch
struct ItemContext {
    db: Arc<Database>,
    fetcher: HttpFetcher,
    names: Arc<NameAllocator>,
    limiter: RequestLimiter,
    retry: RetryConfig,
    site_name: String,
    /// Cancelled by the caller, or by a worker that hit a ledger failure
    stop: CancellationToken,
}

/// Bounded worker pool that fetches candidates and records outcomes
pub struct FetchExecutor {
    db: Arc<Database>,
    fetcher: HttpFetcher,
    names: Arc<NameAllocator>,
    config: FetchConfig,
    retry: RetryConfig,
    slots: Arc<Semaphore>,
}

impl FetchExecutor {
    /// Create an executor writing to `fetch.download_dir`
    ///
    /// The global slot count is shared by every site run through this executor.
    pub fn new(db: Arc<Database>, fetch: &FetchConfig, retry: &RetryConfig) -> Result<Self> {
        Ok(Self {
            db,
            fetcher: HttpFetcher::new(fetch)?,
            names: Arc::new(NameAllocator::new(fetch.download_dir.clone())),
            config: fetch.clone(),
            retry: retry.clone(),
            slots: Arc::new(Semaphore::new(fetch.max_concurrent_downloads.max(1))),
        })
    }

    /// Fetch every candidate for `site` and wait for all of them
    ///
    /// Returns an error only if the download directory cannot be created.
    pub async fn run(
        &self,
        site: &SiteConfig,
        candidates: Vec<CandidateLink>,
        limiter: &RequestLimiter,
        cancel: &CancellationToken,
    ) -> Result<FetchSummary> {
        tokio::fs::create_dir_all(&self.config.download_dir).await?;

        let site_slots = site
            .max_concurrent_downloads
            .filter(|&n| n < self.config.max_concurrent_downloads)
            .map(|n| Arc::new(Semaphore::new(n.max(1))));

        let ctx = Arc::new(ItemContext {
            db: Arc::clone(&self.db),
            fetcher: self.fetcher.clone(),
            names: Arc::clone(&self.names),
            limiter: limiter.clone(),
            retry: self.retry.clone(),
            site_name: site.name.clone(),
            stop: cancel.child_token(),
        });

        tracing::info!(
            site = %site.name,
            candidates = candidates.len(),
            max_concurrent = site_slots
                .as_ref()
                .map_or(self.config.max_concurrent_downloads, |s| s.available_permits()),
            "Starting fetch batch"
        );

        let mut summary = FetchSummary::default();
        let mut handles = Vec::with_capacity(candidates.len());
        let mut pending = candidates.into_iter();

        while let Some(candidate) = pending.next() {
            let permits = tokio::select! {
                biased;
                _ = ctx.stop.cancelled() => None,
                permits = Self::acquire_slots(&self.slots, site_slots.as_ref()) => permits,
            };
            let Some(permits) = permits else {
                summary.cancelled += 1 + pending.len() as u64;
                break;
            };

            let ctx = Arc::clone(&ctx);
            handles.push(tokio::spawn(async move {
                let _permits = permits;
                process_item(&ctx, candidate).await
            }));
        }

        for result in futures::future::join_all(handles).await {
            match result {
                Ok(ItemOutcome::Succeeded { bytes }) => {
                    summary.succeeded += 1;
                    summary.bytes_downloaded += bytes;
                }
                Ok(ItemOutcome::Failed) => summary.failed += 1,
                Ok(ItemOutcome::Duplicate) => summary.skipped_duplicate += 1,
                Ok(ItemOutcome::Cancelled) => summary.cancelled += 1,
                Ok(ItemOutcome::LedgerFailed(e)) => {
                    summary.ledger_error.get_or_insert_with(|| e.to_string());
                }
                Err(e) => {
                    tracing::error!(site = %site.name, error = %e, "Fetch task panicked");
                    summary.failed += 1;
                }
            }
        }

        tracing::info!(
            site = %site.name,
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped_duplicate = summary.skipped_duplicate,
            cancelled = summary.cancelled,
            bytes = summary.bytes_downloaded,
            "Fetch batch finished"
        );

        Ok(summary)
    }

    /// Take the site slot first, then the global one; `None` if a semaphore closed
    async fn acquire_slots(
        global: &Arc<Semaphore>,
        site: Option<&Arc<Semaphore>>,
    ) -> Option<(Option<OwnedSemaphorePermit>, OwnedSemaphorePermit)> {
        let site_permit = match site {
            Some(s) => Some(Arc::clone(s).acquire_owned().await.ok()?),
            None => None,
        };
        let global_permit = Arc::clone(global).acquire_owned().await.ok()?;
        Some((site_permit, global_permit))
    }
}

/// Run one candidate to a terminal outcome
async fn process_item(ctx: &ItemContext, candidate: CandidateLink) -> ItemOutcome {
    if ctx.stop.is_cancelled() {
        return ItemOutcome::Cancelled;
    }

    let outcome = {
        let candidate = &candidate;
        run_with_retry(&ctx.retry, &ctx.stop, move |attempt| async move {
            tokio::select! {
                biased;
                _ = ctx.stop.cancelled() => return Err(FetchError::Cancelled),
                _ = ctx.limiter.acquire() => {}
            }
            tracing::debug!(site = %ctx.site_name, url = %candidate.url, attempt, "Fetching");
            ctx.fetcher.fetch(candidate, &ctx.names).await
        })
        .await
    };

    let result = match outcome {
        RetryOutcome::Success { value, attempts } => finalize_success(ctx, &candidate, value, attempts).await,
        RetryOutcome::Failed {
            error: FetchError::Cancelled,
            attempts,
            ..
        } => {
            tracing::info!(
                site = %ctx.site_name,
                url = %candidate.url,
                attempts,
                "Fetch not started, run cancelled while waiting for a request slot"
            );
            Ok(ItemOutcome::Cancelled)
        }
        RetryOutcome::Failed {
            error,
            attempts,
            kind,
        } => finalize_failure(ctx, &candidate, &error, attempts, kind).await,
        RetryOutcome::Cancelled { error, attempts } => {
            tracing::info!(
                site = %ctx.site_name,
                url = %candidate.url,
                attempts,
                error = %error,
                "Fetch abandoned by cancellation"
            );
            Ok(ItemOutcome::Cancelled)
        }
    };

    result.unwrap_or_else(|e| {
        tracing::error!(site = %ctx.site_name, url = %candidate.url, error = %e, "Ledger write failed");
        ctx.stop.cancel();
        ItemOutcome::LedgerFailed(e)
    })
}

async fn finalize_success(
    ctx: &ItemContext,
    candidate: &CandidateLink,
    file: FetchedFile,
    attempts: u32,
) -> Result<ItemOutcome> {
    let record = NewDownloadRecord::success(
        &ctx.site_name,
        &candidate.url,
        file.path.clone(),
        file.size,
        file.checksum.clone(),
        attempts,
    );

    match ctx.db.record_attempt(&record).await {
        Ok(_) => {
            tracing::info!(
                site = %ctx.site_name,
                url = %candidate.url,
                path = %file.path.display(),
                bytes = file.size,
                attempts,
                "Downloaded"
            );
            Ok(ItemOutcome::Succeeded { bytes: file.size })
        }
        Err(e) if e.is_constraint_violation() => {
            tracing::info!(
                site = %ctx.site_name,
                url = %candidate.url,
                "Already downloaded by another worker, discarding copy"
            );
            remove_artifact(ctx, &file).await;
            ctx.db
                .upsert_visited(&candidate.url, &ctx.site_name, VisitedOutcome::SkippedDuplicate)
                .await?;
            Ok(ItemOutcome::Duplicate)
        }
        Err(e) => {
            remove_artifact(ctx, &file).await;
            Err(e)
        }
    }
}

async fn finalize_failure(
    ctx: &ItemContext,
    candidate: &CandidateLink,
    error: &FetchError,
    attempts: u32,
    kind: FailureKind,
) -> Result<ItemOutcome> {
    let message = error.to_string();
    ctx.db
        .record_attempt(&NewDownloadRecord::failure(
            &ctx.site_name,
            &candidate.url,
            kind,
            &message,
            attempts,
        ))
        .await?;

    ctx.db
        .append_error(
            &NewErrorLog::new(&ctx.site_name, ErrorStage::Fetch, error.kind(), &message)
                .with_url(&candidate.url),
        )
        .await?;

    tracing::warn!(
        site = %ctx.site_name,
        url = %candidate.url,
        attempts,
        kind = kind.as_str(),
        error = %message,
        "Download failed"
    );
    Ok(ItemOutcome::Failed)
}

async fn remove_artifact(ctx: &ItemContext, file: &FetchedFile) {
    if let Err(e) = tokio::fs::remove_file(&file.path).await {
        tracing::warn!(path = %file.path.display(), error = %e, "Failed to remove redundant file");
    }
    ctx.names.release(&file.path).await;
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
