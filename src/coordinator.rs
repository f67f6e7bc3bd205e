//! Session coordinator
//!
//! Drives each enabled site through
//! `COLLECTING -> FILTERING -> FETCHING -> CLOSING -> DONE`, with `FAILED`
//! reachable from any stage. `CLOSING` always runs, so no session is left
//! open. Site failures are contained: the run moves on to the next site.
//! Only a ledger that stops answering altogether aborts the run.

use crate::collector::Collector;
use crate::config::{Config, SiteConfig};
use crate::db::{Database, NewErrorLog};
use crate::error::CollectionError;
use crate::fetch::{FetchExecutor, StorageStats, storage_stats, sweep_stale_parts};
use crate::filter::FilterPipeline;
use crate::rate_limiter::RequestLimiter;
use crate::scorer::{RelevanceScorer, build_scorer};
use crate::types::{
    ErrorStage, RunSummary, SessionCounters, SessionId, SessionState, SiteSummary, VisitedOutcome,
};
use crate::{Error, Result};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a site ended in `FAILED`
#[derive(Debug)]
enum SiteFailure {
    /// The collector could not produce candidates
    Collection(CollectionError),
    /// The run was cancelled before the site finished fetching
    Cancelled,
    /// A ledger read or write failed
    Ledger(Error),
    /// The download directory is unusable
    Storage(Error),
}

impl SiteFailure {
    fn message(&self) -> String {
        match self {
            SiteFailure::Collection(e) => e.to_string(),
            SiteFailure::Cancelled => "run cancelled".to_string(),
            SiteFailure::Ledger(e) | SiteFailure::Storage(e) => e.to_string(),
        }
    }
}

/// Runs configured sites through the pipeline
pub struct Coordinator {
    config: Config,
    db: Arc<Database>,
    collector: Arc<dyn Collector>,
    scorer: Option<Arc<dyn RelevanceScorer>>,
    executor: FetchExecutor,
}

impl Coordinator {
    /// Open the ledger at `config.database_path` and build the pipeline
    pub async fn new(config: Config, collector: Arc<dyn Collector>) -> Result<Self> {
        config.validate()?;
        let db = Arc::new(Database::new(&config.database_path).await?);
        Self::with_database(config, db, collector)
    }

    /// Build the pipeline on an already open ledger
    pub fn with_database(
        config: Config,
        db: Arc<Database>,
        collector: Arc<dyn Collector>,
    ) -> Result<Self> {
        let scorer = build_scorer(&config.scorer)?;
        let executor = FetchExecutor::new(Arc::clone(&db), &config.fetch, &config.retry)?;
        Ok(Self {
            config,
            db,
            collector,
            scorer,
            executor,
        })
    }

    /// Replace the configured scorer
    #[must_use]
    pub fn with_scorer(mut self, scorer: Option<Arc<dyn RelevanceScorer>>) -> Self {
        self.scorer = scorer;
        self
    }

    /// The ledger, for operator queries
    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// The active configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Process every enabled site in order
    ///
    /// Always returns a summary. Cancellation lets in-flight fetches finish
    /// their current attempt and still closes the active session.
    pub async fn run(&self, cancel: &CancellationToken) -> RunSummary {
        let started = Instant::now();
        let mut summary = RunSummary::default();

        if let Err(e) = self.recover_open_sessions().await {
            tracing::warn!(error = %e, "Could not close sessions left open by a previous run");
        }
        let fetch = &self.config.fetch;
        if let Err(e) = sweep_stale_parts(&fetch.download_dir, fetch.stale_part_age).await {
            tracing::warn!(dir = %fetch.download_dir.display(), error = %e, "Could not sweep partial files");
        }

        for site in self.config.enabled_sites() {
            if cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }

            let (site_summary, ledger_error) = self.run_site(site, cancel).await;
            summary.add_site(site_summary);

            if let Some(e) = ledger_error {
                if let Err(ping) = self.db.ping().await {
                    tracing::error!(site = %site.name, error = %e, ping = %ping, "Ledger unavailable, aborting run");
                    summary.fatal_error = Some(e.to_string());
                    break;
                }
                tracing::warn!(site = %site.name, error = %e, "Ledger error was confined to this site");
                self.log_error(&site.name, ErrorStage::Persist, "ledger_error", e.to_string())
                    .await;
            }
        }

        if cancel.is_cancelled() {
            summary.cancelled = true;
        }
        summary.duration = started.elapsed();

        tracing::info!(
            sites = summary.sites_processed,
            links_found = summary.links_found,
            links_filtered_in = summary.links_filtered_in,
            downloads_succeeded = summary.downloads_succeeded,
            downloads_failed = summary.downloads_failed,
            bytes = summary.bytes_downloaded,
            duration_ms = summary.duration.as_millis() as u64,
            cancelled = summary.cancelled,
            fatal = summary.fatal_error.is_some(),
            "Run finished"
        );

        summary
    }

    /// Close sessions a crashed run never closed
    pub async fn recover_open_sessions(&self) -> Result<usize> {
        let open = self.db.open_sessions().await?;
        for session in &open {
            tracing::info!(site = %session.site_name, session = %session.id, "Closing interrupted session");
            self.db
                .close_session(session.id, false, Some("interrupted before close"))
                .await?;
        }
        Ok(open.len())
    }

    /// Files currently in the download directory
    pub async fn storage_stats(&self) -> Result<StorageStats> {
        storage_stats(&self.config.fetch.download_dir).await
    }

    /// One site through the state machine; returns the ledger error, if any, that failed it
    async fn run_site(
        &self,
        site: &SiteConfig,
        cancel: &CancellationToken,
    ) -> (SiteSummary, Option<Error>) {
        let mut summary = SiteSummary {
            site_name: site.name.clone(),
            session_id: None,
            state: SessionState::Collecting,
            fetch_completed: false,
            counters: SessionCounters::default(),
            drops: Default::default(),
            skipped_duplicate: 0,
            error: None,
        };

        let session = match self.db.open_session(&site.name).await {
            Ok(id) => id,
            Err(e) => {
                tracing::error!(site = %site.name, error = %e, "Could not open session");
                summary.state = SessionState::Failed;
                summary.error = Some(e.to_string());
                return (summary, Some(e));
            }
        };
        summary.session_id = Some(session);
        tracing::info!(site = %site.name, session = %session, "Session opened");

        let result = self.drive(site, session, &mut summary, cancel).await;

        transition(&mut summary, SessionState::Closing);
        let failure_message = result.as_ref().err().map(SiteFailure::message);
        if let Err(e) = self
            .db
            .close_session(session, result.is_ok(), failure_message.as_deref())
            .await
        {
            tracing::error!(site = %site.name, session = %session, error = %e, "Failed to close session");
        }

        match result {
            Ok(()) => {
                transition(&mut summary, SessionState::Done);
                (summary, None)
            }
            Err(failure) => {
                tracing::warn!(site = %site.name, error = %failure.message(), "Site failed");
                if let SiteFailure::Storage(e) = &failure {
                    self.log_error(&site.name, ErrorStage::Fetch, "storage", e.to_string())
                        .await;
                }
                summary.error = failure_message;
                transition(&mut summary, SessionState::Failed);
                let ledger_error = match failure {
                    SiteFailure::Ledger(e) => Some(e),
                    _ => None,
                };
                (summary, ledger_error)
            }
        }
    }

    async fn drive(
        &self,
        site: &SiteConfig,
        session: SessionId,
        summary: &mut SiteSummary,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), SiteFailure> {
        // COLLECTING
        let batch = match self.collector.collect(site).await {
            Ok(batch) => batch,
            Err(e) => {
                tracing::error!(site = %site.name, error = %e, "Collection failed");
                self.db
                    .append_error(&NewErrorLog::new(
                        &site.name,
                        ErrorStage::Collect,
                        "collection_error",
                        &e.reason,
                    ))
                    .await
                    .map_err(SiteFailure::Ledger)?;
                return Err(SiteFailure::Collection(e));
            }
        };
        self.add_counters(
            session,
            summary,
            SessionCounters {
                links_found: batch.len() as u64,
                ..Default::default()
            },
        )
        .await?;

        // FILTERING
        transition(summary, SessionState::Filtering);
        let outcome = FilterPipeline::new(site, &self.config.history)
            .with_scorer(self.scorer.as_deref())
            .run(batch, self.db.as_ref())
            .await
            .map_err(SiteFailure::Ledger)?;
        summary.drops = outcome.drops;

        for rejected in &outcome.rejected {
            self.db
                .upsert_visited(&rejected.url, &site.name, VisitedOutcome::SkippedFiltered)
                .await
                .map_err(SiteFailure::Ledger)?;
        }
        for failure in &outcome.scoring_failures {
            self.db
                .append_error(
                    &NewErrorLog::new(
                        &site.name,
                        ErrorStage::Filter,
                        failure.error.kind(),
                        failure.error.to_string(),
                    )
                    .with_url(&failure.url),
                )
                .await
                .map_err(SiteFailure::Ledger)?;
        }
        self.add_counters(
            session,
            summary,
            SessionCounters {
                links_filtered_in: outcome.survivors.len() as u64,
                ..Default::default()
            },
        )
        .await?;

        if cancel.is_cancelled() {
            return Err(SiteFailure::Cancelled);
        }

        // FETCHING
        transition(summary, SessionState::Fetching);
        let limiter = RequestLimiter::new(&site.rate_limit);
        let fetched = self
            .executor
            .run(site, outcome.survivors, &limiter, cancel)
            .await
            .map_err(SiteFailure::Storage)?;
        summary.skipped_duplicate = fetched.skipped_duplicate;

        let counted = self
            .add_counters(
                session,
                summary,
                SessionCounters {
                    downloads_succeeded: fetched.succeeded,
                    downloads_failed: fetched.failed,
                    bytes_downloaded: fetched.bytes_downloaded,
                    ..Default::default()
                },
            )
            .await;

        if let Some(message) = fetched.ledger_error {
            return Err(SiteFailure::Ledger(Error::LedgerUnavailable(message)));
        }
        counted?;
        // Items that finished after the cancel are recorded, but the batch is not complete
        if fetched.cancelled > 0 || cancel.is_cancelled() {
            return Err(SiteFailure::Cancelled);
        }

        summary.fetch_completed = true;
        Ok(())
    }

    /// Best-effort error log entry for failures outside a single item
    async fn log_error(&self, site: &str, stage: ErrorStage, kind: &str, message: String) {
        if let Err(e) = self
            .db
            .append_error(&NewErrorLog::new(site, stage, kind, message))
            .await
        {
            tracing::warn!(site, error = %e, "Failed to append error log entry");
        }
    }

    /// Apply counter deltas to the session and the in-memory summary
    async fn add_counters(
        &self,
        session: SessionId,
        summary: &mut SiteSummary,
        deltas: SessionCounters,
    ) -> std::result::Result<(), SiteFailure> {
        let totals = &mut summary.counters;
        totals.links_found += deltas.links_found;
        totals.links_filtered_in += deltas.links_filtered_in;
        totals.downloads_succeeded += deltas.downloads_succeeded;
        totals.downloads_failed += deltas.downloads_failed;
        totals.bytes_downloaded += deltas.bytes_downloaded;

        self.db
            .update_session_counters(session, &deltas)
            .await
            .map_err(SiteFailure::Ledger)
    }
}

fn transition(summary: &mut SiteSummary, to: SessionState) {
    tracing::debug!(site = %summary.site_name, from = ?summary.state, to = ?to, "Session state change");
    summary.state = to;
}
