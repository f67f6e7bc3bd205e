//! Filter pipeline
//!
//! Turns a collected batch into the ordered list of candidates worth fetching.
//! Stages run in a fixed order, cheapest first:
//!
//! 1. validation and deduplication (first-seen entry wins)
//! 2. history: drop urls that already succeeded or carry a sticky visited decision
//! 3. rules: file type, include and exclude keywords
//! 4. relevance: optional scorer with a threshold; scorer failures pass through
//! 5. prioritization: stable sort by date, then size, then discovery order
//!
//! The pipeline only reads the ledger. Candidates dropped by rules or
//! relevance, and scorer failures, are returned to the caller for recording.

mod rules;

pub use rules::{RuleRejection, SiteRules};

use crate::Result;
use crate::config::{HistoryConfig, SiteConfig};
use crate::db::{Database, VisitedUrl};
use crate::error::ScoringError;
use crate::scorer::RelevanceScorer;
use crate::types::{CandidateLink, DropCounts, VisitedOutcome};
use crate::utils::is_fetchable_url;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::cmp::Ordering;
use std::collections::HashSet;

/// Scoring requests in flight at once during the relevance stage
pub const MAX_CONCURRENT_SCORES: usize = 8;

/// Read-only view of the ledger used by the history stage
#[async_trait]
pub trait LedgerView: Send + Sync {
    /// True iff a SUCCESS record exists for `url`
    async fn has_succeeded(&self, url: &str) -> Result<bool>;

    /// Latest visited decision for `url`, if any
    async fn visited_entry(&self, url: &str) -> Result<Option<VisitedUrl>>;
}

#[async_trait]
impl LedgerView for Database {
    async fn has_succeeded(&self, url: &str) -> Result<bool> {
        Database::has_succeeded(self, url).await
    }

    async fn visited_entry(&self, url: &str) -> Result<Option<VisitedUrl>> {
        Database::visited_entry(self, url).await
    }
}

/// A scorer failure for one candidate; the candidate was kept
#[derive(Debug, Clone)]
pub struct ScoringFailure {
    /// Candidate url
    pub url: String,
    /// What went wrong
    pub error: ScoringError,
}

/// Result of running a batch through the pipeline
#[derive(Debug, Clone, Default)]
pub struct FilterOutcome {
    /// Surviving candidates in fetch priority order
    pub survivors: Vec<CandidateLink>,
    /// Per-stage drop counts
    pub drops: DropCounts,
    /// Candidates dropped by rules or relevance, to be marked SKIPPED_FILTERED
    pub rejected: Vec<CandidateLink>,
    /// Scorer failures to be logged
    pub scoring_failures: Vec<ScoringFailure>,
}

/// Decision stage for one site
pub struct FilterPipeline<'a> {
    site: &'a SiteConfig,
    rules: SiteRules,
    history: &'a HistoryConfig,
    scorer: Option<&'a dyn RelevanceScorer>,
}

impl<'a> FilterPipeline<'a> {
    /// Create a pipeline for `site` without a relevance stage
    pub fn new(site: &'a SiteConfig, history: &'a HistoryConfig) -> Self {
        Self {
            site,
            rules: SiteRules::from_site(site),
            history,
            scorer: None,
        }
    }

    /// Enable the relevance stage
    #[must_use]
    pub fn with_scorer(mut self, scorer: Option<&'a dyn RelevanceScorer>) -> Self {
        self.scorer = scorer;
        self
    }

    /// Run every stage over `batch`
    ///
    /// Fails only when the ledger cannot be read.
    pub async fn run(&self, batch: Vec<CandidateLink>, ledger: &dyn LedgerView) -> Result<FilterOutcome> {
        self.run_at(batch, ledger, Utc::now()).await
    }

    /// [`FilterPipeline::run`] with an explicit clock for cooldown checks
    pub async fn run_at(
        &self,
        batch: Vec<CandidateLink>,
        ledger: &dyn LedgerView,
        now: DateTime<Utc>,
    ) -> Result<FilterOutcome> {
        let mut outcome = FilterOutcome::default();
        let total = batch.len();

        let unique = dedup(batch, &mut outcome.drops);

        let mut fresh = Vec::with_capacity(unique.len());
        for candidate in unique {
            if self.seen_before(&candidate, ledger, now).await? {
                outcome.drops.history += 1;
            } else {
                fresh.push(candidate);
            }
        }

        let mut passed = Vec::with_capacity(fresh.len());
        for candidate in fresh {
            match self.rules.check(&candidate) {
                Ok(()) => passed.push(candidate),
                Err(reason) => {
                    tracing::debug!(site = %self.site.name, url = %candidate.url, ?reason, "Candidate rejected by rules");
                    outcome.drops.rules += 1;
                    outcome.rejected.push(candidate);
                }
            }
        }

        let mut survivors = match self.scorer {
            Some(scorer) => self.apply_relevance(scorer, passed, &mut outcome).await,
            None => passed,
        };

        prioritize(&mut survivors);
        outcome.survivors = survivors;

        tracing::info!(
            site = %self.site.name,
            total,
            survivors = outcome.survivors.len(),
            invalid = outcome.drops.invalid,
            duplicate = outcome.drops.duplicate,
            history = outcome.drops.history,
            rules = outcome.drops.rules,
            relevance = outcome.drops.relevance,
            "Filtered candidate batch"
        );

        Ok(outcome)
    }

    /// History stage: has this url already been decided?
    async fn seen_before(
        &self,
        candidate: &CandidateLink,
        ledger: &dyn LedgerView,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        if ledger.has_succeeded(&candidate.url).await? {
            return Ok(true);
        }

        let Some(entry) = ledger.visited_entry(&candidate.url).await? else {
            return Ok(false);
        };

        let age = (now - entry.last_seen_at).to_std().unwrap_or_default();
        let sticky = match entry.outcome {
            VisitedOutcome::Downloaded => true,
            VisitedOutcome::FailedPermanent => self
                .history
                .failed_permanent_recheck
                .is_none_or(|cooldown| age < cooldown),
            VisitedOutcome::SkippedFiltered => self
                .history
                .filtered_recheck
                .is_some_and(|cooldown| age < cooldown),
            VisitedOutcome::SkippedDuplicate => false,
        };
        Ok(sticky)
    }

    /// Relevance stage; up to [`MAX_CONCURRENT_SCORES`] requests run at once
    /// and scores are applied in batch order
    async fn apply_relevance(
        &self,
        scorer: &dyn RelevanceScorer,
        candidates: Vec<CandidateLink>,
        outcome: &mut FilterOutcome,
    ) -> Vec<CandidateLink> {
        let scores: Vec<_> = futures::stream::iter(candidates.iter().map(|c| scorer.score(c)))
            .buffered(MAX_CONCURRENT_SCORES)
            .collect()
            .await;

        let threshold = self.site.relevance_threshold;
        let mut kept = Vec::with_capacity(candidates.len());
        for (candidate, score) in candidates.into_iter().zip(scores) {
            match score {
                Ok(score) if score < threshold => {
                    tracing::debug!(site = %self.site.name, url = %candidate.url, score, threshold, "Candidate below relevance threshold");
                    outcome.drops.relevance += 1;
                    outcome.rejected.push(candidate);
                }
                Ok(_) => kept.push(candidate),
                Err(error) => {
                    tracing::warn!(
                        site = %self.site.name,
                        url = %candidate.url,
                        scorer = scorer.name(),
                        error = %error,
                        "Relevance scoring failed, keeping candidate"
                    );
                    outcome.scoring_failures.push(ScoringFailure {
                        url: candidate.url.clone(),
                        error,
                    });
                    kept.push(candidate);
                }
            }
        }
        kept
    }
}

/// Drop invalid urls and repeated urls, keeping the first-seen entry
fn dedup(batch: Vec<CandidateLink>, drops: &mut DropCounts) -> Vec<CandidateLink> {
    let mut seen = HashSet::with_capacity(batch.len());
    let mut unique = Vec::with_capacity(batch.len());
    for candidate in batch {
        if !is_fetchable_url(&candidate.url) {
            drops.invalid += 1;
        } else if !seen.insert(candidate.url.clone()) {
            drops.duplicate += 1;
        } else {
            unique.push(candidate);
        }
    }
    unique
}

/// Fetch priority: newest first, then largest first, unknowns last
fn priority(a: &CandidateLink, b: &CandidateLink) -> Ordering {
    let date = |c: &CandidateLink| c.published_at.map_or(0, |d| d.timestamp());
    date(b)
        .cmp(&date(a))
        .then_with(|| b.discovered_size_hint.cmp(&a.discovered_size_hint))
}

/// Stable sort, so equal-priority candidates keep discovery order
fn prioritize(candidates: &mut [CandidateLink]) {
    candidates.sort_by(priority);
}
