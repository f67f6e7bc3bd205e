//! Candidate collection interface
//!
//! Page acquisition (browser automation, DOM extraction, pagination) lives
//! outside this crate. The coordinator only sees the [`Collector`] trait: one
//! call per site that returns the candidate links found there.

use crate::config::SiteConfig;
use crate::error::CollectionError;
use crate::types::CandidateLink;
use async_trait::async_trait;
use std::collections::HashMap;

/// Source of candidate links for a site
///
/// Implementations may be slow (a headless browser, a crawler). A total
/// failure for the site is reported as [`CollectionError`]; the coordinator
/// records it and moves on to the next site.
#[async_trait]
pub trait Collector: Send + Sync {
    /// Discover candidate links on `site`
    async fn collect(&self, site: &SiteConfig) -> Result<Vec<CandidateLink>, CollectionError>;
}

/// Collector serving fixed batches keyed by site name
///
/// Useful when candidates come from somewhere other than a live page (a
/// previous export, a manual list) and in tests. Sites without a batch fail
/// with [`CollectionError`].
#[derive(Debug, Clone, Default)]
pub struct StaticCollector {
    batches: HashMap<String, Vec<CandidateLink>>,
}

impl StaticCollector {
    /// Create an empty collector
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the batch returned for `site_name`
    #[must_use]
    pub fn with_batch(mut self, site_name: impl Into<String>, links: Vec<CandidateLink>) -> Self {
        self.batches.insert(site_name.into(), links);
        self
    }
}

#[async_trait]
impl Collector for StaticCollector {
    async fn collect(&self, site: &SiteConfig) -> Result<Vec<CandidateLink>, CollectionError> {
        self.batches
            .get(&site.name)
            .cloned()
            .ok_or_else(|| CollectionError::new(&site.name, "no candidates registered for site"))
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_collector_returns_registered_batch() {
        let collector = StaticCollector::new().with_batch(
            "reports",
            vec![CandidateLink::new("https://r.example/a.pdf", "reports", ".pdf")],
        );

        let site = SiteConfig::new("reports", "https://r.example/");
        let links = collector.collect(&site).await.unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].url, "https://r.example/a.pdf");
    }

    #[tokio::test]
    async fn static_collector_fails_for_unknown_site() {
        let collector = StaticCollector::new();
        let site = SiteConfig::new("missing", "https://m.example/");

        let err = collector.collect(&site).await.unwrap_err();
        assert_eq!(err.site, "missing");
    }
}
