//! The scorer capability

use crate::error::ScoringError;
use crate::types::CandidateLink;
use async_trait::async_trait;

/// Computes how relevant a candidate is to the operator's interests
///
/// Implementations return a score in `[0, 1]`. Both failure variants are
/// non-fatal to the candidate: the filter pipeline lets it through and logs
/// the failure.
///
/// # Examples
///
/// ```
/// use harvest_dl::scorer::{NoOpScorer, RelevanceScorer};
/// use harvest_dl::CandidateLink;
///
/// # #[tokio::main]
/// # async fn main() {
/// let link = CandidateLink::new("https://example.com/a.pdf", "example", ".pdf");
/// assert_eq!(NoOpScorer.score(&link).await.ok(), Some(1.0));
/// # }
/// ```
#[async_trait]
pub trait RelevanceScorer: Send + Sync {
    /// Score one candidate
    async fn score(&self, candidate: &CandidateLink) -> Result<f64, ScoringError>;

    /// Short identifier used in logs
    fn name(&self) -> &'static str;
}
