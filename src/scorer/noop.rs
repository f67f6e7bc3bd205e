//! Pass-through scorer

use super::traits::RelevanceScorer;
use crate::error::ScoringError;
use crate::types::CandidateLink;
use async_trait::async_trait;

/// Scorer that rates every candidate as fully relevant
///
/// Keeps the relevance stage wired without filtering anything out.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpScorer;

#[async_trait]
impl RelevanceScorer for NoOpScorer {
    async fn score(&self, _candidate: &CandidateLink) -> Result<f64, ScoringError> {
        Ok(1.0)
    }

    fn name(&self) -> &'static str {
        "noop"
    }
}
