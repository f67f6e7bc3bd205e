//! Rule-based scorer

use super::traits::RelevanceScorer;
use crate::error::ScoringError;
use crate::types::CandidateLink;
use async_trait::async_trait;

/// Scores a candidate by the fraction of keywords found in its title or url
///
/// Matching is a case-insensitive substring test against
/// [`CandidateLink::match_text`]. With no keywords every candidate scores 1.0.
#[derive(Debug, Clone)]
pub struct KeywordScorer {
    keywords: Vec<String>,
}

impl KeywordScorer {
    /// Create a scorer; blank keywords are ignored
    pub fn new(keywords: Vec<String>) -> Self {
        let keywords = keywords
            .into_iter()
            .map(|k| k.trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .collect();
        Self { keywords }
    }
}

#[async_trait]
impl RelevanceScorer for KeywordScorer {
    async fn score(&self, candidate: &CandidateLink) -> Result<f64, ScoringError> {
        if self.keywords.is_empty() {
            return Ok(1.0);
        }
        let text = candidate.match_text().to_lowercase();
        let hits = self.keywords.iter().filter(|k| text.contains(k.as_str())).count();
        Ok(hits as f64 / self.keywords.len() as f64)
    }

    fn name(&self) -> &'static str {
        "keyword"
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scores_fraction_of_keywords_found() {
        let scorer = KeywordScorer::new(vec!["Budget".into(), "2025".into(), "audit".into(), " ".into()]);
        let link = CandidateLink::new("https://x.example/f.pdf", "x", ".pdf")
            .with_title("City BUDGET 2025");

        let score = scorer.score(&link).await.unwrap();
        assert!((score - 2.0 / 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn blank_title_matches_against_url() {
        let scorer = KeywordScorer::new(vec!["minutes".into()]);
        let link = CandidateLink::new("https://x.example/minutes-jan.pdf", "x", ".pdf").with_title("  ");

        assert_eq!(scorer.score(&link).await.unwrap(), 1.0);
    }

    #[tokio::test]
    async fn no_keywords_scores_everything_one() {
        let scorer = KeywordScorer::new(Vec::new());
        let link = CandidateLink::new("https://x.example/f.pdf", "x", ".pdf");
        assert_eq!(scorer.score(&link).await.unwrap(), 1.0);
    }
}
