//! Relevance scoring
//!
//! The relevance stage of the filter pipeline consults an optional
//! [`RelevanceScorer`]. Scores are advisory: a scorer that times out or is
//! unavailable never drops a candidate.
//!
//! ## Implementations
//!
//! - [`NoOpScorer`]: every candidate scores 1.0
//! - [`KeywordScorer`]: fraction of configured keywords found in the title or url
//! - [`LlmScorer`]: asks an OpenAI-compatible chat completion endpoint
//!
//! [`build_scorer`] picks one from [`ScorerConfig`].

mod keyword;
mod llm;
mod noop;
mod traits;

pub use keyword::KeywordScorer;
pub use llm::LlmScorer;
pub use noop::NoOpScorer;
pub use traits::RelevanceScorer;

use crate::Result;
use crate::config::ScorerConfig;
use std::sync::Arc;

/// Build the scorer selected by configuration
///
/// Returns `None` when no relevance stage is configured.
pub fn build_scorer(config: &ScorerConfig) -> Result<Option<Arc<dyn RelevanceScorer>>> {
    let scorer: Arc<dyn RelevanceScorer> = match config {
        ScorerConfig::None => return Ok(None),
        ScorerConfig::Keyword { keywords } => Arc::new(KeywordScorer::new(keywords.clone())),
        ScorerConfig::Llm(llm) => Arc::new(LlmScorer::new(llm)?),
    };

    tracing::info!(scorer = scorer.name(), "Relevance scorer configured");
    Ok(Some(scorer))
}
