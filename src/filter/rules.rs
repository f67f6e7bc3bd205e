//! File type and keyword rules for one site

use crate::config::{SiteConfig, normalize_file_type};
use crate::types::CandidateLink;
use std::collections::HashSet;

/// Why a candidate failed the rule stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleRejection {
    /// File type not in the site's allowed set
    FileType(String),
    /// None of the include keywords matched
    NoIncludeMatch,
    /// An exclude keyword matched
    Excluded(String),
}

/// A site's rules, normalized once per batch
#[derive(Debug, Clone)]
pub struct SiteRules {
    allowed_types: HashSet<String>,
    include: Vec<String>,
    exclude: Vec<String>,
}

fn lowercase_keywords(keywords: &[String]) -> Vec<String> {
    keywords
        .iter()
        .map(|k| k.trim().to_lowercase())
        .filter(|k| !k.is_empty())
        .collect()
}

impl SiteRules {
    /// Normalize the rules configured for `site`
    pub fn from_site(site: &SiteConfig) -> Self {
        Self {
            allowed_types: site.allowed_file_types(),
            include: lowercase_keywords(&site.filters.include),
            exclude: lowercase_keywords(&site.filters.exclude),
        }
    }

    /// Check a candidate against the rules
    ///
    /// An empty allowed set accepts every type, and an empty include list
    /// accepts every text. Keywords match case-insensitively as substrings of
    /// the title, or of the url when the title is blank.
    pub fn check(&self, candidate: &CandidateLink) -> Result<(), RuleRejection> {
        let file_type = normalize_file_type(&candidate.file_type);
        if !self.allowed_types.is_empty() && !self.allowed_types.contains(&file_type) {
            return Err(RuleRejection::FileType(file_type));
        }

        let text = candidate.match_text().to_lowercase();

        if !self.include.is_empty() && !self.include.iter().any(|k| text.contains(k.as_str())) {
            return Err(RuleRejection::NoIncludeMatch);
        }

        if let Some(hit) = self.exclude.iter().find(|k| text.contains(k.as_str())) {
            return Err(RuleRejection::Excluded(hit.clone()));
        }

        Ok(())
    }
}
