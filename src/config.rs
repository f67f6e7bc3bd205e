//! Configuration types for harvest-dl
//!
//! Configuration is an explicit value: build a [`Config`] in code or load one
//! from JSON with [`Config::from_file`], then hand it to the
//! [`Coordinator`](crate::coordinator::Coordinator). Nothing is read from
//! process-wide state after construction.

use crate::error::{Error, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Sites to harvest, processed in order
    #[serde(default)]
    pub sites: Vec<SiteConfig>,

    /// Fetch executor settings
    #[serde(default)]
    pub fetch: FetchConfig,

    /// Retry and backoff settings
    #[serde(default)]
    pub retry: RetryConfig,

    /// Re-check policy for urls already in the visited table
    #[serde(default)]
    pub history: HistoryConfig,

    /// Relevance scorer selection
    #[serde(default)]
    pub scorer: ScorerConfig,

    /// Path to the SQLite ledger (default: "./harvest.db")
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sites: Vec::new(),
            fetch: FetchConfig::default(),
            retry: RetryConfig::default(),
            history: HistoryConfig::default(),
            scorer: ScorerConfig::default(),
            database_path: default_database_path(),
        }
    }
}

impl Config {
    /// Parse a JSON configuration, substituting `${VAR}` and `${VAR:default}`
    /// string values from the process environment
    pub fn from_json_str(json: &str) -> Result<Self> {
        let mut value: serde_json::Value = serde_json::from_str(json)?;
        substitute_env_vars(&mut value, &|name| std::env::var(name).ok());
        let config: Config = serde_json::from_value(value)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON configuration file
    pub async fn from_file(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path).await.map_err(|e| Error::Config {
            message: format!("failed to read {}: {}", path.display(), e),
            key: None,
        })?;
        Self::from_json_str(&contents)
    }

    /// Enabled sites in configuration order
    pub fn enabled_sites(&self) -> impl Iterator<Item = &SiteConfig> {
        self.sites.iter().filter(|s| s.enabled)
    }

    /// Look up a site by name
    pub fn site(&self, name: &str) -> Option<&SiteConfig> {
        self.sites.iter().find(|s| s.name == name)
    }

    /// Check invariants that serde defaults cannot express
    pub fn validate(&self) -> Result<()> {
        if self.sites.is_empty() {
            return Err(Error::config("at least one site must be configured", "sites"));
        }
        if self.fetch.max_concurrent_downloads == 0 {
            return Err(Error::config(
                "max_concurrent_downloads must be at least 1",
                "fetch.max_concurrent_downloads",
            ));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(Error::config(
                "backoff_multiplier must be >= 1.0",
                "retry.backoff_multiplier",
            ));
        }

        let mut seen = HashSet::new();
        for (i, site) in self.sites.iter().enumerate() {
            if site.name.trim().is_empty() {
                return Err(Error::config(
                    "site name must not be empty",
                    format!("sites[{i}].name"),
                ));
            }
            if !seen.insert(site.name.as_str()) {
                return Err(Error::config(
                    format!("duplicate site name '{}'", site.name),
                    format!("sites[{i}].name"),
                ));
            }
            if !crate::utils::is_fetchable_url(&site.base_url) {
                return Err(Error::config(
                    format!("base_url '{}' is not an absolute http(s) url", site.base_url),
                    format!("sites[{i}].base_url"),
                ));
            }
            if !(0.0..=1.0).contains(&site.relevance_threshold) {
                return Err(Error::config(
                    "relevance_threshold must be within [0, 1]",
                    format!("sites[{i}].relevance_threshold"),
                ));
            }
            if site.rate_limit.requests_per_minute == 0 {
                return Err(Error::config(
                    "requests_per_minute must be at least 1",
                    format!("sites[{i}].rate_limit.requests_per_minute"),
                ));
            }
            if site.max_concurrent_downloads == Some(0) {
                return Err(Error::config(
                    "max_concurrent_downloads must be at least 1",
                    format!("sites[{i}].max_concurrent_downloads"),
                ));
            }
        }
        Ok(())
    }
}

/// Per-site configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SiteConfig {
    /// Unique site identifier, also used as the filename prefix
    pub name: String,

    /// Entry page handed to the collector
    pub base_url: String,

    /// Whether the site is processed at all (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Allowed file extensions (default: [".pdf"])
    #[serde(default = "default_file_types")]
    pub file_types: Vec<String>,

    /// Keyword rules
    #[serde(default)]
    pub filters: FiltersConfig,

    /// Request pacing for this site
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Minimum relevance score when a scorer is configured (default: 0.6)
    #[serde(default = "default_relevance_threshold")]
    pub relevance_threshold: f64,

    /// Per-site cap on simultaneous fetches, below the global cap
    #[serde(default)]
    pub max_concurrent_downloads: Option<usize>,

    /// Collector-specific settings (selectors, pagination), passed through untouched
    #[serde(default)]
    pub collector: serde_json::Map<String, serde_json::Value>,
}

impl SiteConfig {
    /// Create a site with default rules
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            enabled: true,
            file_types: default_file_types(),
            filters: FiltersConfig::default(),
            rate_limit: RateLimitConfig::default(),
            relevance_threshold: default_relevance_threshold(),
            max_concurrent_downloads: None,
            collector: serde_json::Map::new(),
        }
    }

    /// Allowed file types, lowercased with a leading dot
    pub fn allowed_file_types(&self) -> HashSet<String> {
        self.file_types
            .iter()
            .map(|t| normalize_file_type(t))
            .filter(|t| t.len() > 1)
            .collect()
    }
}

/// Include/exclude keyword rules
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FiltersConfig {
    /// At least one must appear (case-insensitive); empty keeps everything
    #[serde(default)]
    pub include: Vec<String>,

    /// None may appear (case-insensitive)
    #[serde(default)]
    pub exclude: Vec<String>,
}

/// Token-bucket request pacing
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Requests allowed per minute (default: 30)
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,

    /// Requests that may be issued back-to-back before pacing starts (default: 1)
    #[serde(default = "default_burst")]
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: default_requests_per_minute(),
            burst: default_burst(),
        }
    }
}

/// Fetch executor settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Directory downloaded files are written to (default: "./downloads")
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,

    /// Maximum simultaneous fetches across a run (default: 3)
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_downloads: usize,

    /// Per-request timeout (default: 30 seconds)
    #[serde(default = "default_request_timeout", with = "duration_serde")]
    pub timeout: Duration,

    /// Size cap in bytes (default: 100 MiB)
    #[serde(default = "default_max_file_size")]
    pub max_file_size_bytes: u64,

    /// User-Agent header sent with every request
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Check magic bytes and content type against the expected file type (default: true)
    #[serde(default = "default_true")]
    pub verify_content: bool,

    /// `.part` files untouched for this long are removed at the start of a run (default: 24 hours)
    #[serde(default = "default_stale_part_age", with = "duration_serde")]
    pub stale_part_age: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            max_concurrent_downloads: default_max_concurrent(),
            timeout: default_request_timeout(),
            max_file_size_bytes: default_max_file_size(),
            user_agent: default_user_agent(),
            verify_content: true,
            stale_part_age: default_stale_part_age(),
        }
    }
}

/// Retry configuration for transient fetch failures
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt (default: 3, so 4 attempts in total)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry (default: 1 second)
    #[serde(default = "default_initial_delay", with = "duration_serde")]
    pub initial_delay: Duration,

    /// Cap on any single delay, including Retry-After hints (default: 60 seconds)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: false)
    #[serde(default)]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: false,
        }
    }
}

/// How long visited-table decisions stay sticky
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Re-attempt permanent failures once this much time has passed (None = never)
    #[serde(default, with = "optional_duration_serde")]
    pub failed_permanent_recheck: Option<Duration>,

    /// Keep filtered-out urls out of the pipeline for this long (None = re-evaluate every run)
    #[serde(default, with = "optional_duration_serde")]
    pub filtered_recheck: Option<Duration>,
}

/// Relevance scorer selection
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScorerConfig {
    /// No relevance stage
    #[default]
    None,
    /// Fraction of keywords found in title or url
    Keyword {
        /// Keywords to look for (case-insensitive)
        keywords: Vec<String>,
    },
    /// OpenAI-compatible chat completion endpoint
    Llm(LlmScorerConfig),
}

/// LLM-backed scorer settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LlmScorerConfig {
    /// Base URL of an OpenAI-compatible API (e.g. "https://api.openai.com/v1")
    pub endpoint: String,

    /// Model name
    pub model: String,

    /// Bearer token
    #[serde(default)]
    pub api_key: Option<String>,

    /// Description of what the operator is looking for
    #[serde(default)]
    pub topic: Option<String>,

    /// Per-request timeout (default: 30 seconds)
    #[serde(default = "default_request_timeout", with = "duration_serde")]
    pub timeout: Duration,
}

/// Lowercase a file type and ensure it starts with a dot
pub fn normalize_file_type(file_type: &str) -> String {
    let trimmed = file_type.trim().to_lowercase();
    if trimmed.starts_with('.') {
        trimmed
    } else {
        format!(".{trimmed}")
    }
}

/// Replace string values of the form `${VAR}` or `${VAR:default}` in a JSON tree
///
/// Unset variables without a default become `null`.
pub fn substitute_env_vars(value: &mut serde_json::Value, lookup: &dyn Fn(&str) -> Option<String>) {
    use serde_json::Value;

    match value {
        Value::Object(map) => {
            for v in map.values_mut() {
                substitute_env_vars(v, lookup);
            }
        }
        Value::Array(items) => {
            for v in items.iter_mut() {
                substitute_env_vars(v, lookup);
            }
        }
        Value::String(s) => {
            if let Some(caps) = env_pattern().captures(s) {
                let name = caps.get(1).map_or("", |m| m.as_str());
                let default = caps.get(2).map(|m| m.as_str().to_string());
                match lookup(name).or(default) {
                    Some(resolved) => *value = Value::String(resolved),
                    None => {
                        tracing::warn!(
                            variable = name,
                            "Environment variable not set and no default provided"
                        );
                        *value = Value::Null;
                    }
                }
            }
        }
        _ => {}
    }
}

fn env_pattern() -> &'static Regex {
    static PATTERN: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    PATTERN.get_or_init(|| {
        #[allow(clippy::expect_used)]
        Regex::new(r"^\$\{([A-Za-z_][A-Za-z0-9_]*)(?::(.*))?\}$").expect("valid env pattern")
    })
}

fn default_database_path() -> PathBuf {
    PathBuf::from("./harvest.db")
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("./downloads")
}

fn default_max_concurrent() -> usize {
    3
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_stale_part_age() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_max_file_size() -> u64 {
    100 * 1024 * 1024
}

fn default_user_agent() -> String {
    concat!("harvest-dl/", env!("CARGO_PKG_VERSION")).to_string()
}

fn default_true() -> bool {
    true
}

fn default_file_types() -> Vec<String> {
    vec![".pdf".to_string()]
}

fn default_relevance_threshold() -> f64 {
    0.6
}

fn default_requests_per_minute() -> u32 {
    30
}

fn default_burst() -> u32 {
    1
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

// Duration serialization helper
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

// Optional Duration serialization helper
mod optional_duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&d.as_secs()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = Option::<u64>::deserialize(deserializer)?;
        Ok(secs.map(Duration::from_secs))
    }
}
